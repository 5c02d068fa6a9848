//! Runtime configuration.
//!
//! Loaded from an optional JSON file; every field has a default, so an empty object (or no
//! file at all) is a valid configuration. `ROOTVAULT_SHELL` and `ROOTVAULT_UTIL_BOX` override
//! the file, and command-line flags override both.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archive::BUFFER_SIZE;
use crate::backup::Compression;
use crate::error::{Result, VaultError};
use crate::extract::{ExclusionRules, ExecutionMode};
use crate::shell::{ShellExecutor, SuShell};

pub const SHELL_ENV: &str = "ROOTVAULT_SHELL";
pub const UTIL_BOX_ENV: &str = "ROOTVAULT_UTIL_BOX";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VaultConfig {
    /// Program and leading arguments of the privileged session; the command string is
    /// appended as the last argument.
    pub shell: Vec<String>,
    pub util_box: Option<String>,
    pub buffer_size: usize,
    pub compression: Compression,
    pub zstd_level: i32,
    pub excluded_dirs: Vec<String>,
    pub excluded_cache_dirs: Vec<String>,
    pub execution_mode: ExecutionMode,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            shell: vec!["su".into(), "-c".into()],
            util_box: None,
            buffer_size: BUFFER_SIZE,
            compression: Compression::Zstd,
            zstd_level: 3,
            excluded_dirs: vec!["lib".into()],
            excluded_cache_dirs: vec!["cache".into(), "code_cache".into()],
            execution_mode: ExecutionMode::Auto,
        }
    }
}

/// `"su -c"` or `"sh"`; a bare program gets `-c` appended.
pub fn parse_shell(value: &str) -> Vec<String> {
    let mut words: Vec<String> = value.split_whitespace().map(str::to_owned).collect();
    if words.len() == 1 {
        words.push("-c".into());
    }
    words
}

impl VaultConfig {
    /// Read `path` if given, then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| VaultError::io(e, p))?;
                debug!(path = %p.display(), "loading configuration");
                serde_json::from_str(&text)?
            }
            None => VaultConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(shell) = std::env::var(SHELL_ENV) {
            if !shell.trim().is_empty() {
                self.shell = parse_shell(&shell);
            }
        }
        if let Ok(util_box) = std::env::var(UTIL_BOX_ENV) {
            self.util_box = Some(util_box).filter(|b| !b.trim().is_empty());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shell.is_empty() || self.shell[0].trim().is_empty() {
            return Err(VaultError::Config("shell must name a program".into()));
        }
        if self.buffer_size == 0 {
            return Err(VaultError::Config("buffer_size must be positive".into()));
        }
        if !(1..=22).contains(&self.zstd_level) {
            return Err(VaultError::Config(format!("zstd_level {} is outside 1..=22", self.zstd_level)));
        }
        Ok(())
    }

    pub fn executor(&self) -> ShellExecutor {
        let (program, args) = match self.shell.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => ("su".to_owned(), vec!["-c".to_owned()]),
        };
        ShellExecutor::new(SuShell::new(program, args)).with_util_box(self.util_box.clone())
    }

    pub fn exclusions(&self) -> ExclusionRules {
        ExclusionRules::new(self.excluded_dirs.clone(), self.excluded_cache_dirs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: VaultConfig =
            serde_json::from_str(r#"{"util_box": "toybox", "compression": "none", "execution_mode": "shell"}"#).unwrap();
        assert_eq!(config.util_box.as_deref(), Some("toybox"));
        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.execution_mode, ExecutionMode::Shell);
        assert_eq!(config.shell, vec!["su", "-c"]);
        assert_eq!(config.excluded_cache_dirs, vec!["cache", "code_cache"]);
        assert_eq!(config.buffer_size, BUFFER_SIZE);
    }

    #[test]
    fn shell_words() {
        assert_eq!(parse_shell("sh"), vec!["sh", "-c"]);
        assert_eq!(parse_shell("su 0 sh -c"), vec!["su", "0", "sh", "-c"]);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = VaultConfig::default();
        config.zstd_level = 40;
        assert!(matches!(config.validate(), Err(VaultError::Config(_))));
        let config = VaultConfig { shell: vec![], ..VaultConfig::default() };
        assert!(config.validate().is_err());
    }
}
