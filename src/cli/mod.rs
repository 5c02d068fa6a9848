use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::backup::Compression;
use crate::config::{parse_shell, VaultConfig};
use crate::extract::ExecutionMode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON configuration file. Every field is optional.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Privileged shell, e.g. "su -c". Overrides ROOTVAULT_SHELL and the config file.
    #[arg(long, global = true)]
    pub shell: Option<String>,

    /// Multi-call binary prefixed to every filesystem utility (toybox, busybox).
    #[arg(long, global = true)]
    pub util_box: Option<String>,

    /// Raise log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Back up a directory tree into an archive.
    #[command(alias = "b")]
    Backup {
        /// Directory to back up.
        #[arg(required = true)]
        source: PathBuf,

        /// Directory that receives the archive. Created if missing.
        #[arg(short, long)]
        output: PathBuf,

        /// Archive base name. Defaults to the source directory's name.
        #[arg(short, long)]
        name: Option<String>,

        /// Scan and read with plain syscalls instead of the privileged shell.
        #[arg(long)]
        direct: bool,

        /// Stream compression.
        #[arg(long, value_enum)]
        compression: Option<Compression>,

        /// Zstandard compression level (1-22).
        #[arg(long)]
        level: Option<i32>,

        /// Show a progress line on stderr.
        #[arg(long)]
        progress: bool,
    },

    /// Restore an archive into a directory.
    #[command(alias = "r")]
    Restore {
        /// The archive to restore (.tar or .tar.zst).
        #[arg(required = true)]
        archive: PathBuf,

        /// Restore root.
        #[arg(short, long)]
        output: PathBuf,

        /// How files are materialized.
        #[arg(long, value_enum)]
        mode: Option<ExecutionMode>,

        /// Relative path to skip. Repeatable; added to the configured exclusions.
        #[arg(long)]
        exclude: Vec<String>,

        /// Relative cache path to skip. Repeatable.
        #[arg(long)]
        exclude_cache: Vec<String>,

        /// Ignore the configured exclusion sets.
        #[arg(long)]
        no_default_excludes: bool,

        /// Show a progress line on stderr.
        #[arg(long)]
        progress: bool,
    },

    /// List the entries of an archive without restoring it.
    #[command(alias = "l")]
    List {
        #[arg(required = true)]
        archive: PathBuf,
    },

    /// List a directory through the privileged shell.
    Ls {
        #[arg(required = true)]
        path: PathBuf,

        #[arg(short, long)]
        recursive: bool,
    },
}

/// Gets the shell from the command-line option or falls back to whatever the configuration
/// (file, then `ROOTVAULT_SHELL`) already chose.
pub fn get_shell_from_opt_or_config(shell_opt: Option<&str>, config: &VaultConfig) -> Vec<String> {
    match shell_opt {
        Some(shell) if !shell.trim().is_empty() => parse_shell(shell),
        _ => config.shell.clone(),
    }
}

/// Load the configuration and apply the global flags on top of it.
pub fn resolve_config(args: &Args) -> crate::Result<VaultConfig> {
    let mut config = VaultConfig::load(args.config.as_deref())?;
    config.shell = get_shell_from_opt_or_config(args.shell.as_deref(), &config);
    if let Some(util_box) = &args.util_box {
        config.util_box = Some(util_box.clone()).filter(|b| !b.trim().is_empty());
    }
    config.validate()?;
    Ok(config)
}

/// Parses command-line arguments using `clap`.
pub fn run() -> Result<Args, Box<dyn std::error::Error>> {
    Ok(Args::parse())
}
