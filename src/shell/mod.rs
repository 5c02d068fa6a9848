//! # Privileged Executor
//!
//! Runs command strings inside a privileged shell session and turns their output into
//! structured results. The session itself is abstracted behind [`PrivilegedShell`] so the
//! same executor drives `su -c`, a plain `sh -c` during development, or a test double.
//!
//! Every path embedded in a command goes through [`quote`]; nothing else is allowed to splice
//! user data into a command line.

mod listing;
mod stream;

pub use listing::{parse_listing, parse_listing_record, LISTING_FORMAT};
pub use stream::{ShellReader, ShellWriter};

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::common::{FileMetadata, FileType};
use crate::error::{Result, VaultError};

/// Quote one argument for a POSIX shell.
///
/// The argument is wrapped in single quotes; embedded single quotes become `'\''`. Inside
/// single quotes the shell interprets nothing, so spaces, `$`, backticks, `;` and newlines all
/// stay literal.
pub fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Quote a path. Non-UTF-8 bytes are replaced, so such names are not addressable.
pub fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// A way to start a command inside an elevated session.
pub trait PrivilegedShell: Send + Sync {
    /// Build the process that runs `command` with elevated privileges. Stdio is wired by the
    /// caller.
    fn command(&self, command: &str) -> Command;
}

/// The usual session: `<program> <args..> <command>`, e.g. `su -c '<command>'`.
#[derive(Debug, Clone)]
pub struct SuShell {
    program: String,
    args: Vec<String>,
}

impl SuShell {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    /// `su -c`
    pub fn su() -> Self {
        Self::new("su", vec!["-c".into()])
    }

    /// `sh -c`, no elevation. Useful for development and tests on the caller's own files.
    pub fn sh() -> Self {
        Self::new("sh", vec!["-c".into()])
    }
}

impl PrivilegedShell for SuShell {
    fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(command);
        cmd
    }
}

/// Result of one privileged command. A nonzero `exit_code` is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// `-1` when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ShellOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

fn lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes).lines().map(str::to_owned).collect()
}

/// Executes filesystem work through a [`PrivilegedShell`].
#[derive(Clone)]
pub struct ShellExecutor {
    shell: Arc<dyn PrivilegedShell>,
    util_box: Option<String>,
}

impl std::fmt::Debug for ShellExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellExecutor").field("util_box", &self.util_box).finish()
    }
}

impl ShellExecutor {
    pub fn new(shell: impl PrivilegedShell + 'static) -> Self {
        Self { shell: Arc::new(shell), util_box: None }
    }

    pub fn from_shared(shell: Arc<dyn PrivilegedShell>) -> Self {
        Self { shell, util_box: None }
    }

    /// Prefix every filesystem utility with a multi-call binary such as `toybox`.
    pub fn with_util_box(mut self, util_box: Option<String>) -> Self {
        self.util_box = util_box.filter(|b| !b.trim().is_empty());
        self
    }

    /// Command word for a filesystem utility, honouring the utility box.
    pub fn util(&self, tool: &str) -> String {
        match &self.util_box {
            Some(b) => format!("{} {}", quote(b), tool),
            None => tool.to_owned(),
        }
    }

    pub(crate) fn spawn(
        &self,
        command: &str,
        stdin: Stdio,
        stdout: Stdio,
    ) -> Result<std::process::Child> {
        debug!(command, "spawning privileged command");
        self.shell
            .command(command)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| VaultError::ShellCommandFailed { command: command.to_owned(), source })
    }

    fn output(&self, command: &str) -> Result<std::process::Output> {
        let child = self.spawn(command, Stdio::null(), Stdio::piped())?;
        let out = child
            .wait_with_output()
            .map_err(|source| VaultError::ShellCommandFailed { command: command.to_owned(), source })?;
        debug!(command, exit_code = out.status.code().unwrap_or(-1), "privileged command finished");
        Ok(out)
    }

    /// Run a command and collect its output.
    pub fn run(&self, command: &str) -> Result<ShellOutput> {
        let out = self.output(command)?;
        Ok(ShellOutput {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: lines(&out.stdout),
            stderr: lines(&out.stderr),
        })
    }

    /// Run a command that performs `operation` on `path`; a nonzero exit becomes
    /// [`VaultError::PrivilegedOperationFailed`] carrying the intended `value`.
    pub fn run_checked(
        &self,
        command: &str,
        path: &Path,
        operation: &'static str,
        value: impl Into<String>,
    ) -> Result<ShellOutput> {
        let out = self.run(command)?;
        if out.is_success() {
            Ok(out)
        } else {
            Err(VaultError::PrivilegedOperationFailed {
                path: path.to_path_buf(),
                operation,
                value: value.into(),
                detail: format!("exit code {}: {}", out.exit_code, out.stderr.join("; ")),
            })
        }
    }

    /// Structured listing of `path`. Entries are reported relative to `path`, parents before
    /// children. Records that do not parse are skipped with a warning.
    pub fn list_directory(&self, path: &Path, recursive: bool) -> Result<Vec<FileMetadata>> {
        let depth = if recursive { "" } else { " -maxdepth 1" };
        let command = format!(
            "{} {} -mindepth 1{} -printf {}",
            self.util("find"),
            quote_path(path),
            depth,
            quote(LISTING_FORMAT),
        );
        let out = self.output(&command)?;
        if !out.status.success() {
            let exit_code = out.status.code().unwrap_or(-1);
            if out.stdout.is_empty() {
                return Err(VaultError::PrivilegedOperationFailed {
                    path: path.to_path_buf(),
                    operation: "list",
                    value: String::new(),
                    detail: format!("exit code {}: {}", exit_code, lines(&out.stderr).join("; ")),
                });
            }
            warn!(path = %path.display(), exit_code, "listing finished with errors, keeping partial result");
        }
        Ok(parse_listing(&out.stdout))
    }

    /// What kind of object sits at `path`, `None` when nothing does. Symlinks are not followed.
    pub fn probe(&self, path: &Path) -> Result<Option<FileType>> {
        let q = quote_path(path);
        let command = format!(
            "if [ -L {q} ]; then echo l; elif [ -d {q} ]; then echo d; elif [ -f {q} ]; then echo f; \
             elif [ -p {q} ]; then echo p; elif [ -S {q} ]; then echo s; elif [ -b {q} ]; then echo b; \
             elif [ -c {q} ]; then echo c; else echo x; fi"
        );
        let out = self.run(&command)?;
        Ok(out
            .stdout
            .first()
            .and_then(|l| l.trim().chars().next())
            .and_then(FileType::from_type_char))
    }

    /// Stream the content of `path` out of the privileged session.
    pub fn open_read(&self, path: &Path) -> Result<ShellReader> {
        let command = format!("{} {}", self.util("cat"), quote_path(path));
        let child = self.spawn(&command, Stdio::null(), Stdio::piped())?;
        ShellReader::new(child, path)
    }

    /// Create or truncate `path` and stream bytes into it. Call [`ShellWriter::finish`] to
    /// observe the final status.
    pub fn open_write(&self, path: &Path) -> Result<ShellWriter> {
        let command = format!("{} > {}", self.util("cat"), quote_path(path));
        let child = self.spawn(&command, Stdio::piped(), Stdio::null())?;
        ShellWriter::new(child, path)
    }
}
