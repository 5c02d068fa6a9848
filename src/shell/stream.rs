//! Byte streams in and out of the privileged session (`cat` / `cat >`).

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout};

use crate::common::FinishWrite;
use crate::error::{Result, VaultError};

fn drain_stderr(child: &mut Child) -> String {
    let mut msg = String::new();
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut msg);
    }
    msg.trim().to_owned()
}

/// Reads the stdout of a privileged `cat`. A nonzero exit surfaces as an error at EOF.
///
/// Single reads may return fewer bytes than requested; callers that need full chunks loop.
pub struct ShellReader {
    child: Child,
    stdout: ChildStdout,
    path: PathBuf,
    finished: bool,
}

impl ShellReader {
    pub(crate) fn new(mut child: Child, path: &Path) -> Result<Self> {
        let stdout = child.stdout.take().ok_or_else(|| {
            VaultError::io(io::Error::new(io::ErrorKind::BrokenPipe, "no stdout pipe"), path)
        })?;
        Ok(Self { child, stdout, path: path.to_path_buf(), finished: false })
    }
}

impl Read for ShellReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.finished {
            self.finished = true;
            let stderr = drain_stderr(&mut self.child);
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("privileged read of '{}' failed ({}): {}", self.path.display(), status, stderr),
                ));
            }
        }
        Ok(n)
    }
}

impl Drop for ShellReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Feeds the stdin of a privileged `cat > path`.
pub struct ShellWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    path: PathBuf,
}

impl ShellWriter {
    pub(crate) fn new(mut child: Child, path: &Path) -> Result<Self> {
        let stdin = child.stdin.take().ok_or_else(|| {
            VaultError::io(io::Error::new(io::ErrorKind::BrokenPipe, "no stdin pipe"), path)
        })?;
        Ok(Self { child, stdin: Some(stdin), path: path.to_path_buf() })
    }

    /// Close the stream and wait for the writer process; a nonzero exit becomes
    /// [`VaultError::PrivilegedOperationFailed`].
    pub fn finish(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush().map_err(|e| VaultError::io(e, &self.path))?;
        } else {
            return Ok(());
        }
        let stderr = drain_stderr(&mut self.child);
        let status = self.child.wait().map_err(|e| VaultError::io(e, &self.path))?;
        if status.success() {
            Ok(())
        } else {
            Err(VaultError::PrivilegedOperationFailed {
                path: self.path.clone(),
                operation: "write",
                value: "file content".into(),
                detail: format!("{}: {}", status, stderr),
            })
        }
    }
}

impl Write for ShellWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer already finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl FinishWrite for ShellWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.close()
    }
}

impl Drop for ShellWriter {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            let _ = self.child.wait();
        }
    }
}
