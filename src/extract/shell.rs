use std::io::{self, Read};
use std::path::Path;
use std::process::Stdio;

use crate::error::{Result, VaultError};
use crate::shell::{quote, quote_path, ShellExecutor, ShellWriter};

/// Restores through privileged shell commands, one command per step.
pub struct ShellMaterializer<'a> {
    executor: &'a ShellExecutor,
}

impl<'a> ShellMaterializer<'a> {
    pub fn new(executor: &'a ShellExecutor) -> Self {
        Self { executor }
    }

    /// Prefix that clears a non-directory at `q` and refuses a real directory, like the
    /// syscall path does.
    fn clear_slot(&self, q: &str) -> String {
        format!(
            "if [ -d {q} ] && [ ! -L {q} ]; then echo 'File exists' >&2; exit 1; fi; {} -f {q} && ",
            self.executor.util("rm"),
        )
    }
}

impl super::Materializer for ShellMaterializer<'_> {
    fn make_directory(&self, path: &Path) -> Result<()> {
        let command = format!("{} -p {}", self.executor.util("mkdir"), quote_path(path));
        self.executor.run_checked(&command, path, "mkdir", "directory")?;
        Ok(())
    }

    fn create_hard_link(&self, target: &Path, path: &Path) -> Result<()> {
        let q = quote_path(path);
        let command = format!(
            "{}{} {} {q}",
            self.clear_slot(&q),
            self.executor.util("ln"),
            quote_path(target),
        );
        self.executor
            .run_checked(&command, path, "ln", target.display().to_string())?;
        Ok(())
    }

    fn create_symlink(&self, target: &str, path: &Path) -> Result<()> {
        let q = quote_path(path);
        let command = format!(
            "{}{} -s {} {q}",
            self.clear_slot(&q),
            self.executor.util("ln"),
            quote(target),
        );
        self.executor.run_checked(&command, path, "ln -s", target)?;
        Ok(())
    }

    fn create_fifo(&self, path: &Path) -> Result<()> {
        let q = quote_path(path);
        let command = format!("{}{} {q}", self.clear_slot(&q), self.executor.util("mkfifo"));
        self.executor.run_checked(&command, path, "mkfifo", "fifo")?;
        Ok(())
    }

    fn write_file(&self, path: &Path, content: &mut dyn Read) -> Result<u64> {
        let q = quote_path(path);
        let command = format!(
            "if [ -L {q} ]; then {} -f {q} || exit 1; fi; {} > {q}",
            self.executor.util("rm"),
            self.executor.util("cat"),
        );
        let child = self.executor.spawn(&command, Stdio::piped(), Stdio::null())?;
        let mut writer = ShellWriter::new(child, path)?;
        let copied = io::copy(content, &mut writer).map_err(|e| VaultError::io(e, path))?;
        writer.finish()?;
        Ok(copied)
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        // Five digits so GNU chmod also clears setgid on directories.
        let command = format!("{} {:05o} {}", self.executor.util("chmod"), mode, quote_path(path));
        self.executor
            .run_checked(&command, path, "chmod", format!("{:04o}", mode))?;
        Ok(())
    }

    fn set_mod_time(&self, path: &Path, secs: i64) -> Result<()> {
        let command = format!(
            "{} -c -h -m -d @{} {}",
            self.executor.util("touch"),
            secs,
            quote_path(path),
        );
        self.executor.run_checked(&command, path, "touch", secs.to_string())?;
        Ok(())
    }

    fn is_symlink(&self, path: &Path) -> Result<bool> {
        let out = self.executor.run(&format!("[ -L {} ]", quote_path(path)))?;
        Ok(out.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Materializer;
    use crate::shell::SuShell;
    use std::fs;
    use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
    use tempfile::tempdir;

    #[test]
    fn shell_steps_touch_the_filesystem() {
        let dir = tempdir().unwrap();
        let exec = ShellExecutor::new(SuShell::sh());
        let m = ShellMaterializer::new(&exec);

        let sub = dir.path().join("nested dir/with 'quote'");
        m.make_directory(&sub).unwrap();
        assert!(sub.is_dir());

        let file = sub.join("f.txt");
        let n = m.write_file(&file, &mut &b"hello"[..]).unwrap();
        assert_eq!(n, 5);
        m.chmod(&file, 0o640).unwrap();
        m.set_mod_time(&file, 1_500_000_000).unwrap();
        let meta = fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o640);
        assert_eq!(meta.mtime(), 1_500_000_000);

        let pipe = sub.join("p");
        fs::write(&pipe, b"stale").unwrap();
        m.create_fifo(&pipe).unwrap();
        assert!(fs::symlink_metadata(&pipe).unwrap().file_type().is_fifo());

        let link = sub.join("l");
        m.create_symlink("f.txt", &link).unwrap();
        m.create_symlink("f.txt", &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("f.txt"));

        let hard = sub.join("h");
        m.create_hard_link(&file, &hard).unwrap();
        assert_eq!(fs::read(&hard).unwrap(), b"hello");
    }

    #[test]
    fn failing_step_reports_privileged_operation() {
        let dir = tempdir().unwrap();
        let exec = ShellExecutor::new(SuShell::sh());
        let m = ShellMaterializer::new(&exec);
        match m.chmod(&dir.path().join("missing"), 0o644) {
            Err(VaultError::PrivilegedOperationFailed { operation, value, .. }) => {
                assert_eq!(operation, "chmod");
                assert_eq!(value, "0644");
            }
            other => panic!("unexpected {:?}", other),
        }
        // a real directory is never replaced by a link
        let d = dir.path().join("d");
        fs::create_dir(&d).unwrap();
        assert!(m.create_symlink("x", &d).is_err());
        assert!(d.is_dir());
    }

    #[test]
    fn symlinks_are_replaced_not_followed() {
        let dir = tempdir().unwrap();
        let exec = ShellExecutor::new(SuShell::sh());
        let m = ShellMaterializer::new(&exec);

        let victim = dir.path().join("victim");
        fs::write(&victim, b"keep").unwrap();
        m.set_mod_time(&victim, 1_400_000_000).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&victim, &link).unwrap();
        assert!(m.is_symlink(&link).unwrap());
        assert!(!m.is_symlink(&victim).unwrap());
        assert!(!m.is_symlink(&dir.path().join("missing")).unwrap());

        m.set_mod_time(&link, 1_500_000_000).unwrap();
        assert_eq!(fs::metadata(&victim).unwrap().mtime(), 1_400_000_000);

        m.write_file(&link, &mut &b"fresh"[..]).unwrap();
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_file());
        assert_eq!(fs::read(&link).unwrap(), b"fresh");
        assert_eq!(fs::read(&victim).unwrap(), b"keep");
    }
}
