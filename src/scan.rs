//! Enumerating a source tree into [`FileMetadata`] records and opening file content.
//!
//! Two flavours mirror the two extraction variants: [`ShellScanner`] goes through the
//! privileged session, [`DirectScanner`] uses the process's own identity.

use std::io::Read;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::common::{FileMetadata, FileType, PERMISSION_MASK};
use crate::error::{Result, VaultError};
use crate::shell::ShellExecutor;

/// Supplies the bytes of a regular file while packing.
pub trait ContentSource {
    fn open(&self, meta: &FileMetadata) -> Result<Box<dyn Read + '_>>;
}

/// A tree that can be enumerated and read: the input side of a backup.
pub trait SourceTree: ContentSource {
    /// All objects below the root, parents before children, paths relative to the root.
    fn scan(&self) -> Result<Vec<FileMetadata>>;

    fn root(&self) -> &Path;

    /// This tree as a plain content source.
    fn content(&self) -> &dyn ContentSource;
}

/// Scans and reads through the privileged session.
pub struct ShellScanner<'a> {
    executor: &'a ShellExecutor,
    root: PathBuf,
}

impl<'a> ShellScanner<'a> {
    pub fn new(executor: &'a ShellExecutor, root: impl Into<PathBuf>) -> Self {
        Self { executor, root: root.into() }
    }
}

impl ContentSource for ShellScanner<'_> {
    fn open(&self, meta: &FileMetadata) -> Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.executor.open_read(&self.root.join(&meta.path))?))
    }
}

impl SourceTree for ShellScanner<'_> {
    fn scan(&self) -> Result<Vec<FileMetadata>> {
        let entries = self.executor.list_directory(&self.root, true)?;
        debug!(root = %self.root.display(), count = entries.len(), "privileged scan complete");
        Ok(entries)
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn content(&self) -> &dyn ContentSource {
        self
    }
}

/// Scans and reads with plain syscalls.
pub struct DirectScanner {
    root: PathBuf,
}

impl DirectScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn file_type_of(ft: std::fs::FileType) -> FileType {
    if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_dir() {
        FileType::Directory
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

impl ContentSource for DirectScanner {
    fn open(&self, meta: &FileMetadata) -> Result<Box<dyn Read + '_>> {
        let path = self.root.join(&meta.path);
        let file = std::fs::File::open(&path).map_err(|e| VaultError::io(e, path))?;
        Ok(Box::new(file))
    }
}

impl SourceTree for DirectScanner {
    fn scan(&self) -> Result<Vec<FileMetadata>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry during scan");
                    continue;
                }
            };
            let meta = entry.metadata().map_err(|e| {
                VaultError::io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "metadata loop")),
                    entry.path(),
                )
            })?;
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|_| VaultError::NotFound { path: entry.path().display().to_string() })?
                .to_string_lossy()
                .into_owned();
            let file_type = file_type_of(entry.file_type());
            let link_target = if file_type == FileType::Symlink {
                let target = std::fs::read_link(entry.path()).map_err(|e| VaultError::io(e, entry.path()))?;
                Some(target.to_string_lossy().into_owned())
            } else {
                None
            };
            entries.push(FileMetadata {
                path: rel,
                file_type,
                mode: meta.mode() & PERMISSION_MASK,
                owner: meta.uid().to_string(),
                group: meta.gid().to_string(),
                size: if file_type == FileType::RegularFile { meta.size() } else { 0 },
                mod_time: meta.mtime(),
                link_target,
            });
        }
        debug!(root = %self.root.display(), count = entries.len(), "direct scan complete");
        Ok(entries)
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn content(&self) -> &dyn ContentSource {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::SuShell;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn direct_and_shell_scans_agree() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("files/deep")).unwrap();
        fs::write(dir.path().join("files/deep/x.bin"), vec![7u8; 300]).unwrap();
        fs::write(dir.path().join("top.txt"), b"top").unwrap();
        std::os::unix::fs::symlink("top.txt", dir.path().join("alias")).unwrap();

        let direct = DirectScanner::new(dir.path()).scan().unwrap();
        let exec = ShellExecutor::new(SuShell::sh());
        let mut shell = ShellScanner::new(&exec, dir.path()).scan().unwrap();
        shell.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(direct.len(), shell.len());
        for (d, s) in direct.iter().zip(shell.iter()) {
            assert_eq!(d.path, s.path);
            assert_eq!(d.file_type, s.file_type);
            assert_eq!(d.mode, s.mode);
            assert_eq!(d.size, s.size);
            assert_eq!(d.mod_time, s.mod_time);
            assert_eq!(d.link_target, s.link_target);
        }
    }

    #[test]
    fn direct_scan_is_parent_first() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c"), b"").unwrap();
        let paths: Vec<_> = DirectScanner::new(dir.path())
            .scan()
            .unwrap()
            .into_iter()
            .map(|m| m.path)
            .collect();
        assert_eq!(paths, vec!["a", "a/b", "a/b/c"]);
    }
}
