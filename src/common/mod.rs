//! Common types shared by the scanner, the archive codec and the storage layer.

use std::io::Write;

use serde::{Deserialize, Serialize};

/// Type bits OR-ed into a tar entry mode, per POSIX `st_mode`.
pub const DIR_MODE_OR_MASK: u32 = 0o040000;
pub const FILE_MODE_OR_MASK: u32 = 0o100000;
pub const FIFO_MODE_OR_MASK: u32 = 0o010000;
pub const SYMLINK_MODE_OR_MASK: u32 = 0o120000;

/// Permission bits including setuid, setgid and sticky.
pub const PERMISSION_MASK: u32 = 0o7777;

/// Kind of filesystem object reported by a scan.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    NamedPipe,
    BlockDevice,
    CharDevice,
    Socket,
}

impl FileType {
    /// Maps the single-letter type code used by `find -printf %y` (and `ls -l`).
    pub fn from_type_char(c: char) -> Option<Self> {
        match c {
            'f' | '-' => Some(FileType::RegularFile),
            'd' => Some(FileType::Directory),
            'l' => Some(FileType::Symlink),
            'p' => Some(FileType::NamedPipe),
            'b' => Some(FileType::BlockDevice),
            'c' => Some(FileType::CharDevice),
            's' => Some(FileType::Socket),
            _ => None,
        }
    }

    pub fn type_char(self) -> char {
        match self {
            FileType::RegularFile => 'f',
            FileType::Directory => 'd',
            FileType::Symlink => 'l',
            FileType::NamedPipe => 'p',
            FileType::BlockDevice => 'b',
            FileType::CharDevice => 'c',
            FileType::Socket => 's',
        }
    }

    /// The OR-mask combined with the permission bits in an archive entry, or `None` for types
    /// that are never archived.
    pub fn mode_mask(self) -> Option<u32> {
        match self {
            FileType::RegularFile => Some(FILE_MODE_OR_MASK),
            FileType::Directory => Some(DIR_MODE_OR_MASK),
            FileType::Symlink => Some(SYMLINK_MODE_OR_MASK),
            FileType::NamedPipe => Some(FIFO_MODE_OR_MASK),
            FileType::BlockDevice | FileType::CharDevice | FileType::Socket => None,
        }
    }
}

/// Metadata for a single filesystem object found by a privileged scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Path relative to the scanned root.
    pub path: String,
    pub file_type: FileType,
    /// 12-bit permission value, type bits excluded.
    pub mode: u32,
    pub owner: String,
    pub group: String,
    /// Only meaningful for regular files.
    pub size: u64,
    /// Unix timestamp, second resolution.
    pub mod_time: i64,
    pub link_target: Option<String>,
}

impl FileMetadata {
    /// Entry mode for the archive header: type mask | permission bits.
    pub fn archive_mode(&self) -> Option<u32> {
        self.file_type
            .mode_mask()
            .map(|mask| mask | (self.mode & PERMISSION_MASK))
    }

    /// Last path component.
    pub fn name(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.path)
    }
}

/// A byte sink whose final status is only known once it is closed (a privileged `cat >`, a
/// document stream). Dropping without `finish` closes it but discards the status.
pub trait FinishWrite: Write + Send {
    fn finish(self: Box<Self>) -> crate::Result<()>;
}

/// Adapter for sinks that report everything through `Write` itself.
pub struct PlainWriter<W: Write + Send>(pub W);

impl<W: Write + Send> Write for PlainWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> FinishWrite for PlainWriter<W> {
    fn finish(mut self: Box<Self>) -> crate::Result<()> {
        self.0.flush()?;
        Ok(())
    }
}
