//! # Archive packing
//!
//! Serializes a scan (a sequence of [`FileMetadata`]) into a tar stream. Entries are written
//! in input order, one header each; regular files are followed by exactly `size` bytes of
//! content pulled from a [`ContentSource`].
//!
//! Entry modes carry the type mask in the high bits and the 12 permission bits below it, so
//! any tar implementation restores the right kind of object.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tar::{Builder, EntryType, Header};
use tracing::{debug, warn};

use crate::common::{FileMetadata, FileType};
use crate::error::{Result, VaultError};
use crate::extract::normalize_entry_path;
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::scan::ContentSource;

/// Copy buffer for file content. Privileged reads are expensive per call, so reads are
/// batched into large chunks.
pub const BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Read until `buf` is full or the reader is exhausted. Short reads are normal for pipes
/// and are retried, not treated as EOF.
pub fn fill_buffer(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Presents exactly `remaining` bytes of `inner`, refilled in large chunks. A source that
/// ends early is padded with zeros; surplus bytes are never read.
struct ExactContent<'a, 'r> {
    inner: Box<dyn Read + 'r>,
    buf: &'a mut [u8],
    pos: usize,
    len: usize,
    remaining: u64,
    padded: u64,
}

impl<'a, 'r> ExactContent<'a, 'r> {
    fn new(inner: Box<dyn Read + 'r>, size: u64, buf: &'a mut [u8]) -> Self {
        Self { inner, buf, pos: 0, len: 0, remaining: size, padded: 0 }
    }
}

impl Read for ExactContent<'_, '_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.len {
            if self.remaining == 0 {
                return Ok(0);
            }
            let want = self.buf.len().min(self.remaining as usize);
            let got = fill_buffer(&mut self.inner, &mut self.buf[..want])?;
            if got < want {
                self.buf[got..want].fill(0);
                self.padded += (want - got) as u64;
            }
            self.pos = 0;
            self.len = want;
            self.remaining -= want as u64;
        }
        let n = out.len().min(self.len - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Counters for one pack pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackSummary {
    pub written: usize,
    pub skipped: usize,
    pub content_bytes: u64,
    /// Regular files whose source delivered fewer bytes than announced.
    pub padded_files: usize,
}

/// What happened to a single metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackOutcome {
    Written { content_bytes: u64 },
    Skipped,
}

/// Writes tar entries for scan results.
pub struct ArchivePacker<W: Write> {
    builder: Builder<W>,
    buffer: Vec<u8>,
    buffer_size: usize,
    cancel: Option<Arc<AtomicBool>>,
    progress: Option<Arc<ProgressCallback>>,
    padded_files: usize,
}

fn header_for(meta: &FileMetadata, entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(meta.mod_time.max(0) as u64);
    header.set_uid(meta.owner.parse().unwrap_or(0));
    header.set_gid(meta.group.parse().unwrap_or(0));
    if let Err(e) = header.set_username(&meta.owner) {
        warn!(path = %meta.path, owner = %meta.owner, error = %e, "owner name not stored");
    }
    if let Err(e) = header.set_groupname(&meta.group) {
        warn!(path = %meta.path, group = %meta.group, error = %e, "group name not stored");
    }
    header
}

impl<W: Write> ArchivePacker<W> {
    pub fn new(writer: W) -> Self {
        Self {
            builder: Builder::new(writer),
            buffer: Vec::new(),
            buffer_size: BUFFER_SIZE,
            cancel: None,
            progress: None,
            padded_files: 0,
        }
    }

    /// Size of the chunk pulled from a content source per refill.
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes.max(512);
        self
    }

    /// Checked before every entry; once set, packing stops with [`VaultError::Cancelled`].
    pub fn cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn progress(mut self, callback: Arc<ProgressCallback>) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Write one record. Devices and sockets are logged and skipped.
    pub fn add_entry(
        &mut self,
        meta: &FileMetadata,
        source: Option<&dyn ContentSource>,
    ) -> Result<PackOutcome> {
        let Some(mode) = meta.archive_mode() else {
            warn!(path = %meta.path, file_type = ?meta.file_type, "not archivable, skipping");
            return Ok(PackOutcome::Skipped);
        };
        let Some(name) = normalize_entry_path(Path::new(&meta.path)).filter(|n| !n.is_empty()) else {
            warn!(path = %meta.path, "path has no archivable name, skipping");
            return Ok(PackOutcome::Skipped);
        };
        let io_err = |e: io::Error| VaultError::io(e, &meta.path);

        match meta.file_type {
            FileType::RegularFile => {
                debug!(path = %meta.path, size = meta.size, "adding file to archive");
                let (size, reader): (u64, Box<dyn Read + '_>) = match source {
                    Some(src) => (meta.size, src.open(meta)?),
                    None => {
                        warn!(path = %meta.path, "no content source, storing empty file");
                        (0, Box::new(io::empty()))
                    }
                };
                let mut header = header_for(meta, EntryType::Regular, mode, size);
                let want = self.buffer_size.min(size.max(1) as usize);
                if self.buffer.len() < want {
                    self.buffer.resize(want, 0);
                }
                let mut content = ExactContent::new(reader, size, &mut self.buffer[..want]);
                self.builder
                    .append_data(&mut header, &name, &mut content)
                    .map_err(io_err)?;
                if content.padded > 0 {
                    warn!(
                        path = %meta.path,
                        missing = content.padded,
                        "file shrank while archiving, padded with zeros"
                    );
                    self.padded_files += 1;
                }
                Ok(PackOutcome::Written { content_bytes: size })
            }
            FileType::Directory => {
                debug!(path = %meta.path, "adding directory to archive");
                let mut header = header_for(meta, EntryType::Directory, mode, 0);
                self.builder
                    .append_data(&mut header, &name, io::empty())
                    .map_err(io_err)?;
                Ok(PackOutcome::Written { content_bytes: 0 })
            }
            FileType::Symlink => {
                let Some(target) = meta.link_target.as_deref() else {
                    warn!(path = %meta.path, "symlink without target, skipping");
                    return Ok(PackOutcome::Skipped);
                };
                debug!(path = %meta.path, target, "adding symlink to archive");
                let mut header = header_for(meta, EntryType::Symlink, mode, 0);
                self.builder
                    .append_link(&mut header, &name, target)
                    .map_err(io_err)?;
                Ok(PackOutcome::Written { content_bytes: 0 })
            }
            FileType::NamedPipe => {
                debug!(path = %meta.path, "adding fifo to archive");
                let mut header = header_for(meta, EntryType::Fifo, mode, 0);
                self.builder
                    .append_data(&mut header, &name, io::empty())
                    .map_err(io_err)?;
                Ok(PackOutcome::Written { content_bytes: 0 })
            }
            FileType::BlockDevice | FileType::CharDevice | FileType::Socket => Ok(PackOutcome::Skipped),
        }
    }

    /// Write every record in order.
    pub fn add_all(
        &mut self,
        entries: &[FileMetadata],
        source: Option<&dyn ContentSource>,
    ) -> Result<PackSummary> {
        let mut summary = PackSummary::default();
        let mut tracker = ProgressTracker::new(entries.len() as u64, self.progress.clone());
        let padded_before = self.padded_files;
        for meta in entries {
            if self.cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed)) {
                return Err(VaultError::Cancelled);
            }
            match self.add_entry(meta, source)? {
                PackOutcome::Written { content_bytes } => {
                    summary.written += 1;
                    summary.content_bytes += content_bytes;
                    tracker.record_entry(&meta.path, content_bytes);
                }
                PackOutcome::Skipped => {
                    summary.skipped += 1;
                    tracker.record_skipped(&meta.path);
                }
            }
        }
        summary.padded_files = self.padded_files - padded_before;
        Ok(summary)
    }

    /// Write the end-of-archive marker and hand back the underlying writer.
    pub fn finish(self) -> Result<W> {
        Ok(self.builder.into_inner()?)
    }
}
