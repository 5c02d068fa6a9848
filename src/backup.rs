//! One backup or restore operation: scan, pack and store, or fetch and unpack.
//!
//! These functions tie the scanner, the archive codec and the storage layer together; all
//! policy (which tree, which exclusions, which execution mode) comes from the caller.

use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::archive::{ArchivePacker, PackSummary, BUFFER_SIZE};
use crate::common::{FileMetadata, FinishWrite};
use crate::error::{Result, VaultError};
use crate::extract::{ExclusionRules, Materializer, UnpackSummary, Unpacker};
use crate::progress::ProgressCallback;
use crate::scan::{ContentSource, SourceTree};
use crate::storage::StorageNode;

/// Stream compression wrapped around the tar stream.
#[derive(Serialize, Deserialize, clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Zstd,
}

impl Compression {
    pub fn extension(self) -> &'static str {
        match self {
            Compression::None => ".tar",
            Compression::Zstd => ".tar.zst",
        }
    }

    /// Guess from a stored archive's name.
    pub fn from_archive_name(name: &str) -> Self {
        if name.ends_with(".zst") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Archive file name for a backup called `base`.
pub fn archive_name(base: &str, compression: Compression) -> String {
    format!("{}{}", base, compression.extension())
}

#[derive(Clone)]
pub struct BackupOptions {
    pub compression: Compression,
    pub zstd_level: i32,
    pub buffer_size: usize,
    pub cancel: Option<Arc<AtomicBool>>,
    pub progress: Option<Arc<ProgressCallback>>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            compression: Compression::Zstd,
            zstd_level: 3,
            buffer_size: BUFFER_SIZE,
            cancel: None,
            progress: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct RestoreOptions {
    pub exclusions: ExclusionRules,
    pub cancel: Option<Arc<AtomicBool>>,
    pub progress: Option<Arc<ProgressCallback>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub archive_name: String,
    pub scanned: usize,
    pub pack: PackSummary,
}

fn pack_into<W: Write>(
    writer: W,
    entries: &[FileMetadata],
    source: &dyn ContentSource,
    opts: &BackupOptions,
) -> Result<(W, PackSummary)> {
    let mut packer = ArchivePacker::new(writer).buffer_size(opts.buffer_size);
    if let Some(flag) = &opts.cancel {
        packer = packer.cancellation(flag.clone());
    }
    if let Some(cb) = &opts.progress {
        packer = packer.progress(cb.clone());
    }
    let summary = packer.add_all(entries, Some(source))?;
    Ok((packer.finish()?, summary))
}

/// Scan `source` and write its archive into `dest_dir`, replacing an archive of the same
/// name.
pub fn backup_tree(
    source: &dyn SourceTree,
    dest_dir: &Arc<StorageNode>,
    base_name: &str,
    opts: &BackupOptions,
) -> Result<BackupReport> {
    let entries = source.scan()?;
    let name = archive_name(base_name, opts.compression);
    let node = match dest_dir.find_file(&name) {
        Some(existing) => existing,
        None => dest_dir.create_file(&name)?,
    };
    let sink = node.open_write()?;

    let summary = match opts.compression {
        Compression::None => {
            let (sink, summary) = pack_into(sink, &entries, source.content(), opts)?;
            sink.finish()?;
            summary
        }
        Compression::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(sink, opts.zstd_level)
                .map_err(|e| VaultError::io(e, &name))?;
            let (encoder, summary) = pack_into(encoder, &entries, source.content(), opts)?;
            let sink = encoder.finish().map_err(|e| VaultError::io(e, &name))?;
            sink.finish()?;
            summary
        }
    };

    info!(
        root = %source.root().display(),
        archive = %name,
        entries = summary.written,
        skipped = summary.skipped,
        bytes = summary.content_bytes,
        "backup written"
    );
    Ok(BackupReport { archive_name: name, scanned: entries.len(), pack: summary })
}

/// Unpack the archive stored at `archive` below `target_root`.
pub fn restore_tree(
    archive: &StorageNode,
    target_root: &Path,
    materializer: &dyn Materializer,
    opts: &RestoreOptions,
) -> Result<UnpackSummary> {
    let name = archive.name();
    if !archive.is_file() {
        return Err(VaultError::NotFound { path: name });
    }
    let raw = BufReader::with_capacity(BUFFER_SIZE, archive.open_read()?);
    let reader: Box<dyn Read> = match Compression::from_archive_name(&name) {
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(raw).map_err(|e| VaultError::io(e, &name))?),
        Compression::None => Box::new(raw),
    };

    let mut unpacker = Unpacker::new(materializer).exclusions(opts.exclusions.clone());
    if let Some(flag) = &opts.cancel {
        unpacker = unpacker.cancellation(flag.clone());
    }
    if let Some(cb) = &opts.progress {
        unpacker = unpacker.progress(cb.clone());
    }
    let summary = unpacker.unpack(reader, target_root)?;
    info!(archive = %name, target = %target_root.display(), restored = summary.restored, "restore finished");
    Ok(summary)
}
