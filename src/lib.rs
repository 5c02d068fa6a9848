//! # rootvault Core Library
//!
//! Backs up and restores application data that lives outside the caller's own permissions.
//! Files are reached through a privileged shell session (or plain syscalls when the process is
//! already privileged) and packaged as tar archives that keep file type, permission bits,
//! ownership, link targets and modification times.
//!
//! ## Key Modules
//!
//! - [`shell`]: the privileged executor: quoting, command execution, structured listings and
//!   byte streams.
//! - [`scan`]: enumerates a source tree into [`common::FileMetadata`] records.
//! - [`archive`]: packs metadata records and file content into a tar stream.
//! - [`extract`]: unpacks a tar stream through a direct or a shell-mediated materializer.
//! - [`storage`]: uniform nodes over privileged paths and document trees, with a listing cache.
//! - [`backup`]: one backup or restore operation end to end.
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use rootvault::backup::{backup_tree, BackupOptions};
//! use rootvault::scan::ShellScanner;
//! use rootvault::shell::{ShellExecutor, SuShell};
//! use rootvault::storage::StorageNode;
//!
//! let executor = Arc::new(ShellExecutor::new(SuShell::su()));
//! let source = ShellScanner::new(&executor, "/data/data/org.example.app");
//! let dest = StorageNode::from_path(executor.clone(), "/sdcard/backups");
//! let report = backup_tree(&source, &dest, "org.example.app", &BackupOptions::default())?;
//! println!("{} entries", report.pack.written);
//! # Ok::<(), rootvault::VaultError>(())
//! ```

pub mod archive;
pub mod backup;
pub mod cli;
pub mod cli_runner;
pub mod common;
pub mod config;
pub mod error;
pub mod extract;
pub mod progress;
pub mod scan;
pub mod shell;
pub mod storage;

pub use error::{Result, VaultError};

// Filesystem wrapper for the direct code paths
pub mod fsx;
