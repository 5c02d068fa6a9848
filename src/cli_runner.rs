//! Command implementations for the `rootvault` binary.

use crate::backup::{self, BackupOptions, RestoreOptions};
use crate::cli::{self, Commands};
use crate::common::FileMetadata;
use crate::extract::{self, ExclusionRules};
use crate::progress::{ProgressCallback, ProgressState};
use crate::scan::{DirectScanner, ShellScanner, SourceTree};
use crate::shell::{quote_path, ShellExecutor};
use crate::storage::StorageNode;
use chrono::{TimeZone, Utc};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber. `RUST_LOG` wins over `-v`.
pub fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rootvault={}", level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

/// Parse arguments and run the selected command.
pub fn run_cli_app() -> Result<(), Box<dyn std::error::Error>> {
    let args = cli::run()?;
    init_logging(args.verbose);
    let config = cli::resolve_config(&args)?;
    let executor = Arc::new(config.executor());

    match &args.command {
        Commands::Backup { source, output, name, direct, compression, level, progress } => {
            let base = match name {
                Some(n) => n.clone(),
                None => source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or("cannot derive an archive name from the source, pass --name")?,
            };
            executor.run_checked(
                &format!("{} -p {}", executor.util("mkdir"), quote_path(output)),
                output,
                "mkdir",
                "directory",
            )?;
            let dest = StorageNode::from_path(executor.clone(), output);
            let opts = BackupOptions {
                compression: compression.unwrap_or(config.compression),
                zstd_level: level.unwrap_or(config.zstd_level),
                buffer_size: config.buffer_size,
                cancel: None,
                progress: progress.then(|| create_cli_progress_callback("backup")),
            };

            let report = if *direct {
                backup::backup_tree(&DirectScanner::new(source), &dest, &base, &opts)?
            } else {
                let scanner = ShellScanner::new(&executor, source);
                backup::backup_tree(&scanner as &dyn SourceTree, &dest, &base, &opts)?
            };
            if *progress {
                eprintln!();
            }
            println!(
                "{}: {} entries, {} skipped, {} bytes",
                output.join(&report.archive_name).display(),
                report.pack.written,
                report.pack.skipped,
                report.pack.content_bytes,
            );
        }
        Commands::Restore { archive, output, mode, exclude, exclude_cache, no_default_excludes, progress } => {
            let mut rules = if *no_default_excludes { ExclusionRules::default() } else { config.exclusions() };
            rules.dirs.extend(exclude.iter().cloned());
            rules.cache_dirs.extend(exclude_cache.iter().cloned());

            let node = StorageNode::from_path(executor.clone(), archive);
            let materializer = mode.unwrap_or(config.execution_mode).materializer(&executor);
            let opts = RestoreOptions {
                exclusions: rules,
                cancel: None,
                progress: progress.then(|| create_cli_progress_callback("restore")),
            };
            let summary = backup::restore_tree(&node, output, materializer.as_ref(), &opts)?;
            if *progress {
                eprintln!();
            }
            println!(
                "{}: {} restored, {} excluded, {} skipped",
                output.display(),
                summary.restored,
                summary.excluded,
                summary.skipped,
            );
        }
        Commands::List { archive } => {
            let entries = list_archive(&executor, archive)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for meta in &entries {
                writeln!(out, "{}", format_entry(meta))?;
            }
        }
        Commands::Ls { path, recursive } => {
            let entries = executor.list_directory(path, *recursive)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for meta in &entries {
                writeln!(out, "{}", format_entry(meta))?;
            }
        }
    }

    Ok(())
}

fn list_archive(executor: &ShellExecutor, archive: &Path) -> crate::Result<Vec<FileMetadata>> {
    let raw = BufReader::new(executor.open_read(archive)?);
    let name = archive.to_string_lossy();
    let reader: Box<dyn Read> = match backup::Compression::from_archive_name(&name) {
        backup::Compression::Zstd => Box::new(
            zstd::stream::read::Decoder::with_buffer(raw).map_err(|e| crate::VaultError::io(e, archive))?,
        ),
        backup::Compression::None => Box::new(raw),
    };
    extract::list_entries(reader)
}

/// One `ls -l`-like line: type, mode, owner/group, size, time, path and link target.
pub fn format_entry(meta: &FileMetadata) -> String {
    let time = Utc
        .timestamp_opt(meta.mod_time, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| meta.mod_time.to_string());
    let mut line = format!(
        "{} {:04o} {}/{} {:>10} {} {}",
        meta.file_type.type_char(),
        meta.mode,
        meta.owner,
        meta.group,
        meta.size,
        time,
        meta.path,
    );
    if let Some(target) = &meta.link_target {
        line.push_str(" -> ");
        line.push_str(target);
    }
    line
}

// --- utils for CLI progress -------------------------------------------------

fn create_cli_progress_callback(operation: &str) -> Arc<ProgressCallback> {
    let operation = operation.to_uppercase();
    let last_update = Mutex::new(None::<Instant>);
    let prev_len = Mutex::new(0usize);

    Arc::new(move |state: &ProgressState| {
        let now = Instant::now();
        // Update every 100ms to avoid terminal spam, but always show completion
        let complete = state.total_entries > 0 && state.processed_entries >= state.total_entries;
        {
            let mut last = last_update.lock().unwrap();
            if let Some(prev) = *last {
                if !complete && now.duration_since(prev).as_millis() < 100 {
                    return;
                }
            }
            *last = Some(now);
        }

        let term_width = term_size::dimensions().map(|(w, _)| w).unwrap_or(80);

        let build_status_line = |bw: usize| -> String {
            let counts = if state.total_entries > 0 {
                let filled = ((state.progress_percent() / 100.0) * bw as f32) as usize;
                let empty = bw.saturating_sub(filled);
                format!(
                    "[{}{}] {:.1}% | {}/{} entries",
                    "█".repeat(filled),
                    "░".repeat(empty),
                    state.progress_percent(),
                    state.processed_entries,
                    state.total_entries,
                )
            } else {
                format!("{} entries", state.processed_entries)
            };
            format!(
                "[{}] {} | {} skipped | {:.1} MB/s | {}",
                operation,
                counts,
                state.skipped_entries,
                state.speed_mbps(),
                state.current_path,
            )
        };

        let mut bar_len = 40;
        let status_line = loop {
            let line = build_status_line(bar_len);
            if line.chars().count() <= term_width || bar_len <= 10 {
                break line.chars().take(term_width).collect::<String>();
            }
            bar_len -= 4;
        };

        let mut line_to_print = status_line;
        {
            let mut prev = prev_len.lock().unwrap();
            let len = line_to_print.chars().count();
            if *prev > len {
                line_to_print.push_str(&" ".repeat(*prev - len));
            }
            *prev = len;
        }
        eprint!("\r\x1B[2K{}", line_to_print);
        io::stderr().flush().ok();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FileType;

    #[test]
    fn entry_line_shows_link_target() {
        let meta = FileMetadata {
            path: "a/c".into(),
            file_type: FileType::Symlink,
            mode: 0o777,
            owner: "root".into(),
            group: "root".into(),
            size: 0,
            mod_time: 0,
            link_target: Some("b.txt".into()),
        };
        assert_eq!(
            format_entry(&meta),
            "l 0777 root/root          0 1970-01-01 00:00 a/c -> b.txt"
        );
    }
}
