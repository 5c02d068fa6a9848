//! # Extraction Module
//!
//! Rebuilds a directory tree from a tar stream. The entry-type state machine lives in
//! [`Unpacker`]; the actual filesystem work is delegated to a [`Materializer`], of which there
//! are two: [`DirectMaterializer`] (plain syscalls, for a process that already holds the needed
//! identity) and [`ShellMaterializer`] (every step is a privileged shell command).
//!
//! Both produce the same tree for the same archive. Directory modes are applied last, so a
//! read-only directory can still receive its children.
//!
//! Nothing is written through a symlink below the restore root. An entry whose path runs
//! through one (restored earlier in the same archive or already on disk) is skipped with a
//! warning, and a regular file replaces a symlink at its own path instead of following it.

mod direct;
mod shell;

pub use direct::DirectMaterializer;
pub use shell::ShellMaterializer;

use std::collections::HashSet;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tar::EntryType;
use tracing::{debug, info, warn};

use crate::common::{FileMetadata, FileType, PERMISSION_MASK};
use crate::error::{Result, VaultError};
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::shell::ShellExecutor;

/// Filesystem capabilities the unpack algorithm needs. Paths are absolute (root already
/// joined); implementations report failures as [`VaultError`]s which the unpacker wraps.
pub trait Materializer {
    /// Create the directory and any missing parents. Existing directories are fine.
    fn make_directory(&self, path: &Path) -> Result<()>;

    /// Hard link `path` to the existing `target`, replacing a non-directory at `path`.
    fn create_hard_link(&self, target: &Path, path: &Path) -> Result<()>;

    /// Symlink `path -> target`; `target` is stored verbatim.
    fn create_symlink(&self, target: &str, path: &Path) -> Result<()>;

    fn create_fifo(&self, path: &Path) -> Result<()>;

    /// Create or truncate `path` and copy `content` into it until EOF. A symlink at `path` is
    /// replaced, never written through.
    fn write_file(&self, path: &Path, content: &mut dyn Read) -> Result<u64>;

    /// Set the 12 permission bits.
    fn chmod(&self, path: &Path, mode: u32) -> Result<()>;

    /// Set the modification time without following a final symlink.
    fn set_mod_time(&self, path: &Path, secs: i64) -> Result<()>;

    /// Whether `path` itself is a symlink. Missing paths are not.
    fn is_symlink(&self, path: &Path) -> Result<bool>;
}

/// How restore steps reach the filesystem.
#[derive(Serialize, Deserialize, clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Native syscalls with the process's own identity.
    Direct,
    /// Every step through the privileged shell.
    Shell,
    /// Direct when running as root, shell otherwise.
    #[default]
    Auto,
}

impl ExecutionMode {
    /// Resolve `Auto` against the current effective uid.
    pub fn resolve(self) -> ExecutionMode {
        match self {
            ExecutionMode::Auto if crate::fsx::effective_uid() == 0 => ExecutionMode::Direct,
            ExecutionMode::Auto => ExecutionMode::Shell,
            other => other,
        }
    }

    pub fn materializer<'a>(self, executor: &'a ShellExecutor) -> Box<dyn Materializer + 'a> {
        match self.resolve() {
            ExecutionMode::Direct => Box::new(DirectMaterializer),
            _ => Box::new(ShellMaterializer::new(executor)),
        }
    }
}

/// Relative paths that must not be restored: general exclusions and cache directories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionRules {
    pub dirs: Vec<String>,
    pub cache_dirs: Vec<String>,
}

impl ExclusionRules {
    pub fn new(dirs: Vec<String>, cache_dirs: Vec<String>) -> Self {
        Self { dirs, cache_dirs }
    }

    fn matches(&self, candidate: &str) -> bool {
        self.dirs.iter().any(|d| d == candidate) || self.cache_dirs.iter().any(|d| d == candidate)
    }

    /// Exact match of `rel` or of one of its ancestors.
    pub fn is_excluded(&self, rel: &str) -> bool {
        if self.dirs.is_empty() && self.cache_dirs.is_empty() {
            return false;
        }
        let mut prefix = rel;
        loop {
            if self.matches(prefix) {
                return true;
            }
            match prefix.rfind('/') {
                Some(idx) => prefix = &prefix[..idx],
                None => return false,
            }
        }
    }
}

/// Strip `./` and leading `/`, reject `..`. Returns `None` for paths that would escape the
/// restore root; an empty string is the root itself.
pub fn normalize_entry_path(raw: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.join("/"))
}

/// Counters for one unpack pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnpackSummary {
    pub restored: usize,
    pub excluded: usize,
    pub skipped: usize,
    pub bytes: u64,
    pub deferred_modes: usize,
}

struct DeferredDir {
    rel: String,
    path: PathBuf,
    mode: u32,
    mtime: i64,
}

/// Which paths below the restore root are symlinks, as far as this pass has looked. Nothing is
/// ever written through one of them.
#[derive(Default)]
struct LinkGuard {
    links: HashSet<PathBuf>,
    plain: HashSet<PathBuf>,
}

impl LinkGuard {
    fn is_link(&mut self, m: &dyn Materializer, path: &Path) -> Result<bool> {
        if self.links.contains(path) {
            return Ok(true);
        }
        if self.plain.contains(path) {
            return Ok(false);
        }
        let link = m.is_symlink(path)?;
        if link {
            self.links.insert(path.to_path_buf());
        } else {
            self.plain.insert(path.to_path_buf());
        }
        Ok(link)
    }

    /// First ancestor of `rel` (below `root`, excluding `rel` itself) that is a symlink.
    fn linked_ancestor(&mut self, m: &dyn Materializer, root: &Path, rel: &str) -> Result<Option<PathBuf>> {
        let mut current = root.to_path_buf();
        let mut parts = rel.split('/').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                break;
            }
            current.push(part);
            if self.is_link(m, &current)? {
                return Ok(Some(current));
            }
        }
        Ok(None)
    }

    fn record_link(&mut self, path: &Path) {
        self.plain.remove(path);
        self.links.insert(path.to_path_buf());
    }

    fn record_plain(&mut self, path: &Path) {
        self.links.remove(path);
        self.plain.insert(path.to_path_buf());
    }
}

/// Sequential tar-to-tree extraction over a [`Materializer`].
pub struct Unpacker<'m> {
    materializer: &'m dyn Materializer,
    exclusions: ExclusionRules,
    cancel: Option<Arc<AtomicBool>>,
    progress: Option<Arc<ProgressCallback>>,
}

fn step<T>(rel: &str, operation: &'static str, value: impl Into<String>, res: Result<T>) -> Result<T> {
    res.map_err(|source| VaultError::UnpackFailed {
        path: rel.to_owned(),
        operation,
        value: value.into(),
        source: Box::new(source),
    })
}

fn mode_str(mode: u32) -> String {
    format!("{:04o}", mode)
}

impl<'m> Unpacker<'m> {
    pub fn new(materializer: &'m dyn Materializer) -> Self {
        Self { materializer, exclusions: ExclusionRules::default(), cancel: None, progress: None }
    }

    pub fn exclusions(mut self, rules: ExclusionRules) -> Self {
        self.exclusions = rules;
        self
    }

    pub fn cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn progress(mut self, callback: Arc<ProgressCallback>) -> Self {
        self.progress = Some(callback);
        self
    }

    fn ensure_parent(
        &self,
        rel: &str,
        target: &Path,
        root: &Path,
        ensured: &mut HashSet<PathBuf>,
    ) -> Result<()> {
        if let Some(parent) = target.parent() {
            if parent != root && !ensured.contains(parent) {
                step(rel, "create parent directory of", "a directory", self.materializer.make_directory(parent))?;
                ensured.insert(parent.to_path_buf());
            }
        }
        Ok(())
    }

    /// Restore every entry of `reader` below `root`. Stops at the first failing step; what was
    /// written before stays on disk.
    pub fn unpack<R: Read>(&self, reader: R, root: &Path) -> Result<UnpackSummary> {
        let m = self.materializer;
        let mut summary = UnpackSummary::default();
        let mut tracker = ProgressTracker::new(0, self.progress.clone());
        let mut deferred: Vec<DeferredDir> = Vec::new();
        let mut ensured: HashSet<PathBuf> = HashSet::new();
        let mut guard = LinkGuard::default();

        step(".", "create", "the restore root", m.make_directory(root))?;

        let mut archive = tar::Archive::new(reader);
        let entries = archive.entries().map_err(|e| VaultError::io(e, root))?;
        for entry in entries {
            if self.cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed)) {
                return Err(VaultError::Cancelled);
            }
            let mut entry = entry.map_err(|e| VaultError::io(e, root))?;
            let raw = entry.path().map_err(|e| VaultError::io(e, root))?.into_owned();
            let Some(rel) = normalize_entry_path(&raw) else {
                warn!(path = %raw.display(), "entry escapes the restore root, skipping");
                summary.skipped += 1;
                tracker.record_skipped(&raw.to_string_lossy());
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            if self.exclusions.is_excluded(&rel) {
                debug!(path = %rel, "excluded");
                summary.excluded += 1;
                tracker.record_skipped(&rel);
                continue;
            }

            let header = entry.header();
            let entry_type = header.entry_type();
            let mode = header.mode().map_err(|e| VaultError::io(e, &raw))? & PERMISSION_MASK;
            let mtime = header.mtime().map_err(|e| VaultError::io(e, &raw))? as i64;
            let size = header.size().map_err(|e| VaultError::io(e, &raw))?;
            let link_name = entry
                .link_name()
                .map_err(|e| VaultError::io(e, &raw))?
                .map(|l| l.to_string_lossy().into_owned());
            let target = root.join(&rel);
            let through = step(&rel, "inspect", "no symlink on the way", guard.linked_ancestor(m, root, &rel))?;
            if let Some(link) = through {
                warn!(path = %rel, link = %link.display(), "entry lies behind a symlink, skipping");
                summary.skipped += 1;
                tracker.record_skipped(&rel);
                continue;
            }

            let mut bytes = 0;
            match entry_type {
                EntryType::Directory => {
                    if step(&rel, "inspect", "a directory", guard.is_link(m, &target))? {
                        warn!(path = %rel, "directory entry would follow an existing symlink, skipping");
                        summary.skipped += 1;
                        tracker.record_skipped(&rel);
                        continue;
                    }
                    debug!(path = %rel, mode = %mode_str(mode), "directory");
                    step(&rel, "create directory", mode_str(mode), m.make_directory(&target))?;
                    ensured.insert(target.clone());
                    deferred.push(DeferredDir { rel: rel.clone(), path: target.clone(), mode, mtime });
                }
                EntryType::Link => {
                    let link = link_name.unwrap_or_default();
                    let Some(link_rel) = normalize_entry_path(Path::new(&link)).filter(|l| !l.is_empty()) else {
                        warn!(path = %rel, target = %link, "hard link target outside the restore root, skipping");
                        summary.skipped += 1;
                        tracker.record_skipped(&rel);
                        continue;
                    };
                    if step(&rel, "inspect", link_rel.clone(), guard.linked_ancestor(m, root, &link_rel))?.is_some() {
                        warn!(path = %rel, target = %link_rel, "hard link target lies behind a symlink, skipping");
                        summary.skipped += 1;
                        tracker.record_skipped(&rel);
                        continue;
                    }
                    self.ensure_parent(&rel, &target, root, &mut ensured)?;
                    debug!(path = %rel, target = %link_rel, "hard link");
                    step(&rel, "link", link_rel.clone(), m.create_hard_link(&root.join(&link_rel), &target))?;
                    guard.record_plain(&target);
                }
                EntryType::Symlink => {
                    let link = link_name.unwrap_or_default();
                    self.ensure_parent(&rel, &target, root, &mut ensured)?;
                    debug!(path = %rel, target = %link, "symlink");
                    step(&rel, "symlink", link.clone(), m.create_symlink(&link, &target))?;
                    guard.record_link(&target);
                }
                EntryType::Fifo => {
                    self.ensure_parent(&rel, &target, root, &mut ensured)?;
                    debug!(path = %rel, mode = %mode_str(mode), "fifo");
                    step(&rel, "create fifo", mode_str(mode), m.create_fifo(&target))?;
                    guard.record_plain(&target);
                    step(&rel, "chmod", mode_str(mode), m.chmod(&target, mode))?;
                }
                EntryType::Regular | EntryType::Continuous => {
                    self.ensure_parent(&rel, &target, root, &mut ensured)?;
                    debug!(path = %rel, size, mode = %mode_str(mode), "file");
                    bytes = step(&rel, "write", format!("{} bytes", size), m.write_file(&target, &mut entry))?;
                    guard.record_plain(&target);
                    step(&rel, "chmod", mode_str(mode), m.chmod(&target, mode))?;
                }
                other => {
                    warn!(path = %rel, entry_type = ?other, "entry type cannot be restored, skipping");
                    summary.skipped += 1;
                    tracker.record_skipped(&rel);
                    continue;
                }
            }

            if !matches!(entry_type, EntryType::Link | EntryType::Symlink) {
                step(&rel, "set modification time of", mtime.to_string(), m.set_mod_time(&target, mtime))?;
            }
            summary.restored += 1;
            summary.bytes += bytes;
            tracker.record_entry(&rel, bytes);
        }

        for dir in &deferred {
            step(&dir.rel, "chmod", mode_str(dir.mode), m.chmod(&dir.path, dir.mode))?;
            step(&dir.rel, "set modification time of", dir.mtime.to_string(), m.set_mod_time(&dir.path, dir.mtime))?;
        }
        summary.deferred_modes = deferred.len();

        info!(
            root = %root.display(),
            restored = summary.restored,
            excluded = summary.excluded,
            skipped = summary.skipped,
            "unpack finished"
        );
        Ok(summary)
    }
}

/// Read the headers of a tar stream back into metadata records, without restoring anything.
/// Hard links come back as regular files carrying their target.
pub fn list_entries<R: Read>(reader: R) -> Result<Vec<FileMetadata>> {
    let mut archive = tar::Archive::new(reader);
    let mut out = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let header = entry.header();
        let file_type = match header.entry_type() {
            EntryType::Regular | EntryType::Continuous | EntryType::Link => FileType::RegularFile,
            EntryType::Directory => FileType::Directory,
            EntryType::Symlink => FileType::Symlink,
            EntryType::Fifo => FileType::NamedPipe,
            EntryType::Block => FileType::BlockDevice,
            EntryType::Char => FileType::CharDevice,
            other => {
                debug!(entry_type = ?other, "ignoring auxiliary entry");
                continue;
            }
        };
        let owner = match header.username() {
            Ok(Some(name)) if !name.is_empty() => name.to_owned(),
            _ => header.uid()?.to_string(),
        };
        let group = match header.groupname() {
            Ok(Some(name)) if !name.is_empty() => name.to_owned(),
            _ => header.gid()?.to_string(),
        };
        out.push(FileMetadata {
            path: entry.path()?.to_string_lossy().into_owned(),
            file_type,
            mode: header.mode()? & PERMISSION_MASK,
            owner,
            group,
            size: header.size()?,
            mod_time: header.mtime()? as i64,
            link_target: entry.link_name()?.map(|l| l.to_string_lossy().into_owned()),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_and_refuses() {
        assert_eq!(normalize_entry_path(Path::new("./a/b")).as_deref(), Some("a/b"));
        assert_eq!(normalize_entry_path(Path::new("/abs/x")).as_deref(), Some("abs/x"));
        assert_eq!(normalize_entry_path(Path::new("./")).as_deref(), Some(""));
        assert_eq!(normalize_entry_path(Path::new("a/../../etc")), None);
    }

    #[test]
    fn exclusion_matches_exact_and_ancestors() {
        let rules = ExclusionRules::new(vec!["lib".into()], vec!["cache".into(), "app_webview/cache".into()]);
        assert!(rules.is_excluded("cache"));
        assert!(rules.is_excluded("cache/x"));
        assert!(rules.is_excluded("lib"));
        assert!(rules.is_excluded("app_webview/cache/y"));
        assert!(!rules.is_excluded("cached"));
        assert!(!rules.is_excluded("other/cache2"));
        assert!(!rules.is_excluded("app_webview"));
        assert!(!ExclusionRules::default().is_excluded("cache"));
    }

    #[test]
    fn auto_mode_resolves_to_concrete_variant() {
        let resolved = ExecutionMode::Auto.resolve();
        assert_ne!(resolved, ExecutionMode::Auto);
        assert_eq!(ExecutionMode::Shell.resolve(), ExecutionMode::Shell);
        assert_eq!(ExecutionMode::Direct.resolve(), ExecutionMode::Direct);
    }
}
