//! # Storage Nodes
//!
//! [`StorageNode`] addresses one filesystem object through one of two backends, fixed when
//! the node is built:
//!
//! * **path**: a real path reached through the privileged [`ShellExecutor`];
//! * **document**: an opaque reference handed to a [`DocumentResolver`].
//!
//! Listings are cached per node identity in a [`NodeCache`] until it is invalidated. Nodes
//! created or deleted through this API keep an already cached parent listing in step.
//! `rename_to` does not: the node itself is updated in place, but the parent's listing keeps
//! its old identity until the next invalidation.

mod cache;
mod document;

pub use cache::NodeCache;
pub use document::{DocumentEntry, DocumentKind, DocumentResolver, MIME_TYPE_BINARY, MIME_TYPE_DIR};

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, warn};

use crate::common::{FileType, FinishWrite};
use crate::error::{Result, VaultError};
use crate::shell::{quote_path, ShellExecutor};

#[derive(Clone)]
enum Location {
    Path {
        path: PathBuf,
        executor: Arc<ShellExecutor>,
    },
    Document {
        reference: String,
        resolver: Arc<dyn DocumentResolver>,
    },
}

impl Location {
    fn key(&self) -> String {
        match self {
            Location::Path { path, .. } => format!("path:{}", path.display()),
            Location::Document { reference, .. } => format!("doc:{}", reference),
        }
    }
}

struct NodeState {
    location: Location,
    name: Option<String>,
    /// Existence and type as last observed, with the cache generation of the observation.
    presence: Option<(u64, Option<FileType>)>,
}

/// Handle to a file or directory in either backend.
pub struct StorageNode {
    state: RwLock<NodeState>,
    parent: Option<Weak<StorageNode>>,
    cache: Arc<NodeCache>,
    ensure_lock: Mutex<()>,
}

impl std::fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap();
        f.debug_struct("StorageNode")
            .field("key", &state.location.key())
            .field("name", &state.name)
            .finish()
    }
}

fn check_child_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(VaultError::io(
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid child name {:?}", name)),
            name,
        ));
    }
    Ok(())
}

fn path_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl StorageNode {
    fn build(
        cache: Arc<NodeCache>,
        location: Location,
        parent: Option<Weak<StorageNode>>,
        name: Option<String>,
        kind: Option<Option<FileType>>,
    ) -> Arc<Self> {
        let presence = kind.map(|k| (cache.generation(), k));
        Arc::new(Self {
            state: RwLock::new(NodeState { location, name, presence }),
            parent,
            cache,
            ensure_lock: Mutex::new(()),
        })
    }

    /// Root node for a privileged path, using the global cache.
    pub fn from_path(executor: Arc<ShellExecutor>, path: impl Into<PathBuf>) -> Arc<Self> {
        Self::from_path_with_cache(NodeCache::global(), executor, path)
    }

    pub fn from_path_with_cache(
        cache: Arc<NodeCache>,
        executor: Arc<ShellExecutor>,
        path: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Self::build(cache, Location::Path { path: path.into(), executor }, None, None, None)
    }

    /// Root node for a document reference, using the global cache.
    ///
    /// With a `shadow` executor and a resolver that maps `reference` to a real path, the
    /// returned node is path-backed instead.
    pub fn from_document(
        resolver: Arc<dyn DocumentResolver>,
        reference: &str,
        shadow: Option<Arc<ShellExecutor>>,
    ) -> Arc<Self> {
        Self::from_document_with_cache(NodeCache::global(), resolver, reference, shadow)
    }

    pub fn from_document_with_cache(
        cache: Arc<NodeCache>,
        resolver: Arc<dyn DocumentResolver>,
        reference: &str,
        shadow: Option<Arc<ShellExecutor>>,
    ) -> Arc<Self> {
        if let Some(executor) = shadow {
            if let Some(path) = resolver.shadow_path(reference) {
                debug!(reference, path = %path.display(), "using shadow path for document");
                return Self::from_path_with_cache(cache, executor, path);
            }
        }
        let node_cache = cache.clone();
        cache.root(reference, move || {
            Self::build(
                node_cache,
                Location::Document { reference: reference.to_owned(), resolver },
                None,
                None,
                None,
            )
        })
    }

    fn location(&self) -> Location {
        self.state.read().unwrap().location.clone()
    }

    fn key(&self) -> String {
        self.state.read().unwrap().location.key()
    }

    fn set_presence(&self, kind: Option<FileType>) {
        self.state.write().unwrap().presence = Some((self.cache.generation(), kind));
    }

    fn child(self: &Arc<Self>, location: Location, name: String, kind: Option<FileType>) -> Arc<Self> {
        Self::build(self.cache.clone(), location, Some(Arc::downgrade(self)), Some(name), Some(kind))
    }

    /// The real path, for path-backed nodes.
    pub fn path(&self) -> Option<PathBuf> {
        match &self.state.read().unwrap().location {
            Location::Path { path, .. } => Some(path.clone()),
            Location::Document { .. } => None,
        }
    }

    /// The document reference, for document-backed nodes.
    pub fn reference(&self) -> Option<String> {
        match &self.state.read().unwrap().location {
            Location::Document { reference, .. } => Some(reference.clone()),
            Location::Path { .. } => None,
        }
    }

    pub fn parent(&self) -> Option<Arc<StorageNode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Display name, resolved once and then cached.
    pub fn name(&self) -> String {
        if let Some(name) = &self.state.read().unwrap().name {
            return name.clone();
        }
        let name = match self.location() {
            Location::Path { path, .. } => path_name(&path),
            Location::Document { reference, resolver } => match resolver.display_name(&reference) {
                Ok(name) => name,
                Err(e) => {
                    warn!(reference = %reference, error = %e, "display name unavailable");
                    return reference;
                }
            },
        };
        self.state.write().unwrap().name = Some(name.clone());
        name
    }

    /// Existence and type, re-probed when the cache was invalidated since the last look.
    fn kind(&self) -> Option<FileType> {
        let generation = self.cache.generation();
        if let Some((seen, kind)) = self.state.read().unwrap().presence {
            if seen == generation {
                return kind;
            }
        }
        let kind = match self.location() {
            Location::Path { path, executor } => executor.probe(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "probe failed");
                None
            }),
            Location::Document { reference, resolver } => match resolver.kind(&reference) {
                Ok(kind) => kind.map(FileType::from),
                Err(e) => {
                    warn!(reference = %reference, error = %e, "document lookup failed");
                    None
                }
            },
        };
        self.state.write().unwrap().presence = Some((generation, kind));
        kind
    }

    pub fn exists(&self) -> bool {
        self.kind().is_some()
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == Some(FileType::Directory)
    }

    pub fn is_file(&self) -> bool {
        self.kind() == Some(FileType::RegularFile)
    }

    pub fn open_read(&self) -> Result<Box<dyn Read + Send>> {
        match self.location() {
            Location::Path { path, executor } => Ok(Box::new(executor.open_read(&path)?)),
            Location::Document { reference, resolver } => resolver.open_read(&reference),
        }
    }

    /// Create or truncate, then stream bytes in. Call `finish` on the result to observe the
    /// final status.
    pub fn open_write(&self) -> Result<Box<dyn FinishWrite>> {
        let writer: Box<dyn FinishWrite> = match self.location() {
            Location::Path { path, executor } => Box::new(executor.open_write(&path)?),
            Location::Document { reference, resolver } => resolver.open_write(&reference)?,
        };
        self.set_presence(Some(FileType::RegularFile));
        Ok(writer)
    }

    fn create_child(self: &Arc<Self>, name: &str, mime: &str) -> Result<Arc<StorageNode>> {
        check_child_name(name)?;
        let directory = mime == MIME_TYPE_DIR;
        let kind = if directory { FileType::Directory } else { FileType::RegularFile };
        let location = match self.location() {
            Location::Path { path, executor } => {
                let child = path.join(name);
                let command = if directory {
                    format!("{} -p {}", executor.util("mkdir"), quote_path(&child))
                } else {
                    format!("{} {}", executor.util("touch"), quote_path(&child))
                };
                let operation = if directory { "mkdir" } else { "create file" };
                executor.run_checked(&command, &child, operation, mime)?;
                Location::Path { path: child, executor }
            }
            Location::Document { reference, resolver } => {
                let created = resolver.create_document(&reference, mime, name)?;
                Location::Document { reference: created, resolver }
            }
        };
        let node = self.child(location, name.to_owned(), Some(kind));
        self.cache.append_child(&self.key(), node.clone());
        debug!(parent = %self.name(), name, mime, "created child");
        Ok(node)
    }

    pub fn create_directory(self: &Arc<Self>, name: &str) -> Result<Arc<StorageNode>> {
        self.create_child(name, MIME_TYPE_DIR)
    }

    pub fn create_file(self: &Arc<Self>, name: &str) -> Result<Arc<StorageNode>> {
        self.create_child(name, MIME_TYPE_BINARY)
    }

    /// Like [`create_file`](Self::create_file) with an explicit MIME type; the path backend
    /// ignores it except for [`MIME_TYPE_DIR`].
    pub fn create_file_with_mime(self: &Arc<Self>, mime: &str, name: &str) -> Result<Arc<StorageNode>> {
        self.create_child(name, mime)
    }

    /// Remove this object. Missing targets and failures both yield `false`; failures are
    /// logged.
    pub fn delete(&self) -> bool {
        if !self.exists() {
            return false;
        }
        let deleted = match self.location() {
            Location::Path { path, executor } => {
                let q = quote_path(&path);
                // No `-f`: a target that vanished since it was listed must report failure.
                let command = format!("{} {q} 2>/dev/null || {} {q}", executor.util("rm"), executor.util("rmdir"));
                match executor.run(&command) {
                    Ok(out) if out.is_success() => true,
                    Ok(out) => {
                        warn!(path = %path.display(), exit_code = out.exit_code, stderr = %out.stderr.join("; "), "delete failed");
                        false
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "delete failed");
                        false
                    }
                }
            }
            Location::Document { reference, resolver } => match resolver.delete_document(&reference) {
                Ok(deleted) => deleted,
                Err(e) => {
                    warn!(reference = %reference, error = %e, "delete failed");
                    false
                }
            },
        };
        if deleted {
            self.set_presence(None);
            if let Some(parent) = self.parent() {
                self.cache.remove_child(&parent.key(), self);
            }
        }
        deleted
    }

    /// Rename within the same parent. The parent's cached listing is left as it is.
    pub fn rename_to(&self, name: &str) -> Result<()> {
        check_child_name(name)?;
        let location = match self.location() {
            Location::Path { path, executor } => {
                let target = path.with_file_name(name);
                let command = format!("{} {} {}", executor.util("mv"), quote_path(&path), quote_path(&target));
                executor.run_checked(&command, &path, "rename", name)?;
                Location::Path { path: target, executor }
            }
            Location::Document { reference, resolver } => {
                let renamed = resolver.rename_document(&reference, name)?;
                Location::Document { reference: renamed, resolver }
            }
        };
        let mut state = self.state.write().unwrap();
        state.location = location;
        state.name = Some(name.to_owned());
        Ok(())
    }

    /// Direct child named `name`, `None` when absent.
    pub fn find_file(self: &Arc<Self>, name: &str) -> Option<Arc<StorageNode>> {
        if check_child_name(name).is_err() {
            return None;
        }
        match self.location() {
            Location::Path { path, executor } => {
                let child = path.join(name);
                let kind = executor.probe(&child).unwrap_or_else(|e| {
                    warn!(path = %child.display(), error = %e, "probe failed");
                    None
                });
                kind.map(|k| self.child(Location::Path { path: child, executor }, name.to_owned(), Some(k)))
            }
            Location::Document { .. } => self.list_files().into_iter().find(|c| c.name() == name),
        }
    }

    /// Children of this node, from the cache when available. Empty when the node has no
    /// children or cannot be enumerated.
    pub fn list_files(self: &Arc<Self>) -> Vec<Arc<StorageNode>> {
        let key = self.key();
        if let Some(children) = self.cache.listing(&key) {
            return children;
        }
        let children = match self.location() {
            Location::Path { path, executor } => match executor.list_directory(&path, false) {
                Ok(entries) => entries
                    .into_iter()
                    .map(|meta| {
                        let name = meta.name().to_owned();
                        let location = Location::Path { path: path.join(&meta.path), executor: executor.clone() };
                        self.child(location, name, Some(meta.file_type))
                    })
                    .collect(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "listing failed");
                    return Vec::new();
                }
            },
            Location::Document { reference, resolver } => match resolver.list_children(&reference) {
                Ok(entries) => entries
                    .into_iter()
                    .map(|entry| {
                        let location = Location::Document { reference: entry.reference, resolver: resolver.clone() };
                        self.child(location, entry.name, Some(entry.kind.into()))
                    })
                    .collect(),
                Err(e) => {
                    warn!(reference = %reference, error = %e, "listing failed");
                    return Vec::new();
                }
            },
        };
        self.cache.insert_listing(&key, children)
    }

    /// Find the child directory or create it. Concurrent callers on the same parent are
    /// serialized, so they end up with one directory.
    pub fn ensure_directory(self: &Arc<Self>, name: &str) -> Result<Arc<StorageNode>> {
        let _guard = self.ensure_lock.lock().unwrap();
        if let Some(existing) = self.find_file(name) {
            return Ok(existing);
        }
        self.create_directory(name)
    }

    /// Delete a file, or a directory with everything below it. Every child is attempted even
    /// after a failure; the directory itself is removed only when all children were.
    pub fn delete_recursive(self: &Arc<Self>) -> bool {
        if !self.is_directory() {
            return self.delete();
        }
        self.cache.forget(&self.key());
        let mut all_deleted = true;
        for child in self.list_files() {
            let deleted = child.delete_recursive();
            all_deleted = all_deleted && deleted;
        }
        self.cache.forget(&self.key());
        if all_deleted {
            self.delete()
        } else {
            warn!(name = %self.name(), "directory kept, some children could not be deleted");
            false
        }
    }

    /// Drop every cached listing in this node's cache.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }
}
