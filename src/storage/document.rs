//! The document-tree backend: objects addressed by opaque references and reachable only
//! through a resolver the host platform provides.

use std::io::Read;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::common::{FileType, FinishWrite};
use crate::error::Result;

/// MIME type that makes `create_document` produce a directory.
pub const MIME_TYPE_DIR: &str = "vnd.android.document/directory";

/// MIME type used by [`super::StorageNode::create_file`].
pub const MIME_TYPE_BINARY: &str = "application/octet-stream";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    File,
    Directory,
}

impl From<DocumentKind> for FileType {
    fn from(kind: DocumentKind) -> Self {
        match kind {
            DocumentKind::File => FileType::RegularFile,
            DocumentKind::Directory => FileType::Directory,
        }
    }
}

/// One child returned by [`DocumentResolver::list_children`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEntry {
    pub reference: String,
    pub name: String,
    pub kind: DocumentKind,
}

/// Access to a permission-gated document tree.
pub trait DocumentResolver: Send + Sync {
    /// Kind of the referenced document, `None` when it does not exist.
    fn kind(&self, reference: &str) -> Result<Option<DocumentKind>>;

    fn display_name(&self, reference: &str) -> Result<String>;

    fn list_children(&self, reference: &str) -> Result<Vec<DocumentEntry>>;

    /// Create a child of `parent` and return its reference. Names are not required to be
    /// unique; two documents may share one display name.
    fn create_document(&self, parent: &str, mime: &str, name: &str) -> Result<String>;

    /// `Ok(false)` when the document was already gone.
    fn delete_document(&self, reference: &str) -> Result<bool>;

    /// Rename in place and return the (possibly new) reference.
    fn rename_document(&self, reference: &str, name: &str) -> Result<String>;

    fn open_read(&self, reference: &str) -> Result<Box<dyn Read + Send>>;

    fn open_write(&self, reference: &str) -> Result<Box<dyn FinishWrite>>;

    /// Real filesystem location backing `reference`, when the tree is a view over one.
    fn shadow_path(&self, _reference: &str) -> Option<PathBuf> {
        None
    }
}
