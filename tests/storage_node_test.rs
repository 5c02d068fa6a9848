use rootvault::common::{FinishWrite, PlainWriter};
use rootvault::shell::{PrivilegedShell, ShellExecutor, SuShell};
use rootvault::storage::{
    DocumentEntry, DocumentKind, DocumentResolver, NodeCache, StorageNode, MIME_TYPE_DIR,
};
use rootvault::{Result, VaultError};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::tempdir;

fn sh() -> Arc<ShellExecutor> {
    Arc::new(ShellExecutor::new(SuShell::sh()))
}

fn path_node(path: &std::path::Path) -> Arc<StorageNode> {
    StorageNode::from_path_with_cache(NodeCache::new(), sh(), path)
}

/// `sh -c`, except that removing anything named `marker` fails.
struct RefusingShell {
    marker: &'static str,
}

impl PrivilegedShell for RefusingShell {
    fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        if command.starts_with("rm ") && command.contains(self.marker) {
            cmd.arg("-c").arg("echo 'Operation not permitted' >&2; exit 1");
        } else {
            cmd.arg("-c").arg(command);
        }
        cmd
    }
}

#[test]
fn find_file_on_empty_directory_is_none() {
    let dir = tempdir().unwrap();
    let node = path_node(dir.path());
    assert!(node.is_directory());
    assert!(node.find_file("missing").is_none());
    assert!(node.list_files().is_empty());
}

#[test]
fn path_node_basics() {
    let dir = tempdir().unwrap();
    let root = path_node(dir.path());

    let sub = root.create_directory("sub dir").unwrap();
    assert!(dir.path().join("sub dir").is_dir());
    assert!(sub.is_directory());
    assert_eq!(sub.name(), "sub dir");
    assert!(Arc::ptr_eq(&sub.parent().unwrap(), &root));

    let file = sub.create_file("it's.txt").unwrap();
    let mut w = file.open_write().unwrap();
    w.write_all(b"node bytes").unwrap();
    w.finish().unwrap();
    assert!(file.is_file());

    let found = sub.find_file("it's.txt").unwrap();
    let mut content = String::new();
    found.open_read().unwrap().read_to_string(&mut content).unwrap();
    assert_eq!(content, "node bytes");

    assert!(root.create_directory("../escape").is_err());
    assert!(root.create_file("").is_err());
}

#[test]
fn listing_is_cached_and_kept_in_step() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a"), b"").unwrap();
    let root = path_node(dir.path());

    assert_eq!(root.list_files().len(), 1);
    // created behind the cache's back: not visible until invalidation
    fs::write(dir.path().join("b"), b"").unwrap();
    assert_eq!(root.list_files().len(), 1);

    // created through the node: appended to the cached listing
    root.create_file("c").unwrap();
    let names: Vec<String> = root.list_files().iter().map(|n| n.name()).collect();
    assert_eq!(names, vec!["a", "c"]);

    root.invalidate_cache();
    let mut names: Vec<String> = root.list_files().iter().map(|n| n.name()).collect();
    names.sort();
    assert_eq!(names, vec!["a", "b", "c"]);

    let a = root.list_files().into_iter().find(|n| n.name() == "a").unwrap();
    assert!(a.delete());
    assert_eq!(root.list_files().len(), 2);
}

#[test]
fn invalidation_refreshes_existence() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f"), b"x").unwrap();
    let root = path_node(dir.path());
    let f = root.find_file("f").unwrap();
    assert!(f.exists());

    fs::remove_file(dir.path().join("f")).unwrap();
    assert!(f.exists(), "existence is cached until invalidation");
    f.invalidate_cache();
    assert!(!f.exists());
}

#[test]
fn delete_reports_missing_as_false() {
    let dir = tempdir().unwrap();
    let root = path_node(dir.path());
    let sub = root.create_directory("d").unwrap();
    assert!(sub.delete());
    assert!(!dir.path().join("d").exists());
    assert!(!sub.delete());

    let ghost = path_node(&dir.path().join("ghost"));
    assert!(!ghost.delete());
    assert!(!ghost.delete_recursive());
}

#[test]
fn delete_of_target_removed_after_listing_is_false() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("gone"), b"x").unwrap();
    fs::write(dir.path().join("kept"), b"y").unwrap();
    let root = path_node(dir.path());
    let children = root.list_files();
    assert_eq!(children.len(), 2);

    fs::remove_file(dir.path().join("gone")).unwrap();
    let gone = children.iter().find(|c| c.name() == "gone").unwrap();
    assert!(gone.exists(), "presence still comes from the listing");
    assert!(!gone.delete());

    let kept = children.iter().find(|c| c.name() == "kept").unwrap();
    assert!(kept.delete());
    assert!(!dir.path().join("kept").exists());
}

#[test]
fn delete_recursive_visits_every_child() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("victim");
    fs::create_dir(&target).unwrap();
    for name in ["file1", "file2", "file3"] {
        fs::write(target.join(name), name).unwrap();
    }

    let exec = Arc::new(ShellExecutor::new(RefusingShell { marker: "file2" }));
    let node = StorageNode::from_path_with_cache(NodeCache::new(), exec, &target);
    assert!(!node.delete_recursive());

    assert!(!target.join("file1").exists());
    assert!(target.join("file2").exists());
    assert!(!target.join("file3").exists());
    assert!(target.is_dir());
}

#[test]
fn delete_recursive_removes_nested_trees() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("tree");
    fs::create_dir_all(target.join("x/y/z")).unwrap();
    fs::write(target.join("x/y/z/deep"), b"1").unwrap();
    fs::write(target.join("x/top"), b"2").unwrap();
    std::os::unix::fs::symlink("/", target.join("x/root-link")).unwrap();

    let node = path_node(&target);
    assert!(node.delete_recursive());
    assert!(!target.exists());
}

#[test]
fn rename_keeps_parent_listing_until_invalidated() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("old.txt"), b"").unwrap();
    let root = path_node(dir.path());
    assert_eq!(root.list_files()[0].name(), "old.txt");

    let node = root.find_file("old.txt").unwrap();
    node.rename_to("new.txt").unwrap();
    assert_eq!(node.name(), "new.txt");
    assert_eq!(node.path().unwrap(), dir.path().join("new.txt"));
    assert!(dir.path().join("new.txt").exists());

    assert_eq!(root.list_files()[0].name(), "old.txt");
    root.invalidate_cache();
    assert_eq!(root.list_files()[0].name(), "new.txt");
}

#[test]
fn ensure_directory_finds_or_creates() {
    let dir = tempdir().unwrap();
    let root = path_node(dir.path());
    let first = root.ensure_directory("backups").unwrap();
    let second = root.ensure_directory("backups").unwrap();
    assert_eq!(first.path(), second.path());
    assert!(dir.path().join("backups").is_dir());
}

// --- document backend -------------------------------------------------------

struct Doc {
    parent: Option<String>,
    name: String,
    kind: DocumentKind,
    data: Arc<Mutex<Vec<u8>>>,
}

/// Document tree held in memory. Like real providers it accepts duplicate names.
#[derive(Default)]
struct MemResolver {
    docs: Mutex<BTreeMap<String, Doc>>,
    next: Mutex<u32>,
    shadow: Option<PathBuf>,
}

impl MemResolver {
    fn with_root() -> Arc<Self> {
        let resolver = MemResolver::default();
        resolver.docs.lock().unwrap().insert(
            "root".into(),
            Doc { parent: None, name: "Backups".into(), kind: DocumentKind::Directory, data: Default::default() },
        );
        Arc::new(resolver)
    }

    fn children_named(&self, name: &str) -> usize {
        self.docs.lock().unwrap().values().filter(|d| d.name == name).count()
    }
}

struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl DocumentResolver for MemResolver {
    fn kind(&self, reference: &str) -> Result<Option<DocumentKind>> {
        Ok(self.docs.lock().unwrap().get(reference).map(|d| d.kind))
    }

    fn display_name(&self, reference: &str) -> Result<String> {
        self.docs
            .lock()
            .unwrap()
            .get(reference)
            .map(|d| d.name.clone())
            .ok_or_else(|| VaultError::Document(format!("no document {}", reference)))
    }

    fn list_children(&self, reference: &str) -> Result<Vec<DocumentEntry>> {
        Ok(self
            .docs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, d)| d.parent.as_deref() == Some(reference))
            .map(|(r, d)| DocumentEntry { reference: r.clone(), name: d.name.clone(), kind: d.kind })
            .collect())
    }

    fn create_document(&self, parent: &str, mime: &str, name: &str) -> Result<String> {
        let mut next = self.next.lock().unwrap();
        *next += 1;
        let reference = format!("{}/{}", parent, next);
        let kind = if mime == MIME_TYPE_DIR { DocumentKind::Directory } else { DocumentKind::File };
        self.docs.lock().unwrap().insert(
            reference.clone(),
            Doc { parent: Some(parent.into()), name: name.into(), kind, data: Default::default() },
        );
        Ok(reference)
    }

    fn delete_document(&self, reference: &str) -> Result<bool> {
        Ok(self.docs.lock().unwrap().remove(reference).is_some())
    }

    fn rename_document(&self, reference: &str, name: &str) -> Result<String> {
        match self.docs.lock().unwrap().get_mut(reference) {
            Some(doc) => {
                doc.name = name.into();
                Ok(reference.into())
            }
            None => Err(VaultError::Document(format!("no document {}", reference))),
        }
    }

    fn open_read(&self, reference: &str) -> Result<Box<dyn Read + Send>> {
        let docs = self.docs.lock().unwrap();
        let doc = docs.get(reference).ok_or_else(|| VaultError::NotFound { path: reference.into() })?;
        let bytes = doc.data.lock().unwrap().clone();
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn open_write(&self, reference: &str) -> Result<Box<dyn FinishWrite>> {
        let docs = self.docs.lock().unwrap();
        let doc = docs.get(reference).ok_or_else(|| VaultError::NotFound { path: reference.into() })?;
        doc.data.lock().unwrap().clear();
        Ok(Box::new(PlainWriter(SharedBuf(doc.data.clone()))))
    }

    fn shadow_path(&self, _reference: &str) -> Option<PathBuf> {
        self.shadow.clone()
    }
}

#[test]
fn document_backend_operations() {
    let resolver = MemResolver::with_root();
    let root = StorageNode::from_document_with_cache(NodeCache::new(), resolver.clone(), "root", None);
    assert!(root.is_directory());
    assert_eq!(root.name(), "Backups");
    assert!(root.find_file("missing").is_none());

    let app = root.create_directory("org.example.app").unwrap();
    let archive = app.create_file("data.tar.zst").unwrap();
    let mut w = archive.open_write().unwrap();
    w.write_all(b"archive bytes").unwrap();
    w.finish().unwrap();

    let again = root.find_file("org.example.app").unwrap().find_file("data.tar.zst").unwrap();
    let mut bytes = Vec::new();
    again.open_read().unwrap().read_to_end(&mut bytes).unwrap();
    assert_eq!(bytes, b"archive bytes");

    again.rename_to("renamed.tar.zst").unwrap();
    assert_eq!(resolver.children_named("renamed.tar.zst"), 1);

    assert!(app.delete_recursive());
    assert_eq!(resolver.children_named("org.example.app"), 0);
    assert_eq!(resolver.children_named("renamed.tar.zst"), 0);
    assert!(!app.delete());
}

#[test]
fn document_roots_are_cached_by_reference() {
    let resolver = MemResolver::with_root();
    let cache = NodeCache::new();
    let a = StorageNode::from_document_with_cache(cache.clone(), resolver.clone(), "root", None);
    let b = StorageNode::from_document_with_cache(cache.clone(), resolver.clone(), "root", None);
    assert!(Arc::ptr_eq(&a, &b));
    cache.invalidate();
    let c = StorageNode::from_document_with_cache(cache, resolver, "root", None);
    assert!(!Arc::ptr_eq(&a, &c));
}

#[test]
fn shadow_path_switches_to_path_backend() {
    let dir = tempdir().unwrap();
    let mut resolver = MemResolver::default();
    resolver.shadow = Some(dir.path().to_path_buf());
    let resolver = Arc::new(resolver);

    let node = StorageNode::from_document_with_cache(NodeCache::new(), resolver.clone(), "root", Some(sh()));
    assert_eq!(node.path().as_deref(), Some(dir.path()));
    assert!(node.reference().is_none());

    let plain = StorageNode::from_document_with_cache(NodeCache::new(), resolver, "root", None);
    assert_eq!(plain.reference().as_deref(), Some("root"));
}

#[test]
fn concurrent_ensure_directory_creates_one_document() {
    let resolver = MemResolver::with_root();
    let root = StorageNode::from_document_with_cache(NodeCache::new(), resolver.clone(), "root", None);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let root = root.clone();
            thread::spawn(move || root.ensure_directory("shared").unwrap().reference().unwrap())
        })
        .collect();
    let refs: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(resolver.children_named("shared"), 1);
    assert!(refs.iter().all(|r| r == &refs[0]));
}
