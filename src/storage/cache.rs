//! Process-wide listing cache shared by all storage nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use super::StorageNode;

#[derive(Default)]
struct CacheState {
    listings: HashMap<String, Vec<Arc<StorageNode>>>,
    roots: HashMap<String, Arc<StorageNode>>,
}

/// Children per node identity plus the root document nodes, behind one mutex.
///
/// Entries live until [`NodeCache::invalidate`]; nothing expires on its own. Every
/// invalidation bumps a generation counter, and nodes compare it against the generation
/// their cached existence was observed in.
#[derive(Default)]
pub struct NodeCache {
    state: Mutex<CacheState>,
    generation: AtomicU64,
}

static GLOBAL: OnceLock<Arc<NodeCache>> = OnceLock::new();

impl NodeCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The cache used by nodes built without an explicit one.
    pub fn global() -> Arc<NodeCache> {
        GLOBAL.get_or_init(NodeCache::new).clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Drop every listing and root node, and mark cached existence stale.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap();
        state.listings.clear();
        state.roots.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn listing(&self, key: &str) -> Option<Vec<Arc<StorageNode>>> {
        self.state.lock().unwrap().listings.get(key).cloned()
    }

    /// Store a freshly enumerated listing unless another caller got there first; either way
    /// return the listing that is now cached.
    pub(crate) fn insert_listing(&self, key: &str, children: Vec<Arc<StorageNode>>) -> Vec<Arc<StorageNode>> {
        self.state
            .lock()
            .unwrap()
            .listings
            .entry(key.to_owned())
            .or_insert(children)
            .clone()
    }

    /// Add a new child to a listing that is already cached. Uncached listings stay uncached.
    pub(crate) fn append_child(&self, key: &str, child: Arc<StorageNode>) {
        if let Some(children) = self.state.lock().unwrap().listings.get_mut(key) {
            children.push(child);
        }
    }

    pub(crate) fn remove_child(&self, key: &str, child: &StorageNode) {
        if let Some(children) = self.state.lock().unwrap().listings.get_mut(key) {
            children.retain(|c| !std::ptr::eq(Arc::as_ptr(c), child));
        }
    }

    /// Forget one node's listing.
    pub(crate) fn forget(&self, key: &str) {
        self.state.lock().unwrap().listings.remove(key);
    }

    pub(crate) fn root(&self, reference: &str, make: impl FnOnce() -> Arc<StorageNode>) -> Arc<StorageNode> {
        self.state
            .lock()
            .unwrap()
            .roots
            .entry(reference.to_owned())
            .or_insert_with(make)
            .clone()
    }
}
