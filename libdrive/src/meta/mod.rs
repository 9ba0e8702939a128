//! Per-drive metadata cache: a shared, namespaced path tree of entry
//! envelopes and children lists with optional TTL, plus a background
//! cleaner pruning payload-less leaves.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, interval};
use tracing::debug;

use libtask::now_ms;

use crate::entry::{Entry, EntryType};
use crate::path;
use crate::tree::PathTree;

/// Serializable form of an entry. The cache never inspects `data`; it
/// is an opaque envelope the owning drive uses to rebuild the entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntryCacheItem {
    pub path: String,
    pub kind: EntryType,
    pub size: i64,
    pub mod_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, String>>,
}

impl EntryCacheItem {
    pub fn from_entry(entry: &Entry) -> Self {
        Self {
            path: entry.path.clone(),
            kind: entry.kind,
            size: entry.size,
            mod_time: entry.mod_time,
            data: entry.data.clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CachePayload {
    pub item: Option<EntryCacheItem>,
    /// Names last observed for this directory, in listing order.
    pub children: Option<Vec<String>>,
    pub expires_at: Option<i64>,
}

impl CachePayload {
    fn expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if now_ms() > at)
    }

    fn valid_item(&self) -> Option<&EntryCacheItem> {
        if self.expired() { None } else { self.item.as_ref() }
    }

    fn valid_children(&self) -> Option<&Vec<String>> {
        if self.expired() {
            None
        } else {
            self.children.as_ref()
        }
    }
}

/// Rebuilds an [`Entry`] from a cached envelope. Supplied by the
/// owning drive when it binds its namespace.
pub type EntryDecoder = Arc<dyn Fn(&EntryCacheItem) -> Entry + Send + Sync>;

/// The shared cache. Each drive binds a namespace through
/// [`MetaCache::namespace`] and works against its own subtree.
pub struct MetaCache {
    tree: Arc<PathTree<CachePayload>>,
    stop_tx: watch::Sender<bool>,
}

impl MetaCache {
    pub fn new(clean_interval: Duration) -> Self {
        let tree: Arc<PathTree<CachePayload>> = Arc::new(PathTree::new());
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let sweep_tree = tree.clone();
        tokio::spawn(async move {
            let mut timer = interval(clean_interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        sweep_tree.prune();
                    }
                    _ = stop_rx.changed() => {
                        debug!("metadata cache cleaner stopped");
                        return;
                    }
                }
            }
        });
        Self { tree, stop_tx }
    }

    pub fn namespace(&self, ns: impl Into<String>, decode: EntryDecoder) -> DriveCache {
        DriveCache {
            tree: self.tree.clone(),
            ns: ns.into(),
            decode,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// A drive's handle on the shared cache, bound to its namespace and
/// decoder.
#[derive(Clone)]
pub struct DriveCache {
    tree: Arc<PathTree<CachePayload>>,
    ns: String,
    decode: EntryDecoder,
}

impl DriveCache {
    fn full(&self, p: &str) -> String {
        path::join(&self.ns, p)
    }

    fn expiry(ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|t| now_ms() + t.as_millis() as i64)
    }

    pub fn put_entry(&self, entry: &Entry, ttl: Option<Duration>) {
        let node = self.tree.create(&self.full(&entry.path));
        let item = EntryCacheItem::from_entry(entry);
        let expires_at = Self::expiry(ttl);
        node.with_payload_mut(|p| {
            let payload = p.get_or_insert_with(CachePayload::default);
            payload.item = Some(item);
            payload.expires_at = expires_at;
        });
    }

    pub fn put_entries(&self, entries: &[Entry], ttl: Option<Duration>) {
        for e in entries {
            self.put_entry(e, ttl);
        }
    }

    /// Record a directory listing: the parent keeps the ordered child
    /// names, each child lands as a full payload under it.
    pub fn put_children(&self, parent: &str, entries: &[Entry], ttl: Option<Duration>) {
        let expires_at = Self::expiry(ttl);
        let node = self.tree.create(&self.full(parent));
        let names: Vec<String> = entries.iter().map(|e| e.name().to_string()).collect();
        node.with_payload_mut(|p| {
            let payload = p.get_or_insert_with(CachePayload::default);
            payload.children = Some(names);
            payload.expires_at = expires_at;
        });
        for e in entries {
            let child = node.child_or_create(e.name());
            let item = EntryCacheItem::from_entry(e);
            child.with_payload_mut(|p| {
                let payload = p.get_or_insert_with(CachePayload::default);
                payload.item = Some(item);
                payload.expires_at = expires_at;
            });
        }
    }

    pub fn get_item(&self, p: &str) -> Option<EntryCacheItem> {
        let node = self.tree.get_node(&self.full(p))?;
        node.with_payload(|payload| {
            payload
                .as_ref()
                .and_then(|pl| pl.valid_item().cloned())
        })
    }

    pub fn get_entry(&self, p: &str) -> Option<Entry> {
        self.get_item(p).map(|item| (self.decode)(&item))
    }

    pub fn get_children_items(&self, p: &str) -> Option<Vec<EntryCacheItem>> {
        let node = self.tree.get_node(&self.full(p))?;
        let names = node.with_payload(|payload| {
            payload
                .as_ref()
                .and_then(|pl| pl.valid_children().cloned())
        })?;
        let mut items = Vec::with_capacity(names.len());
        for name in &names {
            let child = node.child(name)?;
            let item = child.with_payload(|payload| {
                payload.as_ref().and_then(|pl| pl.valid_item().cloned())
            })?;
            items.push(item);
        }
        Some(items)
    }

    pub fn get_children(&self, p: &str) -> Option<Vec<Entry>> {
        Some(
            self.get_children_items(p)?
                .iter()
                .map(|i| (self.decode)(i))
                .collect(),
        )
    }

    /// Clear the cached payload at `p`; with `descendants`, unlink the
    /// whole subtree from its parent.
    pub fn evict(&self, p: &str, descendants: bool) {
        let full = self.full(p);
        if let Some(node) = self.tree.get_node(&full) {
            node.set_payload(None);
        }
        if descendants && !full.is_empty() {
            self.tree
                .remove_child(path::parent(&full), path::base_name(&full));
        }
    }

    /// The mandatory discipline after a successful mutation at `p`:
    /// drop the subtree at `p` and the parent's listing.
    pub fn invalidate(&self, p: &str) {
        self.evict(p, true);
        self.evict(path::parent(p), false);
    }

    pub fn evict_all(&self) {
        if self.ns.is_empty() {
            // A namespace-less handle owns the whole tree.
            self.tree.clear();
        } else {
            self.tree
                .remove_child(path::parent(&self.ns), path::base_name(&self.ns));
        }
    }
}
