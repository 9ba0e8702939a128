//! In-memory adapter: a sorted key map standing in for scripted or
//! remote backends in tests. Serves whole-file reads only, which
//! exercises the cache pool's whole-file fallback.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Cursor;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tokio::time::Duration;

use libtask::{TaskContext, now_ms};

use crate::cache::pool::RangeReader;
use crate::drive::{ByteRange, Drive, DriveCaps, DriveMeta, UploadConfig};
use crate::entry::{DriveId, Entry, EntryType};
use crate::error::{DriveError, Result};
use crate::event::{DriveEvent, EventBus};
use crate::meta::DriveCache;
use crate::path;

#[derive(Clone)]
struct MemNode {
    kind: EntryType,
    data: Vec<u8>,
    mod_time: i64,
}

impl MemNode {
    fn dir() -> Self {
        Self {
            kind: EntryType::Dir,
            data: Vec::new(),
            mod_time: -1,
        }
    }

    fn file(data: Vec<u8>) -> Self {
        Self {
            kind: EntryType::File,
            data,
            mod_time: now_ms(),
        }
    }
}

pub struct MemDrive {
    id: DriveId,
    nodes: RwLock<BTreeMap<String, MemNode>>,
    cache: Option<DriveCache>,
    events: Option<EventBus>,
    ttl: Option<Duration>,
}

impl MemDrive {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: DriveId::new(id),
            nodes: RwLock::new(BTreeMap::new()),
            cache: None,
            events: None,
            ttl: None,
        }
    }

    pub fn with_cache(mut self, cache: DriveCache, ttl: Option<Duration>) -> Self {
        self.cache = Some(cache);
        self.ttl = ttl;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn entry_for(&self, p: &str, node: &MemNode) -> Entry {
        match node.kind {
            EntryType::Dir => Entry::dir(self.id.clone(), p),
            EntryType::File => {
                Entry::file(self.id.clone(), p, node.data.len() as i64, node.mod_time)
            }
        }
    }

    fn invalidate(&self, p: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(p);
        }
    }

    fn publish(&self, event: DriveEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    async fn require_parent_dir(&self, p: &str) -> Result<()> {
        let parent = path::parent(p);
        if parent.is_empty() {
            return Ok(());
        }
        let nodes = self.nodes.read().await;
        match nodes.get(parent) {
            Some(n) if n.kind == EntryType::Dir => Ok(()),
            Some(_) => Err(DriveError::NotAllowed(format!("not a directory: {parent}"))),
            None => Err(DriveError::NotFound(parent.to_string())),
        }
    }

    /// Keys of `from` and everything under it.
    async fn subtree_keys(&self, from: &str) -> Vec<String> {
        let nodes = self.nodes.read().await;
        nodes
            .keys()
            .filter(|k| path::is_self_or_ancestor(from, k))
            .cloned()
            .collect()
    }

    async fn check_dest(&self, to: &str, overwrite: bool) -> Result<()> {
        let nodes = self.nodes.read().await;
        if nodes.contains_key(to) && !overwrite {
            return Err(DriveError::NotAllowed(format!("destination exists: {to}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Drive for MemDrive {
    fn id(&self) -> DriveId {
        self.id.clone()
    }

    fn meta(&self) -> DriveMeta {
        DriveMeta { writable: true }
    }

    fn caps(&self) -> DriveCaps {
        DriveCaps::NATIVE_COPY | DriveCaps::NATIVE_RENAME
    }

    async fn get(&self, p: &str) -> Result<Entry> {
        if path::is_root(p) {
            return Ok(Entry::dir(self.id.clone(), ""));
        }
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get_entry(p) {
                return Ok(hit);
            }
        }
        let nodes = self.nodes.read().await;
        let node = nodes
            .get(p)
            .ok_or_else(|| DriveError::NotFound(p.to_string()))?;
        let entry = self.entry_for(p, node);
        if let Some(cache) = &self.cache {
            cache.put_entry(&entry, self.ttl);
        }
        Ok(entry)
    }

    async fn list(&self, p: &str) -> Result<Vec<Entry>> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get_children(p) {
                return Ok(hit);
            }
        }
        let nodes = self.nodes.read().await;
        if !path::is_root(p) {
            match nodes.get(p) {
                Some(n) if n.kind == EntryType::Dir => {}
                Some(_) => return Err(DriveError::NotAllowed(format!("not a directory: {p}"))),
                None => return Err(DriveError::NotFound(p.to_string())),
            }
        }
        let entries: Vec<Entry> = nodes
            .iter()
            .filter(|(k, _)| path::parent(k) == p && !k.is_empty())
            .map(|(k, n)| self.entry_for(k, n))
            .collect();
        if let Some(cache) = &self.cache {
            cache.put_children(p, &entries, self.ttl);
        }
        Ok(entries)
    }

    async fn make_dir(&self, p: &str) -> Result<Entry> {
        if path::is_root(p) {
            return Ok(Entry::dir(self.id.clone(), ""));
        }
        self.require_parent_dir(p).await?;
        {
            let mut nodes = self.nodes.write().await;
            match nodes.get(p) {
                Some(n) if n.kind == EntryType::Dir => {
                    return Ok(Entry::dir(self.id.clone(), p));
                }
                Some(_) => {
                    return Err(DriveError::NotAllowed(format!("file exists: {p}")));
                }
                None => {
                    nodes.insert(p.to_string(), MemNode::dir());
                }
            }
        }
        self.invalidate(p);
        self.publish(DriveEvent::EntryUpdated {
            drive: self.id.clone(),
            path: p.to_string(),
        });
        Ok(Entry::dir(self.id.clone(), p))
    }

    async fn save(
        &self,
        ctx: &TaskContext,
        p: &str,
        _size: i64,
        overwrite: bool,
        mut reader: RangeReader,
    ) -> Result<Entry> {
        if path::is_root(p) {
            return Err(DriveError::NotAllowed("cannot save to the root".into()));
        }
        self.require_parent_dir(p).await?;
        {
            let nodes = self.nodes.read().await;
            match nodes.get(p) {
                Some(n) if n.kind == EntryType::Dir => {
                    return Err(DriveError::NotAllowed(format!("is a directory: {p}")));
                }
                Some(_) if !overwrite => {
                    return Err(DriveError::NotAllowed(format!("file exists: {p}")));
                }
                _ => {}
            }
        }
        let mut data = Vec::new();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            DriveError::check_ctx(ctx)?;
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            ctx.progress(n as i64, false);
        }
        let node = MemNode::file(data);
        let entry = self.entry_for(p, &node);
        self.nodes.write().await.insert(p.to_string(), node);
        self.invalidate(p);
        self.publish(DriveEvent::EntryUpdated {
            drive: self.id.clone(),
            path: p.to_string(),
        });
        Ok(entry)
    }

    async fn copy(
        &self,
        ctx: &TaskContext,
        from: &Entry,
        to: &str,
        overwrite: bool,
    ) -> Result<Entry> {
        if from.drive != self.id {
            return Err(DriveError::Unsupported);
        }
        DriveError::check_ctx(ctx)?;
        self.require_parent_dir(to).await?;
        self.check_dest(to, overwrite).await?;
        let keys = self.subtree_keys(&from.path).await;
        if keys.is_empty() {
            return Err(DriveError::NotFound(from.path.clone()));
        }
        {
            let mut nodes = self.nodes.write().await;
            for key in &keys {
                let Some(node) = nodes.get(key).cloned() else {
                    continue;
                };
                let suffix = path::strip_prefix(key, &from.path).unwrap_or("");
                ctx.progress(node.data.len() as i64, false);
                nodes.insert(path::join(to, suffix), node);
            }
        }
        self.invalidate(to);
        self.publish(DriveEvent::EntryUpdated {
            drive: self.id.clone(),
            path: to.to_string(),
        });
        self.get(to).await
    }

    async fn rename(
        &self,
        ctx: &TaskContext,
        from: &Entry,
        to: &str,
        overwrite: bool,
    ) -> Result<Entry> {
        if from.drive != self.id {
            return Err(DriveError::Unsupported);
        }
        DriveError::check_ctx(ctx)?;
        self.require_parent_dir(to).await?;
        self.check_dest(to, overwrite).await?;
        let keys = self.subtree_keys(&from.path).await;
        if keys.is_empty() {
            return Err(DriveError::NotFound(from.path.clone()));
        }
        {
            let mut nodes = self.nodes.write().await;
            for key in &keys {
                let Some(node) = nodes.remove(key) else {
                    continue;
                };
                let suffix = path::strip_prefix(key, &from.path).unwrap_or("");
                nodes.insert(path::join(to, suffix), node);
            }
        }
        self.invalidate(&from.path);
        self.invalidate(to);
        self.publish(DriveEvent::EntryDeleted {
            drive: self.id.clone(),
            path: from.path.clone(),
        });
        self.publish(DriveEvent::EntryUpdated {
            drive: self.id.clone(),
            path: to.to_string(),
        });
        self.get(to).await
    }

    async fn delete(&self, ctx: &TaskContext, p: &str) -> Result<()> {
        if path::is_root(p) {
            return Err(DriveError::NotAllowed("cannot delete the root".into()));
        }
        DriveError::check_ctx(ctx)?;
        let keys = self.subtree_keys(p).await;
        if keys.is_empty() {
            return Err(DriveError::NotFound(p.to_string()));
        }
        {
            let mut nodes = self.nodes.write().await;
            for key in &keys {
                nodes.remove(key);
            }
        }
        self.invalidate(p);
        self.publish(DriveEvent::EntryDeleted {
            drive: self.id.clone(),
            path: p.to_string(),
        });
        Ok(())
    }

    async fn upload(
        &self,
        _ctx: &TaskContext,
        p: &str,
        _size: i64,
        overwrite: bool,
    ) -> Result<UploadConfig> {
        if !overwrite {
            let nodes = self.nodes.read().await;
            if nodes.contains_key(p) {
                return Err(DriveError::NotAllowed(format!("file exists: {p}")));
            }
        }
        Ok(UploadConfig::local())
    }

    async fn open_reader(&self, p: &str, range: ByteRange) -> Result<RangeReader> {
        range.validate()?;
        if !range.is_whole() {
            return Err(DriveError::Unsupported);
        }
        let nodes = self.nodes.read().await;
        let node = nodes
            .get(p)
            .ok_or_else(|| DriveError::NotFound(p.to_string()))?;
        if node.kind != EntryType::File {
            return Err(DriveError::NotAllowed(format!("not a file: {p}")));
        }
        Ok(Box::new(Cursor::new(node.data.clone())))
    }
}
