//! Composite namespace over the registered adapters. A mount table
//! maps composite prefixes onto backend subtrees; paths outside any
//! mount fall back to name aggregation, where the first segment is the
//! adapter name. Longest mount prefix wins.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use libtask::TaskContext;

use crate::cache::pool::RangeReader;
use crate::copy;
use crate::drive::{ByteRange, ContentUrl, Drive, DriveCaps, DriveMeta, UploadConfig};
use crate::entry::{DriveId, Entry, EntryMeta};
use crate::error::{DriveError, Result};
use crate::path;

#[derive(Clone)]
pub struct Mount {
    pub mount_point: String,
    pub drive: Arc<dyn Drive>,
    pub target_path: String,
}

impl Mount {
    pub fn new(mount_point: &str, drive: Arc<dyn Drive>, target_path: &str) -> Self {
        Self {
            mount_point: path::clean(mount_point),
            drive,
            target_path: path::clean(target_path),
        }
    }
}

/// Where a composite path landed: the backend drive and path, plus the
/// prefix pair needed to map backend entries into the composite
/// namespace.
struct Target {
    drive: Arc<dyn Drive>,
    path: String,
    prefix: String,
    base: String,
}

impl Target {
    fn to_composite(&self, backend: &str) -> String {
        match path::strip_prefix(backend, &self.base) {
            Some(rest) => path::join(&self.prefix, rest),
            None => backend.to_string(),
        }
    }

    fn map_entry(&self, entry: Entry) -> Entry {
        let composite = self.to_composite(&entry.path);
        entry.at_path(composite)
    }
}

pub struct MountedDrive {
    id: DriveId,
    drives: RwLock<HashMap<String, Arc<dyn Drive>>>,
    /// Sorted by mount point length descending, swapped whole on
    /// reload so lookups never see a partial table.
    mounts: RwLock<Arc<Vec<Mount>>>,
}

impl MountedDrive {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: DriveId::new(id),
            drives: RwLock::new(HashMap::new()),
            mounts: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Register an adapter under a name for the aggregation fallback.
    /// The name becomes a top-level directory of the composite root.
    pub fn add_drive(&self, name: &str, drive: Arc<dyn Drive>) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(DriveError::BadRequest(format!("invalid drive name: {name}")));
        }
        self.drives.write().unwrap().insert(name.to_string(), drive);
        Ok(())
    }

    pub fn remove_drive(&self, name: &str) -> Option<Arc<dyn Drive>> {
        self.drives.write().unwrap().remove(name)
    }

    pub fn drive_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drives.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace the mount table. Duplicate mount points are rejected;
    /// the new table takes effect atomically.
    pub fn set_mounts(&self, mut mounts: Vec<Mount>) -> Result<()> {
        mounts.sort_by(|a, b| b.mount_point.len().cmp(&a.mount_point.len()));
        for pair in mounts.windows(2) {
            if pair[0].mount_point == pair[1].mount_point {
                return Err(DriveError::BadRequest(format!(
                    "duplicate mount point: {}",
                    pair[0].mount_point
                )));
            }
        }
        debug!(mounts = mounts.len(), "mount table replaced");
        *self.mounts.write().unwrap() = Arc::new(mounts);
        Ok(())
    }

    fn mounts(&self) -> Arc<Vec<Mount>> {
        self.mounts.read().unwrap().clone()
    }

    fn resolve(&self, p: &str) -> Result<Target> {
        for m in self.mounts().iter() {
            if path::is_self_or_ancestor(&m.mount_point, p) {
                let rest = path::strip_prefix(p, &m.mount_point).unwrap_or("");
                return Ok(Target {
                    drive: m.drive.clone(),
                    path: path::join(&m.target_path, rest),
                    prefix: m.mount_point.clone(),
                    base: m.target_path.clone(),
                });
            }
        }
        if p.is_empty() {
            return Err(DriveError::NotFound(String::new()));
        }
        let (name, rest) = match p.split_once('/') {
            Some((name, rest)) => (name, rest),
            None => (p, ""),
        };
        let drives = self.drives.read().unwrap();
        match drives.get(name) {
            Some(d) => Ok(Target {
                drive: d.clone(),
                path: rest.to_string(),
                prefix: name.to_string(),
                base: String::new(),
            }),
            None => Err(DriveError::NotFound(p.to_string())),
        }
    }

    /// True when `p` is itself a mount point or an ancestor of one, so
    /// it must exist as a directory even if no backend has it.
    fn covers(&self, p: &str) -> bool {
        self.mounts()
            .iter()
            .any(|m| path::is_self_or_ancestor(p, &m.mount_point))
    }

    fn synthetic_dir(&self, p: &str) -> Entry {
        let writable = self
            .mounts()
            .iter()
            .find(|m| m.mount_point == p)
            .map(|m| m.drive.meta().writable)
            .unwrap_or(true);
        let mut e = Entry::dir(self.id.clone(), p);
        e.meta = EntryMeta::rw(true, writable);
        e
    }

    fn list_drives(&self) -> Vec<Entry> {
        let drives = self.drives.read().unwrap();
        drives
            .iter()
            .map(|(name, d)| {
                let mut e = Entry::dir(d.id(), name.clone());
                e.meta = EntryMeta::rw(true, d.meta().writable);
                e
            })
            .collect()
    }

    /// Backend-side view of a composite entry, for handing to the
    /// owning adapter's native operations.
    fn backend_entry(&self, entry: &Entry, target: &Target) -> Entry {
        let mut e = entry.clone().at_path(target.path.clone());
        e.drive = target.drive.id();
        e
    }

    async fn transfer(
        &self,
        ctx: &TaskContext,
        from: &Entry,
        to: &str,
        overwrite: bool,
        delete_source: bool,
    ) -> Result<Entry> {
        let to = path::clean(to);
        if from.is_dir() && path::is_self_or_ancestor(&from.path, &to) {
            return Err(DriveError::NotAllowed(format!(
                "cannot copy {} into itself",
                from.path
            )));
        }
        let src = self.resolve(&from.path)?;
        let dst = self.resolve(&to)?;
        let backend_from = self.backend_entry(from, &src);
        if Arc::ptr_eq(&src.drive, &dst.drive) {
            let native = if delete_source {
                src.drive.rename(ctx, &backend_from, &dst.path, overwrite).await
            } else {
                src.drive.copy(ctx, &backend_from, &dst.path, overwrite).await
            };
            match native {
                Ok(e) => return Ok(dst.map_entry(e)),
                Err(DriveError::Unsupported) => {
                    debug!(from = %from.path, to = %to, "native transfer unsupported, streaming");
                }
                Err(e) => return Err(e),
            }
        }
        copy::copy_entries(
            &src.drive,
            backend_from,
            &dst.drive,
            &dst.path,
            overwrite,
            delete_source,
            ctx,
        )
        .await?;
        self.get(&to).await
    }
}

#[async_trait]
impl Drive for MountedDrive {
    fn id(&self) -> DriveId {
        self.id.clone()
    }

    fn meta(&self) -> DriveMeta {
        DriveMeta { writable: true }
    }

    fn caps(&self) -> DriveCaps {
        // Fallbacks are handled internally, so the composite always
        // advertises them.
        DriveCaps::RANGE_READ | DriveCaps::NATIVE_COPY | DriveCaps::NATIVE_RENAME
    }

    async fn get(&self, raw: &str) -> Result<Entry> {
        let p = path::clean(raw);
        match self.resolve(&p) {
            Ok(t) => match t.drive.get(&t.path).await {
                Ok(e) => Ok(t.map_entry(e)),
                Err(DriveError::NotFound(_)) if self.covers(&p) => Ok(self.synthetic_dir(&p)),
                Err(e) => Err(e),
            },
            Err(_) if path::is_root(&p) => Ok(Entry::dir(self.id.clone(), "")),
            Err(DriveError::NotFound(_)) if self.covers(&p) => Ok(self.synthetic_dir(&p)),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, raw: &str) -> Result<Vec<Entry>> {
        let p = path::clean(raw);
        let mut out: Vec<Entry> = match self.resolve(&p) {
            Ok(t) => match t.drive.list(&t.path).await {
                Ok(entries) => entries.into_iter().map(|e| t.map_entry(e)).collect(),
                Err(DriveError::NotFound(_)) if self.covers(&p) => Vec::new(),
                Err(e) => return Err(e),
            },
            Err(_) if path::is_root(&p) => self.list_drives(),
            Err(DriveError::NotFound(_)) if self.covers(&p) => Vec::new(),
            Err(e) => return Err(e),
        };
        // Mount points one level below `p` appear as directories even
        // when no backend entry exists there; a shadowed backend file
        // yields to the mount.
        for m in self.mounts().iter() {
            let Some(rest) = path::strip_prefix(&m.mount_point, &p) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let name = rest.split('/').next().unwrap_or(rest);
            let child = path::join(&p, name);
            let mut synth = Entry::dir(m.drive.id(), child.clone());
            synth.meta = EntryMeta::rw(true, m.drive.meta().writable);
            match out.iter_mut().find(|e| e.path == child) {
                Some(existing) if existing.is_file() => *existing = synth,
                Some(_) => {}
                None => out.push(synth),
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn make_dir(&self, raw: &str) -> Result<Entry> {
        let p = path::clean(raw);
        let t = self.resolve(&p)?;
        let e = t.drive.make_dir(&t.path).await?;
        Ok(t.map_entry(e))
    }

    async fn save(
        &self,
        ctx: &TaskContext,
        raw: &str,
        size: i64,
        overwrite: bool,
        reader: RangeReader,
    ) -> Result<Entry> {
        let p = path::clean(raw);
        let t = self.resolve(&p)?;
        let e = t.drive.save(ctx, &t.path, size, overwrite, reader).await?;
        Ok(t.map_entry(e))
    }

    async fn copy(
        &self,
        ctx: &TaskContext,
        from: &Entry,
        to: &str,
        overwrite: bool,
    ) -> Result<Entry> {
        self.transfer(ctx, from, to, overwrite, false).await
    }

    async fn rename(
        &self,
        ctx: &TaskContext,
        from: &Entry,
        to: &str,
        overwrite: bool,
    ) -> Result<Entry> {
        self.transfer(ctx, from, to, overwrite, true).await
    }

    async fn delete(&self, ctx: &TaskContext, raw: &str) -> Result<()> {
        let p = path::clean(raw);
        if path::is_root(&p) {
            return Err(DriveError::NotAllowed("cannot delete the root".into()));
        }
        let t = self.resolve(&p)?;
        t.drive.delete(ctx, &t.path).await
    }

    async fn upload(
        &self,
        ctx: &TaskContext,
        raw: &str,
        size: i64,
        overwrite: bool,
    ) -> Result<UploadConfig> {
        let p = path::clean(raw);
        let t = self.resolve(&p)?;
        t.drive.upload(ctx, &t.path, size, overwrite).await
    }

    async fn open_reader(&self, raw: &str, range: ByteRange) -> Result<RangeReader> {
        let p = path::clean(raw);
        let t = self.resolve(&p)?;
        t.drive.open_reader(&t.path, range).await
    }

    async fn content_url(&self, raw: &str) -> Result<Option<ContentUrl>> {
        let p = path::clean(raw);
        let t = self.resolve(&p)?;
        t.drive.content_url(&t.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::memory::MemDrive;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    async fn seed(drive: &MemDrive, p: &str, data: &[u8]) {
        let ctx = TaskContext::new();
        drive
            .save(&ctx, p, data.len() as i64, true, Box::new(Cursor::new(data.to_vec())))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn aggregation_routes_by_first_segment() {
        let mounted = MountedDrive::new("root");
        let x = Arc::new(MemDrive::new("x"));
        seed(&x, "f.txt", b"from x").await;
        mounted.add_drive("x", x).unwrap();

        let e = mounted.get("x/f.txt").await.unwrap();
        assert_eq!(e.path, "x/f.txt");
        assert_eq!(e.size, 6);
        assert!(matches!(
            mounted.get("nope/f").await,
            Err(DriveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn root_lists_drive_names() {
        let mounted = MountedDrive::new("root");
        mounted.add_drive("b", Arc::new(MemDrive::new("b"))).unwrap();
        mounted.add_drive("a", Arc::new(MemDrive::new("a"))).unwrap();
        let names: Vec<String> = mounted
            .list("")
            .await
            .unwrap()
            .iter()
            .map(|e| e.path.clone())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(mounted.list("").await.unwrap().iter().all(|e| e.is_dir()));
    }

    #[tokio::test]
    async fn longest_mount_prefix_wins() {
        let x = Arc::new(MemDrive::new("x"));
        x.make_dir("root").await.unwrap();
        seed(&x, "root/c", b"deep").await;
        let y = Arc::new(MemDrive::new("y"));
        y.make_dir("home").await.unwrap();
        seed(&y, "home/f", b"shallow").await;

        let mounted = MountedDrive::new("root");
        mounted
            .set_mounts(vec![
                Mount::new("a", y.clone(), "home"),
                Mount::new("a/b", x.clone(), "root"),
            ])
            .unwrap();

        let deep = mounted.get("a/b/c").await.unwrap();
        assert_eq!(deep.path, "a/b/c");
        assert_eq!(deep.size, 4);
        let shallow = mounted.get("a/f").await.unwrap();
        assert_eq!(shallow.path, "a/f");
        assert_eq!(shallow.size, 7);
    }

    #[tokio::test]
    async fn listing_synthesizes_mount_point_dirs() {
        let y = Arc::new(MemDrive::new("y"));
        y.make_dir("home").await.unwrap();
        seed(&y, "home/f", b"1").await;
        let x = Arc::new(MemDrive::new("x"));
        x.make_dir("root").await.unwrap();

        let mounted = MountedDrive::new("root");
        mounted
            .set_mounts(vec![
                Mount::new("a", y.clone(), "home"),
                Mount::new("a/b", x.clone(), "root"),
            ])
            .unwrap();

        let paths: Vec<String> = mounted
            .list("a")
            .await
            .unwrap()
            .iter()
            .map(|e| e.path.clone())
            .collect();
        assert_eq!(paths, vec!["a/b", "a/f"]);

        // "a/b" does not exist in driveY, yet it resolves as a dir.
        let b = mounted.get("a/b").await.unwrap();
        assert!(b.is_dir());
    }

    #[tokio::test]
    async fn mount_at_missing_backend_path_is_a_dir() {
        let x = Arc::new(MemDrive::new("x"));
        let mounted = MountedDrive::new("root");
        mounted
            .set_mounts(vec![Mount::new("docs", x.clone(), "not/there")])
            .unwrap();

        let e = mounted.get("docs").await.unwrap();
        assert!(e.is_dir());
        assert!(mounted.list("docs").await.unwrap().is_empty());
        // Ancestors of a mount point exist as well.
        let root = mounted.list("").await.unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].path, "docs");
    }

    #[tokio::test]
    async fn same_drive_transfer_uses_native_path() {
        let x = Arc::new(MemDrive::new("x"));
        seed(&x, "f", b"abc").await;
        let mounted = MountedDrive::new("root");
        mounted.add_drive("x", x.clone()).unwrap();

        let ctx = TaskContext::new();
        let from = mounted.get("x/f").await.unwrap();
        let copied = mounted.copy(&ctx, &from, "x/g", false).await.unwrap();
        assert_eq!(copied.path, "x/g");
        assert_eq!(mounted.get("x/f").await.unwrap().size, 3);
        assert_eq!(mounted.get("x/g").await.unwrap().size, 3);
    }

    #[tokio::test]
    async fn cross_drive_move_streams_and_deletes_source() {
        let x = Arc::new(MemDrive::new("x"));
        x.make_dir("d").await.unwrap();
        seed(&x, "d/f", b"payload").await;
        let y = Arc::new(MemDrive::new("y"));
        let mounted = MountedDrive::new("root");
        mounted.add_drive("x", x.clone()).unwrap();
        mounted.add_drive("y", y.clone()).unwrap();

        let ctx = TaskContext::new();
        let from = mounted.get("x/d").await.unwrap();
        let moved = mounted.rename(&ctx, &from, "y/d", false).await.unwrap();
        assert!(moved.is_dir());
        assert_eq!(mounted.get("y/d/f").await.unwrap().size, 7);
        assert!(matches!(
            mounted.get("x/d").await,
            Err(DriveError::NotFound(_))
        ));

        let mut r = mounted.open_reader("y/d/f", ByteRange::WHOLE).await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn copy_into_itself_is_rejected() {
        let x = Arc::new(MemDrive::new("x"));
        x.make_dir("d").await.unwrap();
        let mounted = MountedDrive::new("root");
        mounted.add_drive("x", x).unwrap();
        let ctx = TaskContext::new();
        let from = mounted.get("x/d").await.unwrap();
        assert!(matches!(
            mounted.copy(&ctx, &from, "x/d/inner", false).await,
            Err(DriveError::NotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_mount_points_rejected() {
        let x: Arc<dyn Drive> = Arc::new(MemDrive::new("x"));
        let mounted = MountedDrive::new("root");
        let res = mounted.set_mounts(vec![
            Mount::new("a", x.clone(), "p"),
            Mount::new("a", x.clone(), "q"),
        ]);
        assert!(matches!(res, Err(DriveError::BadRequest(_))));
    }
}
