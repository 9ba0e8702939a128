//! Rooted local-filesystem adapter: the full contract with ranged
//! reads and native copy/rename.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::time::Duration;

use libtask::TaskContext;

use crate::cache::pool::RangeReader;
use crate::drive::{ByteRange, Drive, DriveCaps, DriveMeta, UploadConfig};
use crate::entry::{DriveId, Entry, EntryType};
use crate::error::{DriveError, Result};
use crate::event::{DriveEvent, EventBus};
use crate::meta::DriveCache;
use crate::path;

pub struct LocalDrive {
    id: DriveId,
    root: PathBuf,
    cache: Option<DriveCache>,
    events: Option<EventBus>,
    ttl: Option<Duration>,
}

fn mod_time_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(-1)
}

fn map_io(p: &str, e: std::io::Error) -> DriveError {
    if e.kind() == std::io::ErrorKind::NotFound {
        DriveError::NotFound(p.to_string())
    } else {
        DriveError::Io(e)
    }
}

impl LocalDrive {
    pub async fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta = fs::metadata(&root)
            .await
            .map_err(|_| DriveError::BadRequest(format!("root does not exist: {root:?}")))?;
        if !meta.is_dir() {
            return Err(DriveError::BadRequest(format!(
                "root is not a directory: {root:?}"
            )));
        }
        Ok(Self {
            id: DriveId::new(id),
            root,
            cache: None,
            events: None,
            ttl: None,
        })
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

    fn resolve(&self, p: &str) -> PathBuf {
        // `clean` strips `..`, so the result never escapes the root.
        let p = path::clean(p);
        if p.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&p)
        }
    }

    fn entry_from_meta(&self, p: &str, meta: &std::fs::Metadata) -> Entry {
        if meta.is_dir() {
            Entry::dir(self.id.clone(), p)
        } else {
            Entry::file(self.id.clone(), p, meta.len() as i64, mod_time_ms(meta))
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

    async fn check_dest(&self, to: &str, overwrite: bool) -> Result<()> {
        if !overwrite && fs::metadata(self.resolve(to)).await.is_ok() {
            return Err(DriveError::NotAllowed(format!("destination exists: {to}")));
        }
        Ok(())
    }

    async fn copy_tree(
        &self,
        ctx: &TaskContext,
        src_root: &Path,
        dest_root: &Path,
    ) -> Result<()> {
        let mut stack = vec![(src_root.to_path_buf(), dest_root.to_path_buf())];
        while let Some((src, dest)) = stack.pop() {
            DriveError::check_ctx(ctx)?;
            let meta = fs::metadata(&src).await?;
            if meta.is_dir() {
                if fs::metadata(&dest).await.is_err() {
                    fs::create_dir(&dest).await?;
                }
                let mut dir = fs::read_dir(&src).await?;
                while let Some(item) = dir.next_entry().await? {
                    stack.push((item.path(), dest.join(item.file_name())));
                }
            } else {
                let n = fs::copy(&src, &dest).await?;
                ctx.progress(n as i64, false);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Drive for LocalDrive {
    fn id(&self) -> DriveId {
        self.id.clone()
    }

    fn meta(&self) -> DriveMeta {
        DriveMeta { writable: true }
    }

    fn caps(&self) -> DriveCaps {
        DriveCaps::RANGE_READ | DriveCaps::NATIVE_COPY | DriveCaps::NATIVE_RENAME
    }

    async fn get(&self, p: &str) -> Result<Entry> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get_entry(p) {
                return Ok(hit);
            }
        }
        let meta = fs::metadata(self.resolve(p))
            .await
            .map_err(|e| map_io(p, e))?;
        let entry = self.entry_from_meta(p, &meta);
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
        let dir_path = self.resolve(p);
        let meta = fs::metadata(&dir_path).await.map_err(|e| map_io(p, e))?;
        if !meta.is_dir() {
            return Err(DriveError::NotAllowed(format!("not a directory: {p}")));
        }
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&dir_path).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            let meta = item.metadata().await?;
            entries.push(self.entry_from_meta(&path::join(p, &name), &meta));
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        if let Some(cache) = &self.cache {
            cache.put_children(p, &entries, self.ttl);
        }
        Ok(entries)
    }

    async fn make_dir(&self, p: &str) -> Result<Entry> {
        let target = self.resolve(p);
        match fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => return Ok(Entry::dir(self.id.clone(), p)),
            Ok(_) => return Err(DriveError::NotAllowed(format!("file exists: {p}"))),
            Err(_) => {}
        }
        fs::create_dir(&target)
            .await
            .map_err(|e| map_io(path::parent(p), e))?;
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
        let target = self.resolve(p);
        match fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => {
                return Err(DriveError::NotAllowed(format!("is a directory: {p}")));
            }
            Ok(_) if !overwrite => {
                return Err(DriveError::NotAllowed(format!("file exists: {p}")));
            }
            _ => {}
        }
        let file = File::create(&target).await.map_err(|e| map_io(p, e))?;
        let mut writer = BufWriter::new(file);
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            DriveError::check_ctx(ctx)?;
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            ctx.progress(n as i64, false);
        }
        writer.flush().await?;
        self.invalidate(p);
        self.publish(DriveEvent::EntryUpdated {
            drive: self.id.clone(),
            path: p.to_string(),
        });
        let meta = fs::metadata(&target).await?;
        Ok(self.entry_from_meta(p, &meta))
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
        self.check_dest(to, overwrite).await?;
        let src = self.resolve(&from.path);
        let dest = self.resolve(to);
        if from.kind == EntryType::Dir {
            self.copy_tree(ctx, &src, &dest).await?;
        } else {
            DriveError::check_ctx(ctx)?;
            let n = fs::copy(&src, &dest).await.map_err(|e| map_io(&from.path, e))?;
            ctx.progress(n as i64, false);
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
        self.check_dest(to, overwrite).await?;
        fs::rename(self.resolve(&from.path), self.resolve(to))
            .await
            .map_err(|e| map_io(&from.path, e))?;
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
        let target = self.resolve(p);
        let meta = fs::metadata(&target).await.map_err(|e| map_io(p, e))?;
        if meta.is_dir() {
            fs::remove_dir_all(&target).await?;
        } else {
            fs::remove_file(&target).await?;
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
        if !overwrite && fs::metadata(self.resolve(p)).await.is_ok() {
            return Err(DriveError::NotAllowed(format!("file exists: {p}")));
        }
        Ok(UploadConfig::local())
    }

    async fn open_reader(&self, p: &str, range: ByteRange) -> Result<RangeReader> {
        range.validate()?;
        let mut file = OpenOptions::new()
            .read(true)
            .open(self.resolve(p))
            .await
            .map_err(|e| map_io(p, e))?;
        if range.is_whole() {
            return Ok(Box::new(file));
        }
        file.seek(SeekFrom::Start(range.start as u64)).await?;
        Ok(Box::new(file.take(range.length as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    async fn drive() -> (tempfile::TempDir, LocalDrive) {
        let dir = tempfile::tempdir().unwrap();
        let drive = LocalDrive::new("local", dir.path()).await.unwrap();
        (dir, drive)
    }

    async fn save(drive: &LocalDrive, p: &str, data: &[u8]) -> Result<Entry> {
        let ctx = TaskContext::new();
        drive
            .save(&ctx, p, data.len() as i64, true, Box::new(Cursor::new(data.to_vec())))
            .await
    }

    #[tokio::test]
    async fn save_then_get_reports_written_size() {
        let (_dir, drive) = drive().await;
        save(&drive, "f.bin", &[7u8; 1000]).await.unwrap();
        let got = drive.get("f.bin").await.unwrap();
        assert_eq!(got.size, 1000);
        assert!(got.mod_time > 0);
    }

    #[tokio::test]
    async fn ranged_read() {
        let (_dir, drive) = drive().await;
        save(&drive, "f", b"0123456789").await.unwrap();
        let mut r = drive
            .open_reader("f", ByteRange::partial(2, 4))
            .await
            .unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"2345");
    }

    #[tokio::test]
    async fn native_copy_of_directory() {
        let (_dir, drive) = drive().await;
        drive.make_dir("d").await.unwrap();
        drive.make_dir("d/sub").await.unwrap();
        save(&drive, "d/sub/f", b"abc").await.unwrap();
        let ctx = TaskContext::new();
        let from = drive.get("d").await.unwrap();
        drive.copy(&ctx, &from, "d2", false).await.unwrap();
        assert_eq!(drive.get("d2/sub/f").await.unwrap().size, 3);
        assert_eq!(ctx.snapshot().loaded, 3);
        // Source stays.
        assert!(drive.get("d/sub/f").await.is_ok());
    }

    #[tokio::test]
    async fn move_then_source_gone() {
        let (_dir, drive) = drive().await;
        save(&drive, "a", b"x").await.unwrap();
        let ctx = TaskContext::new();
        let from = drive.get("a").await.unwrap();
        drive.rename(&ctx, &from, "b", false).await.unwrap();
        assert!(matches!(drive.get("a").await, Err(DriveError::NotFound(_))));
        assert_eq!(drive.get("b").await.unwrap().size, 1);
    }

    #[tokio::test]
    async fn delete_root_is_not_allowed() {
        let (_dir, drive) = drive().await;
        let ctx = TaskContext::new();
        assert!(matches!(
            drive.delete(&ctx, "").await,
            Err(DriveError::NotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn paths_cannot_escape_root() {
        let (_dir, drive) = drive().await;
        save(&drive, "inside", b"x").await.unwrap();
        assert!(matches!(
            drive.get("../../etc/passwd").await,
            Err(DriveError::NotFound(_))
        ));
    }
}
