//! Range-locked cache file pool: per content key, a locally backed
//! sparse file readers stream from while detached writer tasks fill it
//! block by block. Any number of readers share one file; each byte is
//! downloaded by at most one writer.

use futures::future::BoxFuture;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt, ReadBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::range_lock::RangeLock;
use crate::error::{DriveError, Result};

const WRITE_BUF: usize = 32 * 1024;
pub const DEFAULT_BLOCK_SIZE: i64 = 10 * 1024 * 1024;

/// A remote byte stream for one requested range.
pub type RangeReader = Box<dyn AsyncRead + Send + Unpin>;

/// Caller-supplied fetcher: `(offset, length)` for a partial range,
/// `(-1, -1)` for the whole file. Answers `unsupported` when the
/// backend cannot serve partial ranges.
pub type RangeReaderFn = Arc<dyn Fn(i64, i64) -> BoxFuture<'static, Result<RangeReader>> + Send + Sync>;

struct CacheFile {
    key: String,
    path: PathBuf,
    size: i64,
    block_size: i64,
    read_ranges: RangeLock,
    write_ranges: RangeLock,
    /// Open reader handles plus live writer tasks.
    holders: AtomicUsize,
    closed: AtomicBool,
    evicted: AtomicBool,
    /// Set once a ranged probe came back unsupported; later readers go
    /// straight to whole-file mode.
    whole_file: AtomicBool,
    removed: AtomicBool,
}

impl CacheFile {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn acquire_holder(&self) {
        self.holders.fetch_add(1, Ordering::SeqCst);
    }

    fn release_holder(&self) {
        if self.holders.fetch_sub(1, Ordering::SeqCst) == 1
            && (self.is_closed() || self.evicted.load(Ordering::SeqCst))
        {
            self.remove_disk_file();
        }
    }

    /// Tear down: fail blocked readers, stop writers, and remove the
    /// disk file once the last holder releases.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.read_ranges.release(false);
        self.write_ranges.release(false);
        if self.holders.load(Ordering::SeqCst) == 0 {
            self.remove_disk_file();
        }
    }

    fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::SeqCst);
        if self.holders.load(Ordering::SeqCst) == 0 {
            self.remove_disk_file();
        }
    }

    fn remove_disk_file(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        let path = self.path.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(key = %key, error = %e, "failed to remove cache file");
            }
        });
    }

    /// The download scheduler: make sure something is (or already was)
    /// fetching `[start, start+len)`. Returns without waiting; readers
    /// block on `read_ranges.acquire` afterwards.
    async fn read_request(self: &Arc<Self>, getter: &RangeReaderFn, start: i64, len: i64) -> Result<()> {
        if self.is_closed() || self.read_ranges.satisfied(start, len) {
            return Ok(());
        }
        let whole = self.size <= self.block_size || self.whole_file.load(Ordering::SeqCst);
        let mut claimed_all = false;
        if !whole {
            let bs = self.block_size;
            let block_start = start / bs * bs;
            let mut block_end = (start + len + bs - 1) / bs * bs;
            if block_end > self.size {
                block_end = self.size;
            }
            // Never leave a sub-block tail for a later download.
            if self.size - block_end < bs {
                block_end = self.size;
            }
            if !self.write_ranges.try_exclusive_feed(block_start, block_end - block_start) {
                // Another downloader owns this span.
                return Ok(());
            }
            debug!(key = %self.key, block_start, block_end, "scheduling block download");
            match getter(block_start, block_end - block_start).await {
                Ok(src) => {
                    self.spawn_writer(src, block_start);
                    return Ok(());
                }
                Err(DriveError::Unsupported) => {
                    debug!(key = %self.key, "ranges unsupported, switching to whole-file");
                    self.whole_file.store(true, Ordering::SeqCst);
                    // The failed probe keeps its reservation. When that
                    // reservation already spans the file, this caller
                    // owns the whole-file claim and must start the
                    // download itself instead of waiting on it.
                    claimed_all = block_start == 0 && block_end == self.size;
                }
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            }
        }
        if !claimed_all && !self.write_ranges.try_exclusive_feed(0, self.size) {
            // Someone is already downloading everything.
            return Ok(());
        }
        debug!(key = %self.key, size = self.size, "scheduling whole-file download");
        match getter(-1, -1).await {
            Ok(src) => {
                self.spawn_writer(src, 0);
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn spawn_writer(self: &Arc<Self>, mut src: RangeReader, offset: i64) {
        self.acquire_holder();
        let file = self.clone();
        tokio::spawn(async move {
            if let Err(e) = file.write_loop(&mut src, offset).await {
                warn!(key = %file.key, error = %e, "cache writer failed");
                file.close();
            }
            file.release_holder();
        });
    }

    async fn write_loop(&self, src: &mut RangeReader, mut pos: i64) -> std::io::Result<()> {
        let mut f = OpenOptions::new().write(true).open(&self.path).await?;
        f.seek(SeekFrom::Start(pos as u64)).await?;
        let mut buf = vec![0u8; WRITE_BUF];
        loop {
            if self.is_closed() {
                return Ok(());
            }
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            f.write_all(&buf[..n]).await?;
            f.flush().await?;
            self.read_ranges.feed(pos, n as i64);
            pos += n as i64;
        }
        Ok(())
    }
}

/// LRU-bounded pool of cache files, keyed by content key and backed by
/// files named with the key's sha256 plus an instance nonce under the
/// pool directory.
pub struct CacheFilePool {
    dir: PathBuf,
    block_size: i64,
    files: Mutex<LruCache<String, Arc<CacheFile>>>,
}

impl CacheFilePool {
    pub async fn new(max_entries: usize, dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_block_size(max_entries, dir, DEFAULT_BLOCK_SIZE).await
    }

    pub async fn with_block_size(
        max_entries: usize,
        dir: impl Into<PathBuf>,
        block_size: i64,
    ) -> Result<Self> {
        let dir = dir.into();
        let meta = tokio::fs::metadata(&dir)
            .await
            .map_err(|_| DriveError::BadRequest(format!("cache dir does not exist: {dir:?}")))?;
        if !meta.is_dir() {
            return Err(DriveError::BadRequest(format!(
                "cache dir is not a directory: {dir:?}"
            )));
        }
        if block_size <= 0 {
            return Err(DriveError::BadRequest("block size must be positive".into()));
        }
        let cap = NonZeroUsize::new(max_entries)
            .ok_or_else(|| DriveError::BadRequest("pool capacity must be positive".into()))?;
        Ok(Self {
            dir,
            block_size,
            files: Mutex::new(LruCache::new(cap)),
        })
    }

    fn backing_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        // The nonce keeps an evicted-but-held instance and its
        // replacement for the same key on separate disk files.
        let name = format!(
            "{}-{}",
            hex::encode(hasher.finalize()),
            uuid::Uuid::new_v4().simple()
        );
        self.dir.join(name)
    }

    /// Open a random-access reader over the cached file for `key`,
    /// creating the sparse backing file on first request.
    pub async fn get_reader(
        &self,
        key: &str,
        size: i64,
        getter: RangeReaderFn,
    ) -> Result<CacheFileReader> {
        if size < 0 {
            return Err(DriveError::BadRequest("unknown size cannot be pooled".into()));
        }
        let mut files = self.files.lock().await;
        let hit = files.get(key).cloned();
        if let Some(file) = hit {
            if !file.is_closed() {
                file.acquire_holder();
                return Ok(CacheFileReader::new(file, getter));
            }
            files.pop(key);
        }

        let path = self.backing_path(key);
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        f.set_len(size as u64).await?;
        let file = Arc::new(CacheFile {
            key: key.to_string(),
            path,
            size,
            block_size: self.block_size,
            read_ranges: RangeLock::new(size),
            write_ranges: RangeLock::new(size),
            holders: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            whole_file: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        });
        if let Some((old_key, old)) = files.push(key.to_string(), file.clone()) {
            if old_key != key {
                debug!(key = %old_key, "evicting cache file");
            }
            old.mark_evicted();
        }
        file.acquire_holder();
        Ok(CacheFileReader::new(file, getter))
    }

    /// Drop and tear down the cached file for `key`, if any.
    pub async fn remove(&self, key: &str) {
        let file = self.files.lock().await.pop(key);
        if let Some(file) = file {
            file.close();
        }
    }

    /// Tear down every cached file. Blocked readers fail promptly.
    pub async fn clear(&self) {
        let mut files = self.files.lock().await;
        while let Some((_, file)) = files.pop_lru() {
            file.close();
        }
    }
}

async fn read_at(
    file: Arc<CacheFile>,
    getter: RangeReaderFn,
    pos: i64,
    len: i64,
) -> std::io::Result<Vec<u8>> {
    file.read_request(&getter, pos, len)
        .await
        .map_err(std::io::Error::from)?;
    if !file.read_ranges.acquire(pos, len).await {
        return Err(std::io::Error::other("cache file closed"));
    }
    let mut f = File::open(&file.path).await?;
    f.seek(SeekFrom::Start(pos as u64)).await?;
    let mut buf = vec![0u8; len as usize];
    f.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Random-access reader handle over a pooled cache file. Reads block
/// until the requested range is locally present.
pub struct CacheFileReader {
    file: Arc<CacheFile>,
    getter: RangeReaderFn,
    pos: i64,
    pending: Option<BoxFuture<'static, std::io::Result<Vec<u8>>>>,
}

impl CacheFileReader {
    fn new(file: Arc<CacheFile>, getter: RangeReaderFn) -> Self {
        Self {
            file,
            getter,
            pos: 0,
            pending: None,
        }
    }

    pub fn size(&self) -> i64 {
        self.file.size
    }

    pub fn position(&self) -> i64 {
        self.pos
    }
}

impl Drop for CacheFileReader {
    fn drop(&mut self) {
        self.file.release_holder();
    }
}

impl AsyncRead for CacheFileReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(fut) = this.pending.as_mut() {
                let result = ready!(fut.as_mut().poll(cx));
                this.pending = None;
                return match result {
                    Ok(bytes) => {
                        let n = bytes.len().min(buf.remaining());
                        buf.put_slice(&bytes[..n]);
                        this.pos += n as i64;
                        Poll::Ready(Ok(()))
                    }
                    Err(e) => Poll::Ready(Err(e)),
                };
            }
            let want = (buf.remaining() as i64).min(this.file.size - this.pos);
            if want <= 0 {
                return Poll::Ready(Ok(()));
            }
            this.pending = Some(Box::pin(read_at(
                this.file.clone(),
                this.getter.clone(),
                this.pos,
                want,
            )));
        }
    }
}

impl AsyncSeek for CacheFileReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();
        let target = match position {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(d) => this.file.size + d,
            SeekFrom::Current(d) => this.pos + d,
        };
        if target < 0 || target > this.file.size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("seek out of bounds: {target}"),
            ));
        }
        this.pending = None;
        this.pos = target;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Poll::Ready(Ok(self.pos as u64))
    }
}
