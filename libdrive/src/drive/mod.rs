//! The adapter contract every backend fulfills, plus the bridge that
//! routes content reads through the cache file pool.

pub mod access;
pub mod local;
pub mod memory;
pub mod mounted;
pub mod s3;

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use libtask::TaskContext;

use crate::cache::pool::{CacheFilePool, CacheFileReader, RangeReader, RangeReaderFn};
use crate::entry::{DriveId, Entry};
use crate::error::{DriveError, Result};

/// A byte range request to an adapter. `(-1, -1)` means the whole
/// file; partial requests have `start >= 0` and `length > 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: i64,
    pub length: i64,
}

impl ByteRange {
    pub const WHOLE: Self = Self {
        start: -1,
        length: -1,
    };

    pub fn partial(start: i64, length: i64) -> Self {
        Self { start, length }
    }

    pub fn is_whole(&self) -> bool {
        self.start < 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_whole() || (self.start >= 0 && self.length > 0) {
            Ok(())
        } else {
            Err(DriveError::BadRequest(format!(
                "invalid byte range: start={} length={}",
                self.start, self.length
            )))
        }
    }

    /// `Range` header value for HTTP-backed adapters. `None` for the
    /// whole file; `bytes=start-` when the length is open-ended.
    pub fn header_value(&self) -> Option<String> {
        if self.is_whole() {
            return None;
        }
        if self.length < 0 {
            Some(format!("bytes={}-", self.start))
        } else {
            Some(format!("bytes={}-{}", self.start, self.start + self.length - 1))
        }
    }
}

bitflags! {
    /// Capability probes `MountedDrive` uses to pick fallback paths.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DriveCaps: u8 {
        const RANGE_READ = 1 << 0;
        const NATIVE_COPY = 1 << 1;
        const NATIVE_RENAME = 1 << 2;
        const CONTENT_URL = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DriveMeta {
    pub writable: bool,
}

/// Redirect or proxy hint for content served by the backend itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentUrl {
    pub url: String,
    /// When set, the gateway streams through itself replacing headers;
    /// otherwise the client fetches the URL directly.
    pub proxy: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Answer to `upload`: where the client should send its bytes.
/// `provider = "local"` routes through the gateway's chunk uploader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    pub provider: String,
    pub config: serde_json::Value,
}

impl UploadConfig {
    pub fn local() -> Self {
        Self {
            provider: "local".into(),
            config: serde_json::json!({}),
        }
    }
}

/// The backend contract. Paths are normalized (`""` is the root).
/// Every mutation must apply the metadata-cache invalidation
/// discipline and publish the matching drive event.
#[async_trait]
pub trait Drive: Send + Sync {
    fn id(&self) -> DriveId;

    fn meta(&self) -> DriveMeta;

    fn caps(&self) -> DriveCaps;

    async fn get(&self, path: &str) -> Result<Entry>;

    async fn list(&self, path: &str) -> Result<Vec<Entry>>;

    /// Idempotent for an existing directory; a file in the way answers
    /// `not-allowed`.
    async fn make_dir(&self, path: &str) -> Result<Entry>;

    async fn save(
        &self,
        ctx: &TaskContext,
        path: &str,
        size: i64,
        overwrite: bool,
        reader: RangeReader,
    ) -> Result<Entry>;

    async fn copy(
        &self,
        _ctx: &TaskContext,
        _from: &Entry,
        _to: &str,
        _overwrite: bool,
    ) -> Result<Entry> {
        Err(DriveError::Unsupported)
    }

    async fn rename(
        &self,
        _ctx: &TaskContext,
        _from: &Entry,
        _to: &str,
        _overwrite: bool,
    ) -> Result<Entry> {
        Err(DriveError::Unsupported)
    }

    async fn delete(&self, ctx: &TaskContext, path: &str) -> Result<()>;

    async fn upload(
        &self,
        _ctx: &TaskContext,
        _path: &str,
        _size: i64,
        _overwrite: bool,
    ) -> Result<UploadConfig> {
        Ok(UploadConfig::local())
    }

    /// Content stream for a file entry. Adapters without range support
    /// answer `unsupported` for partial ranges.
    async fn open_reader(&self, path: &str, range: ByteRange) -> Result<RangeReader>;

    async fn content_url(&self, _path: &str) -> Result<Option<ContentUrl>> {
        Ok(None)
    }
}

/// Fetcher closure for the cache pool, bound to one file on one drive.
pub fn range_reader_fn(drive: Arc<dyn Drive>, path: String) -> RangeReaderFn {
    Arc::new(move |start, length| {
        let drive = drive.clone();
        let path = path.clone();
        Box::pin(async move {
            let range = if start < 0 {
                ByteRange::WHOLE
            } else {
                ByteRange::partial(start, length)
            };
            drive.open_reader(&path, range).await
        })
    })
}

/// Open a pooled random-access reader for a file entry. The cache key
/// carries the modification time, so a changed file gets a fresh
/// cache file.
pub async fn cached_reader(
    pool: &CacheFilePool,
    drive: &Arc<dyn Drive>,
    entry: &Entry,
) -> Result<CacheFileReader> {
    if !entry.is_file() || entry.size < 0 {
        return Err(DriveError::Unsupported);
    }
    let key = format!(
        "{}:{}:{}:{}",
        entry.drive, entry.path, entry.mod_time, entry.size
    );
    pool.get_reader(&key, entry.size, range_reader_fn(drive.clone(), entry.path.clone()))
        .await
}
