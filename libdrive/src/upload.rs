//! Resumable chunked uploads staged on local disk. The upload id
//! encodes the byte sizes, so a restarted gateway can keep serving an
//! id it has never seen: everything it needs is the id and the staging
//! directory.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use libtask::TaskContext;

use crate::cache::pool::RangeReader;
use crate::error::{DriveError, Result};

pub const MIN_CHUNK_SIZE: i64 = 5 * 1024 * 1024;

const DELETED_MARKER: &str = "deleted";
const CONTENT_FILE: &str = "content";
const COPY_BUF: usize = 32 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadInfo {
    pub id: String,
    pub size: i64,
    pub chunk_size: i64,
}

impl UploadInfo {
    pub fn chunk_count(&self) -> i64 {
        (self.size + self.chunk_size - 1) / self.chunk_size
    }

    /// Expected length of chunk `seq`; the last chunk is short.
    pub fn expected_len(&self, seq: i64) -> i64 {
        if seq == self.chunk_count() - 1 {
            self.size - seq * self.chunk_size
        } else {
            self.chunk_size
        }
    }
}

pub struct ChunkUploader {
    dir: PathBuf,
    /// Upload dirs currently held by an operation; `delete` defers to
    /// the last holder.
    holds: Mutex<HashMap<String, usize>>,
}

impl ChunkUploader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            holds: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(&self, size: i64, chunk_size: i64) -> Result<UploadInfo> {
        if size <= 0 {
            return Err(DriveError::BadRequest(format!("invalid upload size: {size}")));
        }
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(DriveError::BadRequest(format!(
                "chunk size below minimum: {chunk_size} < {MIN_CHUNK_SIZE}"
            )));
        }
        let encoded = URL_SAFE_NO_PAD.encode(format!("{size}:{chunk_size}"));
        let id = format!("{}.{}", encoded, Uuid::new_v4().simple());
        fs::create_dir_all(self.dir.join(&id)).await?;
        debug!(id = %id, size, chunk_size, "upload created");
        Ok(UploadInfo {
            id,
            size,
            chunk_size,
        })
    }

    /// Recover the sizes baked into an id. Ids come from clients, so
    /// anything malformed is a bad request, not a panic.
    pub fn parse(&self, id: &str) -> Result<UploadInfo> {
        let invalid = || DriveError::BadRequest(format!("invalid upload id: {id}"));
        if id.contains('/') || id.contains("..") {
            return Err(invalid());
        }
        let (encoded, _uuid) = id.split_once('.').ok_or_else(invalid)?;
        let decoded = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| invalid())?;
        let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;
        let (size, chunk_size) = decoded.split_once(':').ok_or_else(invalid)?;
        let size: i64 = size.parse().map_err(|_| invalid())?;
        let chunk_size: i64 = chunk_size.parse().map_err(|_| invalid())?;
        if size <= 0 || chunk_size < MIN_CHUNK_SIZE {
            return Err(invalid());
        }
        Ok(UploadInfo {
            id: id.to_string(),
            size,
            chunk_size,
        })
    }

    pub async fn put_chunk(&self, id: &str, seq: i64, reader: RangeReader) -> Result<()> {
        let info = self.parse(id)?;
        self.hold(id);
        let res = self.put_chunk_inner(&info, seq, reader).await;
        self.release(id).await;
        res
    }

    async fn put_chunk_inner(&self, info: &UploadInfo, seq: i64, mut reader: RangeReader) -> Result<()> {
        if seq < 0 || seq >= info.chunk_count() {
            return Err(DriveError::BadRequest(format!("chunk out of range: {seq}")));
        }
        let dir = self.dir.join(&info.id);
        self.check_live(&dir, &info.id).await?;
        let expected = info.expected_len(seq);
        let chunk_path = dir.join(seq.to_string());
        let mut file = fs::File::create(&chunk_path).await?;
        let mut written: i64 = 0;
        let mut buf = vec![0u8; COPY_BUF];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            written += n as i64;
            if written > expected {
                break;
            }
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        drop(file);
        if written != expected {
            let _ = fs::remove_file(&chunk_path).await;
            return Err(DriveError::BadRequest(format!(
                "chunk {seq} length mismatch: got {written}, want {expected}"
            )));
        }
        Ok(())
    }

    /// Verify every chunk is staged and concatenate them into the
    /// `content` file, reporting byte progress. The returned path is
    /// handed to the target adapter's `save`.
    pub async fn complete(&self, ctx: &TaskContext, id: &str) -> Result<PathBuf> {
        let info = self.parse(id)?;
        self.hold(id);
        let res = self.complete_inner(ctx, &info).await;
        self.release(id).await;
        res
    }

    async fn complete_inner(&self, ctx: &TaskContext, info: &UploadInfo) -> Result<PathBuf> {
        let dir = self.dir.join(&info.id);
        self.check_live(&dir, &info.id).await?;
        let mut missing = Vec::new();
        for seq in 0..info.chunk_count() {
            let p = dir.join(seq.to_string());
            match fs::metadata(&p).await {
                Ok(m) if m.len() as i64 == info.expected_len(seq) => {}
                _ => missing.push(seq),
            }
        }
        if !missing.is_empty() {
            return Err(DriveError::NotAllowed(format!("missing chunks: {missing:?}")));
        }
        ctx.total(info.size, true);
        let content_path = dir.join(CONTENT_FILE);
        let mut out = fs::File::create(&content_path).await?;
        let mut buf = vec![0u8; COPY_BUF];
        for seq in 0..info.chunk_count() {
            let mut chunk = fs::File::open(dir.join(seq.to_string())).await?;
            loop {
                DriveError::check_ctx(ctx)?;
                let n = chunk.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
                ctx.progress(n as i64, false);
            }
        }
        out.flush().await?;
        Ok(content_path)
    }

    /// Best-effort removal. While another operation holds the upload
    /// dir, only a marker is written; the last holder finishes the
    /// removal on release.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let info = self.parse(id)?;
        let dir = self.dir.join(&info.id);
        let held = {
            let holds = self.holds.lock().unwrap();
            holds.get(&info.id).copied().unwrap_or(0) > 0
        };
        if held {
            fs::write(dir.join(DELETED_MARKER), b"").await?;
            debug!(id = %info.id, "upload delete deferred to holder");
            return Ok(());
        }
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn check_live(&self, dir: &std::path::Path, id: &str) -> Result<()> {
        match fs::metadata(dir).await {
            Ok(_) => {}
            Err(_) => return Err(DriveError::NotFound(format!("upload: {id}"))),
        }
        if fs::metadata(dir.join(DELETED_MARKER)).await.is_ok() {
            return Err(DriveError::NotFound(format!("upload: {id}")));
        }
        Ok(())
    }

    fn hold(&self, id: &str) {
        *self.holds.lock().unwrap().entry(id.to_string()).or_insert(0) += 1;
    }

    async fn release(&self, id: &str) {
        let last = {
            let mut holds = self.holds.lock().unwrap();
            if let Some(n) = holds.get_mut(id) {
                *n -= 1;
                if *n == 0 {
                    holds.remove(id);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if !last {
            return;
        }
        let dir = self.dir.join(id);
        if fs::metadata(dir.join(DELETED_MARKER)).await.is_ok() {
            if let Err(e) = fs::remove_dir_all(&dir).await {
                warn!(id, error = %e, "deferred upload removal failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(data: Vec<u8>) -> RangeReader {
        Box::new(Cursor::new(data))
    }

    #[tokio::test]
    async fn create_validates_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let up = ChunkUploader::new(dir.path());
        assert!(matches!(
            up.create(0, MIN_CHUNK_SIZE).await,
            Err(DriveError::BadRequest(_))
        ));
        assert!(matches!(
            up.create(100, MIN_CHUNK_SIZE - 1).await,
            Err(DriveError::BadRequest(_))
        ));
        let info = up.create(100, MIN_CHUNK_SIZE).await.unwrap();
        assert_eq!(info.chunk_count(), 1);
        assert_eq!(info.expected_len(0), 100);
    }

    #[tokio::test]
    async fn id_round_trips_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let up = ChunkUploader::new(dir.path());
        let info = up.create(15 * 1024 * 1024, MIN_CHUNK_SIZE).await.unwrap();
        let parsed = up.parse(&info.id).unwrap();
        assert_eq!(parsed, info);
        assert!(up.parse("garbage").is_err());
        assert!(up.parse("../escape.id").is_err());
    }

    #[tokio::test]
    async fn chunk_length_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let up = ChunkUploader::new(dir.path());
        let size = MIN_CHUNK_SIZE + 10;
        let info = up.create(size, MIN_CHUNK_SIZE).await.unwrap();
        // Chunk 0 must be exactly chunk_size.
        let res = up.put_chunk(&info.id, 0, reader(vec![1u8; 100])).await;
        assert!(matches!(res, Err(DriveError::BadRequest(_))));
        // The short tail is only valid for the last chunk.
        up.put_chunk(&info.id, 1, reader(vec![2u8; 10])).await.unwrap();
        assert!(matches!(
            up.put_chunk(&info.id, 2, reader(vec![0u8; 1])).await,
            Err(DriveError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn complete_requires_all_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let up = ChunkUploader::new(dir.path());
        let chunk = MIN_CHUNK_SIZE as usize;
        let size = 2 * MIN_CHUNK_SIZE + 5;
        let info = up.create(size, MIN_CHUNK_SIZE).await.unwrap();
        let ctx = TaskContext::new();

        up.put_chunk(&info.id, 0, reader(vec![0u8; chunk])).await.unwrap();
        up.put_chunk(&info.id, 2, reader(vec![2u8; 5])).await.unwrap();
        match up.complete(&ctx, &info.id).await {
            Err(DriveError::NotAllowed(msg)) => assert!(msg.contains("missing")),
            other => panic!("expected missing chunks, got {other:?}"),
        }

        up.put_chunk(&info.id, 1, reader(vec![1u8; chunk])).await.unwrap();
        let staged = up.complete(&ctx, &info.id).await.unwrap();
        let meta = fs::metadata(&staged).await.unwrap();
        assert_eq!(meta.len() as i64, size);
        let snap = ctx.snapshot();
        assert_eq!(snap.loaded, size);
        assert_eq!(snap.total, size);
    }

    #[tokio::test]
    async fn reuploading_a_chunk_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let up = ChunkUploader::new(dir.path());
        let info = up.create(10, MIN_CHUNK_SIZE).await.unwrap();
        up.put_chunk(&info.id, 0, reader(vec![1u8; 10])).await.unwrap();
        up.put_chunk(&info.id, 0, reader(vec![9u8; 10])).await.unwrap();
        let ctx = TaskContext::new();
        let staged = up.complete(&ctx, &info.id).await.unwrap();
        assert_eq!(fs::read(&staged).await.unwrap(), vec![9u8; 10]);
    }

    #[tokio::test]
    async fn delete_defers_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let up = ChunkUploader::new(dir.path());
        let info = up.create(10, MIN_CHUNK_SIZE).await.unwrap();
        up.put_chunk(&info.id, 0, reader(vec![1u8; 10])).await.unwrap();

        up.hold(&info.id);
        up.delete(&info.id).await.unwrap();
        // Held: the dir survives, but the upload reads as gone.
        assert!(fs::metadata(dir.path().join(&info.id)).await.is_ok());
        let ctx = TaskContext::new();
        assert!(matches!(
            up.complete(&ctx, &info.id).await,
            Err(DriveError::NotFound(_))
        ));
        up.release(&info.id).await;
        assert!(fs::metadata(dir.path().join(&info.id)).await.is_err());

        // Unheld delete removes immediately and is idempotent.
        up.delete(&info.id).await.unwrap();
    }
}
