//! S3-compatible adapter over aws-sdk-s3. Directories are zero-byte
//! `path/` marker keys plus the common prefixes a delimiter listing
//! reports; copies are native `CopyObject` for files.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use std::collections::HashMap;
use tokio::io::AsyncReadExt;
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

use libtask::TaskContext;

use crate::cache::pool::RangeReader;
use crate::drive::{ByteRange, ContentUrl, Drive, DriveCaps, DriveMeta, UploadConfig};
use crate::entry::{DriveId, Entry, EntryType};
use crate::error::{DriveError, Result};
use crate::event::{DriveEvent, EventBus};
use crate::meta::DriveCache;
use crate::path;

#[derive(Clone, Debug)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    /// Multipart part size for large saves.
    pub part_size: usize,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub presign_expiry: Duration,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".into(),
            endpoint: None,
            part_size: 8 * 1024 * 1024,
            max_retries: 3,
            initial_retry_delay_ms: 100,
            presign_expiry: Duration::from_secs(15 * 60),
        }
    }
}

pub struct S3Drive {
    id: DriveId,
    client: Client,
    config: S3Config,
    cache: Option<DriveCache>,
    events: Option<EventBus>,
    ttl: Option<Duration>,
}

fn map_sdk<E>(p: &str, e: SdkError<E>) -> DriveError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &e {
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            if status == 404 {
                return DriveError::NotFound(p.to_string());
            }
            DriveError::remote(status, ctx.err().to_string())
        }
        _ => DriveError::remote(500, e.to_string()),
    }
}

impl S3Drive {
    pub async fn new(id: impl Into<String>, config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(DriveError::BadRequest("bucket must be set".into()));
        }
        let mut loader = aws_config::ConfigLoader::default()
            .credentials_provider(
                aws_config::environment::EnvironmentVariableCredentialsProvider::new(),
            )
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let conf = loader.load().await;
        Ok(Self {
            id: DriveId::new(id),
            client: Client::new(&conf),
            config,
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

    /// Key of a file at `p`. The dir marker is the same key with a
    /// trailing slash.
    fn file_key(p: &str) -> String {
        p.to_string()
    }

    fn dir_key(p: &str) -> String {
        format!("{p}/")
    }

    fn list_prefix(p: &str) -> String {
        if path::is_root(p) {
            String::new()
        } else {
            format!("{p}/")
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

    async fn with_retry<T, F, Fut, E>(&self, op: F, name: &'static str) -> std::result::Result<T, SdkError<E>>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, SdkError<E>>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt <= self.config.max_retries => {
                    warn!(op = name, attempt, error = %e, "s3 request failed, retrying");
                    let delay = self.config.initial_retry_delay_ms * 2u64.pow(attempt - 1);
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn head_file(&self, p: &str) -> Result<Option<Entry>> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(Self::file_key(p))
            .send()
            .await;
        match resp {
            Ok(head) => {
                let size = head.content_length().unwrap_or(-1);
                let mod_time = head
                    .last_modified()
                    .map(|t| t.to_millis().unwrap_or(-1))
                    .unwrap_or(-1);
                Ok(Some(Entry::file(self.id.clone(), p, size, mod_time)))
            }
            Err(e) => match map_sdk(p, e) {
                DriveError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn is_dir(&self, p: &str) -> Result<bool> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.config.bucket)
            .prefix(Self::list_prefix(p))
            .max_keys(1)
            .send()
            .await
            .map_err(|e| map_sdk(p, e))?;
        Ok(resp.key_count().unwrap_or(0) > 0)
    }

    async fn save_multipart(
        &self,
        ctx: &TaskContext,
        key: &str,
        reader: &mut RangeReader,
    ) -> Result<()> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk(key, e))?;
        let upload_id = create.upload_id().unwrap_or_default().to_string();

        let result = self
            .upload_parts(ctx, key, &upload_id, reader)
            .await;
        match result {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.config.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| map_sdk(key, e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.config.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %abort, "failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        ctx: &TaskContext,
        key: &str,
        upload_id: &str,
        reader: &mut RangeReader,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut part_number = 1i32;
        loop {
            DriveError::check_ctx(ctx)?;
            let mut part = Vec::with_capacity(self.config.part_size);
            while part.len() < self.config.part_size {
                let mut buf = vec![0u8; 32 * 1024];
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                part.extend_from_slice(&buf[..n]);
            }
            if part.is_empty() {
                break;
            }
            let len = part.len();
            let last = len < self.config.part_size;
            let resp = self
                .with_retry(
                    || {
                        self.client
                            .upload_part()
                            .bucket(&self.config.bucket)
                            .key(key)
                            .upload_id(upload_id)
                            .part_number(part_number)
                            .body(ByteStream::from(part.clone()))
                            .send()
                    },
                    "upload_part",
                )
                .await
                .map_err(|e| map_sdk(key, e))?;
            ctx.progress(len as i64, false);
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(resp.e_tag().map(|s| s.to_string()))
                    .build(),
            );
            part_number += 1;
            if last {
                break;
            }
        }
        Ok(parts)
    }

    async fn delete_prefix(&self, p: &str) -> Result<()> {
        let prefix = Self::list_prefix(p);
        let mut token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(&prefix);
            if let Some(t) = &token {
                req = req.continuation_token(t);
            }
            let resp = req.send().await.map_err(|e| map_sdk(p, e))?;
            let ids: Vec<ObjectIdentifier> = resp
                .contents()
                .iter()
                .filter_map(|o| o.key())
                .filter_map(|k| ObjectIdentifier::builder().key(k).build().ok())
                .collect();
            if !ids.is_empty() {
                let delete = Delete::builder()
                    .set_objects(Some(ids))
                    .build()
                    .map_err(|e| DriveError::remote(500, e.to_string()))?;
                self.client
                    .delete_objects()
                    .bucket(&self.config.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| map_sdk(p, e))?;
            }
            token = resp.next_continuation_token().map(|t| t.to_string());
            if token.is_none() {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Drive for S3Drive {
    fn id(&self) -> DriveId {
        self.id.clone()
    }

    fn meta(&self) -> DriveMeta {
        DriveMeta { writable: true }
    }

    fn caps(&self) -> DriveCaps {
        DriveCaps::RANGE_READ | DriveCaps::NATIVE_COPY | DriveCaps::CONTENT_URL
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
        let entry = match self.head_file(p).await? {
            Some(entry) => entry,
            None if self.is_dir(p).await? => Entry::dir(self.id.clone(), p),
            None => return Err(DriveError::NotFound(p.to_string())),
        };
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
        let prefix = Self::list_prefix(p);
        let mut entries = Vec::new();
        let mut seen_any = path::is_root(p);
        let mut token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(&prefix)
                .delimiter("/");
            if let Some(t) = &token {
                req = req.continuation_token(t);
            }
            let resp = req.send().await.map_err(|e| map_sdk(p, e))?;
            for cp in resp.common_prefixes() {
                if let Some(name) = cp.prefix().and_then(|s| s.strip_prefix(&prefix)) {
                    let name = name.trim_end_matches('/');
                    if !name.is_empty() {
                        entries.push(Entry::dir(self.id.clone(), path::join(p, name)));
                    }
                    seen_any = true;
                }
            }
            for obj in resp.contents() {
                seen_any = true;
                let Some(key) = obj.key() else { continue };
                let Some(name) = key.strip_prefix(&prefix) else {
                    continue;
                };
                // Skip the directory's own marker.
                if name.is_empty() {
                    continue;
                }
                let mod_time = obj
                    .last_modified()
                    .map(|t| t.to_millis().unwrap_or(-1))
                    .unwrap_or(-1);
                entries.push(Entry::file(
                    self.id.clone(),
                    path::join(p, name),
                    obj.size().unwrap_or(-1),
                    mod_time,
                ));
            }
            token = resp.next_continuation_token().map(|t| t.to_string());
            if token.is_none() {
                break;
            }
        }
        if !seen_any {
            return Err(DriveError::NotFound(p.to_string()));
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        if let Some(cache) = &self.cache {
            cache.put_children(p, &entries, self.ttl);
        }
        Ok(entries)
    }

    async fn make_dir(&self, p: &str) -> Result<Entry> {
        if path::is_root(p) {
            return Ok(Entry::dir(self.id.clone(), ""));
        }
        if self.head_file(p).await?.is_some() {
            return Err(DriveError::NotAllowed(format!("file exists: {p}")));
        }
        // Object stores have no real directories; an empty marker key
        // is enough, and re-putting it is naturally idempotent.
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(Self::dir_key(p))
            .body(ByteStream::from(Vec::new()))
            .send()
            .await
            .map_err(|e| map_sdk(p, e))?;
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
        size: i64,
        overwrite: bool,
        mut reader: RangeReader,
    ) -> Result<Entry> {
        if path::is_root(p) {
            return Err(DriveError::NotAllowed("cannot save to the root".into()));
        }
        if !overwrite && self.head_file(p).await?.is_some() {
            return Err(DriveError::NotAllowed(format!("file exists: {p}")));
        }
        let key = Self::file_key(p);
        if size >= 0 && (size as usize) <= self.config.part_size {
            let mut data = Vec::with_capacity(size as usize);
            reader.read_to_end(&mut data).await?;
            DriveError::check_ctx(ctx)?;
            let len = data.len();
            self.with_retry(
                || {
                    self.client
                        .put_object()
                        .bucket(&self.config.bucket)
                        .key(&key)
                        .body(ByteStream::from(data.clone()))
                        .send()
                },
                "put_object",
            )
            .await
            .map_err(|e| map_sdk(p, e))?;
            ctx.progress(len as i64, false);
        } else {
            self.save_multipart(ctx, &key, &mut reader).await?;
        }
        self.invalidate(p);
        self.publish(DriveEvent::EntryUpdated {
            drive: self.id.clone(),
            path: p.to_string(),
        });
        self.head_file(p)
            .await?
            .ok_or_else(|| DriveError::remote(500, format!("saved object missing: {p}")))
    }

    async fn copy(
        &self,
        ctx: &TaskContext,
        from: &Entry,
        to: &str,
        overwrite: bool,
    ) -> Result<Entry> {
        if from.drive != self.id || from.kind == EntryType::Dir {
            // Directory copies degrade to the stream engine.
            return Err(DriveError::Unsupported);
        }
        DriveError::check_ctx(ctx)?;
        if !overwrite && self.head_file(to).await?.is_some() {
            return Err(DriveError::NotAllowed(format!("destination exists: {to}")));
        }
        self.client
            .copy_object()
            .bucket(&self.config.bucket)
            .copy_source(format!("{}/{}", self.config.bucket, Self::file_key(&from.path)))
            .key(Self::file_key(to))
            .send()
            .await
            .map_err(|e| map_sdk(&from.path, e))?;
        if from.size > 0 {
            ctx.progress(from.size, false);
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
        if from.drive != self.id || from.kind == EntryType::Dir {
            return Err(DriveError::Unsupported);
        }
        let copied = self.copy(ctx, from, to, overwrite).await?;
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(Self::file_key(&from.path))
            .send()
            .await
            .map_err(|e| map_sdk(&from.path, e))?;
        self.invalidate(&from.path);
        self.publish(DriveEvent::EntryDeleted {
            drive: self.id.clone(),
            path: from.path.clone(),
        });
        Ok(copied)
    }

    async fn delete(&self, ctx: &TaskContext, p: &str) -> Result<()> {
        if path::is_root(p) {
            return Err(DriveError::NotAllowed("cannot delete the root".into()));
        }
        DriveError::check_ctx(ctx)?;
        let entry = self.get(p).await?;
        if entry.kind == EntryType::Dir {
            self.delete_prefix(p).await?;
        } else {
            self.client
                .delete_object()
                .bucket(&self.config.bucket)
                .key(Self::file_key(p))
                .send()
                .await
                .map_err(|e| map_sdk(p, e))?;
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
        if !overwrite && self.head_file(p).await?.is_some() {
            return Err(DriveError::NotAllowed(format!("file exists: {p}")));
        }
        // Client bytes land on the gateway's chunk uploader, which
        // saves the staged file through this adapter.
        Ok(UploadConfig::local())
    }

    async fn open_reader(&self, p: &str, range: ByteRange) -> Result<RangeReader> {
        range.validate()?;
        let mut req = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(Self::file_key(p));
        if let Some(header) = range.header_value() {
            debug!(key = %p, range = %header, "ranged s3 read");
            req = req.range(header);
        }
        let resp = req.send().await.map_err(|e| map_sdk(p, e))?;
        Ok(Box::new(resp.body.into_async_read()))
    }

    async fn content_url(&self, p: &str) -> Result<Option<ContentUrl>> {
        let presign = PresigningConfig::expires_in(self.config.presign_expiry)
            .map_err(|e| DriveError::remote(500, e.to_string()))?;
        let req = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(Self::file_key(p))
            .presigned(presign)
            .await
            .map_err(|e| map_sdk(p, e))?;
        Ok(Some(ContentUrl {
            url: req.uri().to_string(),
            proxy: false,
            headers: HashMap::new(),
        }))
    }
}
