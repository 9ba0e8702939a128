//! Session view over a drive: every operation is checked against the
//! permission matrix before it reaches the backend, and listings are
//! filtered down to what the session may see.

use async_trait::async_trait;
use std::sync::Arc;

use libtask::TaskContext;

use crate::cache::pool::RangeReader;
use crate::drive::{ByteRange, ContentUrl, Drive, DriveCaps, DriveMeta, UploadConfig};
use crate::entry::{DriveId, Entry};
use crate::error::{DriveError, Result};
use crate::path;
use crate::perm::{Permission, PermissionResolver, Session};

pub struct AccessDrive {
    inner: Arc<dyn Drive>,
    perms: Arc<PermissionResolver>,
    session: Session,
}

impl AccessDrive {
    pub fn new(inner: Arc<dyn Drive>, perms: Arc<PermissionResolver>, session: Session) -> Self {
        Self {
            inner,
            perms,
            session,
        }
    }

    /// Anonymous sessions are asked to authenticate; identified ones
    /// are refused outright.
    fn denied(&self) -> DriveError {
        if self.session.user.is_none() {
            DriveError::Unauthorized
        } else {
            DriveError::NotAllowed("permission denied".into())
        }
    }

    fn require(&self, p: &str, needed: Permission) -> Result<Permission> {
        let granted = self.perms.resolve_path(&self.session, p);
        if granted.contains(needed) {
            Ok(granted)
        } else {
            Err(self.denied())
        }
    }

    /// A directory stays visible when the session can read it or holds
    /// any grant somewhere below it.
    fn visible(&self, entry: &Entry, granted: Permission) -> bool {
        granted.can_read()
            || (entry.is_dir()
                && !self
                    .perms
                    .resolve_descendant(&self.session, &entry.path)
                    .is_empty())
    }

    fn apply_meta(&self, mut entry: Entry, granted: Permission) -> Entry {
        entry.meta.readable = granted.can_read();
        entry.meta.writable = entry.meta.writable && granted.can_write();
        entry
    }
}

#[async_trait]
impl Drive for AccessDrive {
    fn id(&self) -> DriveId {
        self.inner.id()
    }

    fn meta(&self) -> DriveMeta {
        self.inner.meta()
    }

    fn caps(&self) -> DriveCaps {
        self.inner.caps()
    }

    async fn get(&self, raw: &str) -> Result<Entry> {
        let p = path::clean(raw);
        let granted = self.perms.resolve_path(&self.session, &p);
        let entry = self.inner.get(&p).await?;
        if !self.visible(&entry, granted) {
            return Err(self.denied());
        }
        Ok(self.apply_meta(entry, granted))
    }

    async fn list(&self, raw: &str) -> Result<Vec<Entry>> {
        let p = path::clean(raw);
        let granted = self.perms.resolve_path(&self.session, &p);
        if !granted.can_read()
            && self
                .perms
                .resolve_descendant(&self.session, &p)
                .is_empty()
        {
            return Err(self.denied());
        }
        let entries = self.inner.list(&p).await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                let child = self.perms.resolve_path(&self.session, &e.path);
                if self.visible(&e, child) {
                    Some(self.apply_meta(e, child))
                } else {
                    None
                }
            })
            .collect())
    }

    async fn make_dir(&self, raw: &str) -> Result<Entry> {
        let p = path::clean(raw);
        let granted = self.require(&p, Permission::WRITE)?;
        let entry = self.inner.make_dir(&p).await?;
        Ok(self.apply_meta(entry, granted))
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
        let granted = self.require(&p, Permission::WRITE)?;
        let entry = self.inner.save(ctx, &p, size, overwrite, reader).await?;
        Ok(self.apply_meta(entry, granted))
    }

    async fn copy(
        &self,
        ctx: &TaskContext,
        from: &Entry,
        to: &str,
        overwrite: bool,
    ) -> Result<Entry> {
        let to = path::clean(to);
        self.require(&from.path, Permission::READ)?;
        let granted = self.require(&to, Permission::WRITE)?;
        let entry = self.inner.copy(ctx, from, &to, overwrite).await?;
        Ok(self.apply_meta(entry, granted))
    }

    async fn rename(
        &self,
        ctx: &TaskContext,
        from: &Entry,
        to: &str,
        overwrite: bool,
    ) -> Result<Entry> {
        let to = path::clean(to);
        self.require(&from.path, Permission::WRITE)?;
        let granted = self.require(&to, Permission::WRITE)?;
        let entry = self.inner.rename(ctx, from, &to, overwrite).await?;
        Ok(self.apply_meta(entry, granted))
    }

    async fn delete(&self, ctx: &TaskContext, raw: &str) -> Result<()> {
        let p = path::clean(raw);
        self.require(&p, Permission::WRITE)?;
        self.inner.delete(ctx, &p).await
    }

    async fn upload(
        &self,
        ctx: &TaskContext,
        raw: &str,
        size: i64,
        overwrite: bool,
    ) -> Result<UploadConfig> {
        let p = path::clean(raw);
        self.require(&p, Permission::WRITE)?;
        self.inner.upload(ctx, &p, size, overwrite).await
    }

    async fn open_reader(&self, raw: &str, range: ByteRange) -> Result<RangeReader> {
        let p = path::clean(raw);
        self.require(&p, Permission::READ)?;
        self.inner.open_reader(&p, range).await
    }

    async fn content_url(&self, raw: &str) -> Result<Option<ContentUrl>> {
        let p = path::clean(raw);
        self.require(&p, Permission::READ)?;
        self.inner.content_url(&p).await
    }
}
