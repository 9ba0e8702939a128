//! The lifecycle owner: builds the gateway components in dependency
//! order at startup, hands out handles, and shuts everything down in
//! reverse.

use std::sync::Arc;
use tokio::fs;
use tracing::info;

use libtask::TaskRunner;

use crate::cache::pool::CacheFilePool;
use crate::config::GatewayConfig;
use crate::drive::Drive;
use crate::drive::access::AccessDrive;
use crate::drive::mounted::MountedDrive;
use crate::error::Result;
use crate::event::EventBus;
use crate::meta::{DriveCache, EntryDecoder, MetaCache};
use crate::perm::{PathPermission, PermissionResolver, Session};
use crate::upload::ChunkUploader;

pub struct Registry {
    config: GatewayConfig,
    events: EventBus,
    meta: MetaCache,
    pool: Arc<CacheFilePool>,
    perms: Arc<PermissionResolver>,
    tasks: TaskRunner,
    uploader: Arc<ChunkUploader>,
    root: Arc<MountedDrive>,
}

impl Registry {
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        fs::create_dir_all(&config.cache.dir).await?;
        fs::create_dir_all(&config.staging.dir).await?;

        let events = EventBus::new(config.event_capacity);
        let meta = MetaCache::new(tokio::time::Duration::from_secs(
            config.meta.clean_interval_secs,
        ));
        let pool = Arc::new(
            CacheFilePool::with_block_size(
                config.cache.entries,
                config.cache.dir.clone(),
                config.cache.block_size,
            )
            .await?,
        );
        let perms = Arc::new(PermissionResolver::new(
            Vec::new(),
            config.admin_group.as_str(),
        ));
        let tasks = TaskRunner::new(config.tasks.runner_config());
        let uploader = Arc::new(ChunkUploader::new(config.staging.dir.clone()));
        let root = Arc::new(MountedDrive::new(config.root_drive.as_str()));

        info!(root = %config.root_drive, "gateway registry started");
        Ok(Self {
            config,
            events,
            meta,
            pool,
            perms,
            tasks,
            uploader,
            root,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Bind a drive's namespace on the shared metadata cache.
    pub fn drive_cache(&self, ns: impl Into<String>, decode: EntryDecoder) -> DriveCache {
        self.meta.namespace(ns, decode)
    }

    pub fn pool(&self) -> &Arc<CacheFilePool> {
        &self.pool
    }

    pub fn permissions(&self) -> &Arc<PermissionResolver> {
        &self.perms
    }

    pub fn reload_permissions(&self, records: Vec<PathPermission>) {
        self.perms.reload(records);
    }

    pub fn tasks(&self) -> &TaskRunner {
        &self.tasks
    }

    pub fn uploader(&self) -> &Arc<ChunkUploader> {
        &self.uploader
    }

    /// The composite root drive: mount table management and the
    /// unpermissioned dispatch surface.
    pub fn root(&self) -> &Arc<MountedDrive> {
        &self.root
    }

    /// Permission-checked view of the composite tree for one session.
    pub fn for_session(&self, session: Session) -> AccessDrive {
        let inner: Arc<dyn Drive> = self.root.clone();
        AccessDrive::new(inner, self.perms.clone(), session)
    }

    /// Reverse construction order: stop accepting tasks, tear down the
    /// cache pool (blocked readers fail promptly), stop the metadata
    /// cleaner.
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        self.pool.clear().await;
        self.meta.shutdown();
        info!("gateway registry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, StagingConfig};
    use crate::drive::memory::MemDrive;
    use crate::perm::{Permission, Policy, Subject};
    use libtask::TaskContext;

    fn test_config(base: &std::path::Path) -> GatewayConfig {
        GatewayConfig {
            cache: CacheConfig {
                dir: base.join("cache"),
                ..CacheConfig::default()
            },
            staging: StagingConfig {
                dir: base.join("uploads"),
            },
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn builds_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path())).await.unwrap();
        assert!(dir.path().join("cache").is_dir());
        assert!(dir.path().join("uploads").is_dir());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn session_view_enforces_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path())).await.unwrap();
        let mem = Arc::new(MemDrive::new("m"));
        registry.root().add_drive("m", mem).unwrap();
        registry.reload_permissions(vec![PathPermission::new(
            "m",
            Subject::User("alice".into()),
            Permission::full(),
            Policy::Accept,
        )]);

        let alice = registry.for_session(Session::user("alice"));
        alice.make_dir("m/docs").await.unwrap();

        let bob = registry.for_session(Session::user("bob"));
        assert!(bob.make_dir("m/other").await.is_err());

        let admin = registry.for_session(
            Session::user("root").with_groups(vec!["admin".into()]),
        );
        admin.make_dir("m/admin-made").await.unwrap();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn task_runner_is_wired() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path())).await.unwrap();
        let task = registry
            .tasks()
            .execute_and_wait(
                libtask::TaskOptions::new("noop", "test"),
                |_ctx: TaskContext| async { Ok(serde_json::json!({"ok": true})) },
                tokio::time::Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(task.status, libtask::TaskStatus::Done);
        registry.shutdown().await;
    }
}
