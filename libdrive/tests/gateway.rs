//! Whole-gateway wiring: registry-built components serving a mounted,
//! permission-checked tree with pooled content reads.

use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use libdrive::config::{CacheConfig, GatewayConfig, StagingConfig};
use libdrive::drive::local::LocalDrive;
use libdrive::drive::memory::MemDrive;
use libdrive::drive::mounted::Mount;
use libdrive::drive::{Drive, cached_reader};
use libdrive::entry::{DriveId, Entry, EntryType};
use libdrive::error::DriveError;
use libdrive::event::DriveEvent;
use libdrive::meta::EntryDecoder;
use libdrive::perm::{PathPermission, Permission, Policy, Session, Subject};
use libdrive::registry::Registry;
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

fn decoder(id: &str) -> EntryDecoder {
    let id = DriveId::new(id);
    Arc::new(move |item| {
        let mut e = match item.kind {
            EntryType::File => Entry::file(id.clone(), item.path.clone(), item.size, item.mod_time),
            EntryType::Dir => Entry::dir(id.clone(), item.path.clone()),
        };
        e.data = item.data.clone();
        e
    })
}

#[tokio::test]
async fn mounted_local_drive_reads_through_the_pool() {
    let base = tempfile::tempdir().unwrap();
    let registry = Registry::new(test_config(base.path())).await.unwrap();

    let local_root = base.path().join("drive");
    tokio::fs::create_dir_all(&local_root).await.unwrap();
    tokio::fs::write(local_root.join("big.bin"), vec![7u8; 4096])
        .await
        .unwrap();
    let local = Arc::new(
        LocalDrive::new("disk", &local_root)
            .await
            .unwrap()
            .with_cache(
                registry.drive_cache("disk", decoder("disk")),
                registry.config().meta.ttl(),
            )
            .with_events(registry.events().clone()),
    );
    registry.root().add_drive("disk", local.clone()).unwrap();

    let root: Arc<dyn Drive> = registry.root().clone();
    let entry = root.get("disk/big.bin").await.unwrap();
    assert_eq!(entry.size, 4096);

    // Random access through the cache pool, backed by ranged reads.
    let mut reader = cached_reader(registry.pool(), &root, &entry).await.unwrap();
    reader.seek(std::io::SeekFrom::Start(1000)).await.unwrap();
    let mut buf = [0u8; 96];
    reader.read_exact(&mut buf).await.unwrap();
    assert!(buf.iter().all(|&b| b == 7));

    // A second open of the same entry hits the pooled file.
    let mut again = cached_reader(registry.pool(), &root, &entry).await.unwrap();
    let mut all = Vec::new();
    again.read_to_end(&mut all).await.unwrap();
    assert_eq!(all.len(), 4096);

    registry.shutdown().await;
}

#[tokio::test]
async fn mounts_and_permissions_compose() {
    let base = tempfile::tempdir().unwrap();
    let registry = Registry::new(test_config(base.path())).await.unwrap();

    let mem = Arc::new(MemDrive::new("m"));
    mem.make_dir("home").await.unwrap();
    mem.make_dir("home/shared").await.unwrap();
    mem.make_dir("home/private").await.unwrap();
    {
        let ctx = TaskContext::new();
        mem.save(&ctx, "home/shared/readme", 5, true, Box::new(Cursor::new(b"hello".to_vec())))
            .await
            .unwrap();
    }
    registry
        .root()
        .set_mounts(vec![Mount::new("files", mem.clone(), "home")])
        .unwrap();
    registry.reload_permissions(vec![
        PathPermission::new("files", Subject::Any, Permission::READ, Policy::Accept),
        PathPermission::new("files/private", Subject::Any, Permission::READ, Policy::Reject),
        PathPermission::new(
            "files/shared",
            Subject::Group("staff".into()),
            Permission::WRITE,
            Policy::Accept,
        ),
    ]);

    let guest = registry.for_session(Session::user("guest"));
    let names: Vec<String> = guest
        .list("files")
        .await
        .unwrap()
        .iter()
        .map(|e| e.path.clone())
        .collect();
    assert_eq!(names, vec!["files/shared"]);
    assert!(matches!(
        guest.make_dir("files/shared/new").await,
        Err(DriveError::NotAllowed(_))
    ));

    let staff = registry.for_session(Session::user("eve").with_groups(vec!["staff".into()]));
    staff.make_dir("files/shared/new").await.unwrap();
    assert_eq!(guest.get("files/shared/readme").await.unwrap().size, 5);

    registry.shutdown().await;
}

#[tokio::test]
async fn mutations_publish_events_and_invalidate_metadata() {
    let base = tempfile::tempdir().unwrap();
    let registry = Registry::new(test_config(base.path())).await.unwrap();
    let mut events = registry.events().subscribe();

    let mem = Arc::new(
        MemDrive::new("m")
            .with_cache(
                registry.drive_cache("m", decoder("m")),
                registry.config().meta.ttl(),
            )
            .with_events(registry.events().clone()),
    );
    registry.root().add_drive("m", mem.clone()).unwrap();
    let root: Arc<dyn Drive> = registry.root().clone();

    root.make_dir("m/d").await.unwrap();
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, DriveEvent::EntryUpdated { ref path, .. } if path == "d"));

    // Listing is cached, then invalidated by the delete.
    assert_eq!(root.list("m/d").await.unwrap().len(), 0);
    let ctx = TaskContext::new();
    mem.save(&ctx, "d/f", 1, true, Box::new(Cursor::new(b"x".to_vec())))
        .await
        .unwrap();
    assert_eq!(root.list("m/d").await.unwrap().len(), 1);

    let f = root.get("m/d/f").await.unwrap();
    root.delete(&ctx, &f.path).await.unwrap();
    assert!(matches!(root.get("m/d/f").await, Err(DriveError::NotFound(_))));
    assert_eq!(root.list("m/d").await.unwrap().len(), 0);

    registry.shutdown().await;
}
