//! End-to-end chunked upload: stage chunks, complete, then hand the
//! staged file to a drive's save.

use std::io::Cursor;
use std::sync::Arc;

use libdrive::cache::RangeReader;
use libdrive::drive::Drive;
use libdrive::drive::memory::MemDrive;
use libdrive::error::DriveError;
use libdrive::upload::{ChunkUploader, MIN_CHUNK_SIZE};
use libtask::TaskContext;

const MIB: i64 = 1024 * 1024;

fn chunk(byte: u8, len: i64) -> RangeReader {
    Box::new(Cursor::new(vec![byte; len as usize]))
}

#[tokio::test]
async fn staged_upload_lands_in_the_drive() {
    let dir = tempfile::tempdir().unwrap();
    let uploader = ChunkUploader::new(dir.path());
    let drive = Arc::new(MemDrive::new("m"));
    let ctx = TaskContext::new();

    let size = 15 * MIB;
    let info = uploader.create(size, MIN_CHUNK_SIZE).await.unwrap();
    assert_eq!(info.chunk_count(), 3);

    // Out-of-order staging with a gap.
    uploader.put_chunk(&info.id, 0, chunk(0xa, MIN_CHUNK_SIZE)).await.unwrap();
    uploader.put_chunk(&info.id, 2, chunk(0xc, MIN_CHUNK_SIZE)).await.unwrap();
    match uploader.complete(&ctx, &info.id).await {
        Err(DriveError::NotAllowed(msg)) => assert!(msg.contains("missing")),
        other => panic!("expected missing-chunks error, got {other:?}"),
    }

    uploader.put_chunk(&info.id, 1, chunk(0xb, MIN_CHUNK_SIZE)).await.unwrap();
    let staged = uploader.complete(&ctx, &info.id).await.unwrap();

    let file = tokio::fs::File::open(&staged).await.unwrap();
    let entry = drive
        .save(&ctx, "upload.bin", size, false, Box::new(file))
        .await
        .unwrap();
    assert_eq!(entry.size, size);

    // Spot-check chunk boundaries survived the concatenation.
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    let mut f = tokio::fs::File::open(&staged).await.unwrap();
    let mut b = [0u8; 1];
    for (offset, want) in [
        (0, 0xa),
        (MIN_CHUNK_SIZE - 1, 0xa),
        (MIN_CHUNK_SIZE, 0xb),
        (2 * MIN_CHUNK_SIZE, 0xc),
        (size - 1, 0xc),
    ] {
        f.seek(std::io::SeekFrom::Start(offset as u64)).await.unwrap();
        f.read_exact(&mut b).await.unwrap();
        assert_eq!(b[0], want, "offset {offset}");
    }

    uploader.delete(&info.id).await.unwrap();
    assert!(tokio::fs::metadata(dir.path().join(&info.id)).await.is_err());
}

#[tokio::test]
async fn short_tail_chunk_is_accepted_only_at_the_end() {
    let dir = tempfile::tempdir().unwrap();
    let uploader = ChunkUploader::new(dir.path());
    let ctx = TaskContext::new();

    let size = MIN_CHUNK_SIZE + 3;
    let info = uploader.create(size, MIN_CHUNK_SIZE).await.unwrap();
    assert_eq!(info.chunk_count(), 2);

    assert!(matches!(
        uploader.put_chunk(&info.id, 0, chunk(1, 3)).await,
        Err(DriveError::BadRequest(_))
    ));
    uploader.put_chunk(&info.id, 0, chunk(1, MIN_CHUNK_SIZE)).await.unwrap();
    uploader.put_chunk(&info.id, 1, chunk(2, 3)).await.unwrap();

    let staged = uploader.complete(&ctx, &info.id).await.unwrap();
    let meta = tokio::fs::metadata(&staged).await.unwrap();
    assert_eq!(meta.len() as i64, size);
    let snap = ctx.snapshot();
    assert_eq!(snap.loaded, size);
}

#[tokio::test]
async fn unknown_upload_id_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let uploader = ChunkUploader::new(dir.path());
    let ctx = TaskContext::new();

    // Well-formed id whose directory was never created (e.g. another
    // gateway instance): chunks are rejected as unknown.
    let ghost = uploader.create(10 * MIB, MIN_CHUNK_SIZE).await.unwrap();
    uploader.delete(&ghost.id).await.unwrap();
    assert!(matches!(
        uploader.put_chunk(&ghost.id, 0, chunk(0, MIN_CHUNK_SIZE)).await,
        Err(DriveError::NotFound(_))
    ));
    assert!(matches!(
        uploader.complete(&ctx, &ghost.id).await,
        Err(DriveError::NotFound(_))
    ));
}
