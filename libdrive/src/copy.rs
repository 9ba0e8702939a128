//! Copy/move orchestrator: walk an entry tree, report progress,
//! honor cancellation, and copy per node through an injectable hook
//! (native per-step copy or the default stream fallback).

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;

use libtask::TaskContext;

use crate::drive::{ByteRange, Drive};
use crate::entry::Entry;
use crate::error::{DriveError, Result};
use crate::path;

pub struct EntryNode {
    pub entry: Entry,
    pub children: Vec<EntryNode>,
}

/// Recursively collect the tree under `root`. With `byte_progress`,
/// `ctx.total` accumulates file sizes; otherwise it counts entries.
pub async fn build_entries_tree(
    drive: &Arc<dyn Drive>,
    root: Entry,
    ctx: &TaskContext,
    byte_progress: bool,
) -> Result<EntryNode> {
    build_node(drive, root, ctx, byte_progress).await
}

fn build_node<'a>(
    drive: &'a Arc<dyn Drive>,
    entry: Entry,
    ctx: &'a TaskContext,
    byte_progress: bool,
) -> BoxFuture<'a, Result<EntryNode>> {
    async move {
        DriveError::check_ctx(ctx)?;
        if byte_progress {
            if entry.is_file() && entry.size > 0 {
                ctx.total(entry.size, false);
            }
        } else {
            ctx.total(1, false);
        }
        let mut children = Vec::new();
        if entry.is_dir() {
            for child in drive.list(&entry.path).await? {
                children.push(build_node(drive, child, ctx, byte_progress).await?);
            }
        }
        Ok(EntryNode { entry, children })
    }
    .boxed()
}

/// Per-node behavior of a tree copy. `after` runs post-order and sees
/// whether the node and all of its children were processed; a move
/// hook deletes fully-processed sources there.
#[async_trait]
pub trait CopyHooks: Send + Sync {
    async fn do_copy(
        &self,
        src: &Entry,
        dest: &Arc<dyn Drive>,
        dest_path: &str,
        ctx: &TaskContext,
    ) -> Result<()>;

    async fn after(&self, _entry: &Entry, _all_processed: bool, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }
}

/// Walk `node` and copy it under `dest_path` on `dest`. Returns
/// whether every entry was processed; existing files skipped because
/// `overwrite` is off surface as `false` (partial success).
pub async fn copy_all(
    node: &EntryNode,
    dest: &Arc<dyn Drive>,
    dest_path: &str,
    overwrite: bool,
    ctx: &TaskContext,
    hooks: &dyn CopyHooks,
) -> Result<bool> {
    copy_node(node, dest, dest_path.to_string(), overwrite, ctx, hooks).await
}

fn copy_node<'a>(
    node: &'a EntryNode,
    dest: &'a Arc<dyn Drive>,
    dest_path: String,
    overwrite: bool,
    ctx: &'a TaskContext,
    hooks: &'a dyn CopyHooks,
) -> BoxFuture<'a, Result<bool>> {
    async move {
        DriveError::check_ctx(ctx)?;
        let existing = match dest.get(&dest_path).await {
            Ok(e) => Some(e),
            Err(DriveError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let mut processed = true;
        if node.entry.is_dir() {
            match &existing {
                Some(e) if e.is_file() => {
                    return Err(DriveError::NotAllowed(format!(
                        "destination is a file: {dest_path}"
                    )));
                }
                Some(_) => {}
                None => {
                    dest.make_dir(&dest_path).await?;
                }
            }
            for child in &node.children {
                let child_dest = path::join(&dest_path, child.entry.name());
                processed &= copy_node(child, dest, child_dest, overwrite, ctx, hooks).await?;
            }
        } else {
            match &existing {
                Some(e) if e.is_dir() => {
                    return Err(DriveError::NotAllowed(format!(
                        "destination is a directory: {dest_path}"
                    )));
                }
                Some(_) if !overwrite => {
                    processed = false;
                }
                _ => {
                    hooks.do_copy(&node.entry, dest, &dest_path, ctx).await?;
                }
            }
        }
        hooks.after(&node.entry, processed, ctx).await?;
        Ok(processed)
    }
    .boxed()
}

/// Default cross-drive hook: stream the source reader into the
/// destination's `save`. Adapters report byte progress from their
/// write loops.
pub struct StreamCopy {
    pub src: Arc<dyn Drive>,
}

#[async_trait]
impl CopyHooks for StreamCopy {
    async fn do_copy(
        &self,
        src: &Entry,
        dest: &Arc<dyn Drive>,
        dest_path: &str,
        ctx: &TaskContext,
    ) -> Result<()> {
        let reader = self
            .src
            .open_reader(&src.path, ByteRange::WHOLE)
            .await
            .map_err(|e| match e {
                DriveError::Unsupported => {
                    DriveError::NotAllowed(format!("source refuses a reader: {}", src.path))
                }
                other => other,
            })?;
        dest.save(ctx, dest_path, src.size, true, reader).await?;
        Ok(())
    }
}

/// Move hook: stream copy, then delete fully-processed sources
/// post-order.
pub struct StreamMove {
    pub src: Arc<dyn Drive>,
}

#[async_trait]
impl CopyHooks for StreamMove {
    async fn do_copy(
        &self,
        src: &Entry,
        dest: &Arc<dyn Drive>,
        dest_path: &str,
        ctx: &TaskContext,
    ) -> Result<()> {
        StreamCopy {
            src: self.src.clone(),
        }
        .do_copy(src, dest, dest_path, ctx)
        .await
    }

    async fn after(&self, entry: &Entry, all_processed: bool, ctx: &TaskContext) -> Result<()> {
        if all_processed {
            self.src.delete(ctx, &entry.path).await?;
        }
        Ok(())
    }
}

/// Stream-copy (or move) the whole tree at `src_entry` to `dest_path`
/// on another drive. Returns whether everything was processed.
pub async fn copy_entries(
    src_drive: &Arc<dyn Drive>,
    src_entry: Entry,
    dest_drive: &Arc<dyn Drive>,
    dest_path: &str,
    overwrite: bool,
    delete_source: bool,
    ctx: &TaskContext,
) -> Result<bool> {
    let tree = build_entries_tree(src_drive, src_entry, ctx, true).await?;
    if delete_source {
        let hooks = StreamMove {
            src: src_drive.clone(),
        };
        copy_all(&tree, dest_drive, dest_path, overwrite, ctx, &hooks).await
    } else {
        let hooks = StreamCopy {
            src: src_drive.clone(),
        };
        copy_all(&tree, dest_drive, dest_path, overwrite, ctx, &hooks).await
    }
}
