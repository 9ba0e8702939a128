pub mod cache;
pub mod config;
pub mod copy;
pub mod drive;
pub mod entry;
pub mod error;
pub mod event;
pub mod meta;
pub mod path;
pub mod perm;
pub mod registry;
pub mod tree;
pub mod upload;

pub use entry::{DriveId, Entry, EntryMeta, EntryType};
pub use error::{DriveError, Result};
