use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::path;

/// Stable identifier of the adapter that owns an entry. Used for
/// equality only; the registry owns adapter lifetimes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriveId(pub String);

impl DriveId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DriveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Dir,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub readable: bool,
    pub writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub props: Option<serde_json::Value>,
}

impl EntryMeta {
    pub fn rw(readable: bool, writable: bool) -> Self {
        Self {
            readable,
            writable,
            thumbnail: None,
            props: None,
        }
    }
}

/// The universal record a drive returns. `path` is normalized and
/// unique within a drive; `size` is `-1` for directories and
/// size-unknown files; `mod_time` is epoch milliseconds or `-1`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryType,
    pub size: i64,
    pub mod_time: i64,
    pub meta: EntryMeta,
    #[serde(skip)]
    pub drive: DriveId,
    /// Opaque envelope the adapter persists in the metadata cache to
    /// recreate this entry from a hit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, String>>,
}

impl Entry {
    pub fn file(drive: DriveId, path: impl Into<String>, size: i64, mod_time: i64) -> Self {
        Self {
            path: path.into(),
            kind: EntryType::File,
            size,
            mod_time,
            meta: EntryMeta::rw(true, true),
            drive,
            data: None,
        }
    }

    pub fn dir(drive: DriveId, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryType::Dir,
            size: -1,
            mod_time: -1,
            meta: EntryMeta::rw(true, true),
            drive,
            data: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryType::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryType::File
    }

    pub fn name(&self) -> &str {
        path::base_name(&self.path)
    }

    /// Same record at a different path, used when adapters map backend
    /// paths back into the composite namespace.
    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.drive == other.drive && self.path == other.path
    }
}
