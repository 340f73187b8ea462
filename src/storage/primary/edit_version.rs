// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Version lineage of a tablet.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Id of a rowset inside one tablet. Segment `i` of rowset `r` is addressed by the
/// rowset-segment id `r + i`.
pub type RowsetId = u32;

/// A `(major, minor)` version. `minor == 0` is a visible load version, `minor > 0` a
/// compaction output stacked on top of `major`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EditVersion {
    pub major: u64,
    pub minor: u32,
}

impl EditVersion {
    pub const fn new(major: u64, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for EditVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Describes one compaction: where it started, what it consumed and what it produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionInfo {
    pub start_version: EditVersion,
    pub inputs: Vec<RowsetId>,
    pub output: RowsetId,
}

/// One entry of the in-memory version log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditVersionInfo {
    pub version: EditVersion,
    /// Seconds since the unix epoch.
    pub creation_time: i64,
    /// Full rowset membership at this version.
    pub rowsets: Vec<RowsetId>,
    /// Rowsets added by a load commit. Empty for compactions.
    pub deltas: Vec<RowsetId>,
    pub compaction: Option<CompactionInfo>,
}

/// Persisted form of an [`EditVersionInfo`].
///
/// Either `rowsets` holds the full membership, or `rowsets_add`/`rowsets_del` describe
/// the change from the previous entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditVersionMeta {
    pub version: EditVersion,
    pub creation_time: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rowsets: Vec<RowsetId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rowsets_add: Vec<RowsetId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rowsets_del: Vec<RowsetId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deltas: Vec<RowsetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionInfo>,
    /// How far this edit advances the rowset id allocator.
    #[serde(default)]
    pub rowsetid_add: u32,
}

impl EditVersionMeta {
    pub fn is_incremental(&self) -> bool {
        !self.rowsets_add.is_empty() || !self.rowsets_del.is_empty()
    }

    /// Rebuild the full version entry given the membership of the previous entry.
    pub fn redo(&self, last_rowsets: Option<&[RowsetId]>) -> EditVersionInfo {
        let rowsets = if self.is_incremental() {
            modify(
                last_rowsets.unwrap_or_default(),
                &self.rowsets_add,
                &self.rowsets_del,
            )
        } else {
            self.rowsets.clone()
        };
        EditVersionInfo {
            version: self.version,
            creation_time: self.creation_time,
            rowsets,
            deltas: self.deltas.clone(),
            compaction: self.compaction.clone(),
        }
    }
}

impl From<&EditVersionInfo> for EditVersionMeta {
    /// Full snapshot form, used when the log is compacted into the updates meta.
    fn from(info: &EditVersionInfo) -> Self {
        Self {
            version: info.version,
            creation_time: info.creation_time,
            rowsets: info.rowsets.clone(),
            rowsets_add: vec![],
            rowsets_del: vec![],
            deltas: info.deltas.clone(),
            compaction: info.compaction.clone(),
            rowsetid_add: 0,
        }
    }
}

/// Remove `del` from `base` and append `add`, keeping the relative order of survivors.
pub fn modify(base: &[RowsetId], add: &[RowsetId], del: &[RowsetId]) -> Vec<RowsetId> {
    base.iter()
        .filter(|id| !del.contains(id))
        .chain(add.iter())
        .copied()
        .collect()
}

/// Current unix time in seconds.
pub fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Current unix time in milliseconds.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_order() {
        assert!(EditVersion::new(2, 0) < EditVersion::new(2, 1));
        assert!(EditVersion::new(2, 5) < EditVersion::new(3, 0));
        assert_eq!(EditVersion::new(7, 2).to_string(), "7.2");
    }

    #[test]
    fn test_redo_incremental() {
        let edit = EditVersionMeta {
            version: EditVersion::new(5, 1),
            rowsets_add: vec![9],
            rowsets_del: vec![2, 4],
            compaction: Some(CompactionInfo {
                start_version: EditVersion::new(5, 0),
                inputs: vec![2, 4],
                output: 9,
            }),
            rowsetid_add: 1,
            ..Default::default()
        };
        let info = edit.redo(Some(&[1, 2, 3, 4]));
        assert_eq!(info.rowsets, vec![1, 3, 9]);
        assert!(info.deltas.is_empty());
        assert_eq!(info.compaction.unwrap().output, 9);

        let full = EditVersionMeta {
            version: EditVersion::new(2, 0),
            rowsets: vec![1, 2],
            deltas: vec![2],
            ..Default::default()
        };
        assert_eq!(full.redo(Some(&[1])).rowsets, vec![1, 2]);
    }
}
