// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use bitvec::prelude::BitVec;
use serde::{Deserialize, Serialize};

/// Deleted row ordinals of one segment, stamped with the major version that produced them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelVector {
    version: u64,
    deletes: Vec<u32>,
}

impl DelVector {
    pub fn init(version: u64, deletes: &[u32]) -> Self {
        let mut deletes = deletes.to_vec();
        deletes.sort_unstable();
        deletes.dedup();
        Self { version, deletes }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of deleted rows.
    pub fn cardinality(&self) -> usize {
        self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty()
    }

    pub fn contains(&self, ordinal: u32) -> bool {
        self.deletes.binary_search(&ordinal).is_ok()
    }

    pub fn deletes(&self) -> &[u32] {
        &self.deletes
    }

    /// Derive a new vector holding the union of `self` and `dels`.
    ///
    /// An ordinal that is already deleted does not increase the cardinality, so callers
    /// can detect double deletes by comparing cardinalities.
    pub fn add_dels_as_new_version(&self, dels: &[u32], version: u64) -> DelVector {
        let mut added = dels.to_vec();
        added.sort_unstable();
        added.dedup();

        let mut deletes = Vec::with_capacity(self.deletes.len() + added.len());
        let (mut i, mut j) = (0, 0);
        while i < self.deletes.len() && j < added.len() {
            match self.deletes[i].cmp(&added[j]) {
                std::cmp::Ordering::Less => {
                    deletes.push(self.deletes[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    deletes.push(added[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    deletes.push(added[j]);
                    i += 1;
                    j += 1;
                }
            }
        }
        deletes.extend_from_slice(&self.deletes[i..]);
        deletes.extend_from_slice(&added[j..]);
        DelVector { version, deletes }
    }

    /// Apply the current DV info to a visibility bitmap
    pub fn apply_to(&self, data: &mut BitVec, offset_row_id: u32) {
        let pos = self.deletes.partition_point(|x| *x < offset_row_id);
        let end = offset_row_id as u64 + data.len() as u64;
        for row_id in self.deletes[pos..].iter().take_while(|x| (**x as u64) < end) {
            data.set((*row_id - offset_row_id) as usize, false);
        }
    }
}
