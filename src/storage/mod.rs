// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Storage of primary-key tablets.
//!
//! A tablet is a versioned set of rowsets. Loads are committed as new versions and
//! applied asynchronously to the primary index and the delete vectors. See
//! [`TabletUpdates`] for the version state machine.

mod error;
mod primary;

pub use self::error::*;
pub use self::primary::*;
use crate::array::DataChunk;

/// A source of key-sorted chunks.
///
/// `next_batch` returns `Ok(None)` once the source is drained. `expected_size` is a hint:
/// implementations may return fewer rows, and return more only when they cannot split.
pub trait ChunkIterator: Send {
    fn next_batch(&mut self, expected_size: Option<usize>) -> StorageResult<Option<DataChunk>>;
}

impl ChunkIterator for Box<dyn ChunkIterator> {
    fn next_batch(&mut self, expected_size: Option<usize>) -> StorageResult<Option<DataChunk>> {
        self.as_mut().next_batch(expected_size)
    }
}
