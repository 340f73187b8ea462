// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use crate::array::DataChunk;
use crate::storage::{ChunkIterator, StorageResult};

/// Yields prepared chunks, ignoring the expected size.
pub struct TestIterator {
    chunks: Vec<DataChunk>,
    cnt: usize,
}

impl TestIterator {
    pub fn new(chunks: Vec<DataChunk>) -> Self {
        Self { chunks, cnt: 0 }
    }
}

impl ChunkIterator for TestIterator {
    fn next_batch(&mut self, _expected_size: Option<usize>) -> StorageResult<Option<DataChunk>> {
        if self.cnt >= self.chunks.len() {
            return Ok(None);
        }
        let chunk = self.chunks[self.cnt].clone();
        self.cnt += 1;
        Ok(Some(chunk))
    }
}
