// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use super::primary_key_encoder::{EncodedKey, PrimaryKeyEncoder};
use super::rowset::Rowset;
use crate::storage::{StorageResult, TracedStorageError};

/// Keys and source locations of one output segment.
#[derive(Debug)]
pub struct CompactionSegmentState {
    pub pkeys: Vec<EncodedKey>,
    pub src_rssids: Vec<u32>,
}

/// Everything the apply of a compaction needs, derived from the output rowset alone.
#[derive(Debug, Default)]
pub struct CompactionState {
    pub segments: Vec<CompactionSegmentState>,
}

impl CompactionState {
    pub fn load(output: &Rowset, num_key_columns: usize) -> StorageResult<Self> {
        let mut segments = Vec::with_capacity(output.num_segments());
        for (i, segment) in output.segments().iter().enumerate() {
            let Some(src_rssids) = segment.src_rssids() else {
                return Err(TracedStorageError::corruption(format!(
                    "segment {i} of compaction output rowset {} has no source ids",
                    output.rowset_id()
                )));
            };
            let pkeys = PrimaryKeyEncoder::encode_chunk(segment.chunk(), num_key_columns)?;
            if pkeys.len() != src_rssids.len() {
                return Err(TracedStorageError::corruption(format!(
                    "segment {i} of rowset {} has {} rows and {} source ids",
                    output.rowset_id(),
                    pkeys.len(),
                    src_rssids.len()
                )));
            }
            segments.push(CompactionSegmentState {
                pkeys,
                src_rssids: src_rssids.to_vec(),
            });
        }
        Ok(Self { segments })
    }
}
