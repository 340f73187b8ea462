// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use super::primary_key_encoder::{EncodedKey, PrimaryKeyEncoder};
use super::rowset::Rowset;
use crate::storage::StorageResult;

/// Encoded keys a committed rowset upserts and deletes, loaded once per apply.
#[derive(Default, Debug)]
pub struct RowsetUpdateState {
    loaded: bool,
    /// Keys of every segment in row order.
    upserts: Vec<Vec<EncodedKey>>,
    deletes: Vec<EncodedKey>,
    memory_usage: usize,
}

impl RowsetUpdateState {
    pub fn load(&mut self, rowset: &Rowset, num_key_columns: usize) -> StorageResult<()> {
        if self.loaded {
            return Ok(());
        }
        let mut upserts = Vec::with_capacity(rowset.num_segments());
        for segment in rowset.segments() {
            upserts.push(PrimaryKeyEncoder::encode_chunk(segment.chunk(), num_key_columns)?);
        }
        let deletes = match rowset.delete_keys() {
            Some(keys) => PrimaryKeyEncoder::encode_chunk(keys, num_key_columns)?,
            None => vec![],
        };
        self.memory_usage = upserts
            .iter()
            .flatten()
            .chain(&deletes)
            .map(|k| k.len())
            .sum();
        self.upserts = upserts;
        self.deletes = deletes;
        self.loaded = true;
        Ok(())
    }

    pub fn upserts(&self) -> &[Vec<EncodedKey>] {
        &self.upserts
    }

    pub fn deletes(&self) -> &[EncodedKey] {
        &self.deletes
    }

    pub fn memory_usage(&self) -> usize {
        self.memory_usage
    }
}
