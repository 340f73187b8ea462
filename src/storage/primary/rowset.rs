// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use bitvec::prelude::BitVec;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::edit_version::RowsetId;
use super::primary_key_encoder::{EncodedKey, PrimaryKeyEncoder};
use super::schema::TabletSchema;
use super::DelVector;
use crate::array::{concat_chunks, ArrayBuilderImpl, ArrayImplBuilderPickExt, DataChunk};
use crate::storage::{ChunkIterator, StorageResult, TracedStorageError};

/// A key-sorted run of rows.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    chunk: DataChunk,
    /// Rowset-segment id each row was read from. Only compaction outputs carry it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src_rssids: Option<Vec<u32>>,
}

impl Segment {
    pub fn new(chunk: DataChunk, src_rssids: Option<Vec<u32>>) -> Self {
        Self { chunk, src_rssids }
    }

    pub fn chunk(&self) -> &DataChunk {
        &self.chunk
    }

    pub fn num_rows(&self) -> usize {
        self.chunk.cardinality()
    }

    pub fn src_rssids(&self) -> Option<&[u32]> {
        self.src_rssids.as_deref()
    }
}

/// Everything persisted about a rowset.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RowsetMeta {
    pub tablet_id: u64,
    /// Assigned at commit. Segment `i` has rowset-segment id `rowset_id + i`.
    pub rowset_id: RowsetId,
    /// Major version this rowset was committed at, 0 before commit.
    pub version: u64,
    pub num_rows: u64,
    pub data_size: u64,
    pub segments: Vec<Arc<Segment>>,
    /// Key columns of rows deleted by this load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_keys: Option<Arc<DataChunk>>,
}

/// An immutable set of segments plus the deletes of one load or compaction.
#[derive(Debug)]
pub struct Rowset {
    meta: RowsetMeta,
}

impl Rowset {
    pub fn new(meta: RowsetMeta) -> Self {
        Self { meta }
    }

    pub fn meta(&self) -> &RowsetMeta {
        &self.meta
    }

    pub fn tablet_id(&self) -> u64 {
        self.meta.tablet_id
    }

    pub fn rowset_id(&self) -> RowsetId {
        self.meta.rowset_id
    }

    pub fn version(&self) -> u64 {
        self.meta.version
    }

    pub fn num_segments(&self) -> usize {
        self.meta.segments.len()
    }

    pub fn num_rows(&self) -> usize {
        self.meta.num_rows as usize
    }

    pub fn data_disk_size(&self) -> usize {
        self.meta.data_size as usize
    }

    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.meta.segments
    }

    pub fn delete_keys(&self) -> Option<&DataChunk> {
        self.meta.delete_keys.as_deref()
    }

    /// A copy stamped with the commit version and rowset id. Segment data is shared.
    pub fn make_commit(&self, version: u64, rowset_id: RowsetId) -> Rowset {
        let mut meta = self.meta.clone();
        meta.version = version;
        meta.rowset_id = rowset_id;
        Rowset { meta }
    }

    /// Iterators over every segment, with `delvecs[i]` masking segment `i`.
    pub fn get_segment_iterators(
        &self,
        delvecs: Vec<Option<DelVector>>,
        chunk_size: usize,
    ) -> StorageResult<Vec<SegmentIterator>> {
        if delvecs.len() != self.num_segments() {
            return Err(TracedStorageError::invalid_argument(format!(
                "rowset {} has {} segments, got {} delete vectors",
                self.rowset_id(),
                self.num_segments(),
                delvecs.len()
            )));
        }
        Ok(self
            .meta
            .segments
            .iter()
            .zip(delvecs)
            .map(|(segment, delvec)| SegmentIterator::new(segment.clone(), delvec, chunk_size))
            .collect())
    }
}

/// Reads the visible rows of one segment in batches.
pub struct SegmentIterator {
    segment: Arc<Segment>,
    delvec: Option<DelVector>,
    pos: usize,
    chunk_size: usize,
    /// Only read this many leading columns.
    num_columns: Option<usize>,
}

impl SegmentIterator {
    pub fn new(segment: Arc<Segment>, delvec: Option<DelVector>, chunk_size: usize) -> Self {
        Self {
            segment,
            delvec,
            pos: 0,
            chunk_size: chunk_size.max(1),
            num_columns: None,
        }
    }

    /// Read only the first `n` columns.
    pub fn project_prefix(mut self, n: usize) -> Self {
        self.num_columns = Some(n);
        self
    }

    fn gather(&self, rows: &[u32]) -> DataChunk {
        let chunk = self.segment.chunk();
        match self.num_columns {
            Some(n) => chunk.arrays()[..n.min(chunk.column_count())]
                .iter()
                .map(|a| a.gather(rows))
                .collect(),
            None => chunk.gather(rows),
        }
    }
}

impl ChunkIterator for SegmentIterator {
    fn next_batch(&mut self, expected_size: Option<usize>) -> StorageResult<Option<DataChunk>> {
        let total = self.segment.num_rows();
        let batch_size = expected_size.unwrap_or(self.chunk_size).clamp(1, self.chunk_size);
        while self.pos < total {
            let start = self.pos;
            let end = (start + batch_size).min(total);
            self.pos = end;

            let rows = (start as u32..end as u32).collect_vec();
            let chunk = self.gather(&rows);
            let Some(delvec) = &self.delvec else {
                return Ok(Some(chunk));
            };
            let mut visibility = BitVec::repeat(true, end - start);
            delvec.apply_to(&mut visibility, start as u32);
            if visibility.all() {
                return Ok(Some(chunk));
            }
            if visibility.any() {
                let visibility = visibility.iter().by_vals().collect_vec();
                return Ok(Some(chunk.filter(visibility.iter().copied())));
            }
        }
        Ok(None)
    }
}

/// Builds a [`Rowset`] from a load or a compaction.
///
/// Loaded rows are sorted by primary key, and when a key appears more than once the
/// last row wins. Compaction output is appended already sorted, together with the
/// source rowset-segment id of every row.
pub struct RowsetWriter {
    tablet_id: u64,
    schema: Arc<TabletSchema>,
    segment_max_rows: usize,
    chunks: Vec<DataChunk>,
    src_rssids: Option<Vec<u32>>,
    delete_chunks: Vec<DataChunk>,
}

impl RowsetWriter {
    pub fn new(tablet_id: u64, schema: Arc<TabletSchema>, segment_max_rows: usize) -> Self {
        Self {
            tablet_id,
            schema,
            segment_max_rows: segment_max_rows.max(1),
            chunks: vec![],
            src_rssids: None,
            delete_chunks: vec![],
        }
    }

    /// Add unsorted rows to upsert.
    pub fn add_chunk(&mut self, chunk: DataChunk) -> StorageResult<()> {
        if self.src_rssids.is_some() {
            return Err(TracedStorageError::invalid_argument(
                "cannot mix loaded rows with compaction output",
            ));
        }
        self.schema.check_chunk(&chunk)?;
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
        Ok(())
    }

    /// Add keys to delete. `keys` holds only the key columns.
    pub fn add_deletes(&mut self, keys: DataChunk) -> StorageResult<()> {
        self.schema.check_key_chunk(&keys)?;
        if !keys.is_empty() {
            self.delete_chunks.push(keys);
        }
        Ok(())
    }

    /// Append rows that are already in key order, read from the given rowset-segments.
    pub fn append_sorted(&mut self, chunk: DataChunk, src_rssids: &[u32]) -> StorageResult<()> {
        if chunk.cardinality() != src_rssids.len() {
            return Err(TracedStorageError::invalid_argument(format!(
                "{} rows with {} source ids",
                chunk.cardinality(),
                src_rssids.len()
            )));
        }
        if self.src_rssids.is_none() && !self.chunks.is_empty() {
            return Err(TracedStorageError::invalid_argument(
                "cannot mix loaded rows with compaction output",
            ));
        }
        self.schema.check_chunk(&chunk)?;
        self.src_rssids
            .get_or_insert_with(Vec::new)
            .extend_from_slice(src_rssids);
        self.chunks.push(chunk);
        Ok(())
    }

    pub fn build(self) -> StorageResult<Rowset> {
        let num_keys = self.schema.num_key_columns();
        let (rows, src_rssids) = match self.src_rssids {
            Some(src) => {
                let rows = self
                    .chunks
                    .iter()
                    .enumerate()
                    .flat_map(|(c, chunk)| (0..chunk.cardinality()).map(move |r| (c, r)))
                    .collect_vec();
                (rows, Some(src))
            }
            None => (sorted_unique_rows(&self.chunks, num_keys)?, None),
        };

        let mut segments = vec![];
        for (i, part) in rows.chunks(self.segment_max_rows).enumerate() {
            let chunk = pick_rows(&self.chunks, &self.schema, part);
            let src = src_rssids.as_ref().map(|src| {
                let start = i * self.segment_max_rows;
                src[start..start + part.len()].to_vec()
            });
            segments.push(Arc::new(Segment::new(chunk, src)));
        }

        let delete_keys = match concat_chunks(&self.delete_chunks) {
            Some(keys) => {
                let encoded = PrimaryKeyEncoder::encode_chunk(&keys, num_keys)?;
                let unique = (0..encoded.len() as u32)
                    .sorted_by(|a, b| encoded[*a as usize].cmp(&encoded[*b as usize]))
                    .dedup_by(|a, b| encoded[*a as usize] == encoded[*b as usize])
                    .collect_vec();
                Some(Arc::new(keys.gather(&unique)))
            }
            None => None,
        };

        let num_rows = rows.len() as u64;
        let data_size = segments
            .iter()
            .map(|s| s.chunk().estimated_size())
            .sum::<usize>()
            + delete_keys.as_ref().map_or(0, |k| k.estimated_size());
        Ok(Rowset::new(RowsetMeta {
            tablet_id: self.tablet_id,
            rowset_id: 0,
            version: 0,
            num_rows,
            data_size: data_size as u64,
            segments,
            delete_keys,
        }))
    }
}

/// Sort all rows by encoded key and keep the last occurrence of each key.
fn sorted_unique_rows(chunks: &[DataChunk], num_keys: usize) -> StorageResult<Vec<(usize, usize)>> {
    let mut keyed: Vec<(EncodedKey, usize, usize)> = vec![];
    for (c, chunk) in chunks.iter().enumerate() {
        let keys = PrimaryKeyEncoder::encode_chunk(chunk, num_keys)?;
        keyed.extend(keys.into_iter().enumerate().map(|(r, k)| (k, c, r)));
    }
    // stable, so rows with equal keys stay in insertion order
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    let mut rows: Vec<(usize, usize)> = Vec::with_capacity(keyed.len());
    let mut last_key: Option<EncodedKey> = None;
    for (key, c, r) in keyed {
        if last_key.as_ref() == Some(&key) {
            if let Some(last) = rows.last_mut() {
                *last = (c, r);
            }
        } else {
            rows.push((c, r));
            last_key = Some(key);
        }
    }
    Ok(rows)
}

fn pick_rows(chunks: &[DataChunk], schema: &TabletSchema, rows: &[(usize, usize)]) -> DataChunk {
    (0..schema.num_columns())
        .map(|col| {
            let mut builder =
                ArrayBuilderImpl::with_capacity(rows.len(), schema.columns()[col].data_type);
            let arrays = chunks.iter().map(|c| c.array_at(col)).collect_vec();
            builder.pick_from_multiple(&arrays, rows);
            builder.finish()
        })
        .collect()
}
