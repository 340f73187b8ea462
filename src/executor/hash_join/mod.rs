// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Vectorized hash join.
//!
//! The build side is collected with [`JoinHashTable::append_chunk`] and turned into a
//! chained hash table by [`JoinHashTable::build`]. Probe chunks are then fed to
//! [`JoinHashTable::probe`], which emits at most `chunk_size` rows per call and must be
//! called again with the same chunk until `eos` is set. Right and full outer joins
//! finish with [`JoinHashTable::probe_remain`], which sweeps the build rows.

use std::fmt;
use std::sync::Arc;

use bitvec::vec::BitVec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use self::key::JoinKeys;
use self::output::{build_output, build_tuple_output, probe_output};
use self::probe::{HashTableProbeState, ProbeBehavior};
use self::table_items::{check_schema, concat_tuples, JoinHashTableItems};
use super::{ExecutorError, Result};
use crate::array::{Array, BoolArray, DataChunk};
use crate::types::DataType;

mod helper;
mod key;
mod output;
mod probe;
mod table_items;

pub use self::helper::JoinHashMapHelper;
pub use self::key::{EqualityStrategy, JoinKeyDesc};
pub use self::probe::MatchFlag;

/// Identifier of a tuple (a group of columns) on the build side.
pub type TupleId = u32;

/// Default number of rows per output chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    LeftOuter,
    LeftSemi,
    LeftAnti,
    RightOuter,
    RightSemi,
    RightAnti,
    FullOuter,
}

impl JoinType {
    /// Whether probe-side columns are part of the output.
    pub fn outputs_probe(self) -> bool {
        !matches!(self, Self::RightSemi | Self::RightAnti)
    }

    /// Whether build-side columns are part of the output.
    pub fn outputs_build(self) -> bool {
        !matches!(self, Self::LeftSemi | Self::LeftAnti)
    }

    /// Whether the join must sweep the build rows after probing.
    pub fn needs_build_sweep(self) -> bool {
        matches!(
            self,
            Self::RightOuter | Self::RightSemi | Self::RightAnti | Self::FullOuter
        )
    }
}

/// A non-equality join condition evaluated on the hash-matched rows.
///
/// The input chunk holds the probe columns followed by the build columns. The result
/// has one bit per row, set for the rows to keep.
pub trait JoinConjunct: Send + Sync {
    fn evaluate(&self, chunk: &DataChunk) -> Result<BitVec>;
}

impl<F> JoinConjunct for F
where
    F: Fn(&DataChunk) -> Result<BitVec> + Send + Sync,
{
    fn evaluate(&self, chunk: &DataChunk) -> Result<BitVec> {
        self(chunk)
    }
}

/// Parameters of a [`JoinHashTable`].
///
/// The first `keys.len()` columns of the probe and build chunks are the join keys.
#[derive(Clone)]
pub struct JoinHashTableParam {
    pub join_type: JoinType,
    pub keys: Vec<JoinKeyDesc>,
    pub probe_types: Vec<DataType>,
    pub build_types: Vec<DataType>,
    /// The build columns are nullable already, so no tuple-existence column is output.
    pub right_to_nullable: bool,
    pub output_build_tuple_ids: Vec<TupleId>,
    pub chunk_size: usize,
    pub other_conjunct: Option<Arc<dyn JoinConjunct>>,
}

impl JoinHashTableParam {
    pub fn new(
        join_type: JoinType,
        keys: Vec<JoinKeyDesc>,
        probe_types: Vec<DataType>,
        build_types: Vec<DataType>,
    ) -> Self {
        Self {
            join_type,
            keys,
            probe_types,
            build_types,
            right_to_nullable: false,
            output_build_tuple_ids: vec![],
            chunk_size: DEFAULT_CHUNK_SIZE,
            other_conjunct: None,
        }
    }

    pub fn with_right_to_nullable(mut self, right_to_nullable: bool) -> Self {
        self.right_to_nullable = right_to_nullable;
        self
    }

    pub fn with_output_build_tuple_ids(mut self, ids: Vec<TupleId>) -> Self {
        self.output_build_tuple_ids = ids;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_other_conjunct(mut self, conjunct: impl JoinConjunct + 'static) -> Self {
        self.other_conjunct = Some(Arc::new(conjunct));
        self
    }
}

impl fmt::Debug for JoinHashTableParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHashTableParam")
            .field("join_type", &self.join_type)
            .field("keys", &self.keys)
            .field("probe_types", &self.probe_types)
            .field("build_types", &self.build_types)
            .field("right_to_nullable", &self.right_to_nullable)
            .field("output_build_tuple_ids", &self.output_build_tuple_ids)
            .field("chunk_size", &self.chunk_size)
            .field("other_conjunct", &self.other_conjunct.is_some())
            .finish()
    }
}

/// One batch of join output.
#[derive(Debug, Clone, Default)]
pub struct JoinOutput {
    pub chunk: DataChunk,
    /// Tuple-existence columns of the build side.
    pub tuple_columns: Vec<(TupleId, BoolArray)>,
}

impl JoinOutput {
    pub fn cardinality(&self) -> usize {
        self.chunk.cardinality()
    }
}

/// A hash join operator over one partition.
pub struct JoinHashTable {
    param: JoinHashTableParam,
    build_chunks: Vec<DataChunk>,
    build_tuples: Vec<Vec<(TupleId, BoolArray)>>,
    items: Option<JoinHashTableItems>,
    state: HashTableProbeState,
    /// Encoded keys of the probe chunk being drained.
    probe_keys: Option<JoinKeys>,
}

impl JoinHashTable {
    pub fn create(param: JoinHashTableParam) -> Result<Self> {
        if param.keys.is_empty() {
            return Err(ExecutorError::invalid_state("hash join without keys"));
        }
        if param.chunk_size == 0 {
            return Err(ExecutorError::invalid_state("chunk size must be positive"));
        }
        for types in [&param.probe_types, &param.build_types] {
            if types.len() < param.keys.len() {
                return Err(ExecutorError::length_mismatch(param.keys.len(), types.len()));
            }
            for (key, ty) in param.keys.iter().zip(types.iter()) {
                if key.data_type != *ty {
                    return Err(ExecutorError::key_type_mismatch(key.data_type, *ty));
                }
            }
        }
        let mut state = HashTableProbeState::default();
        state.prepare(param.chunk_size);
        Ok(Self {
            param,
            build_chunks: vec![],
            build_tuples: vec![],
            items: None,
            state,
            probe_keys: None,
        })
    }

    pub fn param(&self) -> &JoinHashTableParam {
        &self.param
    }

    /// Add a build-side chunk.
    pub fn append_chunk(&mut self, chunk: DataChunk) -> Result<()> {
        self.append_chunk_with_tuples(chunk, vec![])
    }

    /// Add a build-side chunk along with its tuple-existence columns.
    pub fn append_chunk_with_tuples(
        &mut self,
        chunk: DataChunk,
        tuples: Vec<(TupleId, BoolArray)>,
    ) -> Result<()> {
        if self.items.is_some() {
            return Err(ExecutorError::invalid_state("append after build"));
        }
        check_schema(&self.param.build_types, &chunk)?;
        for (_, tuple) in &tuples {
            if tuple.len() != chunk.cardinality() {
                return Err(ExecutorError::length_mismatch(chunk.cardinality(), tuple.len()));
            }
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.build_chunks.push(chunk);
        self.build_tuples.push(tuples);
        Ok(())
    }

    /// Construct the hash table from the appended chunks.
    pub fn build(&mut self) -> Result<()> {
        if self.items.is_some() {
            return Err(ExecutorError::invalid_state("hash table already built"));
        }
        let tuples = concat_tuples(&self.param.output_build_tuple_ids, &self.build_tuples)?;
        let items = JoinHashTableItems::build(
            &self.param.keys,
            &self.param.build_types,
            &self.build_chunks,
            tuples,
        )?;
        self.build_chunks.clear();
        self.build_tuples.clear();
        debug!(
            join_type = ?self.param.join_type,
            strategy = ?items.strategy,
            rows = items.row_count,
            buckets = items.bucket_size,
            "hash table built"
        );
        if self.param.join_type.needs_build_sweep() {
            self.state.build_match = BitVec::repeat(false, items.row_count + 1);
            self.state.cur_build_index = 1;
        }
        self.items = Some(items);
        Ok(())
    }

    /// Probe the table with `chunk`.
    ///
    /// `eos` is cleared while the chunk still has pending matches. The caller must then
    /// call again with the same chunk before moving on.
    pub fn probe(&mut self, chunk: &DataChunk, output: &mut JoinOutput, eos: &mut bool) -> Result<()> {
        let Self {
            param,
            items,
            state,
            probe_keys,
            ..
        } = self;
        let items = items
            .as_ref()
            .ok_or_else(|| ExecutorError::invalid_state("probe before build"))?;

        if !state.has_pending() {
            check_schema(&param.probe_types, chunk)?;
            let keys = JoinKeys::encode(
                items.strategy,
                &param.keys,
                &chunk.arrays()[..param.keys.len()],
            )?;
            state.lookup_init_keys(items, &keys);
            *probe_keys = Some(keys);
        } else if chunk.cardinality() != state.probe_row_count {
            return Err(ExecutorError::invalid_state(
                "probe chunk changed before it was drained",
            ));
        }

        let (mut probe_index, mut build_index) = if state.probe_done {
            (vec![], vec![])
        } else {
            let keys = probe_keys
                .as_ref()
                .ok_or_else(|| ExecutorError::invalid_state("probe keys missing"))?;
            let behavior = ProbeBehavior::new(param.join_type, param.other_conjunct.is_some());
            state.probe_keys(items, keys, behavior, param.chunk_size)?;
            state.probe_done = !state.has_remain;

            let probe_index = std::mem::take(&mut state.probe_index);
            let build_index = std::mem::take(&mut state.build_index);
            match &param.other_conjunct {
                None => emit_without_conjunct(param.join_type, state, probe_index, build_index),
                Some(conjunct) => emit_with_conjunct(
                    param.join_type,
                    &**conjunct,
                    chunk,
                    items,
                    state,
                    probe_index,
                    build_index,
                )?,
            }
        };
        if state.probe_done && param.other_conjunct.is_some() && emits_filtered_rows(param.join_type) {
            state.emit_filtered(&mut probe_index, &mut build_index, param.chunk_size);
        }
        let has_null_build_tuple = build_index.iter().any(|b| *b == 0);
        *output = materialize(param, items, Some(chunk), &probe_index, &build_index, has_null_build_tuple);

        *eos = !state.has_pending();
        if *eos {
            *probe_keys = None;
        }
        Ok(())
    }

    /// Emit the build rows decided after all probe chunks: unmatched rows for right
    /// outer, right anti and full outer joins, matched rows for right semi joins.
    ///
    /// Does nothing for other join types. Call until `eos` is set.
    pub fn probe_remain(&mut self, output: &mut JoinOutput, eos: &mut bool) -> Result<()> {
        let items = self
            .items
            .as_ref()
            .ok_or_else(|| ExecutorError::invalid_state("probe before build"))?;
        let join_type = self.param.join_type;
        if !join_type.needs_build_sweep() {
            *output = materialize(&self.param, items, None, &[], &[], false);
            *eos = true;
            return Ok(());
        }
        if self.state.has_pending() {
            return Err(ExecutorError::invalid_state(
                "probe chunk not drained before the build sweep",
            ));
        }
        let want_matched = join_type == JoinType::RightSemi;
        let state = &mut self.state;
        let mut build_index = Vec::with_capacity(self.param.chunk_size);
        let mut i = state.cur_build_index.max(1);
        while i <= items.row_count && build_index.len() < self.param.chunk_size {
            if state.build_match[i] == want_matched {
                build_index.push(i as u32);
            }
            i += 1;
        }
        state.cur_build_index = i;
        let probe_index = vec![0; build_index.len()];
        *output = materialize(&self.param, items, None, &probe_index, &build_index, false);
        *eos = i > items.row_count;
        Ok(())
    }

    /// Number of build rows.
    pub fn build_row_count(&self) -> usize {
        self.items.as_ref().map_or(0, |items| items.row_count)
    }

    /// Whether any build row has a null key. Null-safe keys never count as null.
    pub fn has_null_build_key(&self) -> bool {
        self.items.as_ref().is_some_and(|items| items.has_null_key)
    }

    /// The key encoding picked by [`build`](Self::build).
    pub fn strategy(&self) -> Option<EqualityStrategy> {
        self.items.as_ref().map(|items| items.strategy)
    }

    /// How the rows of the last probe call matched.
    pub fn match_flag(&self) -> MatchFlag {
        self.state.match_flag
    }

    pub fn memory_usage(&self) -> usize {
        let pending: usize = self.build_chunks.iter().map(|c| c.estimated_size()).sum();
        pending
            + self.items.as_ref().map_or(0, |items| items.memory_usage())
            + self.state.memory_usage()
            + self.probe_keys.as_ref().map_or(0, |k| k.estimated_size())
    }
}

/// Mark matched build rows and drop what the join type does not output.
fn emit_without_conjunct(
    join_type: JoinType,
    state: &mut HashTableProbeState,
    probe_index: Vec<u32>,
    build_index: Vec<u32>,
) -> (Vec<u32>, Vec<u32>) {
    if join_type.needs_build_sweep() {
        for b in &build_index {
            if *b != 0 {
                state.build_match.set(*b as usize, true);
            }
        }
    }
    match join_type {
        JoinType::RightSemi | JoinType::RightAnti => (vec![], vec![]),
        _ => (probe_index, build_index),
    }
}

/// Filter the hash matches with the other conjunct, then apply the join type.
///
/// Probe rows whose hash matches were all filtered out are null-extended (outer) or
/// emitted (anti) by [`HashTableProbeState::emit_filtered`] once the probe loop is done.
fn emit_with_conjunct(
    join_type: JoinType,
    conjunct: &dyn JoinConjunct,
    chunk: &DataChunk,
    items: &JoinHashTableItems,
    state: &mut HashTableProbeState,
    probe_index: Vec<u32>,
    build_index: Vec<u32>,
) -> Result<(Vec<u32>, Vec<u32>)> {
    let candidates: Vec<usize> = (0..build_index.len())
        .filter(|k| build_index[*k] != 0)
        .collect();
    let keep = if candidates.is_empty() {
        BitVec::new()
    } else {
        let probe_rows: Vec<u32> = candidates.iter().map(|k| probe_index[*k]).collect();
        let build_rows: Vec<u32> = candidates.iter().map(|k| build_index[*k]).collect();
        let joined = chunk
            .gather(&probe_rows)
            .concat_columns(items.build_chunk.gather(&build_rows));
        let keep = conjunct.evaluate(&joined)?;
        if keep.len() != candidates.len() {
            return Err(ExecutorError::length_mismatch(candidates.len(), keep.len()));
        }
        keep
    };

    let mut out_probe = Vec::with_capacity(probe_index.len());
    let mut out_build = Vec::with_capacity(build_index.len());
    let mut c = 0;
    for (p, b) in probe_index.into_iter().zip(build_index) {
        if b == 0 {
            // no hash match at all
            out_probe.push(p);
            out_build.push(0);
            continue;
        }
        let kept = keep[c];
        c += 1;
        if !kept {
            continue;
        }
        let first = !state.probe_matched.replace(p as usize, true);
        if join_type.needs_build_sweep() {
            state.build_match.set(b as usize, true);
        }
        match join_type {
            JoinType::LeftSemi if first => {
                out_probe.push(p);
                out_build.push(0);
            }
            JoinType::Inner | JoinType::LeftOuter | JoinType::RightOuter | JoinType::FullOuter => {
                out_probe.push(p);
                out_build.push(b);
            }
            _ => {}
        }
    }

    Ok((out_probe, out_build))
}

/// Join types that output `(probe, 0)` for probe rows whose hash matches the other
/// conjunct all rejected.
fn emits_filtered_rows(join_type: JoinType) -> bool {
    matches!(
        join_type,
        JoinType::LeftOuter | JoinType::FullOuter | JoinType::LeftAnti
    )
}

/// Lay out the output columns for the join type.
fn materialize(
    param: &JoinHashTableParam,
    items: &JoinHashTableItems,
    probe_chunk: Option<&DataChunk>,
    probe_index: &[u32],
    build_index: &[u32],
    has_null_build_tuple: bool,
) -> JoinOutput {
    let join_type = param.join_type;
    let mut chunk: Option<DataChunk> = None;
    if join_type.outputs_probe() {
        chunk = Some(probe_output(param, probe_chunk, probe_index));
    }
    let mut tuple_columns = vec![];
    if join_type.outputs_build() {
        let build = build_output(items, build_index);
        chunk = Some(match chunk {
            Some(probe) => probe.concat_columns(build),
            None => build,
        });
        tuple_columns = build_tuple_output(param, items, build_index, has_null_build_tuple);
    }
    JoinOutput {
        chunk: chunk.unwrap_or_else(|| DataChunk::no_column(probe_index.len())),
        tuple_columns,
    }
}

#[cfg(test)]
mod tests;
