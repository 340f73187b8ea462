// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! The probe loop.
//!
//! One loop serves every join type. A [`ProbeBehavior`] decides what is emitted for a
//! probe row with and without matches, and the key column decides how keys compare.

use bitvec::vec::BitVec;

use super::key::{for_all_keys, JoinKeys, KeyColumn};
use super::table_items::JoinHashTableItems;
use super::JoinType;
use crate::executor::{ExecutorError, Result};

/// How the rows of the last probe call matched.
///
/// Only describes the work done, the emitted pairs do not depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchFlag {
    /// Every probe row matched exactly one build row.
    AllMatchOne,
    /// Every probe row matched at most one build row.
    MostMatchOne,
    #[default]
    Normal,
}

/// Per-join-type emission rules of the probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeBehavior {
    /// Emit `(probe, build)` for every match.
    pub emit_matched: bool,
    /// Emit `(probe, 0)` for a probe row without any hash match.
    pub emit_unmatched: bool,
    /// Stop walking the chain of a probe row at its first match.
    pub first_match_only: bool,
}

impl ProbeBehavior {
    pub fn new(join_type: JoinType, has_other_conjunct: bool) -> Self {
        use JoinType::*;
        let (emit_matched, emit_unmatched, first_match_only) = match (join_type, has_other_conjunct) {
            (Inner, _) => (true, false, false),
            (LeftOuter | FullOuter, _) => (true, true, false),
            (LeftSemi, false) => (true, false, true),
            (LeftSemi, true) => (true, false, false),
            (LeftAnti, false) => (false, true, true),
            (LeftAnti, true) => (true, true, false),
            // right joins enumerate every match to mark build rows
            (RightOuter | RightSemi | RightAnti, _) => (true, false, false),
        };
        Self {
            emit_matched,
            emit_unmatched,
            first_match_only,
        }
    }
}

/// Cursor and output buffers of probing one probe chunk.
#[derive(Debug, Default)]
pub struct HashTableProbeState {
    pub probe_index: Vec<u32>,
    pub build_index: Vec<u32>,
    /// Number of pairs emitted by the last call.
    pub count: usize,
    pub probe_row_count: usize,
    /// Next chain position per probe row.
    pub next: Vec<u32>,
    /// First probe row not finished yet.
    pub cur_probe_index: usize,
    /// Matches of `cur_probe_index` emitted by earlier calls.
    pub cur_row_match_count: usize,
    pub has_remain: bool,
    pub match_flag: MatchFlag,
    /// Whether the last call emitted a `(probe, 0)` pair.
    pub has_null_build_tuple: bool,
    /// Probe rows with at least one hash match.
    pub probe_hash_matched: BitVec,
    /// Probe rows with at least one match surviving the other conjunct.
    pub probe_matched: BitVec,
    /// Build rows matched by any probe row, for right and full joins.
    pub build_match: BitVec,
    /// Next build row of the post-probe sweep.
    pub cur_build_index: usize,
    /// Whether the probe loop has walked every row of the current chunk.
    pub probe_done: bool,
    /// Probe rows whose hash matches were all rejected by the other conjunct, collected
    /// once the probe loop is done.
    pub filtered_rows: Option<Vec<u32>>,
    /// Next entry of `filtered_rows` to emit.
    pub filtered_pos: usize,
}

impl HashTableProbeState {
    /// Reserve the output buffers for `chunk_size` pairs.
    pub fn prepare(&mut self, chunk_size: usize) {
        self.probe_index = Vec::with_capacity(chunk_size);
        self.build_index = Vec::with_capacity(chunk_size);
    }

    /// Start probing a new chunk: find the chain head of every probe row.
    pub fn lookup_init<K: KeyColumn>(&mut self, items: &JoinHashTableItems, probe_keys: &K) {
        let rows = probe_keys.len();
        self.probe_row_count = rows;
        self.next.clear();
        self.next.extend((0..rows).map(|i| {
            if probe_keys.is_null(i) {
                0
            } else {
                items.head(probe_keys.hash_at(i))
            }
        }));
        self.cur_probe_index = 0;
        self.cur_row_match_count = 0;
        self.has_remain = false;
        self.probe_done = false;
        self.filtered_rows = None;
        self.filtered_pos = 0;
        self.probe_hash_matched = BitVec::repeat(false, rows);
        self.probe_matched = BitVec::repeat(false, rows);
    }

    /// [`lookup_init`](Self::lookup_init) over encoded probe keys.
    pub fn lookup_init_keys(&mut self, items: &JoinHashTableItems, probe_keys: &JoinKeys) {
        for_all_keys!(probe_keys, k => self.lookup_init(items, k))
    }

    /// [`probe`](Self::probe) with the build and probe keys of the same encoding.
    pub fn probe_keys(
        &mut self,
        items: &JoinHashTableItems,
        probe_keys: &JoinKeys,
        behavior: ProbeBehavior,
        chunk_size: usize,
    ) -> Result<()> {
        let next = &items.next;
        match (&items.keys, probe_keys) {
            (JoinKeys::Bool(b), JoinKeys::Bool(p)) => self.probe(next, b, p, behavior, chunk_size),
            (JoinKeys::Int32(b), JoinKeys::Int32(p)) => self.probe(next, b, p, behavior, chunk_size),
            (JoinKeys::Int64(b), JoinKeys::Int64(p)) => self.probe(next, b, p, behavior, chunk_size),
            (JoinKeys::Fixed64(b), JoinKeys::Fixed64(p)) => {
                self.probe(next, b, p, behavior, chunk_size)
            }
            (JoinKeys::Fixed128(b), JoinKeys::Fixed128(p)) => {
                self.probe(next, b, p, behavior, chunk_size)
            }
            (JoinKeys::Serialized(b), JoinKeys::Serialized(p)) => {
                self.probe(next, b, p, behavior, chunk_size)
            }
            _ => {
                return Err(ExecutorError::invalid_state(
                    "probe keys encoded differently from build keys",
                ))
            }
        }
        Ok(())
    }

    /// Whether the current probe chunk still has pairs to emit.
    pub fn has_pending(&self) -> bool {
        self.has_remain
            || self
                .filtered_rows
                .as_ref()
                .is_some_and(|rows| self.filtered_pos < rows.len())
    }

    /// Append `(probe, 0)` for the probe rows whose hash matches were all rejected by
    /// the other conjunct, until `probe_index` holds `chunk_size` pairs. The rest is
    /// left for the next call.
    pub fn emit_filtered(&mut self, probe_index: &mut Vec<u32>, build_index: &mut Vec<u32>, chunk_size: usize) {
        if self.filtered_rows.is_none() {
            let rows = (0..self.probe_row_count)
                .filter(|p| self.probe_hash_matched[*p] && !self.probe_matched[*p])
                .map(|p| p as u32)
                .collect();
            self.filtered_rows = Some(rows);
        }
        let Some(rows) = &self.filtered_rows else {
            return;
        };
        let take = chunk_size
            .saturating_sub(probe_index.len())
            .min(rows.len() - self.filtered_pos);
        let batch = &rows[self.filtered_pos..self.filtered_pos + take];
        probe_index.extend_from_slice(batch);
        build_index.extend(std::iter::repeat(0).take(take));
        self.filtered_pos += take;
    }

    fn emit(&mut self, probe: usize, build: u32) {
        self.probe_index.push(probe as u32);
        self.build_index.push(build);
        self.count += 1;
    }

    /// Walk the chains from the cursor until the probe chunk is drained or `chunk_size`
    /// pairs are emitted.
    pub fn probe<K: KeyColumn>(
        &mut self,
        next: &[u32],
        build_keys: &K,
        probe_keys: &K,
        behavior: ProbeBehavior,
        chunk_size: usize,
    ) {
        self.probe_index.clear();
        self.build_index.clear();
        self.count = 0;
        self.has_null_build_tuple = false;
        let resumed = self.cur_probe_index != 0 || self.cur_row_match_count != 0;
        let mut max_row_matches = 0;
        let mut unmatched_rows = 0;

        let mut i = self.cur_probe_index;
        let mut matched = self.cur_row_match_count;
        while i < self.probe_row_count {
            let mut pos = self.next[i];
            let mut full = false;
            while pos != 0 {
                let b = pos as usize;
                pos = next[b];
                if !build_keys.equals(b, probe_keys, i) {
                    continue;
                }
                matched += 1;
                self.probe_hash_matched.set(i, true);
                if behavior.emit_matched {
                    self.emit(i, b as u32);
                }
                if behavior.first_match_only {
                    pos = 0;
                    break;
                }
                if self.count >= chunk_size {
                    full = true;
                    break;
                }
            }
            if full {
                // skip the rest of the chain if it holds no further match
                while pos != 0 && !build_keys.equals(pos as usize, probe_keys, i) {
                    pos = next[pos as usize];
                }
            }
            if pos != 0 {
                // resume the chain of this row in the next call
                self.next[i] = pos;
                self.cur_probe_index = i;
                self.cur_row_match_count = matched;
                self.has_remain = true;
                self.match_flag = MatchFlag::Normal;
                return;
            }
            self.next[i] = 0;
            if matched == 0 {
                unmatched_rows += 1;
                if behavior.emit_unmatched {
                    self.emit(i, 0);
                    self.has_null_build_tuple = true;
                }
            }
            max_row_matches = max_row_matches.max(matched);
            matched = 0;
            i += 1;
            if self.count >= chunk_size && i < self.probe_row_count {
                self.cur_probe_index = i;
                self.cur_row_match_count = 0;
                self.has_remain = true;
                self.match_flag = MatchFlag::Normal;
                return;
            }
        }

        self.cur_probe_index = 0;
        self.cur_row_match_count = 0;
        self.has_remain = false;
        self.match_flag = if resumed || max_row_matches > 1 {
            MatchFlag::Normal
        } else if unmatched_rows == 0 {
            MatchFlag::AllMatchOne
        } else {
            MatchFlag::MostMatchOne
        };
    }

    pub fn memory_usage(&self) -> usize {
        (self.probe_index.capacity()
            + self.build_index.capacity()
            + self.next.capacity()
            + self.filtered_rows.as_ref().map_or(0, Vec::capacity))
            * std::mem::size_of::<u32>()
            + (self.probe_hash_matched.len() + self.probe_matched.len() + self.build_match.len()) / 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayImpl, DataChunk, I32Array};
    use crate::executor::hash_join::key::{EqualityStrategy, JoinKeyDesc, JoinKeys};
    use crate::types::DataType;

    const CHUNK_SIZE: usize = 4096;

    fn build(keys: impl IntoIterator<Item = Option<i32>>) -> JoinHashTableItems {
        let array: ArrayImpl = I32Array::from_iter(keys).into();
        let chunk: DataChunk = [array].into_iter().collect();
        JoinHashTableItems::build(
            &[JoinKeyDesc::new(DataType::Int32)],
            &[DataType::Int32],
            &[chunk],
            vec![],
        )
        .unwrap()
    }

    fn probe_keys(keys: impl IntoIterator<Item = Option<i32>>) -> JoinKeys {
        let array: ArrayImpl = I32Array::from_iter(keys).into();
        JoinKeys::encode(
            EqualityStrategy::OneKey(DataType::Int32),
            &[JoinKeyDesc::new(DataType::Int32)],
            &[array],
        )
        .unwrap()
    }

    fn run(
        items: &JoinHashTableItems,
        keys: &JoinKeys,
        state: &mut HashTableProbeState,
        behavior: ProbeBehavior,
        init: bool,
    ) {
        let (JoinKeys::Int32(build), JoinKeys::Int32(probe)) = (&items.keys, keys) else {
            panic!("expected one key");
        };
        if init {
            state.lookup_init(items, probe);
        }
        state.probe(&items.next, build, probe, behavior, CHUNK_SIZE);
    }

    fn inner() -> ProbeBehavior {
        ProbeBehavior::new(JoinType::Inner, false)
    }

    #[test]
    fn test_all_match_one() {
        let items = build((0..4096).map(Some));
        let keys = probe_keys((0..4096).map(Some));
        let mut state = HashTableProbeState::default();
        run(&items, &keys, &mut state, inner(), true);
        assert_eq!(state.match_flag, MatchFlag::AllMatchOne);
        assert!(!state.has_remain);
        assert_eq!(state.count, 4096);
        for i in 0..4096 {
            assert_eq!(state.probe_index[i], i as u32);
            assert_eq!(state.build_index[i], i as u32 + 1);
        }
    }

    #[test]
    fn test_most_match_one() {
        let items = build((0..4096).map(|i| Some(if i % 4 == 3 { -1 - i } else { i })));
        let keys = probe_keys((0..4096).map(Some));
        let mut state = HashTableProbeState::default();
        run(&items, &keys, &mut state, inner(), true);
        assert_eq!(state.match_flag, MatchFlag::MostMatchOne);
        assert!(!state.has_remain);
        assert_eq!(state.count, 3072);
        assert!(state.probe_index.iter().all(|i| i % 4 != 3));
    }

    #[test]
    fn test_one_to_many_resumes() {
        // build rows 1..=4096 and 4097..=8192 both hold keys 0..4096
        let items = build((0..4096).chain(0..4096).map(Some));
        let keys = probe_keys((0..3000).map(Some));
        let mut state = HashTableProbeState::default();

        run(&items, &keys, &mut state, inner(), true);
        assert_eq!(state.match_flag, MatchFlag::Normal);
        assert!(state.has_remain);
        assert_eq!(state.cur_probe_index, 2048);
        assert_eq!(state.cur_row_match_count, 0);
        assert_eq!(state.count, 4096);
        for i in 0..2048 {
            assert_eq!(state.probe_index[2 * i], i as u32);
            assert_eq!(state.build_index[2 * i], i as u32 + 1 + 4096);
            assert_eq!(state.probe_index[2 * i + 1], i as u32);
            assert_eq!(state.build_index[2 * i + 1], i as u32 + 1);
        }

        run(&items, &keys, &mut state, inner(), false);
        assert_eq!(state.match_flag, MatchFlag::Normal);
        assert!(!state.has_remain);
        assert_eq!(state.cur_probe_index, 0);
        assert_eq!(state.count, 1904);
        for i in 0..952 {
            assert_eq!(state.probe_index[2 * i], i as u32 + 2048);
            assert_eq!(state.build_index[2 * i], i as u32 + 1 + 4096 + 2048);
        }
    }

    #[test]
    fn test_resume_mid_chain() {
        // every probe row matches three build rows: 12288 pairs in total
        let items = build((0..4096).chain(0..4096).chain(0..4096).map(Some));
        let keys = probe_keys((0..4096).map(Some));
        let mut state = HashTableProbeState::default();
        let mut pairs = vec![];
        let mut calls = 0;
        let mut init = true;
        loop {
            run(&items, &keys, &mut state, inner(), init);
            init = false;
            calls += 1;
            pairs.extend(state.probe_index.iter().copied().zip(state.build_index.iter().copied()));
            if !state.has_remain {
                break;
            }
            assert!(state.count <= CHUNK_SIZE);
        }
        assert_eq!(calls, 3);
        assert_eq!(pairs.len(), 12288);
        // in probe row order, each row's chain most recent first
        for (n, (p, b)) in pairs.iter().enumerate() {
            let row = (n / 3) as u32;
            assert_eq!(*p, row);
            assert_eq!(*b, row + 1 + 4096 * (2 - (n % 3) as u32));
        }
    }

    #[test]
    fn test_left_outer_emits_sentinel() {
        let items = build((0..10).map(Some));
        let keys = probe_keys([Some(1), Some(100), None, Some(9)]);
        let mut state = HashTableProbeState::default();
        run(&items, &keys, &mut state, ProbeBehavior::new(JoinType::LeftOuter, false), true);
        assert_eq!(state.probe_index, vec![0, 1, 2, 3]);
        assert_eq!(state.build_index, vec![2, 0, 0, 10]);
        assert!(state.has_null_build_tuple);
        assert_eq!(state.match_flag, MatchFlag::MostMatchOne);
    }

    #[test]
    fn test_left_semi_and_anti() {
        let items = build([1, 1, 2].map(Some));
        let keys = probe_keys([Some(1), Some(3), Some(2), None]);

        let mut state = HashTableProbeState::default();
        run(&items, &keys, &mut state, ProbeBehavior::new(JoinType::LeftSemi, false), true);
        assert_eq!(state.probe_index, vec![0, 2]);

        run(&items, &keys, &mut state, ProbeBehavior::new(JoinType::LeftAnti, false), true);
        assert_eq!(state.probe_index, vec![1, 3]);
        assert_eq!(state.build_index, vec![0, 0]);
    }

    #[test]
    fn test_null_build_rows_never_match() {
        let items = build((0..100).map(|i| (i % 2 == 0).then_some(i)));
        let keys = probe_keys((0..100).map(Some));
        let mut state = HashTableProbeState::default();
        run(&items, &keys, &mut state, inner(), true);
        assert_eq!(state.count, 50);
        assert!(state.build_index.iter().all(|b| b % 2 == 1));
    }
}
