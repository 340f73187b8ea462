// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use itertools::Itertools;

use super::helper::{JoinHashMapHelper, MAX_BUCKET_SIZE};
use super::key::{for_all_keys, EqualityStrategy, JoinKeyDesc, JoinKeys, KeyColumn};
use super::TupleId;
use crate::array::{concat_chunks, Array, ArrayBuilderImpl, BoolArray, DataChunk};
use crate::executor::{ExecutorError, Result};
use crate::types::DataType;

/// The built side of a hash join.
///
/// Row 0 of every build column is a null row. Build rows are numbered from 1, so a
/// build index of 0 means "no build row" and gathers nulls.
pub struct JoinHashTableItems {
    /// All build chunks, preceded by the null row.
    pub build_chunk: DataChunk,
    /// Tuple-existence columns of the build side, with `false` at row 0.
    pub build_tuples: Vec<(TupleId, BoolArray)>,
    pub keys: JoinKeys,
    pub strategy: EqualityStrategy,
    /// Chain head per bucket.
    pub first: Vec<u32>,
    /// Next row in the chain, per build row.
    pub next: Vec<u32>,
    pub bucket_size: u32,
    /// Number of build rows, excluding the null row.
    pub row_count: usize,
    pub has_null_key: bool,
}

impl JoinHashTableItems {
    /// Concatenate the build chunks and construct the hash table over their keys.
    pub fn build(
        keys: &[JoinKeyDesc],
        build_types: &[DataType],
        chunks: &[DataChunk],
        tuples: Vec<(TupleId, BoolArray)>,
    ) -> Result<Self> {
        let row_count: usize = chunks.iter().map(|c| c.cardinality()).sum();
        if row_count >= u32::MAX as usize {
            return Err(ExecutorError::too_many_build_rows(row_count));
        }
        for chunk in chunks {
            check_schema(build_types, chunk)?;
        }

        let null_row = null_chunk(build_types, 1);
        let all = std::iter::once(null_row).chain(chunks.iter().cloned()).collect_vec();
        let build_chunk = concat_chunks(&all)
            .ok_or_else(|| ExecutorError::invalid_state("no build chunk"))?;

        let strategy = EqualityStrategy::select(keys);
        let encoded = JoinKeys::encode(strategy, keys, &build_chunk.arrays()[..keys.len()])?;
        let bucket_size = JoinHashMapHelper::calc_bucket_num(row_count, MAX_BUCKET_SIZE);
        let (first, next, has_null_key) =
            for_all_keys!(&encoded, k => construct_hash_table(k, bucket_size));

        Ok(Self {
            build_chunk,
            build_tuples: tuples,
            keys: encoded,
            strategy,
            first,
            next,
            bucket_size,
            row_count,
            has_null_key,
        })
    }

    /// Chain head for a probe key hash.
    #[inline]
    pub fn head(&self, hash: u32) -> u32 {
        self.first[JoinHashMapHelper::bucket_of(hash, self.bucket_size) as usize]
    }

    pub fn memory_usage(&self) -> usize {
        self.build_chunk.estimated_size()
            + self.keys.estimated_size()
            + (self.first.len() + self.next.len()) * std::mem::size_of::<u32>()
            + self.build_tuples.iter().map(|(_, t)| t.len()).sum::<usize>()
    }
}

/// A chunk of `rows` all-null rows.
pub fn null_chunk(types: &[DataType], rows: usize) -> DataChunk {
    if types.is_empty() {
        return DataChunk::no_column(rows);
    }
    types
        .iter()
        .map(|ty| {
            let mut builder = ArrayBuilderImpl::with_capacity(rows, *ty);
            for _ in 0..rows {
                builder.push_null();
            }
            builder.finish()
        })
        .collect()
}

/// Check that `chunk` matches the declared column types.
pub fn check_schema(types: &[DataType], chunk: &DataChunk) -> Result<()> {
    if chunk.column_count() != types.len() {
        return Err(ExecutorError::length_mismatch(
            types.len(),
            chunk.column_count(),
        ));
    }
    for (ty, array) in types.iter().zip(chunk.arrays()) {
        if *ty != array.data_type() {
            return Err(ExecutorError::key_type_mismatch(*ty, array.data_type()));
        }
    }
    Ok(())
}

/// Head-insert every non-null build row into its bucket chain.
///
/// Row 0 is never inserted. Returns `(first, next, has_null_key)`.
fn construct_hash_table<K: KeyColumn>(keys: &K, bucket_size: u32) -> (Vec<u32>, Vec<u32>, bool) {
    let mut first = vec![0u32; bucket_size as usize];
    let mut next = vec![0u32; keys.len()];
    let mut has_null = false;
    for i in 1..keys.len() {
        if keys.is_null(i) {
            has_null = true;
            continue;
        }
        let bucket = JoinHashMapHelper::bucket_of(keys.hash_at(i), bucket_size) as usize;
        next[i] = first[bucket];
        first[bucket] = i as u32;
    }
    (first, next, has_null)
}

/// Collect the tuple-existence columns of every build chunk, with `false` at row 0.
pub fn concat_tuples(
    tuple_ids: &[TupleId],
    per_chunk: &[Vec<(TupleId, BoolArray)>],
) -> Result<Vec<(TupleId, BoolArray)>> {
    if per_chunk.iter().all(|t| t.is_empty()) {
        return Ok(vec![]);
    }
    let mut columns = vec![];
    for id in tuple_ids {
        let mut values: Vec<Option<bool>> = vec![Some(false)];
        for tuples in per_chunk {
            let Some((_, column)) = tuples.iter().find(|(tid, _)| tid == id) else {
                return Err(ExecutorError::invalid_state(format!(
                    "build tuple {id} missing in some build chunks"
                )));
            };
            values.extend(column.raw_data().iter().map(|v| Some(*v)));
        }
        columns.push((*id, values.into_iter().collect()));
    }
    Ok(columns)
}

impl std::fmt::Debug for JoinHashTableItems {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHashTableItems")
            .field("strategy", &self.strategy)
            .field("row_count", &self.row_count)
            .field("bucket_size", &self.bucket_size)
            .field("has_null_key", &self.has_null_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayImpl, I32Array, Utf8Array};

    fn chunk(columns: Vec<ArrayImpl>) -> DataChunk {
        columns.into_iter().collect()
    }

    /// Rows reachable from any bucket head.
    fn chained_rows(items: &JoinHashTableItems) -> Vec<u32> {
        let mut rows = vec![];
        for head in &items.first {
            let mut pos = *head;
            while pos != 0 {
                rows.push(pos);
                pos = items.next[pos as usize];
            }
        }
        rows.sort_unstable();
        rows
    }

    #[test]
    fn test_build_one_key() {
        let build = chunk(vec![
            I32Array::from_iter(0..10).into(),
            I32Array::from_iter(10..20).into(),
        ]);
        let items = JoinHashTableItems::build(
            &[JoinKeyDesc::new(DataType::Int32)],
            &[DataType::Int32, DataType::Int32],
            &[build],
            vec![],
        )
        .unwrap();
        assert_eq!(items.strategy, EqualityStrategy::OneKey(DataType::Int32));
        assert_eq!(items.row_count, 10);
        assert_eq!(items.bucket_size, 32);
        assert_eq!(items.build_chunk.cardinality(), 11);
        assert!(items.build_chunk.array_at(0).is_null(0));
        assert!(!items.has_null_key);
        assert_eq!(chained_rows(&items), (1..=10).collect_vec());
    }

    #[test]
    fn test_duplicate_keys_chain_most_recent_first() {
        let build = chunk(vec![I32Array::from_iter([5, 5, 5]).into()]);
        let items = JoinHashTableItems::build(
            &[JoinKeyDesc::new(DataType::Int32)],
            &[DataType::Int32],
            &[build],
            vec![],
        )
        .unwrap();
        let JoinKeys::Int32(keys) = &items.keys else {
            panic!("expected one key");
        };
        let head = items.head(keys.hash_at(1));
        assert_eq!(head, 3);
        assert_eq!(items.next[3], 2);
        assert_eq!(items.next[2], 1);
        assert_eq!(items.next[1], 0);
    }

    #[test]
    fn test_null_keys_excluded() {
        let keys: I32Array = (0..10).map(|i| (i % 2 == 0).then_some(i)).collect();
        let names: Utf8Array = (0..10).map(|i| Some(format!("n{i}"))).collect();
        let build = chunk(vec![keys.clone().into(), names.into()]);
        for descs in [
            vec![JoinKeyDesc::new(DataType::Int32)],
            vec![
                JoinKeyDesc::new(DataType::Int32),
                JoinKeyDesc::new(DataType::Varchar),
            ],
        ] {
            let items = JoinHashTableItems::build(
                &descs,
                &[DataType::Int32, DataType::Varchar],
                &[build.clone()],
                vec![],
            )
            .unwrap();
            assert!(items.has_null_key);
            // build row i + 1 holds input row i
            assert_eq!(chained_rows(&items), vec![1, 3, 5, 7, 9]);
        }
    }

    #[test]
    fn test_schema_mismatch() {
        let build = chunk(vec![I32Array::from_iter(0..3).into()]);
        let err = JoinHashTableItems::build(
            &[JoinKeyDesc::new(DataType::Int32)],
            &[DataType::Int64],
            &[build],
            vec![],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_empty_build() {
        let items = JoinHashTableItems::build(
            &[JoinKeyDesc::new(DataType::Int32)],
            &[DataType::Int32],
            &[],
            vec![],
        )
        .unwrap();
        assert_eq!(items.row_count, 0);
        assert_eq!(items.build_chunk.cardinality(), 1);
        assert!(items.first.iter().all(|h| *h == 0));
    }

    #[test]
    fn test_concat_tuples() {
        let tuples = vec![
            vec![(1, BoolArray::from_iter([true, false]))],
            vec![(1, BoolArray::from_iter([true]))],
        ];
        let columns = concat_tuples(&[1], &tuples).unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].1.raw_data(), &[false, true, false, true]);

        assert!(concat_tuples(&[2], &tuples).is_err());
        assert!(concat_tuples(&[1], &[vec![], vec![]]).unwrap().is_empty());
    }
}
