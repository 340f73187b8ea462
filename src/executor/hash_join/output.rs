// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Materialize `(probe_index, build_index)` pairs into output columns.

use super::table_items::{null_chunk, JoinHashTableItems};
use super::{JoinHashTableParam, TupleId};
use crate::array::{BoolArray, DataChunk};

/// Probe-side columns of the pairs. `None` stands for a missing probe row, as in the
/// build-side sweep of right joins, and yields nulls.
pub fn probe_output(
    param: &JoinHashTableParam,
    probe_chunk: Option<&DataChunk>,
    probe_index: &[u32],
) -> DataChunk {
    match probe_chunk {
        Some(chunk) => chunk.gather(probe_index),
        None => null_chunk(&param.probe_types, probe_index.len()),
    }
}

/// Build-side columns of the pairs. Build index 0 gathers the null row.
pub fn build_output(items: &JoinHashTableItems, build_index: &[u32]) -> DataChunk {
    items.build_chunk.gather(build_index)
}

/// Tuple-existence columns of the build side.
///
/// Nothing is emitted when the build columns are already nullable. Otherwise every
/// requested tuple gets a column: gathered from the tuple columns the build side
/// supplied, or derived from whether the pair has a build row.
pub fn build_tuple_output(
    param: &JoinHashTableParam,
    items: &JoinHashTableItems,
    build_index: &[u32],
    has_null_build_tuple: bool,
) -> Vec<(TupleId, BoolArray)> {
    if param.right_to_nullable {
        return vec![];
    }
    param
        .output_build_tuple_ids
        .iter()
        .map(|id| {
            let supplied = items.build_tuples.iter().find(|(tid, _)| tid == id);
            let column: BoolArray = match supplied {
                Some((_, tuple)) => {
                    let values = tuple.raw_data();
                    build_index.iter().map(|b| values[*b as usize]).collect()
                }
                None if has_null_build_tuple => build_index.iter().map(|b| *b != 0).collect(),
                None => std::iter::repeat(true).take(build_index.len()).collect(),
            };
            (*id, column)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayImpl, I32Array};
    use crate::executor::hash_join::key::JoinKeyDesc;
    use crate::executor::hash_join::JoinType;
    use crate::types::{DataType, DataValue};

    fn items(tuples: Vec<(TupleId, BoolArray)>) -> JoinHashTableItems {
        let array: ArrayImpl = I32Array::from_iter(0..4).into();
        let chunk: DataChunk = [array].into_iter().collect();
        JoinHashTableItems::build(
            &[JoinKeyDesc::new(DataType::Int32)],
            &[DataType::Int32],
            &[chunk],
            tuples,
        )
        .unwrap()
    }

    fn param(right_to_nullable: bool, tuple_ids: Vec<TupleId>) -> JoinHashTableParam {
        JoinHashTableParam::new(
            JoinType::LeftOuter,
            vec![JoinKeyDesc::new(DataType::Int32)],
            vec![DataType::Int32, DataType::Int64],
            vec![DataType::Int32],
        )
        .with_right_to_nullable(right_to_nullable)
        .with_output_build_tuple_ids(tuple_ids)
    }

    #[test]
    fn test_probe_null_output() {
        let chunk = probe_output(&param(false, vec![]), None, &[0, 0, 0]);
        assert_eq!(chunk.cardinality(), 3);
        assert_eq!(chunk.column_count(), 2);
        assert_eq!(chunk.array_at(1).data_type(), DataType::Int64);
        assert!((0..3).all(|i| chunk.array_at(0).is_null(i)));
    }

    #[test]
    fn test_build_default_output() {
        let items = items(vec![]);
        let chunk = build_output(&items, &[0, 1, 4]);
        assert_eq!(chunk.array_at(0).get(0), DataValue::Null);
        assert_eq!(chunk.array_at(0).get(1), DataValue::Int32(0));
        assert_eq!(chunk.array_at(0).get(2), DataValue::Int32(3));
    }

    #[test]
    fn test_tuple_output_from_supplied_columns() {
        // row 0 is the null row
        let items = items(vec![(1, BoolArray::from_iter([false, true, false, true, true]))]);
        let columns = build_tuple_output(&param(false, vec![1, 2]), &items, &[0, 1, 2, 3], true);
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].0, 1);
        assert_eq!(columns[0].1.raw_data(), &[false, true, false, true]);
        // tuple 2 was not supplied by the build side
        assert_eq!(columns[1].0, 2);
        assert_eq!(columns[1].1.raw_data(), &[false, true, true, true]);
    }

    #[test]
    fn test_tuple_output_all_exist() {
        let items = items(vec![]);
        let columns = build_tuple_output(&param(false, vec![1, 2]), &items, &[1, 2, 3], false);
        assert_eq!(columns.len(), 2);
        assert!(columns.iter().all(|(_, c)| c.raw_data() == [true, true, true]));
    }

    #[test]
    fn test_tuple_output_skipped_for_nullable_build() {
        let items = items(vec![]);
        let columns = build_tuple_output(&param(true, vec![1, 2]), &items, &[0, 1], true);
        assert!(columns.is_empty());
    }
}
