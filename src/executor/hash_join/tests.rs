// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use bitvec::prelude::*;
use itertools::Itertools;
use test_case::test_case;

use super::*;
use crate::array::{ArrayImpl, I32Array, I64Array, Utf8Array};
use crate::types::DataValue;

/// Three int columns starting at `start`, `start + 10` and `start + 20`.
fn int32_chunk(count: i32, start: i32) -> DataChunk {
    [0, 10, 20]
        .into_iter()
        .map(|offset| -> ArrayImpl { I32Array::from_iter((0..count).map(|i| start + offset + i)).into() })
        .collect()
}

fn int32_param(join_type: JoinType) -> JoinHashTableParam {
    JoinHashTableParam::new(
        join_type,
        vec![JoinKeyDesc::new(DataType::Int32)],
        vec![DataType::Int32; 3],
        vec![DataType::Int32; 3],
    )
}

fn built(param: JoinHashTableParam, build: Vec<DataChunk>) -> JoinHashTable {
    let mut table = JoinHashTable::create(param).unwrap();
    for chunk in build {
        table.append_chunk(chunk).unwrap();
    }
    table.build().unwrap();
    table
}

/// Probe `chunk` until drained and collect all output rows.
fn probe_all(table: &mut JoinHashTable, chunk: &DataChunk) -> Vec<Vec<DataValue>> {
    let mut rows = vec![];
    let mut eos = false;
    while !eos {
        let mut output = JoinOutput::default();
        table.probe(chunk, &mut output, &mut eos).unwrap();
        rows.extend((0..output.cardinality()).map(|i| output.chunk.get_row_by_idx(i)));
    }
    rows
}

fn remain_all(table: &mut JoinHashTable) -> Vec<Vec<DataValue>> {
    let mut rows = vec![];
    let mut eos = false;
    while !eos {
        let mut output = JoinOutput::default();
        table.probe_remain(&mut output, &mut eos).unwrap();
        rows.extend((0..output.cardinality()).map(|i| output.chunk.get_row_by_idx(i)));
    }
    rows
}

fn int(v: i32) -> DataValue {
    DataValue::Int32(v)
}

#[test]
fn test_one_key_join_hash_table() {
    let mut table = built(int32_param(JoinType::Inner), vec![int32_chunk(10, 0)]);
    let probe = int32_chunk(5, 1);
    let mut output = JoinOutput::default();
    let mut eos = false;
    table.probe(&probe, &mut output, &mut eos).unwrap();
    assert!(eos);
    assert_eq!(table.match_flag(), MatchFlag::AllMatchOne);
    assert_eq!(output.chunk.column_count(), 6);
    assert_eq!(output.cardinality(), 5);
    for i in 0..5 {
        let v = 1 + i as i32;
        assert_eq!(
            output.chunk.get_row_by_idx(i),
            vec![int(v), int(v + 10), int(v + 20), int(v), int(v + 10), int(v + 20)]
        );
    }
    assert!(output.tuple_columns.is_empty());
}

#[test]
fn test_one_nullable_key_join_hash_table() {
    let keys: I32Array = (0..10).map(|i| (i % 2 == 0).then_some(i)).collect();
    let build: DataChunk = [
        ArrayImpl::from(keys),
        I32Array::from_iter(10..20).into(),
        I32Array::from_iter(20..30).into(),
    ]
    .into_iter()
    .collect();
    let mut table = built(int32_param(JoinType::Inner), vec![build]);
    assert!(table.has_null_build_key());

    let rows = probe_all(&mut table, &int32_chunk(10, 0));
    let keys = rows.iter().map(|r| r[3].clone()).collect_vec();
    assert_eq!(keys, [0, 2, 4, 6, 8].map(int));
}

#[test_case(vec![DataType::Int32], EqualityStrategy::OneKey(DataType::Int32))]
#[test_case(vec![DataType::Int32, DataType::Int32], EqualityStrategy::FixedSize64)]
#[test_case(vec![DataType::Int64, DataType::Int32], EqualityStrategy::FixedSize128)]
#[test_case(vec![DataType::Int32, DataType::Varchar], EqualityStrategy::Serialized)]
fn test_key_strategies_agree(types: Vec<DataType>, strategy: EqualityStrategy) {
    // every third build key is null, keys repeat twice
    let column = |ty: DataType, rows: i32, nulls: bool| -> ArrayImpl {
        let valid = move |i: i32| !nulls || i % 3 != 2;
        match ty {
            DataType::Int32 => (0..rows).map(|i| valid(i).then_some(i % 50)).collect::<I32Array>().into(),
            DataType::Int64 => (0..rows)
                .map(|i| valid(i).then_some((i % 50) as i64 * 1_000_000_007))
                .collect::<I64Array>()
                .into(),
            DataType::Varchar => (0..rows)
                .map(|i| valid(i).then(|| format!("k{}", i % 50)))
                .collect::<Utf8Array>()
                .into(),
            DataType::Bool => unreachable!(),
        }
    };
    let build: DataChunk = types.iter().map(|ty| column(*ty, 100, true)).collect();
    let probe: DataChunk = types.iter().map(|ty| column(*ty, 50, false)).collect();
    let param = JoinHashTableParam::new(
        JoinType::Inner,
        types.iter().map(|ty| JoinKeyDesc::new(*ty)).collect(),
        types.clone(),
        types.clone(),
    );
    let mut table = built(param, vec![build]);
    assert_eq!(table.strategy(), Some(strategy));

    let rows = probe_all(&mut table, &probe);
    let mut matched = rows.iter().map(|r| r[0].clone()).collect_vec();
    matched.sort();
    // build rows i and i + 50 hold key i % 50; rows with i % 3 == 2 are null
    let mut expected = (0..100)
        .filter(|i| i % 3 != 2)
        .map(|i| column(types[0], 50, false).get(i % 50))
        .collect_vec();
    expected.sort();
    assert_eq!(matched, expected);
}

#[test]
fn test_null_safe_key_matches_null() {
    let keys: I32Array = [Some(1), None, Some(3)].into_iter().collect();
    let build: DataChunk = [ArrayImpl::from(keys.clone())].into_iter().collect();
    let param = JoinHashTableParam::new(
        JoinType::Inner,
        vec![JoinKeyDesc::null_safe(DataType::Int32)],
        vec![DataType::Int32],
        vec![DataType::Int32],
    );
    let mut table = built(param, vec![build.clone()]);
    assert!(!table.has_null_build_key());
    let rows = probe_all(&mut table, &build);
    assert_eq!(
        rows,
        vec![
            vec![int(1), int(1)],
            vec![DataValue::Null, DataValue::Null],
            vec![int(3), int(3)]
        ]
    );
}

#[test]
fn test_skewed_probe_in_batches() {
    // every probe key matches three build rows
    let build = (0..3).map(|_| int32_chunk(4096, 0)).collect_vec();
    let param = int32_param(JoinType::Inner).with_chunk_size(1000);
    let mut table = built(param, build);
    let probe = int32_chunk(4096, 0);

    let mut total = 0;
    let mut calls = 0;
    let mut last_probe_key = -1;
    let mut eos = false;
    while !eos {
        let mut output = JoinOutput::default();
        table.probe(&probe, &mut output, &mut eos).unwrap();
        calls += 1;
        assert!(output.cardinality() <= 1000);
        for i in 0..output.cardinality() {
            let DataValue::Int32(k) = output.chunk.array_at(0).get(i) else {
                panic!("unexpected null");
            };
            assert!(k >= last_probe_key);
            last_probe_key = k;
        }
        total += output.cardinality();
    }
    assert_eq!(total, 12288);
    assert_eq!(calls, 13);
}

#[test]
fn test_left_outer_join() {
    let param = int32_param(JoinType::LeftOuter)
        .with_output_build_tuple_ids(vec![1]);
    let mut table = built(param, vec![int32_chunk(5, 0)]);
    let probe = int32_chunk(4, 3);
    let mut output = JoinOutput::default();
    let mut eos = false;
    table.probe(&probe, &mut output, &mut eos).unwrap();
    assert!(eos);
    assert_eq!(output.cardinality(), 4);
    assert_eq!(output.chunk.get_row_by_idx(0)[3], int(3));
    assert_eq!(output.chunk.get_row_by_idx(1)[3], int(4));
    assert_eq!(output.chunk.get_row_by_idx(2)[3], DataValue::Null);
    assert_eq!(output.chunk.get_row_by_idx(3)[5], DataValue::Null);
    assert_eq!(output.tuple_columns.len(), 1);
    assert_eq!(output.tuple_columns[0].1.raw_data(), &[true, true, false, false]);
}

#[test]
fn test_left_outer_join_nullable_build_has_no_tuple_column() {
    let param = int32_param(JoinType::LeftOuter)
        .with_right_to_nullable(true)
        .with_output_build_tuple_ids(vec![1]);
    let mut table = built(param, vec![int32_chunk(5, 0)]);
    let mut output = JoinOutput::default();
    let mut eos = false;
    table.probe(&int32_chunk(4, 3), &mut output, &mut eos).unwrap();
    assert!(output.tuple_columns.is_empty());
}

#[test]
fn test_build_tuples_are_gathered() {
    let param = int32_param(JoinType::LeftOuter).with_output_build_tuple_ids(vec![7]);
    let mut table = JoinHashTable::create(param).unwrap();
    table
        .append_chunk_with_tuples(
            int32_chunk(4, 0),
            vec![(7, BoolArray::from_iter([true, false, true, false]))],
        )
        .unwrap();
    table.build().unwrap();
    let mut output = JoinOutput::default();
    let mut eos = false;
    table.probe(&int32_chunk(5, 0), &mut output, &mut eos).unwrap();
    assert_eq!(output.tuple_columns[0].0, 7);
    assert_eq!(
        output.tuple_columns[0].1.raw_data(),
        &[true, false, true, false, false]
    );
}

#[test_case(JoinType::LeftSemi, vec![3, 4])]
#[test_case(JoinType::LeftAnti, vec![5, 6])]
fn test_left_semi_anti(join_type: JoinType, expected: Vec<i32>) {
    let mut table = built(int32_param(join_type), vec![int32_chunk(5, 0), int32_chunk(5, 0)]);
    let rows = probe_all(&mut table, &int32_chunk(4, 3));
    // probe columns only
    assert!(rows.iter().all(|r| r.len() == 3));
    assert_eq!(rows.iter().map(|r| r[0].clone()).collect_vec(), expected.into_iter().map(int).collect_vec());
}

#[test_case(JoinType::RightSemi, vec![3, 4], 0)]
#[test_case(JoinType::RightAnti, vec![0, 1, 2], 0)]
#[test_case(JoinType::RightOuter, vec![0, 1, 2], 2)]
#[test_case(JoinType::FullOuter, vec![0, 1, 2], 4)]
fn test_right_joins_sweep_build(join_type: JoinType, swept: Vec<i32>, probed: usize) {
    let mut table = built(int32_param(join_type), vec![int32_chunk(5, 0)]);
    // probe keys 3..7: 3 and 4 match
    let rows = probe_all(&mut table, &int32_chunk(4, 3));
    assert_eq!(rows.len(), probed);
    let rows = remain_all(&mut table);
    let width = if join_type.outputs_probe() { 6 } else { 3 };
    assert!(rows.iter().all(|r| r.len() == width));
    let build_keys = rows.iter().map(|r| r[width - 3].clone()).collect_vec();
    assert_eq!(build_keys, swept.into_iter().map(int).collect_vec());
    if join_type.outputs_probe() {
        assert!(rows.iter().all(|r| r[0] == DataValue::Null));
    }
}

#[test]
fn test_probe_remain_is_noop_for_left_joins() {
    let mut table = built(int32_param(JoinType::Inner), vec![int32_chunk(5, 0)]);
    assert!(remain_all(&mut table).is_empty());
}

/// Keep pairs where the probe's second column is even.
fn even_probe_value(chunk: &DataChunk) -> Result<BitVec> {
    Ok((0..chunk.cardinality())
        .map(|i| matches!(chunk.array_at(1).get(i), DataValue::Int32(v) if v % 2 == 0))
        .collect())
}

// both build rows of key 4 survive
#[test_case(JoinType::Inner, vec![(4, Some(4)), (4, Some(4))])]
#[test_case(JoinType::LeftOuter, vec![(4, Some(4)), (4, Some(4)), (5, None), (6, None), (3, None)])]
#[test_case(JoinType::LeftSemi, vec![(4, None)])]
#[test_case(JoinType::LeftAnti, vec![(5, None), (6, None), (3, None)])]
fn test_left_joins_with_other_conjunct(join_type: JoinType, expected: Vec<(i32, Option<i32>)>) {
    let param = int32_param(join_type).with_other_conjunct(even_probe_value);
    // two build rows per key
    let mut table = built(param, vec![int32_chunk(5, 0), int32_chunk(5, 0)]);
    // probe rows 3..7, second column 13..17: only probe key 4 passes
    let rows = probe_all(&mut table, &int32_chunk(4, 3));
    let got = rows
        .iter()
        .map(|r| {
            let DataValue::Int32(p) = r[0] else { panic!("null probe key") };
            let b = match r.get(3) {
                Some(DataValue::Int32(b)) => Some(*b),
                _ => None,
            };
            (p, b)
        })
        .collect_vec();
    assert_eq!(got, expected);
}

#[test_case(JoinType::RightSemi, vec![4])]
#[test_case(JoinType::RightAnti, vec![0, 1, 2, 3])]
#[test_case(JoinType::RightOuter, vec![0, 1, 2, 3])]
fn test_right_joins_with_other_conjunct(join_type: JoinType, swept: Vec<i32>) {
    let param = int32_param(join_type).with_other_conjunct(even_probe_value);
    let mut table = built(param, vec![int32_chunk(5, 0)]);
    let probed = probe_all(&mut table, &int32_chunk(4, 3));
    if join_type == JoinType::RightOuter {
        assert_eq!(probed.len(), 1);
        assert_eq!(probed[0][3], int(4));
    } else {
        assert!(probed.is_empty());
    }
    let rows = remain_all(&mut table);
    let width = if join_type.outputs_probe() { 6 } else { 3 };
    let build_keys = rows.iter().map(|r| r[width - 3].clone()).collect_vec();
    assert_eq!(build_keys, swept.into_iter().map(int).collect_vec());
}

#[test_case(JoinType::LeftOuter)]
#[test_case(JoinType::FullOuter)]
#[test_case(JoinType::LeftAnti)]
fn test_rejected_rows_respect_chunk_size(join_type: JoinType) {
    let param = int32_param(join_type)
        .with_chunk_size(4)
        .with_other_conjunct(|chunk: &DataChunk| -> Result<BitVec> {
            Ok(BitVec::repeat(false, chunk.cardinality()))
        });
    let mut table = built(param, vec![int32_chunk(100, 0)]);
    let probe = int32_chunk(100, 0);
    let mut rows = vec![];
    let mut eos = false;
    while !eos {
        let mut output = JoinOutput::default();
        table.probe(&probe, &mut output, &mut eos).unwrap();
        assert!(output.cardinality() <= 4, "batch of {} rows", output.cardinality());
        rows.extend((0..output.cardinality()).map(|i| output.chunk.get_row_by_idx(i)));
    }
    let keys = rows.iter().map(|r| r[0].clone()).sorted().collect_vec();
    assert_eq!(keys, (0..100).map(int).collect_vec());
    if join_type.outputs_build() {
        assert!(rows.iter().all(|r| r[3..].iter().all(|v| *v == DataValue::Null)));
    }

    // the next chunk starts from a clean state, its keys have no match
    let rows = probe_all(&mut table, &int32_chunk(3, 200));
    assert_eq!(rows.len(), 3);
}

#[test]
fn test_conjunct_length_mismatch() {
    let param = int32_param(JoinType::Inner)
        .with_other_conjunct(|_: &DataChunk| -> Result<BitVec> { Ok(bitvec![usize, Lsb0; 1]) });
    let mut table = built(param, vec![int32_chunk(5, 0)]);
    let mut output = JoinOutput::default();
    let mut eos = false;
    assert!(table.probe(&int32_chunk(3, 0), &mut output, &mut eos).is_err());
}

#[test]
fn test_invalid_usage() {
    assert!(JoinHashTable::create(JoinHashTableParam::new(
        JoinType::Inner,
        vec![],
        vec![DataType::Int32],
        vec![DataType::Int32],
    ))
    .is_err());
    assert!(JoinHashTable::create(JoinHashTableParam::new(
        JoinType::Inner,
        vec![JoinKeyDesc::new(DataType::Int64)],
        vec![DataType::Int32],
        vec![DataType::Int32],
    ))
    .is_err());

    let mut table = JoinHashTable::create(int32_param(JoinType::Inner)).unwrap();
    let mut output = JoinOutput::default();
    let mut eos = false;
    assert!(table.probe(&int32_chunk(1, 0), &mut output, &mut eos).is_err());
    let wrong: DataChunk = [ArrayImpl::from(I64Array::from_iter([1i64]))].into_iter().collect();
    assert!(table.append_chunk(wrong).is_err());
    table.build().unwrap();
    assert!(table.append_chunk(int32_chunk(1, 0)).is_err());
    assert!(table.build().is_err());
}

#[test]
fn test_memory_usage_grows_with_build() {
    let small = built(int32_param(JoinType::Inner), vec![int32_chunk(10, 0)]);
    let large = built(int32_param(JoinType::Inner), vec![int32_chunk(10000, 0)]);
    assert!(large.memory_usage() > small.memory_usage());
    assert_eq!(large.build_row_count(), 10000);
}
