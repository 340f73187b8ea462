// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use criterion::*;
use lightrock::array::{ArrayImpl, DataChunk, I32Array, I64Array, Utf8Array};
use lightrock::executor::{JoinHashTable, JoinHashTableParam, JoinKeyDesc, JoinOutput, JoinType};
use lightrock::types::DataType;

const BUILD_ROWS: i32 = 1 << 16;

/// `(key_a, key_b, name)` rows with keys in `[start, start + count)`.
fn chunk(count: i32, start: i32) -> DataChunk {
    let a: I32Array = (start..start + count).collect();
    let b: I64Array = (start..start + count).map(|i| i as i64 * 7).collect();
    let name: Utf8Array = (start..start + count).map(|i| Some(format!("n{i}"))).collect();
    [ArrayImpl::from(a), b.into(), name.into()].into_iter().collect()
}

fn param(keys: &[DataType]) -> JoinHashTableParam {
    JoinHashTableParam::new(
        JoinType::Inner,
        keys.iter().copied().map(JoinKeyDesc::new).collect(),
        vec![DataType::Int32, DataType::Int64, DataType::Varchar],
        vec![DataType::Int32, DataType::Int64, DataType::Varchar],
    )
}

fn build_table(keys: &[DataType], build: &[DataChunk]) -> JoinHashTable {
    let mut table = JoinHashTable::create(param(keys)).unwrap();
    for chunk in build {
        table.append_chunk(chunk.clone()).unwrap();
    }
    table.build().unwrap();
    table
}

fn strategies() -> [(&'static str, Vec<DataType>); 3] {
    [
        ("one_key", vec![DataType::Int32]),
        ("fixed64", vec![DataType::Int32, DataType::Int64]),
        ("serialized", vec![DataType::Int32, DataType::Int64, DataType::Varchar]),
    ]
}

fn hash_join_build(c: &mut Criterion) {
    let build = (0..BUILD_ROWS / 4096)
        .map(|i| chunk(4096, i * 4096))
        .collect::<Vec<_>>();
    let mut group = c.benchmark_group("hash join build");
    for (name, keys) in strategies() {
        group.bench_function(name, |b| b.iter(|| build_table(&keys, &build)));
    }
    group.finish();
}

fn hash_join_probe(c: &mut Criterion) {
    let build = (0..BUILD_ROWS / 4096)
        .map(|i| chunk(4096, i * 4096))
        .collect::<Vec<_>>();
    // half of the probe rows match
    let probe = chunk(4096, BUILD_ROWS - 2048);
    let mut group = c.benchmark_group("hash join probe");
    for (name, keys) in strategies() {
        let mut table = build_table(&keys, &build);
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut eos = false;
                let mut rows = 0;
                while !eos {
                    let mut output = JoinOutput::default();
                    table.probe(&probe, &mut output, &mut eos).unwrap();
                    rows += output.cardinality();
                }
                rows
            })
        });
    }
    group.finish();
}

criterion_group!(benches, hash_join_build, hash_join_probe);
criterion_main!(benches);
