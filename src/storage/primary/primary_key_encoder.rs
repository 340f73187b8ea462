// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Memcomparable encoding of primary keys.
//!
//! Integers are stored big-endian with the sign bit flipped, bools as one byte. A
//! varchar that is not the last key column is escaped (`0x00` becomes `0x00 0x01`)
//! and terminated by `0x00 0x00`, so byte order equals key order.

use crate::array::{Array, ArrayImpl, DataChunk};
use crate::storage::{StorageResult, TracedStorageError};
use crate::types::DataValue;

/// An encoded primary key.
pub type EncodedKey = Vec<u8>;

pub struct PrimaryKeyEncoder;

impl PrimaryKeyEncoder {
    /// Encode the first `num_key_columns` columns of every row of `chunk`.
    pub fn encode_chunk(chunk: &DataChunk, num_key_columns: usize) -> StorageResult<Vec<EncodedKey>> {
        if chunk.column_count() < num_key_columns {
            return Err(TracedStorageError::invalid_argument(format!(
                "chunk has {} columns, key needs {}",
                chunk.column_count(),
                num_key_columns
            )));
        }
        let mut keys = vec![Vec::new(); chunk.cardinality()];
        for col in 0..num_key_columns {
            let last = col + 1 == num_key_columns;
            let array = chunk.array_at(col);
            if array.has_null() {
                return Err(TracedStorageError::invalid_argument(format!(
                    "primary key column {col} contains null"
                )));
            }
            match array {
                ArrayImpl::Bool(a) => {
                    for (key, v) in keys.iter_mut().zip(a.raw_data()) {
                        key.push(*v as u8);
                    }
                }
                ArrayImpl::Int32(a) => {
                    for (key, v) in keys.iter_mut().zip(a.raw_data()) {
                        key.extend_from_slice(&((*v as u32) ^ (1 << 31)).to_be_bytes());
                    }
                }
                ArrayImpl::Int64(a) => {
                    for (key, v) in keys.iter_mut().zip(a.raw_data()) {
                        key.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
                    }
                }
                ArrayImpl::Utf8(a) => {
                    for (key, v) in keys.iter_mut().zip(a.iter()) {
                        encode_bytes(key, v.unwrap_or_default().as_bytes(), last);
                    }
                }
            }
        }
        Ok(keys)
    }

    /// Encode one key given as values.
    pub fn encode_values(values: &[DataValue]) -> StorageResult<EncodedKey> {
        let mut key = Vec::new();
        for (i, value) in values.iter().enumerate() {
            let last = i + 1 == values.len();
            match value {
                DataValue::Null => {
                    return Err(TracedStorageError::invalid_argument(
                        "primary key contains null",
                    ))
                }
                DataValue::Bool(v) => key.push(*v as u8),
                DataValue::Int32(v) => key.extend_from_slice(&((*v as u32) ^ (1 << 31)).to_be_bytes()),
                DataValue::Int64(v) => key.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes()),
                DataValue::String(v) => encode_bytes(&mut key, v.as_bytes(), last),
            }
        }
        Ok(key)
    }
}

fn encode_bytes(key: &mut Vec<u8>, bytes: &[u8], last: bool) {
    if last {
        key.extend_from_slice(bytes);
        return;
    }
    for b in bytes {
        key.push(*b);
        if *b == 0 {
            key.push(1);
        }
    }
    key.extend_from_slice(&[0, 0]);
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn enc(values: &[DataValue]) -> EncodedKey {
        PrimaryKeyEncoder::encode_values(values).unwrap()
    }

    #[test_case(DataValue::Int32(-5), DataValue::Int32(3))]
    #[test_case(DataValue::Int32(i32::MIN), DataValue::Int32(-1))]
    #[test_case(DataValue::Int64(-1), DataValue::Int64(0))]
    #[test_case(DataValue::Bool(false), DataValue::Bool(true))]
    #[test_case(DataValue::String("ab".into()), DataValue::String("b".into()))]
    fn test_order_preserved(small: DataValue, large: DataValue) {
        assert!(enc(&[small]) < enc(&[large]));
    }

    #[test]
    fn test_composite_order() {
        let a = enc(&[DataValue::String("a".into()), DataValue::Int32(9)]);
        let b = enc(&[DataValue::String("a\0".into()), DataValue::Int32(1)]);
        let c = enc(&[DataValue::String("ab".into()), DataValue::Int32(0)]);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_encode_chunk_matches_values() {
        let chunk: DataChunk = [
            ArrayImpl::Int64([7i64, -2].into_iter().collect()),
            ArrayImpl::Utf8([Some("x"), Some("")].into_iter().collect()),
        ]
        .into_iter()
        .collect();
        let keys = PrimaryKeyEncoder::encode_chunk(&chunk, 2).unwrap();
        assert_eq!(
            keys[1],
            enc(&[DataValue::Int64(-2), DataValue::String(String::new())])
        );
        assert!(PrimaryKeyEncoder::encode_values(&[DataValue::Null]).is_err());
    }
}
