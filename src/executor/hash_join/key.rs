// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Join key encodings.
//!
//! The key columns of a chunk are turned into one comparable value per row. Which
//! encoding is used depends on the key descriptors only, so build and probe side always
//! agree.

use bitvec::vec::BitVec;
use serde::{Deserialize, Serialize};

use super::helper::JoinHashMapHelper;
use crate::array::ArrayImpl;
use crate::executor::{ExecutorError, Result};
use crate::types::DataType;

/// Type and comparison mode of one equi-join key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinKeyDesc {
    pub data_type: DataType,
    /// `<=>` semantics: null equals null.
    pub null_safe: bool,
}

impl JoinKeyDesc {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            null_safe: false,
        }
    }

    pub fn null_safe(data_type: DataType) -> Self {
        Self {
            data_type,
            null_safe: true,
        }
    }
}

/// How the key columns of a row are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqualityStrategy {
    /// One fixed-width column, compared directly.
    OneKey(DataType),
    /// Fixed-width columns packed into a `u64`.
    FixedSize64,
    /// Fixed-width columns packed into a `u128`.
    FixedSize128,
    /// Length-prefixed bytes of every column.
    Serialized,
}

impl EqualityStrategy {
    pub fn select(keys: &[JoinKeyDesc]) -> Self {
        if keys.iter().any(|k| k.null_safe) {
            return Self::Serialized;
        }
        if let [key] = keys {
            if key.data_type.fixed_width().is_some() {
                return Self::OneKey(key.data_type);
            }
        }
        let widths: Option<usize> = keys.iter().map(|k| k.data_type.fixed_width()).sum();
        match widths {
            Some(w) if w <= 8 => Self::FixedSize64,
            Some(w) if w <= 16 => Self::FixedSize128,
            _ => Self::Serialized,
        }
    }
}

/// Per-row operations the probe loop needs from an encoded key column.
pub trait KeyColumn {
    fn len(&self) -> usize;
    fn is_null(&self, row: usize) -> bool;
    fn hash_at(&self, row: usize) -> u32;
    fn equals(&self, row: usize, other: &Self, other_row: usize) -> bool;
}

/// Values that can be hashed as a single fixed-width key.
pub trait FixedKey: Copy + Eq + Default {
    fn hash_key(self) -> u32;
}

impl FixedKey for bool {
    fn hash_key(self) -> u32 {
        JoinHashMapHelper::hash_u64(self as u64)
    }
}

impl FixedKey for i32 {
    fn hash_key(self) -> u32 {
        JoinHashMapHelper::hash_u64(self as u32 as u64)
    }
}

impl FixedKey for i64 {
    fn hash_key(self) -> u32 {
        JoinHashMapHelper::hash_u64(self as u64)
    }
}

impl FixedKey for u64 {
    fn hash_key(self) -> u32 {
        JoinHashMapHelper::hash_u64(self)
    }
}

impl FixedKey for u128 {
    fn hash_key(self) -> u32 {
        JoinHashMapHelper::hash_u128(self)
    }
}

/// Fixed-width keys with an optional null bitmap.
#[derive(Debug, Clone, Default)]
pub struct FixedKeys<K> {
    pub values: Vec<K>,
    /// Set bits are null rows. `None` if the keys contain no null.
    pub nulls: Option<BitVec>,
}

impl<K: FixedKey> KeyColumn for FixedKeys<K> {
    fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    fn is_null(&self, row: usize) -> bool {
        self.nulls.as_ref().is_some_and(|n| n[row])
    }

    #[inline]
    fn hash_at(&self, row: usize) -> u32 {
        self.values[row].hash_key()
    }

    #[inline]
    fn equals(&self, row: usize, other: &Self, other_row: usize) -> bool {
        self.values[row] == other.values[other_row]
    }
}

/// Keys serialized into one contiguous buffer.
#[derive(Debug, Clone)]
pub struct SerializedKeys {
    data: Vec<u8>,
    offsets: Vec<usize>,
    nulls: Option<BitVec>,
}

impl SerializedKeys {
    pub fn key(&self, row: usize) -> &[u8] {
        &self.data[self.offsets[row]..self.offsets[row + 1]]
    }
}

impl KeyColumn for SerializedKeys {
    fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    #[inline]
    fn is_null(&self, row: usize) -> bool {
        self.nulls.as_ref().is_some_and(|n| n[row])
    }

    #[inline]
    fn hash_at(&self, row: usize) -> u32 {
        JoinHashMapHelper::hash_bytes(self.key(row))
    }

    #[inline]
    fn equals(&self, row: usize, other: &Self, other_row: usize) -> bool {
        self.key(row) == other.key(other_row)
    }
}

/// Encoded key column of a chunk.
#[derive(Debug, Clone)]
pub enum JoinKeys {
    Bool(FixedKeys<bool>),
    Int32(FixedKeys<i32>),
    Int64(FixedKeys<i64>),
    Fixed64(FixedKeys<u64>),
    Fixed128(FixedKeys<u128>),
    Serialized(SerializedKeys),
}

/// Dispatch on a [`JoinKeys`] value, binding the inner key column.
macro_rules! for_all_keys {
    ($keys:expr, $k:ident => $body:expr) => {
        match $keys {
            JoinKeys::Bool($k) => $body,
            JoinKeys::Int32($k) => $body,
            JoinKeys::Int64($k) => $body,
            JoinKeys::Fixed64($k) => $body,
            JoinKeys::Fixed128($k) => $body,
            JoinKeys::Serialized($k) => $body,
        }
    };
}
pub(super) use for_all_keys;

impl JoinKeys {
    /// Encode the key `columns` with the given strategy.
    pub fn encode(
        strategy: EqualityStrategy,
        descs: &[JoinKeyDesc],
        columns: &[ArrayImpl],
    ) -> Result<Self> {
        if descs.len() != columns.len() {
            return Err(ExecutorError::length_mismatch(descs.len(), columns.len()));
        }
        for (desc, column) in descs.iter().zip(columns) {
            if desc.data_type != column.data_type() {
                return Err(ExecutorError::key_type_mismatch(
                    desc.data_type,
                    column.data_type(),
                ));
            }
        }
        let rows = columns.first().map_or(0, |c| c.len());
        for column in columns {
            if column.len() != rows {
                return Err(ExecutorError::length_mismatch(rows, column.len()));
            }
        }
        let keys = match strategy {
            EqualityStrategy::OneKey(_) => match &columns[0] {
                ArrayImpl::Bool(a) => Self::Bool(one_key(a.raw_data(), &columns[..1])),
                ArrayImpl::Int32(a) => Self::Int32(one_key(a.raw_data(), &columns[..1])),
                ArrayImpl::Int64(a) => Self::Int64(one_key(a.raw_data(), &columns[..1])),
                ArrayImpl::Utf8(_) => {
                    return Err(ExecutorError::unsupported_key_type(DataType::Varchar))
                }
            },
            EqualityStrategy::FixedSize64 => {
                let packed = pack_fixed(columns, rows)?;
                Self::Fixed64(FixedKeys {
                    values: packed.into_iter().map(|v| v as u64).collect(),
                    nulls: null_rows(columns, rows),
                })
            }
            EqualityStrategy::FixedSize128 => Self::Fixed128(FixedKeys {
                values: pack_fixed(columns, rows)?,
                nulls: null_rows(columns, rows),
            }),
            EqualityStrategy::Serialized => Self::Serialized(serialize(descs, columns, rows)),
        };
        Ok(keys)
    }

    pub fn len(&self) -> usize {
        for_all_keys!(self, k => k.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_null(&self, row: usize) -> bool {
        for_all_keys!(self, k => k.is_null(row))
    }

    pub fn estimated_size(&self) -> usize {
        match self {
            Self::Bool(k) => k.values.len(),
            Self::Int32(k) => k.values.len() * 4,
            Self::Int64(k) => k.values.len() * 8,
            Self::Fixed64(k) => k.values.len() * 8,
            Self::Fixed128(k) => k.values.len() * 16,
            Self::Serialized(k) => k.data.len() + k.offsets.len() * std::mem::size_of::<usize>(),
        }
    }
}

fn one_key<K: FixedKey>(data: &[K], columns: &[ArrayImpl]) -> FixedKeys<K> {
    FixedKeys {
        values: data.to_vec(),
        nulls: null_rows(columns, data.len()),
    }
}

/// Rows where any of `columns` is null, or `None` if there is none.
fn null_rows(columns: &[ArrayImpl], rows: usize) -> Option<BitVec> {
    if !columns.iter().any(|c| c.has_null()) {
        return None;
    }
    Some(
        (0..rows)
            .map(|i| columns.iter().any(|c| c.is_null(i)))
            .collect(),
    )
}

/// Pack fixed-width columns into one integer per row, column 0 in the lowest bytes.
fn pack_fixed(columns: &[ArrayImpl], rows: usize) -> Result<Vec<u128>> {
    let mut packed = vec![0u128; rows];
    let mut shift = 0;
    for column in columns {
        match column {
            ArrayImpl::Bool(a) => {
                for (p, v) in packed.iter_mut().zip(a.raw_data()) {
                    *p |= (*v as u128) << shift;
                }
                shift += 8;
            }
            ArrayImpl::Int32(a) => {
                for (p, v) in packed.iter_mut().zip(a.raw_data()) {
                    *p |= (*v as u32 as u128) << shift;
                }
                shift += 32;
            }
            ArrayImpl::Int64(a) => {
                for (p, v) in packed.iter_mut().zip(a.raw_data()) {
                    *p |= (*v as u64 as u128) << shift;
                }
                shift += 64;
            }
            ArrayImpl::Utf8(_) => return Err(ExecutorError::unsupported_key_type(DataType::Varchar)),
        }
    }
    // null slots may hold arbitrary values
    if let Some(nulls) = null_rows(columns, rows) {
        for i in nulls.iter_ones() {
            packed[i] = 0;
        }
    }
    Ok(packed)
}

/// Serialize each row's key columns.
///
/// Null-safe columns write a leading indicator byte (1 for null) so that null rows
/// compare equal. Integers are little-endian, strings carry a `u32` length prefix.
fn serialize(descs: &[JoinKeyDesc], columns: &[ArrayImpl], rows: usize) -> SerializedKeys {
    let mut data = Vec::with_capacity(rows * 8 * columns.len());
    let mut offsets = Vec::with_capacity(rows + 1);
    let mut nulls: Option<BitVec> = None;
    offsets.push(0);
    for i in 0..rows {
        let mut row_null = false;
        for (desc, column) in descs.iter().zip(columns) {
            let is_null = column.is_null(i);
            if desc.null_safe {
                data.push(is_null as u8);
                if is_null {
                    continue;
                }
            } else if is_null {
                row_null = true;
                break;
            }
            match column {
                ArrayImpl::Bool(a) => data.push(a.raw_data()[i] as u8),
                ArrayImpl::Int32(a) => data.extend_from_slice(&a.raw_data()[i].to_le_bytes()),
                ArrayImpl::Int64(a) => data.extend_from_slice(&a.raw_data()[i].to_le_bytes()),
                ArrayImpl::Utf8(a) => {
                    let bytes = a.value_bytes(i);
                    data.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    data.extend_from_slice(bytes);
                }
            }
        }
        if row_null {
            // drop partial bytes of the null row
            data.truncate(offsets[i]);
            nulls.get_or_insert_with(|| BitVec::repeat(false, rows)).set(i, true);
        }
        offsets.push(data.len());
    }
    SerializedKeys {
        data,
        offsets,
        nulls,
    }
}
