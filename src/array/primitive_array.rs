// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::iter::FromIterator;

use bitvec::vec::BitVec;
use serde::{Deserialize, Serialize};

use super::{Array, ArrayBuilder};
use crate::types::NativeType;

/// A collection of primitive types, such as `i32`, `i64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveArray<T: NativeType> {
    valid: BitVec,
    data: Vec<T>,
}

// Enable `collect()` an array from iterator of `Option<T>`.
impl<T: NativeType> FromIterator<Option<T>> for PrimitiveArray<T> {
    fn from_iter<I: IntoIterator<Item = Option<T>>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut builder = <Self as Array>::Builder::with_capacity(iter.size_hint().0);
        for e in iter {
            builder.push(e.as_ref());
        }
        builder.finish()
    }
}

// Enable `collect()` an array from iterator of `T`.
impl<T: NativeType> FromIterator<T> for PrimitiveArray<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter().map(Some).collect()
    }
}

impl<T: NativeType> Array for PrimitiveArray<T> {
    type Item = T;
    type Builder = PrimitiveArrayBuilder<T>;

    fn get(&self, idx: usize) -> Option<&T> {
        self.valid[idx].then(|| &self.data[idx])
    }

    fn len(&self) -> usize {
        self.valid.len()
    }
}

impl<T: NativeType> PrimitiveArray<T> {
    /// Build an array from raw values and a validity bitmap.
    pub fn from_data(data: impl IntoIterator<Item = T>, valid: BitVec) -> Self {
        let data: Vec<T> = data.into_iter().collect();
        assert_eq!(data.len(), valid.len(), "data and validity length mismatch");
        Self { valid, data }
    }

    /// Raw values. Slots of null elements hold `T::default()`.
    pub fn raw_data(&self) -> &[T] {
        &self.data
    }

    pub fn valid_bitmap(&self) -> &BitVec {
        &self.valid
    }

    pub fn is_null(&self, idx: usize) -> bool {
        !self.valid[idx]
    }
}

/// A builder that constructs a [`PrimitiveArray`] from `Option<T>`.
pub struct PrimitiveArrayBuilder<T: NativeType> {
    valid: BitVec,
    data: Vec<T>,
}

impl<T: NativeType> ArrayBuilder for PrimitiveArrayBuilder<T> {
    type Array = PrimitiveArray<T>;

    fn with_capacity(capacity: usize) -> Self {
        Self {
            valid: BitVec::with_capacity(capacity),
            data: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, value: Option<&T>) {
        self.valid.push(value.is_some());
        self.data.push(value.cloned().unwrap_or_default());
    }

    fn append(&mut self, other: &PrimitiveArray<T>) {
        self.valid.extend_from_bitslice(&other.valid);
        self.data.extend_from_slice(&other.data);
    }

    fn finish(self) -> PrimitiveArray<T> {
        PrimitiveArray {
            valid: self.valid,
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_i32() {
        let iter = (0..1000).map(|x| if x % 2 == 0 { None } else { Some(x) });
        let array = iter.clone().collect::<PrimitiveArray<i32>>();
        assert_eq!(
            array.iter().map(|x| x.cloned()).collect::<Vec<_>>(),
            iter.collect::<Vec<_>>()
        );
        assert_eq!(array.raw_data()[0], 0);
        assert!(array.is_null(0));
    }

    #[test]
    fn test_append() {
        let mut builder = PrimitiveArrayBuilder::<i64>::with_capacity(4);
        builder.push(None);
        builder.append(&[1i64, 2, 3].into_iter().collect());
        let array = builder.finish();
        assert_eq!(array.len(), 4);
        assert_eq!(array.get(0), None);
        assert_eq!(array.get(3), Some(&3));
    }
}
