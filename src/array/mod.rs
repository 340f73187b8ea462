// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! In-memory columnar arrays.

use serde::{Deserialize, Serialize};

use crate::types::{DataType, DataValue};

mod data_chunk;
mod iterator;
mod primitive_array;
mod shuffle_ext;
mod utf8_array;

pub use self::data_chunk::*;
pub use self::iterator::ArrayIter;
pub use self::primitive_array::*;
pub use self::shuffle_ext::*;
pub use self::utf8_array::*;

/// A trait over all array builders.
///
/// `ArrayBuilder` is a trait over all builders. You could build an array with
/// `push` with the help of `ArrayBuilder` trait. The `push` function always
/// accepts reference to an element. e.g. for `PrimitiveArray`,
/// you must do `builder.push(Some(&1))`. For `Utf8Array`, you must do
/// `builder.push(Some("xxx"))`.
pub trait ArrayBuilder {
    /// Corresponding `Array` of this builder
    type Array: Array<Builder = Self>;

    /// Create a new builder with `capacity`.
    fn with_capacity(capacity: usize) -> Self;

    /// Append a value to builder.
    fn push(&mut self, value: Option<&<Self::Array as Array>::Item>);

    /// Append an array to builder.
    fn append(&mut self, other: &Self::Array);

    /// Finish build and return a new array.
    fn finish(self) -> Self::Array;
}

/// A trait over all arrays.
///
/// The `Item` is the item you could retrieve from this array. For example,
/// `PrimitiveArray<i32>` returns an `Option<&i32>`, and `Utf8Array` returns
/// an `Option<&str>`.
pub trait Array: Sized {
    /// Corresponding builder of this array.
    type Builder: ArrayBuilder<Array = Self>;

    /// Type of element in the array.
    type Item: ?Sized + ToOwned;

    /// Retrieve a reference to value.
    fn get(&self, idx: usize) -> Option<&Self::Item>;

    /// Number of items of array.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get iterator of current array.
    fn iter(&self) -> ArrayIter<'_, Self> {
        ArrayIter::new(self)
    }
}

pub type BoolArray = PrimitiveArray<bool>;
pub type I32Array = PrimitiveArray<i32>;
pub type I64Array = PrimitiveArray<i64>;
pub type BoolArrayBuilder = PrimitiveArrayBuilder<bool>;
pub type I32ArrayBuilder = PrimitiveArrayBuilder<i32>;
pub type I64ArrayBuilder = PrimitiveArrayBuilder<i64>;

/// Embeds all possible arrays in `array` module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayImpl {
    Bool(BoolArray),
    Int32(I32Array),
    Int64(I64Array),
    Utf8(Utf8Array),
}

/// Embeds all possible array builders in `array` module.
pub enum ArrayBuilderImpl {
    Bool(BoolArrayBuilder),
    Int32(I32ArrayBuilder),
    Int64(I64ArrayBuilder),
    Utf8(Utf8ArrayBuilder),
}

macro_rules! impl_into {
    ($x:ty, $y:ident) => {
        impl From<$x> for ArrayImpl {
            fn from(array: $x) -> Self {
                Self::$y(array)
            }
        }

        impl<'a> TryFrom<&'a ArrayImpl> for &'a $x {
            type Error = ();

            fn try_from(array: &'a ArrayImpl) -> Result<Self, Self::Error> {
                match array {
                    ArrayImpl::$y(array) => Ok(array),
                    _ => Err(()),
                }
            }
        }
    };
}

impl_into! { BoolArray, Bool }
impl_into! { I32Array, Int32 }
impl_into! { I64Array, Int64 }
impl_into! { Utf8Array, Utf8 }

impl ArrayImpl {
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(a) => a.len(),
            Self::Int32(a) => a.len(),
            Self::Int64(a) => a.len(),
            Self::Utf8(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Utf8(_) => DataType::Varchar,
        }
    }

    pub fn is_null(&self, idx: usize) -> bool {
        match self {
            Self::Bool(a) => a.is_null(idx),
            Self::Int32(a) => a.is_null(idx),
            Self::Int64(a) => a.is_null(idx),
            Self::Utf8(a) => a.is_null(idx),
        }
    }

    /// Whether any element of the array is null.
    pub fn has_null(&self) -> bool {
        (0..self.len()).any(|i| self.is_null(i))
    }

    /// Get the value at the given index.
    pub fn get(&self, idx: usize) -> DataValue {
        match self {
            Self::Bool(a) => a.get(idx).map_or(DataValue::Null, |v| DataValue::Bool(*v)),
            Self::Int32(a) => a.get(idx).map_or(DataValue::Null, |v| DataValue::Int32(*v)),
            Self::Int64(a) => a.get(idx).map_or(DataValue::Null, |v| DataValue::Int64(*v)),
            Self::Utf8(a) => a
                .get(idx)
                .map_or(DataValue::Null, |v| DataValue::String(v.to_string())),
        }
    }

    /// Filter the elements and return a new array.
    pub fn filter(&self, visibility: impl Iterator<Item = bool>) -> Self {
        let rows = visibility
            .enumerate()
            .filter_map(|(i, visible)| visible.then_some(i))
            .collect::<Vec<_>>();
        let mut builder = ArrayBuilderImpl::with_capacity(rows.len(), self.data_type());
        builder.pick_from(self, &rows);
        builder.finish()
    }

    /// Estimated in-memory size in bytes.
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::Bool(a) => a.len() + a.len() / 8,
            Self::Int32(a) => a.len() * 4 + a.len() / 8,
            Self::Int64(a) => a.len() * 8 + a.len() / 8,
            Self::Utf8(a) => a.data_len() + a.len() * std::mem::size_of::<usize>() + a.len() / 8,
        }
    }
}

impl ArrayBuilderImpl {
    /// Create a new array builder from data type.
    pub fn with_capacity(capacity: usize, ty: DataType) -> Self {
        match ty {
            DataType::Bool => Self::Bool(BoolArrayBuilder::with_capacity(capacity)),
            DataType::Int32 => Self::Int32(I32ArrayBuilder::with_capacity(capacity)),
            DataType::Int64 => Self::Int64(I64ArrayBuilder::with_capacity(capacity)),
            DataType::Varchar => Self::Utf8(Utf8ArrayBuilder::with_capacity(capacity)),
        }
    }

    /// Create a builder of the same type as `array`.
    pub fn from_type_of_array(array: &ArrayImpl) -> Self {
        Self::with_capacity(0, array.data_type())
    }

    /// Appends an element to the back of array.
    ///
    /// # Panics
    ///
    /// Panics if the value does not match the builder type.
    pub fn push(&mut self, v: &DataValue) {
        match (self, v) {
            (Self::Bool(a), DataValue::Bool(v)) => a.push(Some(v)),
            (Self::Int32(a), DataValue::Int32(v)) => a.push(Some(v)),
            (Self::Int64(a), DataValue::Int64(v)) => a.push(Some(v)),
            (Self::Utf8(a), DataValue::String(v)) => a.push(Some(v)),
            (b, DataValue::Null) => b.push_null(),
            _ => panic!("failed to push value: type mismatch"),
        }
    }

    pub fn push_null(&mut self) {
        match self {
            Self::Bool(a) => a.push(None),
            Self::Int32(a) => a.push(None),
            Self::Int64(a) => a.push(None),
            Self::Utf8(a) => a.push(None),
        }
    }

    /// Appends an `ArrayImpl`.
    ///
    /// # Panics
    ///
    /// Panics if the array does not match the builder type.
    pub fn append(&mut self, array_impl: &ArrayImpl) {
        match (self, array_impl) {
            (Self::Bool(builder), ArrayImpl::Bool(arr)) => builder.append(arr),
            (Self::Int32(builder), ArrayImpl::Int32(arr)) => builder.append(arr),
            (Self::Int64(builder), ArrayImpl::Int64(arr)) => builder.append(arr),
            (Self::Utf8(builder), ArrayImpl::Utf8(arr)) => builder.append(arr),
            _ => panic!("failed to append array: type mismatch"),
        }
    }

    /// Finish build and return a new array.
    pub fn finish(self) -> ArrayImpl {
        match self {
            Self::Bool(a) => ArrayImpl::Bool(a.finish()),
            Self::Int32(a) => ArrayImpl::Int32(a.finish()),
            Self::Int64(a) => ArrayImpl::Int64(a.finish()),
            Self::Utf8(a) => ArrayImpl::Utf8(a.finish()),
        }
    }
}
