// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Utilities to shuffle [`Array`] content.

use itertools::Itertools;

use super::*;

/// Transform an [`Array`] to `Vec<Option<Item>>`.
pub trait ArrayToVecExt: Array {
    /// Transform an [`Array`] to `Vec<Option<Item>>`.
    ///
    /// ```
    /// use lightrock::array::*;
    ///
    /// let array = I32Array::from_iter([1, 3, 5, 7, 9].map(Some));
    /// assert_eq!(
    ///     array.to_vec(),
    ///     vec![Some(1), Some(3), Some(5), Some(7), Some(9)]
    /// );
    /// ```
    fn to_vec(&self) -> Vec<Option<<Self::Item as ToOwned>::Owned>> {
        self.iter().map(|x| x.map(|x| x.to_owned())).collect_vec()
    }
}

impl<T: Array> ArrayToVecExt for T {}

/// Append scattered array values into builder
pub trait ArrayBuilderPickExt: ArrayBuilder {
    /// Pick rows according to `logical_rows` from array to the current builder.
    ///
    /// For example, the `array` contains `[1, 3, 5, 7, 9]`, and `logical_rows` is
    /// `[4, 2, 0]`, then we will append `[9, 5, 1]` to the builder.
    ///
    /// ```
    /// use lightrock::array::*;
    ///
    /// let mut builder = I32ArrayBuilder::with_capacity(10);
    /// let array = I32Array::from_iter([1, 3, 5, 7, 9].map(Some));
    /// builder.pick_from(&array, &[4, 2, 0]);
    /// assert_eq!(builder.finish().to_vec(), vec![Some(9), Some(5), Some(1)]);
    /// ```
    fn pick_from(&mut self, array: &Self::Array, logical_rows: &[usize]) {
        for idx in logical_rows {
            self.push(array.get(*idx));
        }
    }

    /// Pick rows according to `logical_rows` from arrays to the current builder.
    fn pick_from_multiple(&mut self, arrays: &[&Self::Array], logical_rows: &[(usize, usize)]) {
        for (idx, row) in logical_rows {
            self.push(arrays[*idx].get(*row));
        }
    }
}

impl<T: ArrayBuilder> ArrayBuilderPickExt for T {}

pub trait ArrayImplBuilderPickExt {
    fn pick_from(&mut self, array: &ArrayImpl, logical_rows: &[usize]);

    fn pick_from_multiple(&mut self, arrays: &[&ArrayImpl], logical_rows: &[(usize, usize)]);
}

macro_rules! pick_arm {
    ($builder:expr, $array:expr, $rows:expr, [$($variant:ident),*]) => {
        match ($builder, $array) {
            $((ArrayBuilderImpl::$variant(builder), ArrayImpl::$variant(array)) => {
                builder.pick_from(array, $rows)
            })*
            _ => panic!("failed to pick rows: type mismatch"),
        }
    };
}

impl ArrayImplBuilderPickExt for ArrayBuilderImpl {
    fn pick_from(&mut self, array: &ArrayImpl, logical_rows: &[usize]) {
        pick_arm!(self, array, logical_rows, [Bool, Int32, Int64, Utf8])
    }

    fn pick_from_multiple(&mut self, arrays: &[&ArrayImpl], logical_rows: &[(usize, usize)]) {
        for (idx, row) in logical_rows {
            pick_arm!(&mut *self, arrays[*idx], &[*row], [Bool, Int32, Int64, Utf8])
        }
    }
}

impl ArrayImpl {
    /// Gather elements by `u32` row indices into a new array.
    ///
    /// ```
    /// use lightrock::array::*;
    ///
    /// let array: ArrayImpl = I32Array::from_iter([10, 20, 30].map(Some)).into();
    /// let picked = array.gather(&[2, 0, 2]);
    /// let picked: &I32Array = (&picked).try_into().unwrap();
    /// assert_eq!(picked.to_vec(), vec![Some(30), Some(10), Some(30)]);
    /// ```
    pub fn gather(&self, rows: &[u32]) -> ArrayImpl {
        let rows = rows.iter().map(|r| *r as usize).collect_vec();
        let mut builder = ArrayBuilderImpl::with_capacity(rows.len(), self.data_type());
        builder.pick_from(self, &rows);
        builder.finish()
    }
}
