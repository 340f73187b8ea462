// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::iter::FromIterator;

use bitvec::vec::BitVec;
use serde::{Deserialize, Serialize};

use super::{Array, ArrayBuilder};

/// A collection of variable-length strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utf8Array {
    offset: Vec<usize>,
    valid: BitVec,
    data: String,
}

impl Array for Utf8Array {
    type Item = str;
    type Builder = Utf8ArrayBuilder;

    fn get(&self, idx: usize) -> Option<&str> {
        if self.valid[idx] {
            Some(&self.data[self.offset[idx]..self.offset[idx + 1]])
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.valid.len()
    }
}

impl Utf8Array {
    pub fn is_null(&self, idx: usize) -> bool {
        !self.valid[idx]
    }

    /// Bytes of the element at `idx`, empty for null.
    pub fn value_bytes(&self, idx: usize) -> &[u8] {
        &self.data.as_bytes()[self.offset[idx]..self.offset[idx + 1]]
    }

    /// Total length of the string payload.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// A builder that uses `&str` to build an [`Utf8Array`].
pub struct Utf8ArrayBuilder {
    offset: Vec<usize>,
    valid: BitVec,
    data: String,
}

impl ArrayBuilder for Utf8ArrayBuilder {
    type Array = Utf8Array;

    fn with_capacity(capacity: usize) -> Self {
        let mut offset = Vec::with_capacity(capacity + 1);
        offset.push(0);
        Self {
            offset,
            data: String::with_capacity(capacity),
            valid: BitVec::with_capacity(capacity),
        }
    }

    fn push(&mut self, value: Option<&str>) {
        self.valid.push(value.is_some());
        if let Some(x) = value {
            self.data.push_str(x);
        }
        self.offset.push(self.data.len());
    }

    fn append(&mut self, other: &Utf8Array) {
        self.valid.extend_from_bitslice(&other.valid);
        self.data.push_str(&other.data);
        let start = self.offset.last().copied().unwrap_or(0);
        for other_offset in &other.offset[1..] {
            self.offset.push(*other_offset + start);
        }
    }

    fn finish(self) -> Utf8Array {
        Utf8Array {
            valid: self.valid,
            data: self.data,
            offset: self.offset,
        }
    }
}

// Enable `collect()` an array from iterator of `Option<&str>` or `Option<String>`.
impl<Str: AsRef<str>> FromIterator<Option<Str>> for Utf8Array {
    fn from_iter<I: IntoIterator<Item = Option<Str>>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut builder = Utf8ArrayBuilder::with_capacity(iter.size_hint().0);
        for e in iter {
            builder.push(e.as_ref().map(|s| s.as_ref()));
        }
        builder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_builder() {
        let mut builder = Utf8ArrayBuilder::with_capacity(100);
        for i in 0..100 {
            if i % 2 == 0 {
                builder.push(Some(&format!("{}", i)));
            } else {
                builder.push(None);
            }
        }
        let array = builder.finish();
        assert_eq!(array.get(10), Some("10"));
        assert_eq!(array.get(11), None);
        assert_eq!(array.value_bytes(11), b"");
    }

    #[test]
    fn test_utf8_append() {
        let a: Utf8Array = [Some("ab"), None].into_iter().collect();
        let b: Utf8Array = [Some("cde")].into_iter().collect();
        let mut builder = Utf8ArrayBuilder::with_capacity(3);
        builder.append(&a);
        builder.append(&b);
        let array = builder.finish();
        assert_eq!(
            array.iter().collect::<Vec<_>>(),
            vec![Some("ab"), None, Some("cde")]
        );
    }
}
