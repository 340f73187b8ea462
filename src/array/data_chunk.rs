// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::*;
use crate::types::DataValue;

/// A collection of arrays.
///
/// A chunk is a horizontal subset of a segment or a query result. A chunk may carry
/// zero columns, in which case its cardinality is tracked separately.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataChunk {
    arrays: SmallVec<[ArrayImpl; 16]>,
    cardinality: usize,
}

impl FromIterator<ArrayImpl> for DataChunk {
    /// # Panics
    ///
    /// Panics if the arrays do not share the same length.
    fn from_iter<I: IntoIterator<Item = ArrayImpl>>(iter: I) -> Self {
        let arrays: SmallVec<[ArrayImpl; 16]> = iter.into_iter().collect();
        let cardinality = arrays.first().map_or(0, |a| a.len());
        assert!(
            arrays.iter().all(|a| a.len() == cardinality),
            "all arrays must have the same length"
        );
        DataChunk {
            arrays,
            cardinality,
        }
    }
}

impl DataChunk {
    /// A chunk without columns, holding `cardinality` rows.
    pub fn no_column(cardinality: usize) -> Self {
        DataChunk {
            arrays: SmallVec::new(),
            cardinality,
        }
    }

    /// Return the number of rows in the chunk.
    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    pub fn is_empty(&self) -> bool {
        self.cardinality == 0
    }

    pub fn column_count(&self) -> usize {
        self.arrays.len()
    }

    /// Get the reference of array by index.
    pub fn array_at(&self, idx: usize) -> &ArrayImpl {
        &self.arrays[idx]
    }

    pub fn arrays(&self) -> &[ArrayImpl] {
        &self.arrays
    }

    pub fn get_row_by_idx(&self, idx: usize) -> Vec<DataValue> {
        self.arrays.iter().map(|arr| arr.get(idx)).collect()
    }

    /// Filter elements and create a new chunk.
    pub fn filter(&self, visibility: impl Iterator<Item = bool> + Clone) -> Self {
        let cardinality = visibility.clone().filter(|v| *v).count();
        let arrays = self
            .arrays
            .iter()
            .map(|a| a.filter(visibility.clone()))
            .collect();
        DataChunk {
            arrays,
            cardinality,
        }
    }

    /// Gather rows by index and create a new chunk.
    pub fn gather(&self, rows: &[u32]) -> Self {
        DataChunk {
            arrays: self.arrays.iter().map(|a| a.gather(rows)).collect(),
            cardinality: rows.len(),
        }
    }

    /// Keep the first `n` columns.
    pub fn project_prefix(&self, n: usize) -> Self {
        DataChunk {
            arrays: self.arrays.iter().take(n).cloned().collect(),
            cardinality: self.cardinality,
        }
    }

    /// Concatenate the columns of two chunks with the same cardinality.
    ///
    /// # Panics
    ///
    /// Panics if the cardinalities differ.
    pub fn concat_columns(mut self, other: DataChunk) -> Self {
        assert_eq!(self.cardinality, other.cardinality, "cardinality mismatch");
        self.arrays.extend(other.arrays);
        self
    }

    /// Estimated in-memory size in bytes.
    pub fn estimated_size(&self) -> usize {
        self.arrays.iter().map(|a| a.estimated_size()).sum()
    }
}

/// Concatenate chunks with identical schemas vertically.
///
/// Returns `None` for an empty input.
pub fn concat_chunks(chunks: &[DataChunk]) -> Option<DataChunk> {
    let first = chunks.first()?;
    if first.column_count() == 0 {
        return Some(DataChunk::no_column(
            chunks.iter().map(|c| c.cardinality()).sum(),
        ));
    }
    let mut builders = first
        .arrays()
        .iter()
        .map(ArrayBuilderImpl::from_type_of_array)
        .collect::<Vec<_>>();
    for chunk in chunks {
        for (builder, array) in builders.iter_mut().zip(chunk.arrays()) {
            builder.append(array);
        }
    }
    Some(builders.into_iter().map(|b| b.finish()).collect())
}
