// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};

use crate::array::DataChunk;
use crate::storage::{StorageResult, TracedStorageError};
use crate::types::DataType;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Columns of a primary-key tablet. The first `num_key_columns` columns form the key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSchema {
    columns: Vec<ColumnDesc>,
    num_key_columns: usize,
}

impl TabletSchema {
    pub fn new(columns: Vec<ColumnDesc>, num_key_columns: usize) -> StorageResult<Self> {
        if num_key_columns == 0 || num_key_columns > columns.len() {
            return Err(TracedStorageError::invalid_argument(format!(
                "bad key column count {} for {} columns",
                num_key_columns,
                columns.len()
            )));
        }
        if let Some(col) = columns[..num_key_columns].iter().find(|c| c.nullable) {
            return Err(TracedStorageError::invalid_argument(format!(
                "key column {} must not be nullable",
                col.name
            )));
        }
        Ok(Self {
            columns,
            num_key_columns,
        })
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn key_types(&self) -> impl Iterator<Item = DataType> + '_ {
        self.columns[..self.num_key_columns]
            .iter()
            .map(|c| c.data_type)
    }

    /// Check that `chunk` carries every column of the schema with the right type.
    pub fn check_chunk(&self, chunk: &DataChunk) -> StorageResult<()> {
        self.check_columns(chunk, self.columns.len())
    }

    /// Check that `chunk` carries exactly the key columns.
    pub fn check_key_chunk(&self, chunk: &DataChunk) -> StorageResult<()> {
        self.check_columns(chunk, self.num_key_columns)
    }

    fn check_columns(&self, chunk: &DataChunk, n: usize) -> StorageResult<()> {
        if chunk.column_count() != n {
            return Err(TracedStorageError::invalid_argument(format!(
                "expect {} columns, found {}",
                n,
                chunk.column_count()
            )));
        }
        for (desc, array) in self.columns.iter().zip(chunk.arrays()) {
            if desc.data_type != array.data_type() {
                return Err(TracedStorageError::invalid_argument(format!(
                    "column {} expects {}, found {}",
                    desc.name,
                    desc.data_type,
                    array.data_type()
                )));
            }
            if !desc.nullable && array.has_null() {
                return Err(TracedStorageError::invalid_argument(format!(
                    "column {} is not nullable",
                    desc.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ArrayImpl;

    #[test]
    fn test_schema_check() {
        assert!(TabletSchema::new(vec![ColumnDesc::new("k", DataType::Int32, true)], 1).is_err());
        let schema = TabletSchema::new(
            vec![
                ColumnDesc::new("k", DataType::Int32, false),
                ColumnDesc::new("v", DataType::Varchar, true),
            ],
            1,
        )
        .unwrap();
        let good: DataChunk = [
            ArrayImpl::Int32([1, 2].into_iter().collect()),
            ArrayImpl::Utf8([Some("a"), None].into_iter().collect()),
        ]
        .into_iter()
        .collect();
        schema.check_chunk(&good).unwrap();
        assert!(schema.check_key_chunk(&good).is_err());
        let bad: DataChunk = [
            ArrayImpl::Int32([Some(1), None].into_iter().collect()),
            ArrayImpl::Utf8([Some("a"), None].into_iter().collect()),
        ]
        .into_iter()
        .collect();
        assert!(schema.check_chunk(&bad).is_err());
    }
}
