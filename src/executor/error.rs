// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use crate::storage::TracedStorageError;
use crate::types::DataType;

/// The result type of execution.
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// The error type of execution.
#[derive(thiserror::Error, Debug, Clone)]
#[error(transparent)]
pub struct ExecutorError {
    inner: Arc<Inner>,
}

#[derive(thiserror::Error, Debug)]
enum Inner {
    #[error("storage error: {0}")]
    Storage(#[from] TracedStorageError),
    #[error("too many build rows: {0} exceeds the 32-bit row index space")]
    TooManyBuildRows(usize),
    #[error("unsupported join key type: {0}")]
    UnsupportedKeyType(DataType),
    #[error("join key type mismatch: expected {expected} but got {actual}")]
    KeyTypeMismatch { expected: DataType, actual: DataType },
    #[error("column length mismatch: expected {expected} but got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("failed to evaluate other conjunct: {0}")]
    Conjunct(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl From<Inner> for ExecutorError {
    fn from(e: Inner) -> Self {
        ExecutorError { inner: Arc::new(e) }
    }
}

impl From<TracedStorageError> for ExecutorError {
    fn from(e: TracedStorageError) -> Self {
        Inner::from(e).into()
    }
}

impl ExecutorError {
    pub fn too_many_build_rows(rows: usize) -> Self {
        Inner::TooManyBuildRows(rows).into()
    }
    pub fn unsupported_key_type(ty: DataType) -> Self {
        Inner::UnsupportedKeyType(ty).into()
    }
    pub fn key_type_mismatch(expected: DataType, actual: DataType) -> Self {
        Inner::KeyTypeMismatch { expected, actual }.into()
    }
    pub fn length_mismatch(expected: usize, actual: usize) -> Self {
        Inner::LengthMismatch { expected, actual }.into()
    }
    pub fn conjunct(message: impl ToString) -> Self {
        Inner::Conjunct(message.to_string()).into()
    }
    pub fn invalid_state(message: impl ToString) -> Self {
        Inner::InvalidState(message.to_string()).into()
    }

    /// Whether the build side exceeded the row index space.
    pub fn is_too_many_build_rows(&self) -> bool {
        matches!(*self.inner, Inner::TooManyBuildRows(_))
    }
}
