// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::backtrace::Backtrace;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0}({1}) not found")]
    NotFound(&'static str, String),
    #[error("duplicated {0}: {1}")]
    Duplicated(&'static str, String),
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),
    #[error("JSON decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("timed out: {0}")]
    TimedOut(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("data corruption: {0}")]
    Corruption(String),
    #[error("tablet {0} is in error state")]
    TabletInError(u64),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Nested(#[from] Arc<TracedStorageError>),
}

impl From<std::io::Error> for TracedStorageError {
    #[inline]
    fn from(e: std::io::Error) -> TracedStorageError {
        StorageError::Io(e.into()).into()
    }
}

impl From<serde_json::Error> for TracedStorageError {
    #[inline]
    fn from(e: serde_json::Error) -> TracedStorageError {
        StorageError::JsonDecode(e).into()
    }
}

impl From<Arc<TracedStorageError>> for TracedStorageError {
    #[inline]
    fn from(e: Arc<TracedStorageError>) -> TracedStorageError {
        StorageError::Nested(e).into()
    }
}

/// [`StorageError`] with backtrace.
pub struct TracedStorageError {
    source: StorageError,
    backtrace: Backtrace,
}

impl From<StorageError> for TracedStorageError {
    #[inline]
    fn from(source: StorageError) -> TracedStorageError {
        TracedStorageError {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

impl std::fmt::Display for TracedStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}\n{}", self.source, self.backtrace)
    }
}

impl std::fmt::Debug for TracedStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for TracedStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl TracedStorageError {
    pub fn duplicated(ty: &'static str, item: impl ToString) -> Self {
        StorageError::Duplicated(ty, item.to_string()).into()
    }

    pub fn not_found(ty: &'static str, item: impl ToString) -> Self {
        StorageError::NotFound(ty, item.to_string()).into()
    }

    pub fn decode(message: impl ToString) -> Self {
        StorageError::Decode(message.to_string()).into()
    }

    pub fn internal(message: impl ToString) -> Self {
        StorageError::InternalError(message.to_string()).into()
    }

    pub fn timed_out(message: impl ToString) -> Self {
        StorageError::TimedOut(message.to_string()).into()
    }

    pub fn cancelled(message: impl ToString) -> Self {
        StorageError::Cancelled(message.to_string()).into()
    }

    pub fn corruption(message: impl ToString) -> Self {
        StorageError::Corruption(message.to_string()).into()
    }

    pub fn invalid_argument(message: impl ToString) -> Self {
        StorageError::InvalidArgument(message.to_string()).into()
    }

    pub fn tablet_in_error(tablet_id: u64) -> Self {
        StorageError::TabletInError(tablet_id).into()
    }

    /// The underlying error kind.
    pub fn kind(&self) -> &StorageError {
        &self.source
    }
}

pub type StorageResult<T> = std::result::Result<T, TracedStorageError>;
