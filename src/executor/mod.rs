// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Vectorized executors.
//!
//! Executors work on [`DataChunk`](crate::array::DataChunk)s and report failures
//! through [`ExecutorError`].

pub use self::error::*;
pub use self::hash_join::*;

mod error;
pub mod hash_join;
