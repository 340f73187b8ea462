// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Primary-key tablet storage with MVCC version management, and a vectorized
//! hash join engine working over the same columnar [`array`] model.

#![deny(unused_must_use)]

pub mod array;
pub mod executor;
pub mod storage;
pub mod types;
