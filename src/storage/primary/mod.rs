// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Primary-key tablets.
//!
//! Every tablet keeps a log of edit versions in the [`MetaStore`]. A version lists the
//! rowsets visible at that point. Upserts and deletes are resolved against the
//! [`PrimaryIndex`] when a version is applied, which marks superseded rows in
//! per-segment [`DelVector`]s.

pub use cache::*;
pub use compaction_state::*;
pub use context::*;
pub use delete_vector::*;
pub use edit_version::{CompactionInfo, EditVersion, EditVersionInfo, EditVersionMeta, RowsetId};
pub use engine::*;
pub use merge_iterator::*;
pub use meta_store::*;
pub use options::*;
pub use primary_index::*;
pub use primary_key_encoder::*;
pub use rowset::*;
pub use schema::*;
pub use tablet_meta_manager::*;
pub use tablet_updates::*;
pub use update_state::*;

// public modules and structures
mod context;
mod engine;
mod options;
mod schema;
mod tablet_updates;

// internal modules and structures
mod cache;
mod compaction_state;
mod compactor;
mod delete_vector;
mod edit_version;
mod merge_iterator;
mod meta_store;
mod primary_index;
mod primary_key_encoder;
mod rowset;
mod tablet_meta_manager;
mod update_state;

#[cfg(test)]
pub(crate) mod test_util;
