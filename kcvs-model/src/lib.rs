//! Core data model definitions shared across the kcvs crates.
#![allow(missing_docs)]

pub mod buffer;
pub mod entry;
pub mod query;

pub use buffer::StaticBuffer;
pub use entry::{Entry, EntryList};
pub use query::{KeyRangeQuery, KeySliceQuery, SliceQuery};
