use std::fmt::{self, Display};

use crate::buffer::StaticBuffer;

/// Column range `[slice_start, slice_end)` to fetch for a row, optionally capped
/// at `limit` entries.
///
/// Queries are compared by value; a scan uses them as keys of the per-row
/// result map handed to the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SliceQuery {
    slice_start: StaticBuffer,
    slice_end: StaticBuffer,
    limit: Option<usize>,
}

impl SliceQuery {
    pub fn new(slice_start: impl Into<StaticBuffer>, slice_end: impl Into<StaticBuffer>) -> Self {
        Self {
            slice_start: slice_start.into(),
            slice_end: slice_end.into(),
            limit: None,
        }
    }

    /// Query covering every column: start all `0x00`, end all `0xFF` of
    /// `column_len` bytes.
    pub fn full_range(column_len: usize) -> Self {
        Self::new(StaticBuffer::zero(column_len), StaticBuffer::one(column_len))
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn slice_start(&self) -> &StaticBuffer {
        &self.slice_start
    }

    pub fn slice_end(&self) -> &StaticBuffer {
        &self.slice_end
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn contains(&self, column: &StaticBuffer) -> bool {
        self.slice_start <= *column && *column < self.slice_end
    }

    /// Whether the range spans the whole column space, which is what a
    /// grounding query of a multi-query scan must do.
    pub fn spans_full_range(&self) -> bool {
        self.slice_start.is_all_zeros() && self.slice_end.is_all_ones()
    }
}

impl Display for SliceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.slice_start, self.slice_end)?;
        if let Some(limit) = self.limit {
            write!(f, " limit {limit}")?;
        }
        Ok(())
    }
}

/// A [`SliceQuery`] bound to one row key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeySliceQuery {
    pub key: StaticBuffer,
    pub slice: SliceQuery,
}

impl KeySliceQuery {
    pub fn new(key: impl Into<StaticBuffer>, slice: SliceQuery) -> Self {
        Self {
            key: key.into(),
            slice,
        }
    }
}

/// A [`SliceQuery`] applied to every key in `[key_start, key_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeyRangeQuery {
    pub key_start: StaticBuffer,
    pub key_end: StaticBuffer,
    pub slice: SliceQuery,
}

impl KeyRangeQuery {
    pub fn new(
        key_start: impl Into<StaticBuffer>,
        key_end: impl Into<StaticBuffer>,
        slice: SliceQuery,
    ) -> Self {
        Self {
            key_start: key_start.into(),
            key_end: key_end.into(),
            slice,
        }
    }

    pub fn contains_key(&self, key: &StaticBuffer) -> bool {
        self.key_start <= *key && *key < self.key_end
    }
}
