use std::ops::Deref;
use std::sync::Arc;

use crate::buffer::StaticBuffer;

/// A single (column, value) cell of a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Entry {
    pub column: StaticBuffer,
    pub value: StaticBuffer,
}

impl Entry {
    pub fn new(column: impl Into<StaticBuffer>, value: impl Into<StaticBuffer>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn column(&self) -> &StaticBuffer {
        &self.column
    }

    pub fn value(&self) -> &StaticBuffer {
        &self.value
    }
}

/// Immutable, column-ordered list of entries fetched for one (key, query) pair.
///
/// Cloning shares the underlying storage, so lists can be handed from puller
/// threads to processing threads without copying.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryList(Arc<[Entry]>);

impl EntryList {
    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }

    /// Builds a list from entries in any order; the result is sorted by column.
    pub fn from_entries(entries: impl IntoIterator<Item = Entry>) -> Self {
        let mut entries: Vec<Entry> = entries.into_iter().collect();
        entries.sort_by(|a, b| a.column.cmp(&b.column));
        Self(Arc::from(entries))
    }

    /// Looks up the entry for `column` by binary search.
    pub fn get(&self, column: &StaticBuffer) -> Option<&Entry> {
        self.0
            .binary_search_by(|entry| entry.column.cmp(column))
            .ok()
            .map(|idx| &self.0[idx])
    }

    pub fn columns(&self) -> impl Iterator<Item = &StaticBuffer> {
        self.0.iter().map(|entry| &entry.column)
    }
}

impl Default for EntryList {
    fn default() -> Self {
        Self::empty()
    }
}

impl Deref for EntryList {
    type Target = [Entry];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<Entry> for EntryList {
    fn from_iter<T: IntoIterator<Item = Entry>>(iter: T) -> Self {
        Self::from_entries(iter)
    }
}

impl<'a> IntoIterator for &'a EntryList {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
