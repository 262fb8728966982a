use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kcvs_model::{Entry, EntryList, KeyRangeQuery, KeySliceQuery, SliceQuery, StaticBuffer};
use parking_lot::RwLock;
use tracing::debug;

use crate::backend::{KeyColumnValueStore, KeyIterator, RecordIterator, StoreTransaction};
use crate::error::{BackendError, BackendResult};

type Row = BTreeMap<StaticBuffer, StaticBuffer>;
type Rows = BTreeMap<StaticBuffer, Row>;

/// Ordered in-memory key-column-value store.
#[derive(Debug)]
pub struct InMemoryKeyColumnValueStore {
    name: String,
    rows: Arc<RwLock<Rows>>,
    closed: AtomicBool,
}

impl InMemoryKeyColumnValueStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Arc::new(RwLock::new(BTreeMap::new())),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key_count(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> BackendResult<()> {
        if self.is_closed() {
            return Err(BackendError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn key_iterator(
        &self,
        start: Bound<StaticBuffer>,
        end: Option<StaticBuffer>,
        slice: SliceQuery,
    ) -> RowCursor {
        RowCursor {
            rows: Arc::clone(&self.rows),
            next_lower: start,
            end,
            slice,
            current: None,
            closed: false,
        }
    }
}

fn slice_row(row: &Row, slice: &SliceQuery) -> Vec<Entry> {
    if slice.slice_start() >= slice.slice_end() {
        return Vec::new();
    }
    let range = row.range((
        Bound::Included(slice.slice_start().clone()),
        Bound::Excluded(slice.slice_end().clone()),
    ));
    let limit = slice.limit().unwrap_or(usize::MAX);
    range
        .take(limit)
        .map(|(column, value)| Entry::new(column.clone(), value.clone()))
        .collect()
}

impl KeyColumnValueStore for InMemoryKeyColumnValueStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_slice(
        &self,
        query: &KeySliceQuery,
        _tx: &dyn StoreTransaction,
    ) -> BackendResult<EntryList> {
        self.ensure_open()?;
        let rows = self.rows.read();
        Ok(rows
            .get(&query.key)
            .map(|row| EntryList::from_entries(slice_row(row, &query.slice)))
            .unwrap_or_default())
    }

    fn get_keys_in_range(
        &self,
        query: &KeyRangeQuery,
        _tx: &dyn StoreTransaction,
    ) -> BackendResult<Box<dyn KeyIterator>> {
        self.ensure_open()?;
        Ok(Box::new(self.key_iterator(
            Bound::Included(query.key_start.clone()),
            Some(query.key_end.clone()),
            query.slice.clone(),
        )))
    }

    fn get_keys(
        &self,
        query: &SliceQuery,
        _tx: &dyn StoreTransaction,
    ) -> BackendResult<Box<dyn KeyIterator>> {
        self.ensure_open()?;
        Ok(Box::new(self.key_iterator(Bound::Unbounded, None, query.clone())))
    }

    fn mutate(
        &self,
        key: &StaticBuffer,
        additions: &[Entry],
        deletions: &[StaticBuffer],
        _tx: &dyn StoreTransaction,
    ) -> BackendResult<()> {
        self.ensure_open()?;
        let mut rows = self.rows.write();
        let row = rows.entry(key.clone()).or_default();
        for column in deletions {
            row.remove(column);
        }
        for entry in additions {
            row.insert(entry.column.clone(), entry.value.clone());
        }
        if row.is_empty() {
            rows.remove(key);
        }
        Ok(())
    }

    fn close(&self) -> BackendResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(store = %self.name, "closed in-memory store");
        }
        Ok(())
    }
}

/// Lazy cursor over the rows of an in-memory store.
///
/// Every step takes the read lock only long enough to seek past the previous
/// key, so concurrent writers are never blocked for the duration of a scan.
/// Rows with no entry inside the slice are skipped.
struct RowCursor {
    rows: Arc<RwLock<Rows>>,
    next_lower: Bound<StaticBuffer>,
    end: Option<StaticBuffer>,
    slice: SliceQuery,
    current: Option<Vec<Entry>>,
    closed: bool,
}

impl KeyIterator for RowCursor {
    fn next_key(&mut self) -> BackendResult<Option<StaticBuffer>> {
        if self.closed {
            return Err(BackendError::Closed("key iterator".to_string()));
        }
        if let (Some(end), Bound::Included(lower) | Bound::Excluded(lower)) =
            (&self.end, &self.next_lower)
            && lower >= end
        {
            self.current = None;
            return Ok(None);
        }
        let rows = self.rows.read();
        let upper = match &self.end {
            Some(end) => Bound::Excluded(end.clone()),
            None => Bound::Unbounded,
        };
        for (key, row) in rows.range((self.next_lower.clone(), upper)) {
            let entries = slice_row(row, &self.slice);
            if entries.is_empty() {
                continue;
            }
            self.next_lower = Bound::Excluded(key.clone());
            self.current = Some(entries);
            return Ok(Some(key.clone()));
        }
        self.current = None;
        Ok(None)
    }

    fn entries(&mut self) -> BackendResult<RecordIterator<'_>> {
        let entries = self.current.take().ok_or_else(|| {
            BackendError::Permanent("entries requested without a current key".to_string())
        })?;
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn close(&mut self) -> BackendResult<()> {
        self.closed = true;
        self.current = None;
        Ok(())
    }
}
