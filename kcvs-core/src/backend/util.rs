use kcvs_model::{KeyRangeQuery, SliceQuery, StaticBuffer};

use super::{KeyColumnValueStore, KeyIterator, StoreFeatures, StoreTransaction};
use crate::error::{BackendError, BackendResult};

/// Longest key, in bytes, an ordered scan is expected to encounter.
pub const DEFAULT_MAX_KEY_LENGTH: usize = 128;

/// Opens a key iterator for `query`, preferring the backend's unordered scan and
/// falling back to an ordered scan over every key of up to `max_key_length`
/// bytes.
pub fn get_keys(
    store: &dyn KeyColumnValueStore,
    query: &SliceQuery,
    features: &StoreFeatures,
    max_key_length: usize,
    tx: &dyn StoreTransaction,
) -> BackendResult<Box<dyn KeyIterator>> {
    if features.unordered_scan {
        store.get_keys(query, tx)
    } else if features.ordered_scan {
        let range = KeyRangeQuery::new(
            StaticBuffer::zero(1),
            StaticBuffer::one(max_key_length),
            query.clone(),
        );
        store.get_keys_in_range(&range, tx)
    } else {
        Err(BackendError::Unsupported(format!(
            "store {} supports neither ordered nor unordered scans",
            store.name()
        )))
    }
}
