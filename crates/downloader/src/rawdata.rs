//! The engine's own persisted state: fast-sync trie progress and the last
//! pivot number, used to resume an interrupted fast sync after restart.

use emberd_storage::{Column, KeyValueStore};

const FAST_TRIE_PROGRESS_KEY: &[u8] = b"fast_trie_progress";
const LAST_PIVOT_KEY: &[u8] = b"last_pivot";

fn read_meta_u64(store: &dyn KeyValueStore, key: &[u8]) -> Option<u64> {
    let bytes = store.get(Column::Meta, key).ok().flatten()?;
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

fn write_meta_u64(store: &dyn KeyValueStore, key: &[u8], value: u64) {
    if let Err(err) = store.put(Column::Meta, key, &value.to_le_bytes()) {
        emberd_log::log_error!("meta write failed: {err}");
    }
}

pub fn read_fast_trie_progress(store: &dyn KeyValueStore) -> u64 {
    read_meta_u64(store, FAST_TRIE_PROGRESS_KEY).unwrap_or(0)
}

pub fn write_fast_trie_progress(store: &dyn KeyValueStore, count: u64) {
    write_meta_u64(store, FAST_TRIE_PROGRESS_KEY, count);
}

pub fn read_last_pivot_number(store: &dyn KeyValueStore) -> Option<u64> {
    read_meta_u64(store, LAST_PIVOT_KEY)
}

pub fn write_last_pivot_number(store: &dyn KeyValueStore, number: u64) {
    write_meta_u64(store, LAST_PIVOT_KEY, number);
}
