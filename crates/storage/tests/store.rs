use emberd_storage::memory::MemoryStore;
use emberd_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn memory_store_round_trip() {
    let store = MemoryStore::new();
    store.put(Column::Meta, b"pivot", &7u64.to_le_bytes()).expect("put");
    assert!(store.has(Column::Meta, b"pivot").expect("has"));
    assert!(!store.has(Column::TrieNode, b"pivot").expect("has"));

    let value = store.get(Column::Meta, b"pivot").expect("get").expect("value");
    assert_eq!(value, 7u64.to_le_bytes());

    store.delete(Column::Meta, b"pivot").expect("delete");
    assert!(store.get(Column::Meta, b"pivot").expect("get").is_none());
}

#[test]
fn batch_applies_all_ops() {
    let store = MemoryStore::new();
    store.put(Column::TrieNode, b"stale", b"x").expect("put");

    let mut batch = WriteBatch::new();
    batch.put(Column::Meta, b"a".to_vec(), b"1".to_vec());
    batch.put(Column::TrieNode, b"b".to_vec(), b"2".to_vec());
    batch.delete(Column::TrieNode, b"stale".to_vec());
    assert_eq!(batch.len(), 3);
    store.write_batch(&batch).expect("write batch");

    assert_eq!(store.get(Column::Meta, b"a").expect("get").as_deref(), Some(b"1".as_ref()));
    assert_eq!(store.get(Column::TrieNode, b"b").expect("get").as_deref(), Some(b"2".as_ref()));
    assert!(store.get(Column::TrieNode, b"stale").expect("get").is_none());
}

#[cfg(feature = "fjall")]
#[test]
fn fjall_store_smoke() {
    use emberd_storage::fjall::FjallStore;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = FjallStore::open(dir.path()).expect("open");
    store.put(Column::Meta, b"k", b"v").expect("put");
    assert_eq!(store.get(Column::Meta, b"k").expect("get").as_deref(), Some(b"v".as_ref()));
    store.persist().expect("persist");
}
