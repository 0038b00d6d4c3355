//! In-memory storage implementation

use super::entry::Entry;
use super::value::Value;
use bytes::Bytes;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use siphasher::sip::SipHasher13;

/// Type alias for our hash map with SipHasher
type StoreMap = HashMap<Bytes, Entry, BuildHasherDefault<SipHasher13>>;

/// In-memory key-value store for one shard's partition of the keyspace
///
/// All operations are synchronous and local: the owning shard thread is the
/// only caller, so a plain `HashMap` is enough.
pub struct MemoryStore {
    /// The main storage map
    store: StoreMap,

    /// Source of entry versions, unique within this store
    next_version: u64,
}

impl MemoryStore {
    /// Create a new memory store with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new memory store with specified initial capacity
    pub fn with_capacity(capacity: usize) -> Self {
        MemoryStore {
            store: HashMap::with_capacity_and_hasher(
                capacity,
                BuildHasherDefault::<SipHasher13>::default(),
            ),
            next_version: 0,
        }
    }

    fn bump_version(&mut self) -> u64 {
        self.next_version = self.next_version.wrapping_add(1);
        self.next_version
    }

    /// Set a key-value pair, returns true if the key is new
    pub fn set(&mut self, key: impl Into<Bytes>, value: Value) -> bool {
        self.set_with_flags(key, value, 0)
    }

    /// Set a key-value pair with memcached client flags
    pub fn set_with_flags(&mut self, key: impl Into<Bytes>, value: Value, flags: u32) -> bool {
        let key = key.into();
        let mut entry = Entry::with_flags(key.clone(), value, flags);
        entry.version = self.bump_version();
        self.store.insert(key, entry).is_none()
    }

    /// Get a value by key
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.store.get(key).map(|entry| &entry.value)
    }

    /// Get a mutable reference to a value by key
    ///
    /// The entry version is bumped since the caller is about to write.
    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut Value> {
        let version = self.next_version.wrapping_add(1);
        let entry = self.store.get_mut(key)?;
        entry.version = version;
        self.next_version = version;
        Some(&mut entry.value)
    }

    /// Get the entry for a key (including flags and version)
    pub fn get_entry(&self, key: &[u8]) -> Option<&Entry> {
        self.store.get(key)
    }

    /// Remove a key and hand back its entry
    pub fn take(&mut self, key: &[u8]) -> Option<Entry> {
        self.store.remove(key)
    }

    /// Delete a key, returns true if the key existed
    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.store.remove(key).is_some()
    }

    /// Check if a key exists
    pub fn exists(&self, key: &[u8]) -> bool {
        self.store.contains_key(key)
    }

    /// Collect the keys of every entry matching `predicate`
    pub fn scan<F>(&self, mut predicate: F) -> Vec<Bytes>
    where
        F: FnMut(&Entry) -> bool,
    {
        self.store
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Remove all keys, returns how many were dropped
    pub fn clear(&mut self) -> usize {
        let removed = self.store.len();
        self.store.clear();
        removed
    }

    /// Get the number of keys
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Calculate approximate memory usage of stored data in bytes
    pub fn memory_usage(&self) -> usize {
        self.store.values().map(|entry| entry.memory_usage()).sum()
    }

    /// Get statistics about the store
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            keys: self.store.len(),
            used_memory_bytes: self.memory_usage(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the memory store
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub keys: usize,
    pub used_memory_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_set_get() {
        let mut store = MemoryStore::new();
        store.set("key1", Value::string("value1"));

        let value = store.get(b"key1").unwrap();
        assert_eq!(value.as_string().unwrap(), &Bytes::from("value1"));
    }

    #[test]
    fn test_set_reports_new_key() {
        let mut store = MemoryStore::new();
        assert!(store.set("key1", Value::string("a")));
        assert!(!store.set("key1", Value::string("b")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete() {
        let mut store = MemoryStore::new();
        store.set("key1", Value::string("value1"));

        assert!(store.delete(b"key1"));
        assert!(!store.exists(b"key1"));
        assert!(!store.delete(b"key1"));
    }

    #[test]
    fn test_versions_advance_on_write() {
        let mut store = MemoryStore::new();
        store.set_with_flags("k", Value::string("v"), 7);
        let first = store.get_entry(b"k").unwrap().version;
        assert_eq!(store.get_entry(b"k").unwrap().flags, 7);

        store.get_mut(b"k").unwrap();
        assert!(store.get_entry(b"k").unwrap().version > first);
    }

    #[test]
    fn test_scan() {
        let mut store = MemoryStore::new();
        store.set("user:1", Value::string("a"));
        store.set("user:2", Value::string("b"));
        store.set("order:1", Value::string("c"));

        let mut users = store.scan(|entry| entry.key.starts_with(b"user:"));
        users.sort();
        assert_eq!(users, vec![Bytes::from("user:1"), Bytes::from("user:2")]);
    }

    #[test]
    fn test_clear() {
        let mut store = MemoryStore::new();
        store.set("a", Value::integer(1));
        store.set("b", Value::integer(2));
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
    }
}
