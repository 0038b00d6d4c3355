//! Entry structure for key-value pairs

use super::value::Value;
use bytes::Bytes;

/// Represents a single entry in the store
#[derive(Debug, Clone)]
pub struct Entry {
    /// The key
    pub key: Bytes,

    /// The value
    pub value: Value,

    /// Opaque client flags (memcached protocol)
    pub flags: u32,

    /// Bumped on every write; reported as the memcached CAS unique
    pub version: u64,
}

impl Entry {
    /// Create a new entry
    pub fn new(key: impl Into<Bytes>, value: Value) -> Self {
        Entry {
            key: key.into(),
            value,
            flags: 0,
            version: 0,
        }
    }

    /// Create a new entry carrying memcached client flags
    pub fn with_flags(key: impl Into<Bytes>, value: Value, flags: u32) -> Self {
        Entry {
            flags,
            ..Entry::new(key, value)
        }
    }

    /// Increment version
    pub fn increment_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// Calculate approximate memory usage of this entry in bytes
    pub fn memory_usage(&self) -> usize {
        let key_size = self.key.len();
        let value_size = self.value.memory_usage();
        let metadata_size = std::mem::size_of::<u32>() + std::mem::size_of::<u64>();
        key_size + value_size + metadata_size
    }
}
