//! Value types for the key-value store

use bytes::Bytes;

/// Represents the different types of values that can be stored
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// String value (binary-safe)
    String(Bytes),

    /// Integer value (used for counters)
    Integer(i64),
}

impl Value {
    /// Create a string value
    pub fn string(bytes: impl Into<Bytes>) -> Self {
        Value::String(bytes.into())
    }

    /// Create an integer value
    pub fn integer(i: i64) -> Self {
        Value::Integer(i)
    }

    /// Build a value from raw client bytes, keeping canonical integers compact
    pub fn from_bytes(bytes: Bytes) -> Self {
        if bytes.len() <= 20 && !bytes.is_empty() && (bytes[0].is_ascii_digit() || bytes[0] == b'-') {
            if let Some(i) = std::str::from_utf8(&bytes).ok().and_then(|s| s.parse::<i64>().ok()) {
                // "007" must read back as "007"
                if i.to_string().as_bytes() == &bytes[..] {
                    return Value::Integer(i);
                }
            }
        }
        Value::String(bytes)
    }

    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        "string"
    }

    /// Render the value the way clients see it
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Value::String(b) => b.clone(),
            Value::Integer(i) => Bytes::from(i.to_string()),
        }
    }

    /// Try to get as string bytes
    pub fn as_string(&self) -> Option<&Bytes> {
        match self {
            Value::String(b) => Some(b),
            _ => None,
        }
    }

    /// Try to read the value as an integer, parsing string payloads
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::String(b) => std::str::from_utf8(b).ok()?.parse::<i64>().ok(),
        }
    }

    /// Length of the client-visible representation
    pub fn len(&self) -> usize {
        match self {
            Value::String(b) => b.len(),
            Value::Integer(i) => i.to_string().len(),
        }
    }

    /// Whether the client-visible representation is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calculate approximate memory usage in bytes
    pub fn memory_usage(&self) -> usize {
        match self {
            Value::String(bytes) => bytes.len(),
            Value::Integer(_) => std::mem::size_of::<i64>(),
        }
    }
}
