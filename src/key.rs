//! Logical keys and the storage identifiers derived from them.
//!
//! A logical key is projected to a string with [`StoreKey::key_to_string`]
//! and combined with a collection name into a [`StorageId`]. The projection
//! must be injective: two distinct keys that project to the same string
//! would silently share storage.

use std::fmt;

use crate::error::{Result, StoreError};

/// Maximum projected key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Maximum collection name length in bytes.
pub const MAX_COLLECTION_NAME_LENGTH: usize = 128;

/// A key usable in any map.
pub trait StoreKey: Send + Sync {
    /// Deterministic, injective string projection of the key.
    fn key_to_string(&self) -> String;
}

impl StoreKey for str {
    fn key_to_string(&self) -> String {
        self.to_string()
    }
}

impl StoreKey for String {
    fn key_to_string(&self) -> String {
        self.clone()
    }
}

impl<T: StoreKey + ?Sized> StoreKey for &T {
    fn key_to_string(&self) -> String {
        (**self).key_to_string()
    }
}

macro_rules! integer_keys {
    ($($ty:ty),*) => {
        $(
            impl StoreKey for $ty {
                fn key_to_string(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

integer_keys!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

/// Identifier of one value or collection inside a backing store.
///
/// Key-value stores address it as `"{collection}:{key}"`; SQL stores read
/// `collection` as the table and `key` as the key-column filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId {
    pub collection: String,
    pub key: String,
}

impl StorageId {
    /// Build an identifier from a validated collection name and a key.
    pub fn new<K: StoreKey + ?Sized>(collection: &str, key: &K) -> Result<Self> {
        validate_collection_name(collection)?;
        let key = key.key_to_string();
        validate_key(&key)?;
        Ok(Self {
            collection: collection.to_string(),
            key,
        })
    }

    /// Prefix shared by every identifier of a collection (`"{collection}:"`).
    pub fn prefix(collection: &str) -> String {
        format!("{}:", collection)
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection, self.key)
    }
}

/// Validate a projected key.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::invalid("key cannot be empty"));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StoreError::invalid(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

/// Validate a collection name.
///
/// Names double as SQL table names and as the prefix of key-value
/// identifiers, so only `[A-Za-z0-9_]` is accepted. Excluding `:` keeps
/// `"{collection}:{key}"` unambiguous across collections.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::invalid("collection name cannot be empty"));
    }
    if name.len() > MAX_COLLECTION_NAME_LENGTH {
        return Err(StoreError::invalid(format!(
            "collection name exceeds maximum length of {} bytes",
            MAX_COLLECTION_NAME_LENGTH
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::invalid(format!(
            "collection name {:?} may only contain ASCII letters, digits and '_'",
            name
        )));
    }
    Ok(())
}
