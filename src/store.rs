//! StorageHandle trait - the core abstraction over all backing stores.
//!
//! A handle is a connection to one store instance. Every value lives under a
//! [`StorageId`]; an identifier holds either a plain value or a single
//! collection (set, list, sorted set or queue). Composite maps, value maps
//! and queues are all built on these primitives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::error::{Result, StoreError};
use crate::key::StorageId;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique store instance id.
pub fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Shape of a collection bound to an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    /// Unique items, no ordering.
    Set,
    /// Items in insertion order.
    List,
    /// Unique members ordered by (score, member).
    SortedSet,
    /// FIFO items; only the head can be removed.
    Queue,
}

impl CollectionKind {
    /// Stable lowercase name, used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Set => "set",
            CollectionKind::List => "list",
            CollectionKind::SortedSet => "sorted_set",
            CollectionKind::Queue => "queue",
        }
    }

    /// Fails with `Unsupported` unless the head of the collection can be popped.
    pub fn ensure_poppable(&self) -> Result<()> {
        match self {
            CollectionKind::List | CollectionKind::Queue => Ok(()),
            _ => Err(StoreError::Unsupported(format!(
                "pop_front on a {}",
                self.as_str()
            ))),
        }
    }

    /// Fails with `Unsupported` unless arbitrary items can be removed.
    pub fn ensure_removable(&self) -> Result<()> {
        match self {
            CollectionKind::Queue => Err(StoreError::Unsupported(
                "remove of an arbitrary item from a queue".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Whether items are unique within the collection.
    pub fn is_unique(&self) -> bool {
        matches!(self, CollectionKind::Set | CollectionKind::SortedSet)
    }
}

/// A serialized collection item.
#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    pub value: Vec<u8>,
    /// Only meaningful for sorted sets.
    pub score: Option<f64>,
}

impl RawItem {
    /// An unscored item.
    pub fn new(value: Vec<u8>) -> Self {
        Self { value, score: None }
    }

    /// A sorted-set member with its score.
    pub fn scored(value: Vec<u8>, score: f64) -> Self {
        Self {
            value,
            score: Some(score),
        }
    }
}

/// Write condition for plain values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Create or replace. A replaced value loses its expiration.
    Upsert,
    /// Create only; returns `false` if the identifier exists.
    IfAbsent,
    /// Replace only; returns `false` if the identifier is absent. The
    /// existing expiration is kept.
    IfPresent,
}

/// A transaction scoped to one identifier.
///
/// Owned by exactly one logical operation. Dropping it without
/// [`commit`](StorageTransaction::commit) applies nothing.
#[async_trait]
pub trait StorageTransaction: Send {
    /// Require the identifier to be absent when the transaction commits.
    ///
    /// Returns `false` when the store already knows the identifier exists;
    /// the caller should then abandon the transaction. Stores that evaluate
    /// the condition at commit time always return `true` here.
    async fn require_absent(&mut self) -> Result<bool>;

    /// Delete whatever the identifier currently holds.
    async fn clear(&mut self) -> Result<()>;

    /// Append one item to the collection.
    async fn push(&mut self, item: RawItem) -> Result<()>;

    /// Apply every queued command. `Ok(false)` means the transaction lost a
    /// race (condition failed, conflict or busy store) and nothing changed.
    async fn commit(self) -> Result<bool>;

    /// Discard every queued command.
    async fn rollback(self) -> Result<()>;
}

/// A connection to one backing store instance.
///
/// All backends (memory, SQLite) implement this trait. Maps and queues
/// depend on this trait, not on specific implementations.
#[async_trait]
pub trait StorageHandle: Send + Sync + 'static {
    type Transaction: StorageTransaction;

    /// Process-unique id of this store instance.
    fn instance_id(&self) -> u64;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Whether [`begin`](StorageHandle::begin) gives all-or-nothing commits.
    ///
    /// Stores returning `false` only offer at-least-once writes: a failed
    /// replace can leave a partially written collection behind.
    fn is_transactional(&self) -> bool {
        true
    }

    /// Open a transaction writing a collection of `kind` at `id`.
    async fn begin(&self, id: &StorageId, kind: CollectionKind) -> Result<Self::Transaction>;

    /// Whether anything lives at `id`.
    async fn exists(&self, id: &StorageId) -> Result<bool>;

    /// Delete whatever lives at `id`; returns whether anything was removed.
    async fn delete(&self, id: &StorageId) -> Result<bool>;

    /// Keys currently stored in a collection, in lexicographic order.
    async fn keys(&self, collection: &str) -> Result<Vec<String>>;

    /// Set (`Some`) or clear (`None`) the expiration of an existing
    /// identifier. Returns `false` and writes nothing if `id` is absent.
    async fn set_expiration(&self, id: &StorageId, at: Option<SystemTime>) -> Result<bool>;

    /// Current expiration of `id`, `None` if absent or persistent.
    async fn expiration(&self, id: &StorageId) -> Result<Option<SystemTime>>;

    /// Read a plain value.
    async fn get_value(&self, id: &StorageId) -> Result<Option<Vec<u8>>>;

    /// Write a plain value under `mode`; returns whether it was written.
    async fn put_value(&self, id: &StorageId, value: Vec<u8>, mode: PutMode) -> Result<bool>;

    /// All items of a collection in its natural order.
    async fn items(&self, id: &StorageId, kind: CollectionKind) -> Result<Vec<RawItem>>;

    /// Sorted-set members with `min <= score <= max`, ordered by score.
    async fn items_by_score(&self, id: &StorageId, min: f64, max: f64) -> Result<Vec<RawItem>>;

    /// Add one item. Returns `false` if a unique kind already held it (a
    /// sorted set still updates the score).
    async fn add_item(&self, id: &StorageId, kind: CollectionKind, item: RawItem) -> Result<bool>;

    /// Remove one item; returns whether it was present.
    async fn remove_item(&self, id: &StorageId, kind: CollectionKind, value: &[u8])
        -> Result<bool>;

    async fn contains_item(&self, id: &StorageId, kind: CollectionKind, value: &[u8])
        -> Result<bool>;

    async fn item_count(&self, id: &StorageId, kind: CollectionKind) -> Result<u64>;

    /// Remove and return the head of a list or queue.
    async fn pop_front(&self, id: &StorageId, kind: CollectionKind) -> Result<Option<Vec<u8>>>;
}

/// Stores that can delete expired identifiers in bulk.
#[async_trait]
pub trait ExpirySweep: Send + Sync + 'static {
    /// Delete up to `limit` expired identifiers; returns how many were removed.
    async fn purge_expired(&self, limit: u32) -> Result<u64>;
}

/// Milliseconds since the Unix epoch, saturating at zero for earlier
/// instants and at `i64::MAX` for instants too far out to represent.
pub(crate) fn unix_millis(at: SystemTime) -> i64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub(crate) fn from_unix_millis(millis: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(millis.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids_are_unique() {
        let a = next_instance_id();
        let b = next_instance_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_kind_capabilities() {
        assert!(CollectionKind::Queue.ensure_poppable().is_ok());
        assert!(CollectionKind::List.ensure_poppable().is_ok());
        assert!(matches!(
            CollectionKind::Set.ensure_poppable(),
            Err(StoreError::Unsupported(_))
        ));
        assert!(matches!(
            CollectionKind::Queue.ensure_removable(),
            Err(StoreError::Unsupported(_))
        ));
        assert!(CollectionKind::SortedSet.is_unique());
        assert!(!CollectionKind::List.is_unique());
    }

    #[test]
    fn test_unix_millis_roundtrip() {
        let at = SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(1_700_000_000_123);
        assert_eq!(from_unix_millis(unix_millis(at)), at);
        assert_eq!(unix_millis(SystemTime::UNIX_EPOCH), 0);
    }

    #[test]
    fn test_unix_millis_saturates_far_future() {
        let far = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(13_835_058_055_282_163);
        assert_eq!(unix_millis(far), i64::MAX);
        assert!(from_unix_millis(i64::MAX) > SystemTime::now());
    }
}
