//! # univrs-collections
//!
//! Map, set, list, sorted-set and queue semantics over pluggable backing
//! stores.
//!
//! Every map and collection in this crate talks to a [`StorageHandle`], so
//! the same code runs against any backend:
//!
//! - **Composite maps**: a key maps to a whole collection, replaced
//!   atomically with [`KeyMap::try_add`]
//! - **Live handles**: collections read and write the store directly
//! - **Expiration**: TTLs on any map through [`ExpirableKeyMap`]
//! - **Blocking queues**: a polling queue plus a [`Bus`] gives blocking dequeue
//! - **Schema sync**: SQL tables are created and migrated lazily
//!
//! ## Backends
//!
//! - [`SqliteStore`]: SQLite via sqlx, one table per collection
//! - [`MemoryStore`]: In-memory keyspace (testing and development)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use univrs_collections::{JsonSerializer, KeyMap, MemoryStore, SetMap};
//!
//! #[tokio::main]
//! async fn main() -> univrs_collections::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let tags: SetMap<MemoryStore, str, String> =
//!         SetMap::new(store, "tags", Arc::new(JsonSerializer::new()))?;
//!
//!     let initial = vec!["rust".to_string(), "async".to_string()];
//!     assert!(tags.try_add("post-1", &initial, false).await?);
//!
//!     // Handles are live: this writes straight to the store.
//!     let set = tags.get_value_or_empty("post-1")?;
//!     set.add(&"sqlite".to_string()).await?;
//!     println!("{:?}", set.enumerate().await?);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Expiring Keys
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use univrs_collections::{ExpirableKeyMap, MemoryStore, Utf8Serializer, ValueMap};
//!
//! #[tokio::main]
//! async fn main() -> univrs_collections::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let sessions = ExpirableKeyMap::new(ValueMap::<_, str, String>::new(
//!         store,
//!         "sessions",
//!         Arc::new(Utf8Serializer),
//!     )?);
//!
//!     let user = "alice".to_string();
//!     sessions
//!         .try_add_with_relative_expiration("abc", &user, Duration::from_secs(30), false)
//!         .await?;
//!     println!("{:?}", sessions.time_to_live("abc").await?);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Blocking Queues
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use univrs_collections::{
//!     BlockingQueue, JsonSerializer, MemoryBus, MemoryStore, QueueConfig, QueueMap,
//! };
//!
//! #[tokio::main]
//! async fn main() -> univrs_collections::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let queues: QueueMap<MemoryStore, str, String> =
//!         QueueMap::new(store, "jobs", Arc::new(JsonSerializer::new()))?;
//!
//!     let queue = BlockingQueue::new(
//!         queues.get_value_or_empty("pending")?,
//!         Arc::new(MemoryBus::new()),
//!         &QueueConfig::default(),
//!     )
//!     .await?;
//!
//!     queue.enqueue(&"build".to_string()).await?;
//!     let job = queue.dequeue(&CancellationToken::new()).await?;
//!     println!("{}", job);
//!
//!     Ok(())
//! }
//! ```

pub mod blocking_queue;
pub mod bus;
pub mod collections;
pub mod composite;
pub mod config;
pub mod error;
pub mod expiration;
pub mod key;
pub mod map;
pub mod memory;
pub mod receiver;
pub mod serializer;
pub mod sqlite;
pub mod store;
pub mod sweeper;
pub mod value_map;

// Re-export main types
pub use blocking_queue::BlockingQueue;
pub use bus::{handler_fn, Bus, MemoryBus, Message, MessageHandler, Subscription};
pub use collections::{
    Binding, CollectionSource, ListHandle, LiveCollection, MapIdentity, QueueHandle, Scored,
    SetHandle, SortedSetHandle,
};
pub use composite::{replace_collection, CompositeMap, ListMap, QueueMap, SetMap, SortedSetMap};
pub use config::{BusConfig, QueueConfig, ReceiverConfig, SqliteConfig, StoreConfig, SweepConfig};
pub use error::{Result, StoreError};
pub use expiration::{ExpirableKeyMap, Expiration};
pub use key::{StorageId, StoreKey, MAX_KEY_LENGTH};
pub use map::{KeyExpiration, KeyMap};
pub use memory::MemoryStore;
pub use receiver::{BusSource, MessageSource, QueueSource, Receiver, ReceiverError, ReceiverHandle};
pub use serializer::{BytesSerializer, JsonSerializer, Serializer, Utf8Serializer};
pub use sqlite::schema::{Column, ColumnType, SchemaSynchronizer, SyncStrategy, Table};
pub use sqlite::SqliteStore;
pub use store::{
    CollectionKind, ExpirySweep, PutMode, RawItem, StorageHandle, StorageTransaction,
};
pub use sweeper::spawn_expiry_sweeper;
pub use value_map::ValueMap;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::collections::CollectionSource;
    pub use crate::composite::{ListMap, QueueMap, SetMap, SortedSetMap};
    pub use crate::error::{Result, StoreError};
    pub use crate::expiration::{ExpirableKeyMap, Expiration};
    pub use crate::map::{KeyExpiration, KeyMap};
    pub use crate::memory::MemoryStore;
    pub use crate::serializer::{JsonSerializer, Serializer};
    pub use crate::sqlite::SqliteStore;
    pub use crate::store::{StorageHandle, StorageTransaction};
    pub use crate::value_map::ValueMap;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stores_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<MemoryStore>();
        assert_send_sync::<SqliteStore>();
        assert_send_sync::<MemoryBus>();
        assert_send_sync::<SetMap<SqliteStore, str, String>>();
    }

    #[tokio::test]
    async fn test_same_map_on_both_backends() {
        use std::sync::Arc;

        async fn roundtrip<S: StorageHandle>(store: Arc<S>) {
            let map: ListMap<S, u32, String> =
                ListMap::new(store, "history", Arc::new(JsonSerializer::<String>::new())).unwrap();
            let entries = vec!["a".to_string(), "b".to_string()];
            assert!(map.try_add(&1, &entries, false).await.unwrap());
            let list = map.get_value_or_default(&1).await.unwrap().unwrap();
            assert_eq!(list.enumerate().await.unwrap(), entries);
        }

        roundtrip(Arc::new(MemoryStore::new())).await;
        roundtrip(Arc::new(SqliteStore::in_memory().await.unwrap())).await;
    }
}
