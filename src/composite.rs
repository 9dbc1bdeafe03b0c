//! Composite maps: a key maps to a whole collection.
//!
//! Each key owns the storage identifier `{map name}:{key}`. Values handed
//! out by the map are live handles on that identifier; writes through them
//! go straight to the store.
//!
//! `try_add` replaces a collection in one store transaction:
//!
//! 1. snapshot and encode the source before the transaction opens
//! 2. require absence (`overwrite = false`) or clear (`overwrite = true`)
//! 3. push every item in source order
//! 4. commit; the commit outcome is the result
//!
//! Passing a map's own handle back for the same key is recognized through
//! [`CollectionSource::identity_matches`] and never touches the store.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::collections::{
    Binding, CollectionSource, ListHandle, LiveCollection, MapIdentity, QueueHandle, SetHandle,
    SortedSetHandle,
};
use crate::error::Result;
use crate::key::{validate_collection_name, StorageId, StoreKey};
use crate::map::{KeyExpiration, KeyMap};
use crate::serializer::Serializer;
use crate::store::{CollectionKind, RawItem, StorageHandle, StorageTransaction};

/// Map from a key to a set of `T`.
pub type SetMap<S, K, T> = CompositeMap<S, K, SetHandle<S, T>>;
/// Map from a key to a list of `T`.
pub type ListMap<S, K, T> = CompositeMap<S, K, ListHandle<S, T>>;
/// Map from a key to a sorted set of `T`.
pub type SortedSetMap<S, K, T> = CompositeMap<S, K, SortedSetHandle<S, T>>;
/// Map from a key to a queue of `T`.
pub type QueueMap<S, K, T> = CompositeMap<S, K, QueueHandle<S, T>>;

/// Replace the collection at `id` with `items` in one transaction.
///
/// Returns the commit outcome: `false` when `overwrite` is unset and the
/// identifier exists, or when the transaction lost a race.
pub async fn replace_collection<S: StorageHandle>(
    store: &S,
    id: &StorageId,
    kind: CollectionKind,
    items: Vec<RawItem>,
    overwrite: bool,
) -> Result<bool> {
    if !store.is_transactional() {
        warn!(
            backend = store.backend_name(),
            id = %id,
            "store is not transactional; a failed replace may leave a partial collection"
        );
    }

    let mut tx = store.begin(id, kind).await?;
    if overwrite {
        tx.clear().await?;
    } else if !tx.require_absent().await? {
        tx.rollback().await?;
        debug!(id = %id, "replace rejected: identifier exists");
        return Ok(false);
    }

    let count = items.len();
    for item in items {
        tx.push(item).await?;
    }

    let committed = tx.commit().await?;
    debug!(id = %id, items = count, overwrite, committed, "replace collection");
    Ok(committed)
}

/// A map whose values are live collections of kind `C`.
pub struct CompositeMap<S, K: ?Sized, C>
where
    S: StorageHandle,
    C: LiveCollection<S>,
{
    store: Arc<S>,
    identity: MapIdentity,
    serializer: Arc<dyn Serializer<C::Value>>,
    _marker: PhantomData<fn(&K) -> C>,
}

impl<S, K, C> CompositeMap<S, K, C>
where
    S: StorageHandle,
    K: StoreKey + ?Sized,
    C: LiveCollection<S>,
{
    /// Create a map named `name` on `store`. The name must be a valid
    /// collection name.
    pub fn new(
        store: Arc<S>,
        name: impl Into<String>,
        serializer: Arc<dyn Serializer<C::Value>>,
    ) -> Result<Self> {
        let name = name.into();
        validate_collection_name(&name)?;
        let identity = MapIdentity {
            store_instance: store.instance_id(),
            collection: name,
        };
        Ok(Self {
            store,
            identity,
            serializer,
            _marker: PhantomData,
        })
    }

    /// Collection name of this map.
    pub fn name(&self) -> &str {
        &self.identity.collection
    }

    /// Store instance plus collection name, used to recognize own handles.
    pub fn identity(&self) -> &MapIdentity {
        &self.identity
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Storage identifier of `key` in this map.
    pub fn storage_id(&self, key: &K) -> Result<StorageId> {
        StorageId::new(&self.identity.collection, key)
    }

    fn handle(&self, id: StorageId) -> C {
        C::bind(
            Binding::new(Arc::clone(&self.store), id),
            Arc::clone(&self.serializer),
        )
    }

    /// Live handle for `key`, or `None` if nothing is stored there.
    pub async fn get_value_or_default(&self, key: &K) -> Result<Option<C>> {
        let id = self.storage_id(key)?;
        if !self.store.exists(&id).await? {
            return Ok(None);
        }
        Ok(Some(self.handle(id)))
    }

    /// Live handle for `key` without touching the store. The first write
    /// through it creates the collection.
    pub fn get_value_or_empty(&self, key: &K) -> Result<C> {
        let id = self.storage_id(key)?;
        Ok(self.handle(id))
    }

    /// Keys currently present in the map.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.store.keys(&self.identity.collection).await
    }
}

#[async_trait]
impl<S, K, C> KeyMap for CompositeMap<S, K, C>
where
    S: StorageHandle,
    K: StoreKey + ?Sized,
    C: LiveCollection<S>,
    C::Item: 'static,
{
    type Key = K;
    type Value = dyn CollectionSource<C::Item>;

    async fn try_add(&self, key: &K, value: &Self::Value, overwrite: bool) -> Result<bool> {
        let id = self.storage_id(key)?;

        if value.identity_matches(&self.identity, &id.key) {
            debug!(id = %id, overwrite, "self-assignment");
            return Ok(overwrite);
        }

        // The source may alias the destination, so it is fully read before
        // the destination transaction opens.
        let snapshot = value.snapshot().await?;
        let items = snapshot
            .iter()
            .map(|item| C::encode(item, self.serializer.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        replace_collection(self.store.as_ref(), &id, C::KIND, items, overwrite).await
    }

    async fn try_remove(&self, key: &K) -> Result<bool> {
        let id = self.storage_id(key)?;
        self.store.delete(&id).await
    }

    async fn contains_key(&self, key: &K) -> Result<bool> {
        let id = self.storage_id(key)?;
        self.store.exists(&id).await
    }
}

#[async_trait]
impl<S, K, C> KeyExpiration for CompositeMap<S, K, C>
where
    S: StorageHandle,
    K: StoreKey + ?Sized,
    C: LiveCollection<S>,
    C::Item: 'static,
{
    async fn set_key_expiration(&self, key: &K, at: Option<SystemTime>) -> Result<bool> {
        let id = self.storage_id(key)?;
        self.store.set_expiration(&id, at).await
    }

    async fn key_expiration(&self, key: &K) -> Result<Option<SystemTime>> {
        let id = self.storage_id(key)?;
        self.store.expiration(&id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::Scored;
    use crate::error::StoreError;
    use crate::memory::MemoryStore;
    use crate::serializer::JsonSerializer;
    use crate::sqlite::SqliteStore;
    use crate::store::PutMode;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// JSON serializer that counts every call.
    #[derive(Default)]
    struct CountingSerializer {
        serialized: AtomicUsize,
        deserialized: AtomicUsize,
    }

    impl Serializer<u32> for CountingSerializer {
        fn serialize(&self, value: &u32) -> Result<Vec<u8>> {
            self.serialized.fetch_add(1, Ordering::SeqCst);
            JsonSerializer::<u32>::new().serialize(value)
        }

        fn deserialize(&self, raw: &[u8]) -> Result<u32> {
            self.deserialized.fetch_add(1, Ordering::SeqCst);
            JsonSerializer::<u32>::new().deserialize(raw)
        }
    }

    fn json() -> Arc<dyn Serializer<u32>> {
        Arc::new(JsonSerializer::<u32>::new())
    }

    fn set_map<S: StorageHandle>(store: Arc<S>) -> SetMap<S, str, u32> {
        SetMap::new(store, "tags", json()).unwrap()
    }

    async fn sorted<S: StorageHandle>(map: &SetMap<S, str, u32>, key: &str) -> Vec<u32> {
        let handle = map.get_value_or_default(key).await.unwrap().unwrap();
        let mut items = handle.enumerate().await.unwrap();
        items.sort();
        items
    }

    async fn add_reject_overwrite<S: StorageHandle>(store: Arc<S>) {
        let map = set_map(store);

        assert!(map.try_add("k1", &vec![1u32, 2, 3], false).await.unwrap());
        assert!(!map.try_add("k1", &vec![9u32], false).await.unwrap());
        assert_eq!(sorted(&map, "k1").await, vec![1u32, 2, 3]);

        assert!(map.try_add("k1", &vec![9u32], true).await.unwrap());
        assert_eq!(sorted(&map, "k1").await, vec![9u32]);
    }

    #[tokio::test]
    async fn test_set_map_add_reject_overwrite_memory() {
        add_reject_overwrite(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_set_map_add_reject_overwrite_sqlite() {
        add_reject_overwrite(Arc::new(SqliteStore::in_memory().await.unwrap())).await;
    }

    #[tokio::test]
    async fn test_self_assignment_skips_serializer() {
        let store = Arc::new(MemoryStore::new());
        let serializer = Arc::new(CountingSerializer::default());
        let map: SetMap<MemoryStore, str, u32> =
            SetMap::new(store, "tags", serializer.clone()).unwrap();

        map.try_add("k", &vec![1u32, 2], false).await.unwrap();
        let before = serializer.serialized.load(Ordering::SeqCst);

        let handle = map.get_value_or_empty("k").unwrap();
        assert!(map.try_add("k", &handle, true).await.unwrap());
        assert!(!map.try_add("k", &handle, false).await.unwrap());

        assert_eq!(serializer.serialized.load(Ordering::SeqCst), before);
        assert_eq!(serializer.deserialized.load(Ordering::SeqCst), 0);
        assert_eq!(sorted(&map, "k").await, vec![1u32, 2]);
    }

    #[tokio::test]
    async fn test_handle_from_other_key_is_copied() {
        let store = Arc::new(MemoryStore::new());
        let map = set_map(Arc::clone(&store));
        map.try_add("src", &vec![4u32, 5], false).await.unwrap();

        let src = map.get_value_or_default("src").await.unwrap().unwrap();
        assert!(map.try_add("dst", &src, false).await.unwrap());
        assert_eq!(sorted(&map, "dst").await, vec![4u32, 5]);

        // Same collection name on another map instance still matches.
        let twin = set_map(Arc::clone(&store));
        assert!(twin.try_add("src", &src, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_with_own_contents_under_other_handle() {
        let store = Arc::new(MemoryStore::new());
        let map = set_map(Arc::clone(&store));
        map.try_add("k", &vec![1u32, 2, 3], false).await.unwrap();

        // A handle from another store is copied item by item.
        let other = Arc::new(MemoryStore::new());
        let foreign = set_map(Arc::clone(&other));
        foreign.try_add("k", &vec![7u32], false).await.unwrap();
        let handle = foreign.get_value_or_default("k").await.unwrap().unwrap();

        assert!(map.try_add("k", &handle, true).await.unwrap());
        assert_eq!(sorted(&map, "k").await, vec![7u32]);
    }

    #[tokio::test]
    async fn test_get_value_or_empty_writes_lazily() {
        let store = Arc::new(MemoryStore::new());
        let map = set_map(Arc::clone(&store));

        assert!(map.get_value_or_default("k").await.unwrap().is_none());
        let handle = map.get_value_or_empty("k").unwrap();
        assert!(!map.contains_key("k").await.unwrap());

        handle.add(&42).await.unwrap();
        assert!(map.contains_key("k").await.unwrap());
        assert_eq!(map.keys().await.unwrap(), vec!["k"]);

        assert!(map.try_remove("k").await.unwrap());
        assert!(!map.try_remove("k").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let map = set_map(Arc::new(MemoryStore::new()));
        let err = map.try_add("", &vec![1u32], false).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        let bad_name =
            SetMap::<MemoryStore, str, u32>::new(Arc::new(MemoryStore::new()), "a:b", json());
        assert!(bad_name.is_err());
    }

    #[tokio::test]
    async fn test_list_map_preserves_source_order() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let map: ListMap<SqliteStore, u64, u32> = ListMap::new(store, "history", json()).unwrap();

        assert!(map.try_add(&7, &vec![3u32, 1, 3, 2], false).await.unwrap());
        let list = map.get_value_or_default(&7).await.unwrap().unwrap();
        assert_eq!(list.enumerate().await.unwrap(), vec![3u32, 1, 3, 2]);

        list.push(&9).await.unwrap();
        assert_eq!(list.len().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_sorted_set_map() {
        let store = Arc::new(MemoryStore::new());
        let map: SortedSetMap<MemoryStore, str, u32> =
            SortedSetMap::new(store, "ranks", json()).unwrap();

        let source = vec![Scored::new(10u32, 2.0), Scored::new(20, 1.0)];
        assert!(map.try_add("board", &source, false).await.unwrap());

        let board = map.get_value_or_default("board").await.unwrap().unwrap();
        let members: Vec<u32> = board
            .enumerate()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.item)
            .collect();
        assert_eq!(members, vec![20u32, 10]);
    }

    #[tokio::test]
    async fn test_queue_map_and_empty_overwrite() {
        let store = Arc::new(MemoryStore::new());
        let map: QueueMap<MemoryStore, str, u32> = QueueMap::new(store, "jobs", json()).unwrap();

        map.try_add("q", &std::collections::VecDeque::from(vec![1u32, 2]), false)
            .await
            .unwrap();
        let queue = map.get_value_or_default("q").await.unwrap().unwrap();
        assert_eq!(queue.dequeue_or_default().await.unwrap(), Some(1));

        // Overwriting with an empty source leaves nothing behind.
        assert!(map.try_add("q", &Vec::<u32>::new(), true).await.unwrap());
        assert!(!map.contains_key("q").await.unwrap());
    }

    async fn concurrent_try_add<S: StorageHandle>(store: Arc<S>) {
        let map = Arc::new(set_map(store));
        let mut tasks = Vec::new();
        for i in 0..8u32 {
            let map = Arc::clone(&map);
            tasks.push(tokio::spawn(async move {
                let items: HashSet<u32> = (i * 10..i * 10 + 5).collect();
                map.try_add("race", &items, false).await
            }));
        }

        let mut winners = Vec::new();
        for (i, task) in tasks.into_iter().enumerate() {
            if task.await.unwrap().unwrap() {
                winners.push(i as u32);
            }
        }
        assert_eq!(winners.len(), 1);

        let base = winners[0] * 10;
        assert_eq!(sorted(&map, "race").await, (base..base + 5).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_try_add_single_winner_memory() {
        concurrent_try_add(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_try_add_single_winner_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_path(dir.path().join("p1.db")).await.unwrap();
        concurrent_try_add(Arc::new(store)).await;
    }

    /// Memory store that reports at-least-once writes.
    struct Relaxed(MemoryStore);

    #[async_trait]
    impl StorageHandle for Relaxed {
        type Transaction = <MemoryStore as StorageHandle>::Transaction;

        fn instance_id(&self) -> u64 {
            self.0.instance_id()
        }

        fn backend_name(&self) -> &'static str {
            "relaxed"
        }

        fn is_transactional(&self) -> bool {
            false
        }

        async fn begin(&self, id: &StorageId, kind: CollectionKind) -> Result<Self::Transaction> {
            self.0.begin(id, kind).await
        }

        async fn exists(&self, id: &StorageId) -> Result<bool> {
            self.0.exists(id).await
        }

        async fn delete(&self, id: &StorageId) -> Result<bool> {
            self.0.delete(id).await
        }

        async fn keys(&self, collection: &str) -> Result<Vec<String>> {
            self.0.keys(collection).await
        }

        async fn set_expiration(&self, id: &StorageId, at: Option<SystemTime>) -> Result<bool> {
            self.0.set_expiration(id, at).await
        }

        async fn expiration(&self, id: &StorageId) -> Result<Option<SystemTime>> {
            self.0.expiration(id).await
        }

        async fn get_value(&self, id: &StorageId) -> Result<Option<Vec<u8>>> {
            self.0.get_value(id).await
        }

        async fn put_value(&self, id: &StorageId, value: Vec<u8>, mode: PutMode) -> Result<bool> {
            self.0.put_value(id, value, mode).await
        }

        async fn items(&self, id: &StorageId, kind: CollectionKind) -> Result<Vec<RawItem>> {
            self.0.items(id, kind).await
        }

        async fn items_by_score(
            &self,
            id: &StorageId,
            min: f64,
            max: f64,
        ) -> Result<Vec<RawItem>> {
            self.0.items_by_score(id, min, max).await
        }

        async fn add_item(
            &self,
            id: &StorageId,
            kind: CollectionKind,
            item: RawItem,
        ) -> Result<bool> {
            self.0.add_item(id, kind, item).await
        }

        async fn remove_item(
            &self,
            id: &StorageId,
            kind: CollectionKind,
            value: &[u8],
        ) -> Result<bool> {
            self.0.remove_item(id, kind, value).await
        }

        async fn contains_item(
            &self,
            id: &StorageId,
            kind: CollectionKind,
            value: &[u8],
        ) -> Result<bool> {
            self.0.contains_item(id, kind, value).await
        }

        async fn item_count(&self, id: &StorageId, kind: CollectionKind) -> Result<u64> {
            self.0.item_count(id, kind).await
        }

        async fn pop_front(
            &self,
            id: &StorageId,
            kind: CollectionKind,
        ) -> Result<Option<Vec<u8>>> {
            self.0.pop_front(id, kind).await
        }
    }

    #[tokio::test]
    async fn test_replace_on_non_transactional_store() {
        let store = Relaxed(MemoryStore::new());
        assert!(!store.is_transactional());
        let id = StorageId::new("tags", "k").unwrap();
        let items = || vec![RawItem::new(b"1".to_vec()), RawItem::new(b"2".to_vec())];

        assert!(replace_collection(&store, &id, CollectionKind::List, items(), false)
            .await
            .unwrap());
        assert!(!replace_collection(&store, &id, CollectionKind::List, items(), false)
            .await
            .unwrap());
        assert!(replace_collection(&store, &id, CollectionKind::List, vec![], true)
            .await
            .unwrap());
        assert!(!store.exists(&id).await.unwrap());

        let map: ListMap<Relaxed, str, u32> =
            ListMap::new(Arc::new(store), "history", json()).unwrap();
        assert!(map.try_add("h", &vec![5u32, 6], false).await.unwrap());
        let list = map.get_value_or_default("h").await.unwrap().unwrap();
        assert_eq!(list.enumerate().await.unwrap(), vec![5u32, 6]);
    }

    #[tokio::test]
    async fn test_composite_key_expiration() {
        let map = set_map(Arc::new(MemoryStore::new()));
        let at = SystemTime::now() + std::time::Duration::from_secs(30);

        assert!(!map.set_key_expiration("k", Some(at)).await.unwrap());
        map.try_add("k", &vec![1u32], false).await.unwrap();
        assert!(map.set_key_expiration("k", Some(at)).await.unwrap());
        assert_eq!(map.key_expiration("k").await.unwrap(), Some(at));
    }
}
