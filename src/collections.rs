//! Live collection handles.
//!
//! A handle is bound to one [`StorageId`] on one store and reads and writes
//! the store directly; it never buffers items. Handles double as
//! [`CollectionSource`]s so they can be passed back into a composite map.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::key::StorageId;
use crate::serializer::Serializer;
use crate::store::{CollectionKind, RawItem, StorageHandle};

/// Identity of a map: the store instance plus the map's collection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapIdentity {
    pub store_instance: u64,
    pub collection: String,
}

/// Anything a composite map can copy items from.
#[async_trait]
pub trait CollectionSource<I>: Send + Sync {
    /// Every item, fully materialized, in the source's natural order.
    async fn snapshot(&self) -> Result<Vec<I>>;

    /// Whether this source already is the storage behind `key` in `map`.
    fn identity_matches(&self, _map: &MapIdentity, _key: &str) -> bool {
        false
    }
}

#[async_trait]
impl<I: Clone + Send + Sync> CollectionSource<I> for Vec<I> {
    async fn snapshot(&self) -> Result<Vec<I>> {
        Ok(self.clone())
    }
}

#[async_trait]
impl<I: Clone + Send + Sync> CollectionSource<I> for VecDeque<I> {
    async fn snapshot(&self) -> Result<Vec<I>> {
        Ok(self.iter().cloned().collect())
    }
}

#[async_trait]
impl<I: Clone + Send + Sync, H: std::hash::BuildHasher + Send + Sync> CollectionSource<I>
    for HashSet<I, H>
{
    async fn snapshot(&self) -> Result<Vec<I>> {
        Ok(self.iter().cloned().collect())
    }
}

#[async_trait]
impl<I: Clone + Send + Sync> CollectionSource<I> for BTreeSet<I> {
    async fn snapshot(&self) -> Result<Vec<I>> {
        Ok(self.iter().cloned().collect())
    }
}

/// A store plus the identifier a handle is bound to.
pub struct Binding<S> {
    pub store: Arc<S>,
    pub id: StorageId,
}

impl<S> Clone for Binding<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            id: self.id.clone(),
        }
    }
}

impl<S: StorageHandle> Binding<S> {
    /// Bind `id` on `store`.
    pub fn new(store: Arc<S>, id: StorageId) -> Self {
        Self { store, id }
    }

    fn matches(&self, map: &MapIdentity, key: &str) -> bool {
        self.store.instance_id() == map.store_instance
            && self.id.collection == map.collection
            && self.id.key == key
    }
}

/// A handle type a composite map can hand out.
pub trait LiveCollection<S: StorageHandle>: Send + Sync + Sized {
    /// Item as seen by callers.
    type Item: Send + Sync;
    /// Element type the serializer works on.
    type Value: Send + Sync;

    const KIND: CollectionKind;

    fn bind(binding: Binding<S>, serializer: Arc<dyn Serializer<Self::Value>>) -> Self;

    fn encode(item: &Self::Item, serializer: &dyn Serializer<Self::Value>) -> Result<RawItem>;
}

/// Shared plumbing of every handle.
struct Core<S, T> {
    binding: Binding<S>,
    serializer: Arc<dyn Serializer<T>>,
    kind: CollectionKind,
}

impl<S, T> Clone for Core<S, T> {
    fn clone(&self) -> Self {
        Self {
            binding: self.binding.clone(),
            serializer: Arc::clone(&self.serializer),
            kind: self.kind,
        }
    }
}

impl<S: StorageHandle, T: Send + Sync> Core<S, T> {
    fn new(binding: Binding<S>, serializer: Arc<dyn Serializer<T>>, kind: CollectionKind) -> Self {
        Self {
            binding,
            serializer,
            kind,
        }
    }

    fn store(&self) -> &S {
        &self.binding.store
    }

    fn id(&self) -> &StorageId {
        &self.binding.id
    }

    async fn add(&self, item: RawItem) -> Result<bool> {
        self.store().add_item(self.id(), self.kind, item).await
    }

    async fn remove(&self, item: &T) -> Result<bool> {
        let raw = self.serializer.serialize(item)?;
        self.store().remove_item(self.id(), self.kind, &raw).await
    }

    async fn contains(&self, item: &T) -> Result<bool> {
        let raw = self.serializer.serialize(item)?;
        self.store().contains_item(self.id(), self.kind, &raw).await
    }

    async fn len(&self) -> Result<u64> {
        self.store().item_count(self.id(), self.kind).await
    }

    async fn raw_items(&self) -> Result<Vec<RawItem>> {
        self.store().items(self.id(), self.kind).await
    }

    async fn values(&self) -> Result<Vec<T>> {
        self.raw_items()
            .await?
            .iter()
            .map(|item| self.serializer.deserialize(&item.value))
            .collect()
    }

    async fn pop_front(&self) -> Result<Option<T>> {
        match self.store().pop_front(self.id(), self.kind).await? {
            Some(raw) => Ok(Some(self.serializer.deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    async fn clear(&self) -> Result<bool> {
        self.store().delete(self.id()).await
    }
}

macro_rules! common_handle_ops {
    ($handle:ident) => {
        impl<S: StorageHandle, T: Send + Sync + 'static> $handle<S, T> {
            /// Identifier this handle is bound to.
            pub fn storage_id(&self) -> &StorageId {
                self.core.id()
            }

            /// Whether `item` is in the collection.
            pub async fn contains(&self, item: &T) -> Result<bool> {
                self.core.contains(item).await
            }

            /// Number of items; 0 when the identifier is absent.
            pub async fn len(&self) -> Result<u64> {
                self.core.len().await
            }

            /// Whether the collection holds no items.
            pub async fn is_empty(&self) -> Result<bool> {
                Ok(self.core.len().await? == 0)
            }

            /// Delete the whole collection; returns whether it existed.
            pub async fn clear(&self) -> Result<bool> {
                self.core.clear().await
            }
        }

        impl<S, T> Clone for $handle<S, T> {
            fn clone(&self) -> Self {
                Self {
                    core: self.core.clone(),
                }
            }
        }

        impl<S, T> fmt::Debug for $handle<S, T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($handle))
                    .field("id", &self.core.binding.id)
                    .finish()
            }
        }
    };
}

/// Live handle to a set.
pub struct SetHandle<S, T> {
    core: Core<S, T>,
}

common_handle_ops!(SetHandle);

impl<S: StorageHandle, T: Send + Sync + 'static> SetHandle<S, T> {
    /// Create a set handle bound to `binding`.
    pub fn new(binding: Binding<S>, serializer: Arc<dyn Serializer<T>>) -> Self {
        Self {
            core: Core::new(binding, serializer, CollectionKind::Set),
        }
    }

    /// Returns `false` if the item was already a member.
    pub async fn add(&self, item: &T) -> Result<bool> {
        let raw = self.core.serializer.serialize(item)?;
        self.core.add(RawItem::new(raw)).await
    }

    /// Remove `item`; returns whether it was a member.
    pub async fn remove(&self, item: &T) -> Result<bool> {
        self.core.remove(item).await
    }

    /// All members, in the store's order.
    pub async fn enumerate(&self) -> Result<Vec<T>> {
        self.core.values().await
    }
}

/// Live handle to a list.
pub struct ListHandle<S, T> {
    core: Core<S, T>,
}

common_handle_ops!(ListHandle);

impl<S: StorageHandle, T: Send + Sync + 'static> ListHandle<S, T> {
    /// Create a list handle bound to `binding`.
    pub fn new(binding: Binding<S>, serializer: Arc<dyn Serializer<T>>) -> Self {
        Self {
            core: Core::new(binding, serializer, CollectionKind::List),
        }
    }

    /// Append to the tail.
    pub async fn push(&self, item: &T) -> Result<()> {
        let raw = self.core.serializer.serialize(item)?;
        self.core.add(RawItem::new(raw)).await?;
        Ok(())
    }

    /// Same as [`push`](Self::push).
    pub async fn add(&self, item: &T) -> Result<()> {
        self.push(item).await
    }

    /// Remove the first occurrence of `item`.
    pub async fn remove(&self, item: &T) -> Result<bool> {
        self.core.remove(item).await
    }

    /// Remove and return the head of the list.
    pub async fn pop_front(&self) -> Result<Option<T>> {
        self.core.pop_front().await
    }

    /// All items in list order.
    pub async fn enumerate(&self) -> Result<Vec<T>> {
        self.core.values().await
    }
}

/// A sorted-set member with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored<T> {
    pub item: T,
    pub score: f64,
}

impl<T> Scored<T> {
    /// Pair `item` with `score`.
    pub fn new(item: T, score: f64) -> Self {
        Self { item, score }
    }
}

/// Live handle to a sorted set.
pub struct SortedSetHandle<S, T> {
    core: Core<S, T>,
}

common_handle_ops!(SortedSetHandle);

impl<S: StorageHandle, T: Send + Sync + 'static> SortedSetHandle<S, T> {
    /// Create a sorted-set handle bound to `binding`.
    pub fn new(binding: Binding<S>, serializer: Arc<dyn Serializer<T>>) -> Self {
        Self {
            core: Core::new(binding, serializer, CollectionKind::SortedSet),
        }
    }

    /// Add a member or replace its score. Returns `false` if it was already a member.
    pub async fn add(&self, item: &T, score: f64) -> Result<bool> {
        let raw = self.core.serializer.serialize(item)?;
        self.core.add(RawItem::scored(raw, score)).await
    }

    /// Remove a member; returns whether it was present.
    pub async fn remove(&self, item: &T) -> Result<bool> {
        self.core.remove(item).await
    }

    /// Members ordered by (score, member).
    pub async fn enumerate(&self) -> Result<Vec<Scored<T>>> {
        let raw = self.core.raw_items().await?;
        self.decode(raw)
    }

    /// Members with `min <= score <= max`.
    pub async fn range_by_score(&self, min: f64, max: f64) -> Result<Vec<Scored<T>>> {
        let raw = self
            .core
            .store()
            .items_by_score(self.core.id(), min, max)
            .await?;
        self.decode(raw)
    }

    fn decode(&self, raw: Vec<RawItem>) -> Result<Vec<Scored<T>>> {
        raw.into_iter()
            .map(|item| {
                Ok(Scored {
                    item: self.core.serializer.deserialize(&item.value)?,
                    score: item.score.unwrap_or_default(),
                })
            })
            .collect()
    }
}

/// Live handle to a FIFO queue.
pub struct QueueHandle<S, T> {
    core: Core<S, T>,
}

common_handle_ops!(QueueHandle);

impl<S: StorageHandle, T: Send + Sync + 'static> QueueHandle<S, T> {
    /// Create a queue handle bound to `binding`.
    pub fn new(binding: Binding<S>, serializer: Arc<dyn Serializer<T>>) -> Self {
        Self {
            core: Core::new(binding, serializer, CollectionKind::Queue),
        }
    }

    /// Append `item` at the tail.
    pub async fn enqueue(&self, item: &T) -> Result<()> {
        let raw = self.core.serializer.serialize(item)?;
        self.core.add(RawItem::new(raw)).await?;
        Ok(())
    }

    /// Same as [`enqueue`](Self::enqueue).
    pub async fn add(&self, item: &T) -> Result<()> {
        self.enqueue(item).await
    }

    /// Non-blocking dequeue; `None` when the queue is empty.
    pub async fn dequeue_or_default(&self) -> Result<Option<T>> {
        self.core.pop_front().await
    }

    /// Queues only support removal at the head.
    pub async fn remove(&self, item: &T) -> Result<bool> {
        self.core.remove(item).await
    }

    /// All items in FIFO order, without removing them.
    pub async fn enumerate(&self) -> Result<Vec<T>> {
        self.core.values().await
    }
}

macro_rules! plain_live_collection {
    ($handle:ident, $kind:expr) => {
        impl<S: StorageHandle, T: Send + Sync + 'static> LiveCollection<S> for $handle<S, T> {
            type Item = T;
            type Value = T;

            const KIND: CollectionKind = $kind;

            fn bind(binding: Binding<S>, serializer: Arc<dyn Serializer<T>>) -> Self {
                Self::new(binding, serializer)
            }

            fn encode(item: &T, serializer: &dyn Serializer<T>) -> Result<RawItem> {
                Ok(RawItem::new(serializer.serialize(item)?))
            }
        }

        #[async_trait]
        impl<S: StorageHandle, T: Send + Sync + 'static> CollectionSource<T> for $handle<S, T> {
            async fn snapshot(&self) -> Result<Vec<T>> {
                self.core.values().await
            }

            fn identity_matches(&self, map: &MapIdentity, key: &str) -> bool {
                self.core.binding.matches(map, key)
            }
        }
    };
}

plain_live_collection!(SetHandle, CollectionKind::Set);
plain_live_collection!(ListHandle, CollectionKind::List);
plain_live_collection!(QueueHandle, CollectionKind::Queue);

impl<S: StorageHandle, T: Send + Sync + 'static> LiveCollection<S> for SortedSetHandle<S, T> {
    type Item = Scored<T>;
    type Value = T;

    const KIND: CollectionKind = CollectionKind::SortedSet;

    fn bind(binding: Binding<S>, serializer: Arc<dyn Serializer<T>>) -> Self {
        Self::new(binding, serializer)
    }

    fn encode(item: &Scored<T>, serializer: &dyn Serializer<T>) -> Result<RawItem> {
        Ok(RawItem::scored(serializer.serialize(&item.item)?, item.score))
    }
}

#[async_trait]
impl<S: StorageHandle, T: Send + Sync + 'static> CollectionSource<Scored<T>>
    for SortedSetHandle<S, T>
{
    async fn snapshot(&self) -> Result<Vec<Scored<T>>> {
        self.enumerate().await
    }

    fn identity_matches(&self, map: &MapIdentity, key: &str) -> bool {
        self.core.binding.matches(map, key)
    }
}
