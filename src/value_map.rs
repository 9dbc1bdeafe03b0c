//! Plain key to value map.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

use crate::error::Result;
use crate::key::{validate_collection_name, StorageId, StoreKey};
use crate::map::{KeyExpiration, KeyMap};
use crate::serializer::Serializer;
use crate::store::{PutMode, StorageHandle};

/// A map storing one serialized value per key.
pub struct ValueMap<S, K: ?Sized, V> {
    store: Arc<S>,
    name: String,
    serializer: Arc<dyn Serializer<V>>,
    _marker: PhantomData<fn(&K)>,
}

impl<S, K, V> ValueMap<S, K, V>
where
    S: StorageHandle,
    K: StoreKey + ?Sized,
    V: Send + Sync,
{
    /// Create a map named `name` on `store`.
    pub fn new(
        store: Arc<S>,
        name: impl Into<String>,
        serializer: Arc<dyn Serializer<V>>,
    ) -> Result<Self> {
        let name = name.into();
        validate_collection_name(&name)?;
        Ok(Self {
            store,
            name,
            serializer,
            _marker: PhantomData,
        })
    }

    /// Collection name of this map.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn storage_id(&self, key: &K) -> Result<StorageId> {
        StorageId::new(&self.name, key)
    }

    async fn put(&self, key: &K, value: &V, mode: PutMode) -> Result<bool> {
        let id = self.storage_id(key)?;
        let raw = self.serializer.serialize(value)?;
        let written = self.store.put_value(&id, raw, mode).await?;
        debug!(id = %id, ?mode, written, "put value");
        Ok(written)
    }

    /// Replace the value of an existing key. Returns `false` if the key is
    /// absent. The key keeps its expiration.
    pub async fn try_update(&self, key: &K, value: &V) -> Result<bool> {
        self.put(key, value, PutMode::IfPresent).await
    }

    /// Create or replace. A replaced key loses its expiration.
    pub async fn set(&self, key: &K, value: &V) -> Result<()> {
        self.put(key, value, PutMode::Upsert).await?;
        Ok(())
    }

    /// Value under `key`, or `None` if absent or expired.
    pub async fn get_value_or_default(&self, key: &K) -> Result<Option<V>> {
        let id = self.storage_id(key)?;
        match self.store.get_value(&id).await? {
            Some(raw) => Ok(Some(self.serializer.deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Keys currently present in the map.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.store.keys(&self.name).await
    }
}

#[async_trait]
impl<S, K, V> KeyMap for ValueMap<S, K, V>
where
    S: StorageHandle,
    K: StoreKey + ?Sized,
    V: Send + Sync + 'static,
{
    type Key = K;
    type Value = V;

    async fn try_add(&self, key: &K, value: &V, overwrite: bool) -> Result<bool> {
        let mode = if overwrite {
            PutMode::Upsert
        } else {
            PutMode::IfAbsent
        };
        self.put(key, value, mode).await
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
impl<S, K, V> KeyExpiration for ValueMap<S, K, V>
where
    S: StorageHandle,
    K: StoreKey + ?Sized,
    V: Send + Sync + 'static,
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
