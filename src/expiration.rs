//! Key expiration layered over any [`KeyExpiration`] map.
//!
//! Per key: absent, present without TTL, present with TTL, then absent
//! again on expiry or removal. Re-setting a TTL is last-write-wins.
//!
//! Adding with an expiration is two store operations (add, then set the
//! expiration). If the process dies in between, the value stays without a
//! TTL.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::map::{KeyExpiration, KeyMap};

/// Absolute expiration of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// The key never expires.
    Never,
    At(SystemTime),
}

impl Expiration {
    /// Expiration `ttl` from now. A `ttl` too large to represent as an
    /// instant is `Never`.
    pub fn after(ttl: Duration) -> Self {
        SystemTime::now()
            .checked_add(ttl)
            .map_or(Expiration::Never, Expiration::At)
    }

    /// The instant, or `None` for `Never`.
    pub fn instant(&self) -> Option<SystemTime> {
        match self {
            Expiration::Never => None,
            Expiration::At(at) => Some(*at),
        }
    }

    /// Whether the instant is already reached. `Never` is never past.
    pub fn is_past(&self, now: SystemTime) -> bool {
        matches!(self, Expiration::At(at) if *at <= now)
    }
}

impl From<Option<SystemTime>> for Expiration {
    fn from(at: Option<SystemTime>) -> Self {
        at.map_or(Expiration::Never, Expiration::At)
    }
}

/// Adds TTL operations to a map.
pub struct ExpirableKeyMap<M> {
    inner: M,
}

impl<M: KeyExpiration> ExpirableKeyMap<M> {
    /// Wrap `inner`.
    pub fn new(inner: M) -> Self {
        Self { inner }
    }

    /// The wrapped map.
    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Unwrap into the inner map.
    pub fn into_inner(self) -> M {
        self.inner
    }

    /// Add `value` and expire it `ttl` from now.
    pub async fn try_add_with_relative_expiration(
        &self,
        key: &M::Key,
        value: &M::Value,
        ttl: Duration,
        overwrite: bool,
    ) -> Result<bool> {
        self.try_add_with_absolute_expiration(key, value, Expiration::after(ttl), overwrite)
            .await
    }

    /// Add `value` and then set its expiration. An instant in the past
    /// returns `false` without touching the store.
    pub async fn try_add_with_absolute_expiration(
        &self,
        key: &M::Key,
        value: &M::Value,
        expiration: Expiration,
        overwrite: bool,
    ) -> Result<bool> {
        if expiration.is_past(SystemTime::now()) {
            debug!("add rejected: expiration already passed");
            return Ok(false);
        }

        if !self.inner.try_add(key, value, overwrite).await? {
            return Ok(false);
        }

        if let Expiration::At(at) = expiration {
            // The key can vanish between the two calls; the add still happened.
            if !self.inner.set_key_expiration(key, Some(at)).await? {
                debug!("key removed before its expiration was set");
            }
        }
        Ok(true)
    }

    /// Returns `false` if the key is absent. A `ttl` beyond the
    /// representable range makes the key persistent.
    pub async fn set_relative_key_expiration(&self, key: &M::Key, ttl: Duration) -> Result<bool> {
        self.inner
            .set_key_expiration(key, Expiration::after(ttl).instant())
            .await
    }

    /// Returns `false` if the key is absent. `Never` removes the expiration.
    pub async fn set_absolute_key_expiration(
        &self,
        key: &M::Key,
        expiration: Expiration,
    ) -> Result<bool> {
        if expiration.is_past(SystemTime::now()) {
            return Err(StoreError::invalid("expiration is in the past"));
        }
        self.inner.set_key_expiration(key, expiration.instant()).await
    }

    /// Make the key persistent. Returns `false` if the key is absent.
    pub async fn remove_expiration(&self, key: &M::Key) -> Result<bool> {
        self.inner.set_key_expiration(key, None).await
    }

    /// Current expiration; `Never` if the key is absent or persistent.
    pub async fn key_expiration(&self, key: &M::Key) -> Result<Expiration> {
        Ok(self.inner.key_expiration(key).await?.into())
    }

    /// Remaining lifetime; `None` if the key is absent or never expires.
    pub async fn time_to_live(&self, key: &M::Key) -> Result<Option<Duration>> {
        let Some(at) = self.inner.key_expiration(key).await? else {
            return Ok(None);
        };
        Ok(Some(
            at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO),
        ))
    }
}

#[async_trait]
impl<M: KeyExpiration> KeyMap for ExpirableKeyMap<M> {
    type Key = M::Key;
    type Value = M::Value;

    async fn try_add(&self, key: &M::Key, value: &M::Value, overwrite: bool) -> Result<bool> {
        self.inner.try_add(key, value, overwrite).await
    }

    async fn try_remove(&self, key: &M::Key) -> Result<bool> {
        self.inner.try_remove(key).await
    }

    async fn contains_key(&self, key: &M::Key) -> Result<bool> {
        self.inner.contains_key(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::SetMap;
    use crate::memory::MemoryStore;
    use crate::serializer::{JsonSerializer, Utf8Serializer};
    use crate::sqlite::SqliteStore;
    use crate::store::StorageHandle;
    use crate::value_map::ValueMap;
    use std::sync::Arc;

    fn sessions<S: StorageHandle>(store: Arc<S>) -> ExpirableKeyMap<ValueMap<S, str, String>> {
        ExpirableKeyMap::new(ValueMap::new(store, "sessions", Arc::new(Utf8Serializer)).unwrap())
    }

    #[tokio::test]
    async fn test_past_instant_rejected_without_write() {
        let map = sessions(Arc::new(MemoryStore::new()));
        let past = SystemTime::now() - Duration::from_secs(5);

        let added = map
            .try_add_with_absolute_expiration("k", &"v".to_string(), Expiration::At(past), false)
            .await
            .unwrap();
        assert!(!added);
        assert!(!map.contains_key("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_update_supersedes() {
        let map = sessions(Arc::new(MemoryStore::new()));
        map.try_add("k", &"v".to_string(), false).await.unwrap();

        assert!(map
            .set_relative_key_expiration("k", Duration::from_millis(100))
            .await
            .unwrap());
        assert!(map
            .set_relative_key_expiration("k", Duration::from_millis(1000))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(map.contains_key("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(!map.contains_key("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_relative_add_expires_sqlite() {
        let map = sessions(Arc::new(SqliteStore::in_memory().await.unwrap()));

        assert!(map
            .try_add_with_relative_expiration(
                "k",
                &"v".to_string(),
                Duration::from_millis(150),
                false,
            )
            .await
            .unwrap());
        assert!(map.contains_key("k").await.unwrap());
        let ttl = map.time_to_live("k").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_millis(150));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!map.contains_key("k").await.unwrap());
        assert_eq!(map.inner().get_value_or_default("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_expiration_never_creates_key() {
        let map = sessions(Arc::new(MemoryStore::new()));

        assert!(!map
            .set_relative_key_expiration("ghost", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!map
            .set_absolute_key_expiration("ghost", Expiration::after(Duration::from_secs(10)))
            .await
            .unwrap());
        assert!(!map.remove_expiration("ghost").await.unwrap());
        assert!(!map.contains_key("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_absolute_rejects_past() {
        let map = sessions(Arc::new(MemoryStore::new()));
        map.try_add("k", &"v".to_string(), false).await.unwrap();

        let past = SystemTime::now() - Duration::from_secs(1);
        let err = map
            .set_absolute_key_expiration("k", Expiration::At(past))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert!(map.contains_key("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_expiration_persists_key() {
        let map = sessions(Arc::new(MemoryStore::new()));
        map.try_add_with_relative_expiration(
            "k",
            &"v".to_string(),
            Duration::from_millis(100),
            false,
        )
            .await
            .unwrap();
        assert!(matches!(map.key_expiration("k").await.unwrap(), Expiration::At(_)));

        assert!(map.remove_expiration("k").await.unwrap());
        assert_eq!(map.key_expiration("k").await.unwrap(), Expiration::Never);
        assert_eq!(map.time_to_live("k").await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(map.contains_key("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_never_adds_persistent_key() {
        let map = sessions(Arc::new(MemoryStore::new()));
        assert!(map
            .try_add_with_absolute_expiration("k", &"v".to_string(), Expiration::Never, false)
            .await
            .unwrap());
        assert_eq!(map.key_expiration("k").await.unwrap(), Expiration::Never);
    }

    #[tokio::test]
    async fn test_failed_add_sets_no_expiration() {
        let map = sessions(Arc::new(MemoryStore::new()));
        map.try_add("k", &"first".to_string(), false).await.unwrap();

        let added = map
            .try_add_with_relative_expiration(
                "k",
                &"second".to_string(),
                Duration::from_secs(5),
                false,
            )
            .await
            .unwrap();
        assert!(!added);
        assert_eq!(map.key_expiration("k").await.unwrap(), Expiration::Never);
    }

    #[tokio::test]
    async fn test_expirable_composite_map() {
        let store = Arc::new(MemoryStore::new());
        let sets: SetMap<MemoryStore, str, u32> =
            SetMap::new(store, "tags", Arc::new(JsonSerializer::<u32>::new())).unwrap();
        let map = ExpirableKeyMap::new(sets);

        assert!(map
            .try_add_with_relative_expiration(
                "k",
                &vec![1u32, 2],
                Duration::from_millis(100),
                false,
            )
            .await
            .unwrap());
        assert!(map.time_to_live("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!map.contains_key("k").await.unwrap());
        assert!(map.inner().get_value_or_default("k").await.unwrap().is_none());
    }

    async fn unbounded_ttl<S: StorageHandle>(store: Arc<S>) {
        let map = sessions(store);

        assert!(map
            .try_add_with_relative_expiration("k", &"v".to_string(), Duration::MAX, false)
            .await
            .unwrap());
        assert!(map.contains_key("k").await.unwrap());
        assert_eq!(map.key_expiration("k").await.unwrap(), Expiration::Never);

        map.set_relative_key_expiration("k", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(map
            .set_relative_key_expiration("k", Duration::MAX)
            .await
            .unwrap());
        assert_eq!(map.time_to_live("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unbounded_ttl_never_expires_memory() {
        unbounded_ttl(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_unbounded_ttl_never_expires_sqlite() {
        unbounded_ttl(Arc::new(SqliteStore::in_memory().await.unwrap())).await;
    }

    #[test]
    fn test_after_overflow_is_never() {
        assert_eq!(Expiration::after(Duration::MAX), Expiration::Never);
        assert!(matches!(
            Expiration::after(Duration::from_secs(1)),
            Expiration::At(_)
        ));
    }

    #[tokio::test]
    async fn test_far_future_instant_agrees_across_backends() {
        let far = SystemTime::UNIX_EPOCH + Duration::from_secs(13_835_058_055_282_163);
        let memory = sessions(Arc::new(MemoryStore::new()));
        let sqlite = sessions(Arc::new(SqliteStore::in_memory().await.unwrap()));

        let value = "v".to_string();
        assert!(memory
            .try_add_with_absolute_expiration("k", &value, Expiration::At(far), false)
            .await
            .unwrap());
        assert!(sqlite
            .try_add_with_absolute_expiration("k", &value, Expiration::At(far), false)
            .await
            .unwrap());
        assert!(memory.contains_key("k").await.unwrap());
        assert!(sqlite.contains_key("k").await.unwrap());
        assert!(sqlite.time_to_live("k").await.unwrap().is_some());
    }
}
