//! Map traits shared by composite and plain maps.

use async_trait::async_trait;
use std::time::SystemTime;

use crate::error::Result;
use crate::key::StoreKey;

/// A keyed map over a backing store.
///
/// `try_add` and `try_remove` report lost races and missing keys as
/// `Ok(false)`; only storage failures are errors.
#[async_trait]
pub trait KeyMap: Send + Sync {
    type Key: StoreKey + ?Sized;
    type Value: Send + Sync + ?Sized;

    /// Add `value` under `key`. With `overwrite = false` the call fails
    /// (returns `false`) if the key already exists.
    async fn try_add(&self, key: &Self::Key, value: &Self::Value, overwrite: bool) -> Result<bool>;

    /// Delete everything stored under `key`.
    async fn try_remove(&self, key: &Self::Key) -> Result<bool>;

    async fn contains_key(&self, key: &Self::Key) -> Result<bool>;
}

/// Maps whose keys can carry an expiration.
#[async_trait]
pub trait KeyExpiration: KeyMap {
    /// Set (`Some`) or clear (`None`) the expiration of an existing key.
    /// Returns `false` without creating anything if the key is absent.
    async fn set_key_expiration(&self, key: &Self::Key, at: Option<SystemTime>) -> Result<bool>;

    /// Current expiration, `None` if the key is absent or persistent.
    async fn key_expiration(&self, key: &Self::Key) -> Result<Option<SystemTime>>;
}
