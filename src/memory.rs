//! In-memory store with key-value (Redis-style) semantics.
//!
//! Each `"{collection}:{key}"` identifier holds one typed value: a plain
//! value, a set, a list, a sorted set or a queue. Identifiers carry an
//! optional expiration which is enforced lazily on access and actively by
//! [`purge_expired`](crate::store::ExpirySweep::purge_expired).
//!
//! Transactions queue commands and apply them under a single write lock at
//! commit time, with `require_absent` evaluated as an `EXEC` condition.
//!
//! This implementation is NOT durable - data is lost on process exit.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::key::StorageId;
use crate::store::{
    next_instance_id, CollectionKind, ExpirySweep, PutMode, RawItem, StorageHandle,
    StorageTransaction,
};

type Keyspace = BTreeMap<String, Slot>;

enum Value {
    Plain(Vec<u8>),
    Set(BTreeSet<Vec<u8>>),
    List(VecDeque<Vec<u8>>),
    Queue(VecDeque<Vec<u8>>),
    /// Kept sorted by (score, member).
    SortedSet(Vec<(Vec<u8>, f64)>),
}

impl Value {
    fn empty(kind: CollectionKind) -> Self {
        match kind {
            CollectionKind::Set => Value::Set(BTreeSet::new()),
            CollectionKind::List => Value::List(VecDeque::new()),
            CollectionKind::Queue => Value::Queue(VecDeque::new()),
            CollectionKind::SortedSet => Value::SortedSet(Vec::new()),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Plain(_) => "plain",
            Value::Set(_) => CollectionKind::Set.as_str(),
            Value::List(_) => CollectionKind::List.as_str(),
            Value::Queue(_) => CollectionKind::Queue.as_str(),
            Value::SortedSet(_) => CollectionKind::SortedSet.as_str(),
        }
    }

    fn kind(&self) -> Option<CollectionKind> {
        match self {
            Value::Plain(_) => None,
            Value::Set(_) => Some(CollectionKind::Set),
            Value::List(_) => Some(CollectionKind::List),
            Value::Queue(_) => Some(CollectionKind::Queue),
            Value::SortedSet(_) => Some(CollectionKind::SortedSet),
        }
    }

    fn len(&self) -> usize {
        match self {
            Value::Plain(_) => 1,
            Value::Set(s) => s.len(),
            Value::List(l) | Value::Queue(l) => l.len(),
            Value::SortedSet(z) => z.len(),
        }
    }

    fn add(&mut self, item: RawItem) -> bool {
        match self {
            Value::Plain(v) => {
                *v = item.value;
                true
            }
            Value::Set(s) => s.insert(item.value),
            Value::List(l) | Value::Queue(l) => {
                l.push_back(item.value);
                true
            }
            Value::SortedSet(z) => {
                let score = item.score.unwrap_or(0.0);
                let existed = match z.iter().position(|(m, _)| *m == item.value) {
                    Some(pos) => {
                        z.remove(pos);
                        true
                    }
                    None => false,
                };
                let pos = z
                    .binary_search_by(|(m, s)| compare_scored(s, m, &score, &item.value))
                    .unwrap_or_else(|p| p);
                z.insert(pos, (item.value, score));
                !existed
            }
        }
    }

    fn remove(&mut self, value: &[u8]) -> bool {
        match self {
            Value::Plain(_) | Value::Queue(_) => false,
            Value::Set(s) => s.remove(value),
            Value::List(l) => match l.iter().position(|v| v == value) {
                Some(pos) => {
                    l.remove(pos);
                    true
                }
                None => false,
            },
            Value::SortedSet(z) => {
                let before = z.len();
                z.retain(|(m, _)| m != value);
                z.len() != before
            }
        }
    }

    fn contains(&self, value: &[u8]) -> bool {
        match self {
            Value::Plain(v) => v == value,
            Value::Set(s) => s.contains(value),
            Value::List(l) | Value::Queue(l) => l.iter().any(|v| v == value),
            Value::SortedSet(z) => z.iter().any(|(m, _)| m == value),
        }
    }

    fn items(&self) -> Vec<RawItem> {
        match self {
            Value::Plain(v) => vec![RawItem::new(v.clone())],
            Value::Set(s) => s.iter().cloned().map(RawItem::new).collect(),
            Value::List(l) | Value::Queue(l) => l.iter().cloned().map(RawItem::new).collect(),
            Value::SortedSet(z) => z
                .iter()
                .map(|(m, s)| RawItem::scored(m.clone(), *s))
                .collect(),
        }
    }

    fn pop_front(&mut self) -> Option<Vec<u8>> {
        match self {
            Value::List(l) | Value::Queue(l) => l.pop_front(),
            _ => None,
        }
    }
}

fn compare_scored(a_score: &f64, a_member: &[u8], b_score: &f64, b_member: &[u8]) -> Ordering {
    a_score
        .total_cmp(b_score)
        .then_with(|| a_member.cmp(b_member))
}

struct Slot {
    value: Value,
    expires_at: Option<SystemTime>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

fn live<'a>(data: &'a Keyspace, key: &str, now: SystemTime) -> Option<&'a Slot> {
    data.get(key).filter(|slot| !slot.is_expired(now))
}

fn purge_if_expired(data: &mut Keyspace, key: &str, now: SystemTime) {
    if data.get(key).map(|s| s.is_expired(now)).unwrap_or(false) {
        data.remove(key);
    }
}

fn wrong_type(key: &str, expected: &'static str, slot: &Slot) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
        found: slot.value.type_name(),
    }
}

fn check_kind(key: &str, slot: &Slot, kind: CollectionKind) -> Result<()> {
    if slot.value.kind() == Some(kind) {
        Ok(())
    } else {
        Err(wrong_type(key, kind.as_str(), slot))
    }
}

/// In-memory implementation of StorageHandle.
///
/// Uses a BTreeMap for ordered key iteration and RwLock for concurrency.
pub struct MemoryStore {
    data: Arc<RwLock<Keyspace>>,
    instance_id: u64,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            instance_id: next_instance_id(),
        }
    }

    /// Number of identifiers, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store holds no identifiers.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Clear all identifiers.
    pub fn clear(&self) {
        self.data.write().clear();
    }

    /// Run `f` against a live collection slot, removing it once it becomes empty.
    fn with_collection<R>(
        &self,
        id: &StorageId,
        kind: CollectionKind,
        default: R,
        f: impl FnOnce(&mut Value) -> R,
    ) -> Result<R> {
        let key = id.to_string();
        let now = SystemTime::now();
        let mut data = self.data.write();
        purge_if_expired(&mut data, &key, now);
        let Some(slot) = data.get_mut(&key) else {
            return Ok(default);
        };
        check_kind(&key, slot, kind)?;
        let result = f(&mut slot.value);
        if slot.value.len() == 0 {
            data.remove(&key);
        }
        Ok(result)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Queued `MULTI`-style transaction against a [`MemoryStore`].
pub struct MemoryTransaction {
    data: Arc<RwLock<Keyspace>>,
    key: String,
    kind: CollectionKind,
    require_absent: bool,
    clear: bool,
    pending: Vec<RawItem>,
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn require_absent(&mut self) -> Result<bool> {
        self.require_absent = true;
        Ok(true)
    }

    async fn clear(&mut self) -> Result<()> {
        self.clear = true;
        self.pending.clear();
        Ok(())
    }

    async fn push(&mut self, item: RawItem) -> Result<()> {
        self.pending.push(item);
        Ok(())
    }

    async fn commit(self) -> Result<bool> {
        let now = SystemTime::now();
        let mut data = self.data.write();
        purge_if_expired(&mut data, &self.key, now);

        if self.require_absent && data.contains_key(&self.key) {
            debug!(key = %self.key, "transaction condition failed: key exists");
            return Ok(false);
        }

        // Validate before mutating so a type error leaves nothing applied.
        if !self.clear {
            if let Some(slot) = data.get(&self.key) {
                check_kind(&self.key, slot, self.kind)?;
            }
        }

        if self.clear {
            data.remove(&self.key);
        }

        if !self.pending.is_empty() {
            let slot = data
                .entry(self.key.clone())
                .or_insert_with(|| Slot::new(Value::empty(self.kind)));
            for item in self.pending {
                slot.value.add(item);
            }
        }

        Ok(true)
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl StorageHandle for MemoryStore {
    type Transaction = MemoryTransaction;

    fn instance_id(&self) -> u64 {
        self.instance_id
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self, id: &StorageId, kind: CollectionKind) -> Result<MemoryTransaction> {
        Ok(MemoryTransaction {
            data: Arc::clone(&self.data),
            key: id.to_string(),
            kind,
            require_absent: false,
            clear: false,
            pending: Vec::new(),
        })
    }

    async fn exists(&self, id: &StorageId) -> Result<bool> {
        let data = self.data.read();
        Ok(live(&data, &id.to_string(), SystemTime::now()).is_some())
    }

    async fn delete(&self, id: &StorageId) -> Result<bool> {
        let key = id.to_string();
        let mut data = self.data.write();
        purge_if_expired(&mut data, &key, SystemTime::now());
        Ok(data.remove(&key).is_some())
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>> {
        let prefix = StorageId::prefix(collection);
        let now = SystemTime::now();
        let data = self.data.read();
        let keys = data
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(_, slot)| !slot.is_expired(now))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect();
        Ok(keys)
    }

    async fn set_expiration(&self, id: &StorageId, at: Option<SystemTime>) -> Result<bool> {
        let key = id.to_string();
        let mut data = self.data.write();
        purge_if_expired(&mut data, &key, SystemTime::now());
        match data.get_mut(&key) {
            Some(slot) => {
                slot.expires_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expiration(&self, id: &StorageId) -> Result<Option<SystemTime>> {
        let data = self.data.read();
        Ok(live(&data, &id.to_string(), SystemTime::now()).and_then(|slot| slot.expires_at))
    }

    async fn get_value(&self, id: &StorageId) -> Result<Option<Vec<u8>>> {
        let key = id.to_string();
        let data = self.data.read();
        match live(&data, &key, SystemTime::now()) {
            Some(Slot {
                value: Value::Plain(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(slot) => Err(wrong_type(&key, "plain", slot)),
            None => Ok(None),
        }
    }

    async fn put_value(&self, id: &StorageId, value: Vec<u8>, mode: PutMode) -> Result<bool> {
        let key = id.to_string();
        let mut data = self.data.write();
        purge_if_expired(&mut data, &key, SystemTime::now());

        let Some(slot) = data.get_mut(&key) else {
            if mode == PutMode::IfPresent {
                return Ok(false);
            }
            data.insert(key, Slot::new(Value::Plain(value)));
            return Ok(true);
        };
        if !matches!(slot.value, Value::Plain(_)) {
            return Err(wrong_type(&key, "plain", slot));
        }
        match mode {
            PutMode::IfAbsent => Ok(false),
            PutMode::IfPresent => {
                slot.value = Value::Plain(value);
                Ok(true)
            }
            PutMode::Upsert => {
                *slot = Slot::new(Value::Plain(value));
                Ok(true)
            }
        }
    }

    async fn items(&self, id: &StorageId, kind: CollectionKind) -> Result<Vec<RawItem>> {
        let key = id.to_string();
        let data = self.data.read();
        match live(&data, &key, SystemTime::now()) {
            Some(slot) => {
                check_kind(&key, slot, kind)?;
                Ok(slot.value.items())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn items_by_score(&self, id: &StorageId, min: f64, max: f64) -> Result<Vec<RawItem>> {
        let items = self.items(id, CollectionKind::SortedSet).await?;
        Ok(items
            .into_iter()
            .filter(|item| {
                let score = item.score.unwrap_or(0.0);
                score >= min && score <= max
            })
            .collect())
    }

    async fn add_item(&self, id: &StorageId, kind: CollectionKind, item: RawItem) -> Result<bool> {
        let key = id.to_string();
        let mut data = self.data.write();
        purge_if_expired(&mut data, &key, SystemTime::now());
        let slot = data
            .entry(key.clone())
            .or_insert_with(|| Slot::new(Value::empty(kind)));
        check_kind(&key, slot, kind)?;
        Ok(slot.value.add(item))
    }

    async fn remove_item(
        &self,
        id: &StorageId,
        kind: CollectionKind,
        value: &[u8],
    ) -> Result<bool> {
        kind.ensure_removable()?;
        self.with_collection(id, kind, false, |v| v.remove(value))
    }

    async fn contains_item(
        &self,
        id: &StorageId,
        kind: CollectionKind,
        value: &[u8],
    ) -> Result<bool> {
        let key = id.to_string();
        let data = self.data.read();
        match live(&data, &key, SystemTime::now()) {
            Some(slot) => {
                check_kind(&key, slot, kind)?;
                Ok(slot.value.contains(value))
            }
            None => Ok(false),
        }
    }

    async fn item_count(&self, id: &StorageId, kind: CollectionKind) -> Result<u64> {
        let key = id.to_string();
        let data = self.data.read();
        match live(&data, &key, SystemTime::now()) {
            Some(slot) => {
                check_kind(&key, slot, kind)?;
                Ok(slot.value.len() as u64)
            }
            None => Ok(0),
        }
    }

    async fn pop_front(&self, id: &StorageId, kind: CollectionKind) -> Result<Option<Vec<u8>>> {
        kind.ensure_poppable()?;
        self.with_collection(id, kind, None, |v| v.pop_front())
    }
}

#[async_trait]
impl ExpirySweep for MemoryStore {
    async fn purge_expired(&self, limit: u32) -> Result<u64> {
        let now = SystemTime::now();
        let mut data = self.data.write();
        let expired: Vec<String> = data
            .iter()
            .filter(|(_, slot)| slot.is_expired(now))
            .map(|(k, _)| k.clone())
            .take(limit as usize)
            .collect();
        for key in &expired {
            data.remove(key);
        }
        Ok(expired.len() as u64)
    }
}
