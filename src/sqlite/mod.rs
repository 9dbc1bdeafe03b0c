//! SQLite store implementation.
//!
//! Each collection name maps to one table with the layout from
//! [`commands::collection_table`]; a storage identifier is the
//! `key = ?` filter on that table. Tables are created and migrated lazily by
//! a per-table [`SchemaSynchronizer`] before the first command runs against
//! them.
//!
//! Features:
//! - WAL mode for concurrent readers
//! - Real database transactions for composite writes
//! - Expiration column with implicit filtering of expired rows
//! - Fixed per-store command timeout

pub mod commands;
pub mod schema;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use crate::config::SqliteConfig;
use crate::error::{Result, StoreError};
use crate::key::{validate_collection_name, StorageId};
use crate::store::{
    from_unix_millis, next_instance_id, unix_millis, CollectionKind, ExpirySweep, PutMode,
    RawItem, StorageHandle, StorageTransaction,
};
use commands::{collection_table, Commands};
use schema::{Column, LiveColumn, SchemaDriver, SchemaSynchronizer, Table};

/// Run a database future under the store's command timeout.
async fn timed<T, E, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<StoreError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Busy, locked and constraint failures mean another writer got there first.
fn is_lost_race(err: &StoreError) -> bool {
    match err {
        StoreError::Database(sqlx::Error::Database(db)) => {
            db.is_unique_violation()
                || matches!(
                    db.code().as_deref(),
                    Some("5" | "6" | "261" | "262" | "517" | "1555" | "2067")
                )
        }
        _ => false,
    }
}

fn now_millis() -> i64 {
    unix_millis(SystemTime::now())
}

/// Schema driver issuing DDL through a SQLite pool.
#[derive(Clone)]
pub struct SqliteSchemaDriver {
    pool: SqlitePool,
    timeout: Duration,
}

impl SqliteSchemaDriver {
    /// Create a driver issuing DDL through `pool`.
    pub fn new(pool: SqlitePool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl SchemaDriver for SqliteSchemaDriver {
    async fn describe(&self, table: &Table) -> Result<Option<Vec<LiveColumn>>> {
        let rows: Vec<(String, String)> = timed(
            self.timeout,
            sqlx::query_as("SELECT name, type FROM pragma_table_info(?1, ?2)")
                .bind(&table.name)
                .bind(&table.schema)
                .fetch_all(&self.pool),
        )
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            rows.into_iter()
                .map(|(name, declared_type)| LiveColumn {
                    name,
                    declared_type,
                })
                .collect(),
        ))
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        let sql = table.create_statement();
        debug!(%sql, "create table");
        timed(self.timeout, sqlx::query(&sql).execute(&self.pool)).await?;
        Ok(())
    }

    async fn add_column(&self, table: &Table, column: &Column) -> Result<()> {
        let sql = table.add_column_statement(column);
        debug!(%sql, "add column");
        timed(self.timeout, sqlx::query(&sql).execute(&self.pool)).await?;
        Ok(())
    }
}

struct TableEntry {
    sync: SchemaSynchronizer,
    commands: Commands,
}

/// SQLite implementation of StorageHandle.
pub struct SqliteStore {
    pool: SqlitePool,
    config: SqliteConfig,
    driver: SqliteSchemaDriver,
    tables: Mutex<HashMap<String, Arc<TableEntry>>>,
    instance_id: u64,
}

impl SqliteStore {
    /// Open or create a SQLite store described by `config`.
    pub async fn open(config: SqliteConfig) -> Result<Self> {
        info!(url = %config.url, "Opening SQLite store");

        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self::with_pool(pool, config))
    }

    /// Open or create a file-backed store with default settings.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let config = SqliteConfig {
            url: format!("sqlite:{}", path.as_ref().display()),
            ..SqliteConfig::default()
        };
        Self::open(config).await
    }

    /// Create an in-memory SQLite store (for testing).
    ///
    /// A single connection is kept alive for the lifetime of the pool, since
    /// every new `:memory:` connection would see an empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self::with_pool(pool, SqliteConfig::default()))
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: SqlitePool, config: SqliteConfig) -> Self {
        let driver = SqliteSchemaDriver::new(pool.clone(), config.command_timeout());
        Self {
            pool,
            config,
            driver,
            tables: Mutex::new(HashMap::new()),
            instance_id: next_instance_id(),
        }
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Settings this store was opened with.
    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    fn command_timeout(&self) -> Duration {
        self.config.command_timeout()
    }

    fn entry(&self, collection: &str) -> Result<Arc<TableEntry>> {
        let mut tables = self.tables.lock();
        if let Some(entry) = tables.get(collection) {
            return Ok(Arc::clone(entry));
        }
        validate_collection_name(collection)?;
        let table = collection_table(&self.config.schema, collection, self.config.sync_strategy);
        let entry = Arc::new(TableEntry {
            commands: Commands::new(&table),
            sync: SchemaSynchronizer::new(table),
        });
        tables.insert(collection.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Synchronize the collection's table and return its commands.
    async fn prepare(&self, collection: &str) -> Result<Commands> {
        let entry = self.entry(collection)?;
        entry.sync.ensure(&self.driver).await?;
        Ok(entry.commands.clone())
    }

    /// Register `table` (if not already known under its name) and
    /// synchronize its schema according to its strategy.
    pub async fn ensure_table(&self, table: Table) -> Result<()> {
        table.validate()?;
        let entry = {
            let mut tables = self.tables.lock();
            let name = table.name.clone();
            let entry = tables.entry(name).or_insert_with(|| {
                Arc::new(TableEntry {
                    commands: Commands::new(&table),
                    sync: SchemaSynchronizer::new(table),
                })
            });
            Arc::clone(entry)
        };
        entry.sync.ensure(&self.driver).await
    }
}

/// Database transaction writing one collection.
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    commands: Commands,
    key: String,
    kind: CollectionKind,
    next_position: Option<i64>,
    timeout: Duration,
    lost: bool,
}

impl SqliteTransaction {
    /// Record a lost race instead of failing; other errors propagate.
    fn absorb<T>(&mut self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if is_lost_race(&e) => {
                debug!(key = %self.key, error = %e, "transaction lost a race");
                self.lost = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn position(&mut self) -> Result<i64> {
        if let Some(pos) = self.next_position {
            return Ok(pos);
        }
        let sql = self.commands.next_position();
        let (pos,): (i64,) = timed(
            self.timeout,
            sqlx::query_as(&sql).bind(&self.key).fetch_one(&mut *self.tx),
        )
        .await?;
        self.next_position = Some(pos);
        Ok(pos)
    }

    async fn write(&mut self, item: RawItem) -> Result<()> {
        if self.kind.is_unique() {
            let sql = self.commands.find_item();
            let found: Option<(i64,)> = timed(
                self.timeout,
                sqlx::query_as(&sql)
                    .bind(&self.key)
                    .bind(&item.value)
                    .fetch_optional(&mut *self.tx),
            )
            .await?;
            if found.is_some() {
                if self.kind == CollectionKind::SortedSet {
                    let sql = self.commands.update_score();
                    timed(
                        self.timeout,
                        sqlx::query(&sql)
                            .bind(&self.key)
                            .bind(&item.value)
                            .bind(item.score)
                            .execute(&mut *self.tx),
                    )
                    .await?;
                }
                return Ok(());
            }
        }

        let position = self.position().await?;
        let sql = self.commands.insert();
        timed(
            self.timeout,
            sqlx::query(&sql)
                .bind(&self.key)
                .bind(position)
                .bind(&item.value)
                .bind(item.score)
                .execute(&mut *self.tx),
        )
        .await?;
        self.next_position = Some(position + 1);
        Ok(())
    }
}

#[async_trait]
impl StorageTransaction for SqliteTransaction {
    async fn require_absent(&mut self) -> Result<bool> {
        if self.lost {
            return Ok(false);
        }
        let sql = self.commands.exists();
        let found: Result<Option<(i64,)>> = timed(
            self.timeout,
            sqlx::query_as(&sql)
                .bind(&self.key)
                .bind(now_millis())
                .fetch_optional(&mut *self.tx),
        )
        .await;
        match self.absorb(found)? {
            Some(row) => Ok(row.is_none()),
            None => Ok(false),
        }
    }

    async fn clear(&mut self) -> Result<()> {
        if self.lost {
            return Ok(());
        }
        let sql = self.commands.delete_key();
        let result = timed(
            self.timeout,
            sqlx::query(&sql).bind(&self.key).execute(&mut *self.tx),
        )
        .await;
        self.absorb(result)?;
        self.next_position = Some(0);
        Ok(())
    }

    async fn push(&mut self, item: RawItem) -> Result<()> {
        if self.lost {
            return Ok(());
        }
        let result = self.write(item).await;
        self.absorb(result)?;
        Ok(())
    }

    async fn commit(self) -> Result<bool> {
        if self.lost {
            timed(self.timeout, self.tx.rollback()).await?;
            return Ok(false);
        }
        match timed(self.timeout, self.tx.commit()).await {
            Ok(()) => Ok(true),
            Err(e) if is_lost_race(&e) => {
                debug!(key = %self.key, error = %e, "commit lost a race");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn rollback(self) -> Result<()> {
        timed(self.timeout, self.tx.rollback()).await
    }
}

#[async_trait]
impl StorageHandle for SqliteStore {
    type Transaction = SqliteTransaction;

    fn instance_id(&self) -> u64 {
        self.instance_id
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn begin(&self, id: &StorageId, kind: CollectionKind) -> Result<SqliteTransaction> {
        // Schema work uses its own pool connection, so it must finish before
        // this transaction takes one.
        let commands = self.prepare(&id.collection).await?;
        let timeout = self.command_timeout();
        let mut tx = timed(timeout, self.pool.begin())
            .await
            .map_err(|e| match e {
                StoreError::Database(e) => StoreError::TransactionFailed(e.to_string()),
                other => other,
            })?;

        // Writing first takes the write lock up front, so concurrent writers
        // queue on busy_timeout instead of failing on a stale snapshot.
        let purge = commands.purge_key();
        let purged = timed(
            timeout,
            sqlx::query(&purge)
                .bind(&id.key)
                .bind(now_millis())
                .execute(&mut *tx),
        )
        .await;

        let mut transaction = SqliteTransaction {
            tx,
            commands,
            key: id.key.clone(),
            kind,
            next_position: None,
            timeout,
            lost: false,
        };
        transaction.absorb(purged)?;
        Ok(transaction)
    }

    async fn exists(&self, id: &StorageId) -> Result<bool> {
        let commands = self.prepare(&id.collection).await?;
        let sql = commands.exists();
        let row: Option<(i64,)> = timed(
            self.command_timeout(),
            sqlx::query_as(&sql)
                .bind(&id.key)
                .bind(now_millis())
                .fetch_optional(&self.pool),
        )
        .await?;
        Ok(row.is_some())
    }

    async fn delete(&self, id: &StorageId) -> Result<bool> {
        let commands = self.prepare(&id.collection).await?;
        let (purge, delete) = (commands.purge_key(), commands.delete_key());
        let pool = &self.pool;
        timed(self.command_timeout(), async move {
            let mut tx = pool.begin().await?;
            sqlx::query(&purge)
                .bind(&id.key)
                .bind(now_millis())
                .execute(&mut *tx)
                .await?;
            let deleted = sqlx::query(&delete)
                .bind(&id.key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok::<_, sqlx::Error>(deleted > 0)
        })
        .await
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>> {
        let commands = self.prepare(collection).await?;
        let sql = commands.keys();
        let rows: Vec<(String,)> = timed(
            self.command_timeout(),
            sqlx::query_as(&sql).bind(now_millis()).fetch_all(&self.pool),
        )
        .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn set_expiration(&self, id: &StorageId, at: Option<SystemTime>) -> Result<bool> {
        let commands = self.prepare(&id.collection).await?;
        let (purge, update) = (commands.purge_key(), commands.set_expiration());
        let at = at.map(unix_millis);
        let pool = &self.pool;
        timed(self.command_timeout(), async move {
            let mut tx = pool.begin().await?;
            sqlx::query(&purge)
                .bind(&id.key)
                .bind(now_millis())
                .execute(&mut *tx)
                .await?;
            let updated = sqlx::query(&update)
                .bind(&id.key)
                .bind(at)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok::<_, sqlx::Error>(updated > 0)
        })
        .await
    }

    async fn expiration(&self, id: &StorageId) -> Result<Option<SystemTime>> {
        let commands = self.prepare(&id.collection).await?;
        let sql = commands.expiration();
        let (at,): (Option<i64>,) = timed(
            self.command_timeout(),
            sqlx::query_as(&sql)
                .bind(&id.key)
                .bind(now_millis())
                .fetch_one(&self.pool),
        )
        .await?;
        Ok(at.map(from_unix_millis))
    }

    async fn get_value(&self, id: &StorageId) -> Result<Option<Vec<u8>>> {
        let commands = self.prepare(&id.collection).await?;
        let sql = commands.get_value();
        let row: Option<(Vec<u8>,)> = timed(
            self.command_timeout(),
            sqlx::query_as(&sql)
                .bind(&id.key)
                .bind(now_millis())
                .fetch_optional(&self.pool),
        )
        .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn put_value(&self, id: &StorageId, value: Vec<u8>, mode: PutMode) -> Result<bool> {
        let commands = self.prepare(&id.collection).await?;
        let pool = &self.pool;
        let result = timed(self.command_timeout(), async move {
            let mut tx = pool.begin().await?;
            let now = now_millis();
            sqlx::query(&commands.purge_key())
                .bind(&id.key)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            let exists = sqlx::query(&commands.exists())
                .bind(&id.key)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();

            let written = match (mode, exists) {
                (PutMode::IfAbsent, true) | (PutMode::IfPresent, false) => false,
                (PutMode::IfPresent, true) => {
                    sqlx::query(&commands.update_value())
                        .bind(&id.key)
                        .bind(&value)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected()
                        > 0
                }
                (PutMode::Upsert, _) | (PutMode::IfAbsent, false) => {
                    sqlx::query(&commands.delete_key())
                        .bind(&id.key)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(&commands.insert())
                        .bind(&id.key)
                        .bind(0i64)
                        .bind(&value)
                        .bind(None::<f64>)
                        .execute(&mut *tx)
                        .await?;
                    true
                }
            };
            tx.commit().await?;
            Ok::<_, sqlx::Error>(written)
        })
        .await;

        match result {
            Err(e) if mode == PutMode::IfAbsent && is_lost_race(&e) => Ok(false),
            other => other,
        }
    }

    async fn items(&self, id: &StorageId, kind: CollectionKind) -> Result<Vec<RawItem>> {
        let commands = self.prepare(&id.collection).await?;
        let sql = commands.items(kind == CollectionKind::SortedSet);
        let rows: Vec<(Vec<u8>, Option<f64>)> = timed(
            self.command_timeout(),
            sqlx::query_as(&sql)
                .bind(&id.key)
                .bind(now_millis())
                .fetch_all(&self.pool),
        )
        .await?;
        Ok(rows
            .into_iter()
            .map(|(value, score)| RawItem { value, score })
            .collect())
    }

    async fn items_by_score(&self, id: &StorageId, min: f64, max: f64) -> Result<Vec<RawItem>> {
        let commands = self.prepare(&id.collection).await?;
        let sql = commands.items_by_score();
        let rows: Vec<(Vec<u8>, Option<f64>)> = timed(
            self.command_timeout(),
            sqlx::query_as(&sql)
                .bind(&id.key)
                .bind(now_millis())
                .bind(min)
                .bind(max)
                .fetch_all(&self.pool),
        )
        .await?;
        Ok(rows
            .into_iter()
            .map(|(value, score)| RawItem { value, score })
            .collect())
    }

    async fn add_item(&self, id: &StorageId, kind: CollectionKind, item: RawItem) -> Result<bool> {
        let commands = self.prepare(&id.collection).await?;
        let pool = &self.pool;
        timed(self.command_timeout(), async move {
            let mut tx = pool.begin().await?;
            sqlx::query(&commands.purge_key())
                .bind(&id.key)
                .bind(now_millis())
                .execute(&mut *tx)
                .await?;

            if kind.is_unique() {
                let found = sqlx::query(&commands.find_item())
                    .bind(&id.key)
                    .bind(&item.value)
                    .fetch_optional(&mut *tx)
                    .await?
                    .is_some();
                if found {
                    if kind == CollectionKind::SortedSet {
                        sqlx::query(&commands.update_score())
                            .bind(&id.key)
                            .bind(&item.value)
                            .bind(item.score)
                            .execute(&mut *tx)
                            .await?;
                    }
                    tx.commit().await?;
                    return Ok::<_, sqlx::Error>(false);
                }
            }

            let (position,): (i64,) = sqlx::query_as(&commands.next_position())
                .bind(&id.key)
                .fetch_one(&mut *tx)
                .await?;
            sqlx::query(&commands.insert())
                .bind(&id.key)
                .bind(position)
                .bind(&item.value)
                .bind(item.score)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn remove_item(
        &self,
        id: &StorageId,
        kind: CollectionKind,
        value: &[u8],
    ) -> Result<bool> {
        kind.ensure_removable()?;
        let commands = self.prepare(&id.collection).await?;
        let sql = commands.remove_item();
        let removed = timed(
            self.command_timeout(),
            sqlx::query(&sql)
                .bind(&id.key)
                .bind(now_millis())
                .bind(value)
                .execute(&self.pool),
        )
        .await?
        .rows_affected();
        Ok(removed > 0)
    }

    async fn contains_item(
        &self,
        id: &StorageId,
        _kind: CollectionKind,
        value: &[u8],
    ) -> Result<bool> {
        let commands = self.prepare(&id.collection).await?;
        let sql = commands.contains_item();
        let row: Option<(i64,)> = timed(
            self.command_timeout(),
            sqlx::query_as(&sql)
                .bind(&id.key)
                .bind(now_millis())
                .bind(value)
                .fetch_optional(&self.pool),
        )
        .await?;
        Ok(row.is_some())
    }

    async fn item_count(&self, id: &StorageId, _kind: CollectionKind) -> Result<u64> {
        let commands = self.prepare(&id.collection).await?;
        let sql = commands.count();
        let (count,): (i64,) = timed(
            self.command_timeout(),
            sqlx::query_as(&sql)
                .bind(&id.key)
                .bind(now_millis())
                .fetch_one(&self.pool),
        )
        .await?;
        Ok(count as u64)
    }

    async fn pop_front(&self, id: &StorageId, kind: CollectionKind) -> Result<Option<Vec<u8>>> {
        kind.ensure_poppable()?;
        let commands = self.prepare(&id.collection).await?;
        let sql = commands.pop_front();
        let row: Option<(Vec<u8>,)> = timed(
            self.command_timeout(),
            sqlx::query_as(&sql)
                .bind(&id.key)
                .bind(now_millis())
                .fetch_optional(&self.pool),
        )
        .await?;
        Ok(row.map(|(v,)| v))
    }
}

#[async_trait]
impl ExpirySweep for SqliteStore {
    async fn purge_expired(&self, limit: u32) -> Result<u64> {
        let entries: Vec<Arc<TableEntry>> = self.tables.lock().values().cloned().collect();
        let mut purged = 0u64;
        for entry in entries {
            if purged >= limit as u64 {
                break;
            }
            // Custom tables registered through ensure_table carry no expiration column.
            if entry.sync.table().get_column("expires_at").is_none() {
                continue;
            }
            entry.sync.ensure(&self.driver).await?;
            let sql = entry.commands.purge_expired();
            let rows: Vec<(String,)> = timed(
                self.command_timeout(),
                sqlx::query_as(&sql)
                    .bind(now_millis())
                    .bind((limit as u64 - purged) as i64)
                    .fetch_all(&self.pool),
            )
            .await?;
            // One row per item; count identifiers.
            let keys: HashSet<String> = rows.into_iter().map(|(key,)| key).collect();
            purged += keys.len() as u64;
        }
        Ok(purged)
    }
}
