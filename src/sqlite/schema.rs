//! Table descriptors and lazy schema synchronization.
//!
//! A [`SchemaSynchronizer`] makes sure its table exists with every declared
//! column before the first command runs against it:
//!
//! - absent table: `CREATE TABLE` with all columns and a primary key over the
//!   declared key columns
//! - present table: missing columns are added one `ALTER TABLE` at a time
//! - a live column whose type conflicts with the declaration fails with
//!   [`StoreError::SchemaIncompatible`]; types are never migrated
//!
//! How often synchronization is attempted is governed by [`SyncStrategy`].
//! Each synchronizer owns its own async mutex, so concurrent callers on the
//! same table run the check-and-alter sequence exactly once while other
//! tables proceed independently.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::key::validate_collection_name;

/// Policy for how often schema reconciliation runs per table instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Never synchronize; the table is assumed to exist.
    Ignore,
    /// Synchronize on first use only, whatever the outcome.
    TryOnce,
    /// Synchronize on every use until one attempt succeeds.
    UntilSuccess,
}

impl FromStr for SyncStrategy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(SyncStrategy::Ignore),
            "try_once" | "tryonce" => Ok(SyncStrategy::TryOnce),
            "until_success" | "untilsuccess" => Ok(SyncStrategy::UntilSuccess),
            other => Err(StoreError::Config(format!("unknown sync strategy {:?}", other))),
        }
    }
}

/// Storage class of a column, compared using SQLite affinity rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Blob,
    Numeric,
}

impl ColumnType {
    /// SQL type name used in DDL.
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
            ColumnType::Numeric => "NUMERIC",
        }
    }

    /// Affinity of a declared column type.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            ColumnType::Text
        } else if upper.is_empty() || upper.contains("BLOB") {
            ColumnType::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            ColumnType::Real
        } else {
            ColumnType::Numeric
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

/// A declared column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub db_type: ColumnType,
    pub length: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub is_identity: bool,
    pub nullable: bool,
}

impl Column {
    /// A nullable column of `db_type`.
    pub fn new(name: impl Into<String>, db_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            db_type,
            length: None,
            precision: None,
            scale: None,
            is_identity: false,
            nullable: true,
        }
    }

    /// Mark the column `NOT NULL`.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set the declared length of a text or blob column.
    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    /// Set precision and scale of a numeric column.
    pub fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    /// Auto-incrementing identity. Only valid as the sole key column.
    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self.nullable = false;
        self
    }

    fn type_clause(&self) -> String {
        match (self.length, self.precision, self.scale) {
            (Some(len), _, _) => format!("{}({})", self.db_type, len),
            (None, Some(p), Some(s)) => format!("{}({}, {})", self.db_type, p, s),
            (None, Some(p), None) => format!("{}({})", self.db_type, p),
            _ => self.db_type.to_string(),
        }
    }

    fn default_clause(&self) -> &'static str {
        match self.db_type {
            ColumnType::Text => "DEFAULT ''",
            ColumnType::Blob => "DEFAULT X''",
            _ => "DEFAULT 0",
        }
    }
}

/// A column as reported by the live database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub declared_type: String,
}

/// Table schema descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    /// Schema namespace (`main` for SQLite unless databases are attached).
    pub schema: String,
    pub key_columns: Vec<String>,
    pub columns: Vec<Column>,
    pub strategy: SyncStrategy,
}

impl Table {
    /// An empty table `name` in `schema`.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            key_columns: Vec::new(),
            columns: Vec::new(),
            strategy: SyncStrategy::UntilSuccess,
        }
    }

    /// Append a column.
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Set the primary key columns.
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Choose how the table is synchronized.
    pub fn strategy(mut self, strategy: SyncStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Declared column named `name`.
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// `"schema"."name"`.
    pub fn qualified_name(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.name)
    }

    /// Check names and key columns before any DDL is generated from them.
    pub fn validate(&self) -> Result<()> {
        validate_collection_name(&self.schema)?;
        validate_collection_name(&self.name)?;
        if self.columns.is_empty() {
            return Err(StoreError::invalid(format!("table {} has no columns", self.name)));
        }
        for column in &self.columns {
            validate_collection_name(&column.name)?;
            if column.is_identity
                && (self.key_columns.len() != 1
                    || !self.key_columns[0].eq_ignore_ascii_case(&column.name)
                    || column.db_type != ColumnType::Integer)
            {
                return Err(StoreError::invalid(format!(
                    "identity column {}.{} must be the sole INTEGER key column",
                    self.name, column.name
                )));
            }
        }
        if self.key_columns.is_empty() {
            return Err(StoreError::invalid(format!(
                "table {} declares no key columns",
                self.name
            )));
        }
        for key in &self.key_columns {
            if self.get_column(key).is_none() {
                return Err(StoreError::invalid(format!(
                    "key column {} is not a column of {}",
                    key, self.name
                )));
            }
        }
        Ok(())
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for the declared layout.
    pub fn create_statement(&self) -> String {
        let identity = self.columns.iter().any(|c| c.is_identity);
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut def = format!("\"{}\" {}", c.name, c.type_clause());
                if c.is_identity {
                    def.push_str(" PRIMARY KEY AUTOINCREMENT");
                } else if !c.nullable {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();
        if !identity {
            let keys: Vec<String> = self
                .key_columns
                .iter()
                .map(|k| format!("\"{}\"", k))
                .collect();
            parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.qualified_name(),
            parts.join(", ")
        )
    }

    /// `ALTER TABLE ... ADD COLUMN` for one column. NOT NULL columns get a
    /// type default so existing rows stay valid.
    pub fn add_column_statement(&self, column: &Column) -> String {
        let mut def = format!("\"{}\" {}", column.name, column.type_clause());
        if !column.nullable {
            def.push_str(" NOT NULL ");
            def.push_str(column.default_clause());
        }
        format!("ALTER TABLE {} ADD COLUMN {}", self.qualified_name(), def)
    }
}

/// Database-facing side of schema synchronization.
#[async_trait]
pub trait SchemaDriver: Send + Sync {
    /// Live columns of `table`, or `None` if it does not exist.
    async fn describe(&self, table: &Table) -> Result<Option<Vec<LiveColumn>>>;

    async fn create_table(&self, table: &Table) -> Result<()>;

    async fn add_column(&self, table: &Table, column: &Column) -> Result<()>;
}

/// Synchronization state of one table instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynchronized,
    Synchronizing,
    Synchronized,
    /// `TryOnce` attempt failed; never retried.
    Attempted,
    /// `Ignore` strategy; no synchronization is ever attempted.
    Bypassed,
}

/// Per-table schema synchronization state machine.
pub struct SchemaSynchronizer {
    table: Table,
    state: parking_lot::Mutex<SyncState>,
    gate: tokio::sync::Mutex<()>,
}

/// Puts the state back to `Unsynchronized` if an in-flight attempt is dropped.
struct InFlight<'a> {
    state: &'a parking_lot::Mutex<SyncState>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if *state == SyncState::Synchronizing {
            *state = SyncState::Unsynchronized;
        }
    }
}

impl SchemaSynchronizer {
    /// Create a synchronizer for `table`; `Ignore` tables start out bypassed.
    pub fn new(table: Table) -> Self {
        let initial = match table.strategy {
            SyncStrategy::Ignore => SyncState::Bypassed,
            _ => SyncState::Unsynchronized,
        };
        Self {
            table,
            state: parking_lot::Mutex::new(initial),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// The declared table.
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Current synchronization state.
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    fn is_settled(&self) -> bool {
        matches!(
            self.state(),
            SyncState::Synchronized | SyncState::Attempted | SyncState::Bypassed
        )
    }

    /// Make sure the table schema matches its declaration, as far as the
    /// strategy allows. Cheap once the state is settled.
    pub async fn ensure(&self, driver: &dyn SchemaDriver) -> Result<()> {
        if self.is_settled() {
            return Ok(());
        }

        let _gate = self.gate.lock().await;
        if self.is_settled() {
            return Ok(());
        }

        *self.state.lock() = SyncState::Synchronizing;
        let in_flight = InFlight { state: &self.state };

        let outcome = self.synchronize(driver).await;

        let next = match (&outcome, self.table.strategy) {
            (Ok(()), _) => SyncState::Synchronized,
            (Err(_), SyncStrategy::TryOnce) => SyncState::Attempted,
            (Err(_), _) => SyncState::Unsynchronized,
        };
        *self.state.lock() = next;
        drop(in_flight);

        if let Err(e) = &outcome {
            warn!(
                table = %self.table.name,
                error = %e,
                state = ?next,
                "schema synchronization failed"
            );
        }
        outcome
    }

    async fn synchronize(&self, driver: &dyn SchemaDriver) -> Result<()> {
        let table = &self.table;
        table.validate()?;

        let Some(live) = driver.describe(table).await? else {
            info!(table = %table.name, schema = %table.schema, "creating table");
            return driver.create_table(table).await;
        };

        let mut missing = Vec::new();
        for column in &table.columns {
            match live.iter().find(|c| c.name.eq_ignore_ascii_case(&column.name)) {
                Some(found) => {
                    let found_type = ColumnType::from_declared(&found.declared_type);
                    if found_type != column.db_type {
                        return Err(StoreError::SchemaIncompatible {
                            table: table.name.clone(),
                            column: column.name.clone(),
                            declared: column.db_type.to_string(),
                            found: found.declared_type.clone(),
                        });
                    }
                }
                None => missing.push(column),
            }
        }

        for column in missing {
            info!(table = %table.name, column = %column.name, "adding missing column");
            driver.add_column(table, column).await?;
        }

        debug!(table = %table.name, "schema synchronized");
        Ok(())
    }
}
