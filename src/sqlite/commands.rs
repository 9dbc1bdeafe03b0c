//! SQL text for collection tables.
//!
//! Every read is generated with the expiration filter appended, so rows whose
//! `expires_at` has passed are invisible even before the sweeper removes
//! them. Writes that touch a key first purge that key's expired rows.
//!
//! Parameter convention: `?1` is the key and `?2` the current time in Unix
//! milliseconds unless a statement documents otherwise.

use crate::sqlite::schema::{Column, ColumnType, SyncStrategy, Table};

/// Declared layout shared by every collection table.
pub fn collection_table(schema: &str, name: &str, strategy: SyncStrategy) -> Table {
    Table::new(schema, name)
        .column(Column::new("key", ColumnType::Text).not_null())
        .column(Column::new("position", ColumnType::Integer).not_null())
        .column(Column::new("item", ColumnType::Blob).not_null())
        .column(Column::new("score", ColumnType::Real))
        .column(Column::new("expires_at", ColumnType::Integer))
        .primary_key(["key", "position"])
        .strategy(strategy)
}

fn live(now_param: u8) -> String {
    format!("(expires_at IS NULL OR expires_at > ?{})", now_param)
}

#[derive(Debug, Clone)]
pub(crate) struct Commands {
    table: String,
}

impl Commands {
    pub fn new(table: &Table) -> Self {
        Self {
            table: table.qualified_name(),
        }
    }

    pub fn exists(&self) -> String {
        format!(
            "SELECT 1 FROM {} WHERE key = ?1 AND {} LIMIT 1",
            self.table,
            live(2)
        )
    }

    /// `?1` is the current time.
    pub fn keys(&self) -> String {
        format!(
            "SELECT DISTINCT key FROM {} WHERE {} ORDER BY key",
            self.table,
            live(1)
        )
    }

    pub fn items(&self, by_score: bool) -> String {
        let order = if by_score { "score, item" } else { "position" };
        format!(
            "SELECT item, score FROM {} WHERE key = ?1 AND {} ORDER BY {}",
            self.table,
            live(2),
            order
        )
    }

    /// `?3`/`?4` are the inclusive score bounds.
    pub fn items_by_score(&self) -> String {
        format!(
            "SELECT item, score FROM {} WHERE key = ?1 AND {} AND score >= ?3 AND score <= ?4 \
             ORDER BY score, item",
            self.table,
            live(2)
        )
    }

    pub fn get_value(&self) -> String {
        format!(
            "SELECT item FROM {} WHERE key = ?1 AND position = 0 AND {}",
            self.table,
            live(2)
        )
    }

    /// `?3` is the item.
    pub fn contains_item(&self) -> String {
        format!(
            "SELECT 1 FROM {} WHERE key = ?1 AND {} AND item = ?3 LIMIT 1",
            self.table,
            live(2)
        )
    }

    pub fn count(&self) -> String {
        format!(
            "SELECT COUNT(*) FROM {} WHERE key = ?1 AND {}",
            self.table,
            live(2)
        )
    }

    pub fn expiration(&self) -> String {
        format!(
            "SELECT MAX(expires_at) FROM {} WHERE key = ?1 AND {}",
            self.table,
            live(2)
        )
    }

    pub fn purge_key(&self) -> String {
        format!(
            "DELETE FROM {} WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            self.table
        )
    }

    /// `?1` is the current time, `?2` the maximum number of keys. Returns
    /// the key of every deleted row.
    pub fn purge_expired(&self) -> String {
        format!(
            "DELETE FROM {t} WHERE expires_at IS NOT NULL AND expires_at <= ?1 \
             AND key IN (SELECT DISTINCT key FROM {t} \
             WHERE expires_at IS NOT NULL AND expires_at <= ?1 LIMIT ?2) RETURNING key",
            t = self.table
        )
    }

    /// Only `?1`.
    pub fn delete_key(&self) -> String {
        format!("DELETE FROM {} WHERE key = ?1", self.table)
    }

    /// `?2` is the new expiration (or NULL).
    pub fn set_expiration(&self) -> String {
        format!("UPDATE {} SET expires_at = ?2 WHERE key = ?1", self.table)
    }

    /// Only `?1`.
    pub fn next_position(&self) -> String {
        format!(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM {} WHERE key = ?1",
            self.table
        )
    }

    /// `?2` position, `?3` item, `?4` score. New rows inherit the key's
    /// current expiration.
    pub fn insert(&self) -> String {
        format!(
            "INSERT INTO {t} (key, position, item, score, expires_at) \
             VALUES (?1, ?2, ?3, ?4, (SELECT expires_at FROM {t} WHERE key = ?1 LIMIT 1))",
            t = self.table
        )
    }

    /// `?2` is the new value.
    pub fn update_value(&self) -> String {
        format!(
            "UPDATE {} SET item = ?2 WHERE key = ?1 AND position = 0",
            self.table
        )
    }

    /// `?2` is the item.
    pub fn find_item(&self) -> String {
        format!(
            "SELECT position FROM {} WHERE key = ?1 AND item = ?2 ORDER BY position LIMIT 1",
            self.table
        )
    }

    /// `?2` item, `?3` score.
    pub fn update_score(&self) -> String {
        format!(
            "UPDATE {} SET score = ?3 WHERE key = ?1 AND item = ?2",
            self.table
        )
    }

    /// `?3` is the item; removes its first occurrence.
    pub fn remove_item(&self) -> String {
        format!(
            "DELETE FROM {t} WHERE key = ?1 AND position = (SELECT position FROM {t} \
             WHERE key = ?1 AND {live} AND item = ?3 ORDER BY position LIMIT 1)",
            t = self.table,
            live = live(2)
        )
    }

    pub fn pop_front(&self) -> String {
        format!(
            "DELETE FROM {t} WHERE key = ?1 AND position = (SELECT position FROM {t} \
             WHERE key = ?1 AND {live} ORDER BY position LIMIT 1) RETURNING item",
            t = self.table,
            live = live(2)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> Commands {
        Commands::new(&collection_table("main", "tags", SyncStrategy::UntilSuccess))
    }

    #[test]
    fn test_reads_filter_expired_rows() {
        let c = commands();
        for sql in [
            c.exists(),
            c.items(false),
            c.items(true),
            c.items_by_score(),
            c.get_value(),
            c.contains_item(),
            c.count(),
            c.expiration(),
            c.pop_front(),
        ] {
            assert!(
                sql.contains("(expires_at IS NULL OR expires_at > ?2)"),
                "missing expiration filter: {}",
                sql
            );
        }
        assert!(c.keys().contains("(expires_at IS NULL OR expires_at > ?1)"));
    }

    #[test]
    fn test_table_is_qualified() {
        assert!(commands().delete_key().contains("\"main\".\"tags\""));
    }

    #[test]
    fn test_collection_layout() {
        let table = collection_table("main", "tags", SyncStrategy::TryOnce);
        table.validate().unwrap();
        assert_eq!(table.key_columns, vec!["key", "position"]);
        assert_eq!(table.strategy, SyncStrategy::TryOnce);
        assert!(table.get_column("expires_at").unwrap().nullable);
    }
}
