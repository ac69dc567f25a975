//! SQL text for one (schema, table) pair.
//!
//! Generated once per target and regenerated when the target changes.
//! Identifiers are validated by [`TableTarget::validate`] before they get here.

use crate::config::TableTarget;

// == SQL Commands ==
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlCommands {
    pub target: TableTarget,
    pub create_schema: String,
    pub create_table: String,
    pub create_index: String,
    pub table_exists: String,
    /// $1 keys, $2 now
    pub fetch: String,
    /// $1 keys, $2 values, $3 absolute, $4 sliding (microseconds), $5 next, $6 value types
    pub upsert: String,
    /// $1 keys
    pub delete: String,
    /// $1 keys, $2 now
    pub refresh: String,
    /// $1 now, $2 limit
    pub delete_expired: String,
}

impl SqlCommands {
    pub fn new(target: &TableTarget) -> Self {
        let table = target.qualified();
        let index = format!("\"{}_next_expiration_idx\"", target.table);

        Self {
            target: target.clone(),
            create_schema: format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", target.schema),
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 key TEXT PRIMARY KEY, \
                 value BYTEA NOT NULL, \
                 absolute_expiration TIMESTAMPTZ NULL, \
                 sliding_interval INTERVAL NULL, \
                 next_expiration TIMESTAMPTZ NOT NULL DEFAULT now(), \
                 value_type TEXT NULL)"
            ),
            create_index: format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {table} (next_expiration)"
            ),
            table_exists: "SELECT to_regclass($1::text) IS NOT NULL".to_string(),
            // LEAST ignores NULLs, so entries without an absolute expiration slide freely
            fetch: format!(
                "WITH touched AS (\
                 UPDATE {table} SET next_expiration = LEAST(absolute_expiration, $2 + sliding_interval) \
                 WHERE key = ANY($1) AND sliding_interval IS NOT NULL AND next_expiration > $2 \
                 RETURNING key) \
                 SELECT key, value FROM {table} WHERE key = ANY($1) AND next_expiration > $2"
            ),
            upsert: format!(
                "INSERT INTO {table} \
                 (key, value, absolute_expiration, sliding_interval, next_expiration, value_type) \
                 SELECT k, v, a, s * INTERVAL '1 microsecond', n, t \
                 FROM UNNEST($1::text[], $2::bytea[], $3::timestamptz[], $4::int8[], $5::timestamptz[], $6::text[]) \
                 AS u(k, v, a, s, n, t) \
                 ON CONFLICT (key) DO UPDATE SET \
                 value = EXCLUDED.value, \
                 absolute_expiration = EXCLUDED.absolute_expiration, \
                 sliding_interval = EXCLUDED.sliding_interval, \
                 next_expiration = EXCLUDED.next_expiration, \
                 value_type = EXCLUDED.value_type"
            ),
            delete: format!("DELETE FROM {table} WHERE key = ANY($1)"),
            refresh: format!(
                "UPDATE {table} SET next_expiration = LEAST(absolute_expiration, $2 + sliding_interval) \
                 WHERE key = ANY($1) AND sliding_interval IS NOT NULL AND next_expiration > $2"
            ),
            delete_expired: format!(
                "DELETE FROM {table} WHERE key IN (\
                 SELECT key FROM {table} WHERE next_expiration <= $1 \
                 ORDER BY next_expiration LIMIT $2 FOR UPDATE SKIP LOCKED)"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_use_qualified_table() {
        let sql = SqlCommands::new(&TableTarget::new("cache", "entries"));

        for statement in [&sql.create_table, &sql.fetch, &sql.upsert, &sql.delete, &sql.refresh] {
            assert!(statement.contains("\"cache\".\"entries\""), "{statement}");
        }
        assert_eq!(sql.create_schema, "CREATE SCHEMA IF NOT EXISTS \"cache\"");
        assert!(sql.create_index.contains("\"entries_next_expiration_idx\""));
    }

    #[test]
    fn test_cleanup_is_bounded() {
        let sql = SqlCommands::new(&TableTarget::new("public", "cache_entries"));
        assert!(sql.delete_expired.contains("LIMIT $2"));
        assert!(sql.delete_expired.contains("next_expiration <= $1"));
    }

    #[test]
    fn test_regenerated_for_new_target() {
        let before = SqlCommands::new(&TableTarget::new("public", "a"));
        let after = SqlCommands::new(&TableTarget::new("public", "b"));
        assert_ne!(before.fetch, after.fetch);
        assert!(after.fetch.contains("\"public\".\"b\""));
    }
}
