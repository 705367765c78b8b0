use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use smartsql_core::{IndexSpec, IndexType, SchemaSource, SoupSchema};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::cipher::EntryCipher;
use super::database::{DatabaseManager, StoreScope};
use super::long_operation::{self, CREATE_LONG_OPERATIONS_TABLE};
use crate::error::{StoreError, StoreResult};

mod blobs;
mod crud;
mod fulltext;
mod query;
mod soups;

pub const SOUP_ATTRS_TABLE: &str = "soup_attrs";
pub const SOUP_INDEX_MAP_TABLE: &str = "soup_index_map";

const CREATE_META_TABLES: &str = "
CREATE TABLE IF NOT EXISTS soup_attrs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    soupName TEXT NOT NULL UNIQUE,
    externalStorage INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS soup_index_map (
    soupName TEXT NOT NULL,
    path TEXT NOT NULL,
    columnName TEXT NOT NULL,
    columnType TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS soup_index_map_0 ON soup_index_map (soupName);
";

/// A SmartStore: named JSON soups in one (optionally encrypted) database.
///
/// All operations on one store are serialized through its lock; calling back
/// into the same store from inside an operation deadlocks.
pub struct SmartStore {
    name: String,
    scope: StoreScope,
    db_path: PathBuf,
    inner: Mutex<Option<StoreInner>>,
}

impl std::fmt::Debug for SmartStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartStore")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish()
    }
}

/// State that only exists while the store is open
pub(crate) struct StoreInner {
    conn: Connection,
    blob_root: PathBuf,
    cipher: Option<EntryCipher>,
    /// soup name -> layout
    soup_cache: RefCell<HashMap<String, SoupSchema>>,
    /// smart sql -> translated sql
    sql_cache: RefCell<LruCache<String, String>>,
}

impl SmartStore {
    /// Open (creating if needed) a store and resume any interrupted schema operations
    pub fn open(
        manager: &DatabaseManager,
        name: &str,
        key: Option<&str>,
        sql_cache_size: usize,
    ) -> StoreResult<Self> {
        let conn = manager.open_store_database(name, key)?;
        conn.execute_batch(CREATE_META_TABLES)?;
        conn.execute_batch(CREATE_LONG_OPERATIONS_TABLE)?;

        let capacity = NonZeroUsize::new(sql_cache_size).unwrap_or(NonZeroUsize::MIN);
        let inner = StoreInner {
            conn,
            blob_root: manager.blob_root(name),
            cipher: key.filter(|k| !k.is_empty()).map(EntryCipher::from_store_key),
            soup_cache: RefCell::new(HashMap::new()),
            sql_cache: RefCell::new(LruCache::new(capacity)),
        };

        let store = Self {
            name: name.to_string(),
            scope: manager.scope().clone(),
            db_path: manager.full_db_file_path(name),
            inner: Mutex::new(Some(inner)),
        };

        let resumed = store.resume_long_operations()?;
        if resumed > 0 {
            info!("Resumed {} long operation(s) in store '{}'", resumed, name);
        }
        info!("Opened store '{}' ({})", name, store.scope);
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &StoreScope {
        &self.scope
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Run `f` with the open store, failing with `StoreClosed` after `close`
    pub(crate) fn with_inner<T>(
        &self,
        f: impl FnOnce(&StoreInner) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let guard = self.inner.lock();
        let inner = guard
            .as_ref()
            .ok_or_else(|| StoreError::StoreClosed(self.name.clone()))?;
        f(inner)
    }

    /// Close the underlying connection; later calls fail with `StoreClosed`
    pub fn close(&self) {
        if let Some(inner) = self.inner.lock().take() {
            if let Err((_, e)) = inner.conn.close() {
                warn!("Error closing store '{}': {}", self.name, e);
            }
            info!("Closed store '{}'", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Size in bytes of the database file
    pub fn database_size(&self) -> StoreResult<u64> {
        self.with_inner(|_| Ok(fs::metadata(&self.db_path)?.len()))
    }

    /// Finish schema operations interrupted by a crash; returns how many ran
    pub fn resume_long_operations(&self) -> StoreResult<usize> {
        self.with_inner(|inner| {
            let ops = long_operation::load_all(&inner.conn)?;
            for op in &ops {
                info!(
                    "Resuming {} of soup '{}' after {}",
                    op.op_type.as_str(),
                    op.details.soup_name,
                    op.status.as_str()
                );
                inner.run_alter_soup(op.id, &op.details, op.status)?;
            }
            Ok(ops.len())
        })
    }
}

impl Drop for SmartStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl SchemaSource for StoreInner {
    fn soup_schema(&self, soup_name: &str) -> Option<SoupSchema> {
        match self.soup_schema_for(soup_name) {
            Ok(schema) => schema,
            Err(e) => {
                warn!("Failed to load soup '{}': {}", soup_name, e);
                None
            }
        }
    }
}

impl StoreInner {
    // ==================== Soup Metadata ====================

    /// Cached soup layout, read from the metadata tables on a miss
    pub(crate) fn soup_schema_for(&self, soup_name: &str) -> StoreResult<Option<SoupSchema>> {
        if let Some(schema) = self.soup_cache.borrow().get(soup_name) {
            return Ok(Some(schema.clone()));
        }
        let loaded = load_soup_schema(&self.conn, soup_name)?;
        if let Some(schema) = &loaded {
            self.soup_cache
                .borrow_mut()
                .insert(soup_name.to_string(), schema.clone());
        }
        Ok(loaded)
    }

    pub(crate) fn require_soup(&self, soup_name: &str) -> StoreResult<SoupSchema> {
        self.soup_schema_for(soup_name)?
            .ok_or_else(|| StoreError::SoupNotFound(soup_name.to_string()))
    }

    /// Drop cached layout and translations that mention the soup
    pub(crate) fn evict_soup(&self, soup_name: &str) {
        self.soup_cache.borrow_mut().remove(soup_name);

        let mut cache = self.sql_cache.borrow_mut();
        let stale: Vec<String> = cache
            .iter()
            .filter(|(smart_sql, _)| {
                smartsql_core::referenced_soups(smart_sql)
                    .iter()
                    .any(|s| s == soup_name)
            })
            .map(|(smart_sql, _)| smart_sql.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
        debug!("Evicted soup '{}' from caches", soup_name);
    }

    /// Translate smart sql, reusing earlier translations
    pub(crate) fn translate(&self, smart_sql: &str) -> StoreResult<String> {
        if let Some(sql) = self.sql_cache.borrow_mut().get(smart_sql) {
            return Ok(sql.clone());
        }
        let sql = smartsql_core::translate(smart_sql, self)?;
        self.sql_cache
            .borrow_mut()
            .put(smart_sql.to_string(), sql.clone());
        Ok(sql)
    }
}

/// Read a soup's layout straight from the metadata tables
pub(crate) fn load_soup_schema(
    conn: &Connection,
    soup_name: &str,
) -> StoreResult<Option<SoupSchema>> {
    let attrs: Option<(i64, i64)> = conn
        .query_row(
            "SELECT id, externalStorage FROM soup_attrs WHERE soupName = ?1",
            [soup_name],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((id, external)) = attrs else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT path, columnName, columnType FROM soup_index_map WHERE soupName = ?1 ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([soup_name], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut index_specs = Vec::with_capacity(rows.len());
    for (path, column, column_type) in rows {
        let index_type = IndexType::parse(&column_type)?;
        let spec = IndexSpec::new(path, index_type);
        index_specs.push(if index_type.has_column() {
            spec.with_column(column)
        } else {
            spec
        });
    }

    Ok(Some(SoupSchema {
        soup_name: soup_name.to_string(),
        table_name: soup_table_name(id),
        index_specs,
        external_storage: external != 0,
    }))
}

pub(crate) fn soup_table_name(id: i64) -> String {
    format!("TABLE_{}", id)
}

/// Convert a JSON value for storage in a column of the given index type
pub(crate) fn json_to_sql(value: Option<&Value>, index_type: IndexType) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        None | Some(Value::Null) => Sql::Null,
        Some(Value::Bool(b)) => Sql::Integer(*b as i64),
        Some(Value::Number(n)) => match index_type {
            IndexType::Integer => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Sql::Integer)
                .unwrap_or(Sql::Null),
            IndexType::Floating => n.as_f64().map(Sql::Real).unwrap_or(Sql::Null),
            IndexType::String | IndexType::FullText => Sql::Text(n.to_string()),
            IndexType::Json1 => match n.as_i64() {
                Some(i) => Sql::Integer(i),
                None => n.as_f64().map(Sql::Real).unwrap_or(Sql::Null),
            },
        },
        Some(Value::String(s)) => match index_type {
            IndexType::Integer => s.parse().map(Sql::Integer).unwrap_or(Sql::Text(s.clone())),
            IndexType::Floating => s.parse().map(Sql::Real).unwrap_or(Sql::Text(s.clone())),
            _ => Sql::Text(s.clone()),
        },
        Some(other) => Sql::Text(other.to_string()),
    }
}

/// Convert a JSON bind argument with no column type to coerce to
pub(crate) fn json_arg(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => n.as_f64().map(Sql::Real).unwrap_or(Sql::Null),
        },
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use rusqlite::types::Value as Sql;

    #[test]
    fn test_json_to_sql_by_type() {
        assert_eq!(json_to_sql(Some(&json!(3.7)), IndexType::Integer), Sql::Integer(3));
        assert_eq!(json_to_sql(Some(&json!(3)), IndexType::Floating), Sql::Real(3.0));
        assert_eq!(
            json_to_sql(Some(&json!(42)), IndexType::String),
            Sql::Text("42".to_string())
        );
        assert_eq!(json_to_sql(Some(&json!(true)), IndexType::String), Sql::Integer(1));
        assert_eq!(json_to_sql(None, IndexType::String), Sql::Null);
        assert_eq!(
            json_to_sql(Some(&json!(["a", "b"])), IndexType::String),
            Sql::Text("[\"a\",\"b\"]".to_string())
        );
    }

    #[test]
    fn test_load_missing_soup() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_META_TABLES).unwrap();
        assert!(load_soup_schema(&conn, "nope").unwrap().is_none());
    }
}
