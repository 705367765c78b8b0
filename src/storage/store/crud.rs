use super::fulltext::id_placeholders;
use super::*;
use smartsql_core::{project, SOUP_CREATED_DATE, SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE};

/// An external entry file to write once the row work has succeeded
struct PendingFile {
    entry_id: i64,
    entry: Value,
}

impl SmartStore {
    // ==================== Basic CRUD ====================

    /// Insert or update entries in one transaction.
    ///
    /// An entry is updated when it carries `_soupEntryId`, or when
    /// `external_id_path` is given and exactly one existing entry has the same
    /// value at that path. Any failure rolls back the whole batch.
    pub fn upsert_entries(
        &self,
        soup_name: &str,
        entries: &[Value],
        external_id_path: Option<&str>,
    ) -> StoreResult<Vec<Value>> {
        self.with_inner(|inner| {
            let schema = inner.require_soup(soup_name)?;
            if let Some(path) = external_id_path {
                if path != SOUP_ENTRY_ID && schema.index_for_path(path).is_none() {
                    return Err(smartsql_core::SmartSqlError::UnknownPath {
                        soup: soup_name.to_string(),
                        path: path.to_string(),
                    }
                    .into());
                }
            }

            let tx = inner.conn.unchecked_transaction()?;
            let mut saved = Vec::with_capacity(entries.len());
            let mut pending = Vec::new();
            for entry in entries {
                let (entry, file) = inner.upsert_one(&tx, &schema, entry, external_id_path)?;
                saved.push(entry);
                pending.extend(file);
            }
            for file in &pending {
                inner.save_external_entry(&schema.table_name, file.entry_id, &file.entry)?;
            }
            tx.commit()?;
            debug!("Upserted {} entries into '{}'", saved.len(), soup_name);
            Ok(saved)
        })
    }

    pub fn upsert_entry(&self, soup_name: &str, entry: Value) -> StoreResult<Value> {
        let mut saved = self.upsert_entries(soup_name, &[entry], None)?;
        saved
            .pop()
            .ok_or_else(|| StoreError::InternalError("upsert returned no entry".to_string()))
    }

    /// Entries with the given ids; unknown ids are skipped
    pub fn retrieve_entries(&self, soup_name: &str, entry_ids: &[i64]) -> StoreResult<Vec<Value>> {
        if entry_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_inner(|inner| {
            let schema = inner.require_soup(soup_name)?;
            let mut stmt = inner.conn.prepare(&format!(
                "SELECT _soupEntryId, soup FROM {} WHERE _soupEntryId IN ({})",
                schema.table_name,
                id_placeholders(entry_ids.len())
            ))?;
            let rows: Vec<(i64, Option<String>)> = stmt
                .query_map(rusqlite::params_from_iter(entry_ids), |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut entries = Vec::with_capacity(rows.len());
            for (id, soup) in rows {
                if schema.external_storage {
                    entries.push(inner.load_external_entry(&schema.table_name, id)?);
                } else if let Some(json) = soup {
                    entries.push(serde_json::from_str(&json)?);
                }
            }
            Ok(entries)
        })
    }

    /// Entry id whose indexed `path` equals `value`; more than one match is an error
    pub fn lookup_soup_entry_id(
        &self,
        soup_name: &str,
        path: &str,
        value: &Value,
    ) -> StoreResult<Option<i64>> {
        self.with_inner(|inner| {
            let schema = inner.require_soup(soup_name)?;
            lookup_entry_id(&inner.conn, &schema, path, value)
        })
    }

    pub fn remove_entries(&self, soup_name: &str, entry_ids: &[i64]) -> StoreResult<()> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        self.with_inner(|inner| {
            let schema = inner.require_soup(soup_name)?;
            inner.delete_entries(&schema, entry_ids)?;
            debug!("Removed {} entries from '{}'", entry_ids.len(), soup_name);
            Ok(())
        })
    }
}

/// Bound variables per DELETE statement
const DELETE_BATCH: usize = 500;

impl StoreInner {
    /// Delete rows, full-text rows and entry files for an explicit id list,
    /// in one transaction
    pub(crate) fn delete_entries(&self, schema: &SoupSchema, entry_ids: &[i64]) -> StoreResult<()> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        for chunk in entry_ids.chunks(DELETE_BATCH) {
            fulltext::delete_fts_rows(&tx, schema, chunk)?;
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE _soupEntryId IN ({})",
                    schema.table_name,
                    id_placeholders(chunk.len())
                ),
                rusqlite::params_from_iter(chunk),
            )?;
        }
        tx.commit()?;
        if schema.external_storage {
            self.delete_external_entries(&schema.table_name, entry_ids);
        }
        Ok(())
    }

    fn upsert_one(
        &self,
        conn: &Connection,
        schema: &SoupSchema,
        entry: &Value,
        external_id_path: Option<&str>,
    ) -> StoreResult<(Value, Option<PendingFile>)> {
        let Value::Object(map) = entry else {
            return Err(StoreError::InvalidEntry(
                "soup entries must be JSON objects".to_string(),
            ));
        };
        let mut map = map.clone();

        let mut entry_id = match map.get(SOUP_ENTRY_ID) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_i64().ok_or_else(|| {
                StoreError::InvalidEntry(format!("{} must be an integer, got {}", SOUP_ENTRY_ID, v))
            })?),
        };
        if entry_id.is_none() {
            if let Some(path) = external_id_path.filter(|p| *p != SOUP_ENTRY_ID) {
                if let Some(value) = project(entry, path).filter(|v| !v.is_null()) {
                    entry_id = lookup_entry_id(conn, schema, path, &value)?;
                }
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        let created = match entry_id {
            Some(id) => conn
                .query_row(
                    &format!(
                        "SELECT _soupCreatedDate FROM {} WHERE _soupEntryId = ?1",
                        schema.table_name
                    ),
                    [id],
                    |r| r.get::<_, Option<i64>>(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::EntryNotFound {
                    soup: schema.soup_name.clone(),
                    id,
                })?
                .unwrap_or(now),
            None => now,
        };
        map.insert(SOUP_CREATED_DATE.to_string(), Value::from(created));
        map.insert(SOUP_LAST_MODIFIED_DATE.to_string(), Value::from(now));

        let entry_id = match entry_id {
            Some(id) => id,
            None => {
                conn.execute(
                    &format!(
                        "INSERT INTO {} (_soupCreatedDate, _soupLastModifiedDate) VALUES (?1, ?2)",
                        schema.table_name
                    ),
                    params![created, now],
                )?;
                conn.last_insert_rowid()
            }
        };
        map.insert(SOUP_ENTRY_ID.to_string(), Value::from(entry_id));
        let entry = Value::Object(map);

        let column_specs: Vec<&IndexSpec> = schema
            .index_specs
            .iter()
            .filter(|s| s.column_name.is_some())
            .collect();
        let mut sets = vec!["soup = ?".to_string(), "_soupLastModifiedDate = ?".to_string()];
        let mut values = vec![
            if schema.external_storage {
                rusqlite::types::Value::Null
            } else {
                rusqlite::types::Value::Text(serde_json::to_string(&entry)?)
            },
            rusqlite::types::Value::Integer(now),
        ];
        for spec in column_specs {
            if let Some(column) = &spec.column_name {
                sets.push(format!("{} = ?", column));
                values.push(json_to_sql(project(&entry, &spec.path).as_ref(), spec.index_type));
            }
        }
        values.push(rusqlite::types::Value::Integer(entry_id));
        conn.execute(
            &format!(
                "UPDATE {} SET {} WHERE _soupEntryId = ?",
                schema.table_name,
                sets.join(", ")
            ),
            rusqlite::params_from_iter(values),
        )?;

        fulltext::upsert_fts_row(conn, schema, entry_id, &entry)?;

        let pending = schema.external_storage.then(|| PendingFile {
            entry_id,
            entry: entry.clone(),
        });
        Ok((entry, pending))
    }
}

fn lookup_entry_id(
    conn: &Connection,
    schema: &SoupSchema,
    path: &str,
    value: &Value,
) -> StoreResult<Option<i64>> {
    let (expr, arg) = if path == SOUP_ENTRY_ID {
        (format!("{}._soupEntryId", schema.table_name), json_arg(value))
    } else {
        let spec = schema.index_for_path(path).ok_or_else(|| {
            StoreError::Query(smartsql_core::SmartSqlError::UnknownPath {
                soup: schema.soup_name.clone(),
                path: path.to_string(),
            })
        })?;
        let expr = schema.column_expr(path).ok_or_else(|| {
            StoreError::InternalError(format!("no column for indexed path '{}'", path))
        })?;
        (expr, json_to_sql(Some(value), spec.index_type))
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT _soupEntryId FROM {} WHERE {} = ?1 LIMIT 2",
        schema.table_name, expr
    ))?;
    let ids = stmt
        .query_map([arg], |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    match ids.as_slice() {
        [] => Ok(None),
        [id] => Ok(Some(*id)),
        _ => Err(StoreError::DuplicateExternalId {
            soup: schema.soup_name.clone(),
            path: path.to_string(),
            value: value.to_string(),
        }),
    }
}
