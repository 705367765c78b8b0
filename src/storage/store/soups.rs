use super::*;
use crate::storage::long_operation::{AlterSoupDetails, AlterSoupStep};
use crate::storage::soup_spec::SoupSpec;
use smartsql_core::same_index_specs;

impl SmartStore {
    // ==================== Soup Registration ====================

    /// Create a soup; succeeds without change if it exists with the same specs
    pub fn register_soup(&self, soup_name: &str, index_specs: &[IndexSpec]) -> StoreResult<()> {
        self.register_soup_with_spec(&SoupSpec::new(soup_name), index_specs)
    }

    pub fn register_soup_with_spec(
        &self,
        soup_spec: &SoupSpec,
        index_specs: &[IndexSpec],
    ) -> StoreResult<()> {
        validate_index_specs(index_specs, soup_spec.uses_external_storage())?;
        let soup_name = soup_spec.name.as_str();

        self.with_inner(|inner| {
            if let Some(existing) = inner.soup_schema_for(soup_name)? {
                if same_index_specs(&existing.index_specs, index_specs)
                    && existing.external_storage == soup_spec.uses_external_storage()
                {
                    return Ok(());
                }
                return Err(StoreError::SoupSpecConflict(soup_name.to_string()));
            }

            let tx = inner.conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO soup_attrs (soupName, externalStorage) VALUES (?1, ?2)",
                params![soup_name, soup_spec.uses_external_storage()],
            )?;
            let table_name = soup_table_name(tx.last_insert_rowid());
            create_soup_table(&tx, soup_name, &table_name, index_specs)?;
            tx.commit()?;

            inner.evict_soup(soup_name);
            info!("Registered soup '{}' as {}", soup_name, table_name);
            Ok(())
        })
    }

    // ==================== Soup Introspection ====================

    pub fn soup_exists(&self, soup_name: &str) -> StoreResult<bool> {
        self.with_inner(|inner| Ok(inner.soup_schema_for(soup_name)?.is_some()))
    }

    /// Index specs as registered (without physical column names)
    pub fn indices_for_soup(&self, soup_name: &str) -> StoreResult<Vec<IndexSpec>> {
        self.with_inner(|inner| {
            let schema = inner.require_soup(soup_name)?;
            Ok(schema
                .index_specs
                .into_iter()
                .map(|s| IndexSpec::new(s.path, s.index_type))
                .collect())
        })
    }

    pub fn attributes_for_soup(&self, soup_name: &str) -> StoreResult<SoupSpec> {
        self.with_inner(|inner| {
            let schema = inner.require_soup(soup_name)?;
            Ok(if schema.external_storage {
                SoupSpec::with_external_storage(soup_name)
            } else {
                SoupSpec::new(soup_name)
            })
        })
    }

    /// Physical table backing the soup
    pub fn soup_table_name(&self, soup_name: &str) -> StoreResult<String> {
        self.with_inner(|inner| Ok(inner.require_soup(soup_name)?.table_name))
    }

    pub fn all_soup_names(&self) -> StoreResult<Vec<String>> {
        self.with_inner(|inner| {
            let mut stmt = inner
                .conn
                .prepare("SELECT soupName FROM soup_attrs ORDER BY soupName")?;
            let names = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
    }

    // ==================== Soup Removal ====================

    /// Delete every entry but keep the soup and its indexes
    pub fn clear_soup(&self, soup_name: &str) -> StoreResult<()> {
        self.with_inner(|inner| {
            let schema = inner.require_soup(soup_name)?;
            let tx = inner.conn.unchecked_transaction()?;
            tx.execute(&format!("DELETE FROM {}", schema.table_name), [])?;
            if schema.has_full_text() {
                tx.execute(&format!("DELETE FROM {}", schema.fts_table_name()), [])?;
            }
            tx.commit()?;
            if schema.external_storage {
                inner.remove_soup_blob_dir(&schema.table_name)?;
            }
            debug!("Cleared soup '{}'", soup_name);
            Ok(())
        })
    }

    /// Drop the soup's table, metadata and external files; a missing soup is a no-op
    pub fn remove_soup(&self, soup_name: &str) -> StoreResult<()> {
        self.with_inner(|inner| inner.remove_soup(soup_name))
    }

    pub fn remove_all_soups(&self) -> StoreResult<()> {
        for soup_name in self.all_soup_names()? {
            self.remove_soup(&soup_name)?;
        }
        Ok(())
    }

    // ==================== Schema Changes ====================

    /// Rebuild the soup with new index specs, keeping its storage mode
    pub fn alter_soup(
        &self,
        soup_name: &str,
        index_specs: &[IndexSpec],
        re_index_data: bool,
    ) -> StoreResult<()> {
        let external = self.attributes_for_soup(soup_name)?.uses_external_storage();
        let spec = if external {
            SoupSpec::with_external_storage(soup_name)
        } else {
            SoupSpec::new(soup_name)
        };
        self.alter_soup_with_spec(soup_name, &spec, index_specs, re_index_data)
    }

    /// Rebuild the soup with new index specs and storage features.
    ///
    /// When `re_index_data` is false, columns for newly indexed paths stay
    /// null until each entry is next upserted.
    pub fn alter_soup_with_spec(
        &self,
        soup_name: &str,
        soup_spec: &SoupSpec,
        index_specs: &[IndexSpec],
        re_index_data: bool,
    ) -> StoreResult<()> {
        validate_index_specs(index_specs, soup_spec.uses_external_storage())?;
        self.with_inner(|inner| {
            let existing = inner.require_soup(soup_name)?;
            let details = AlterSoupDetails {
                soup_name: soup_name.to_string(),
                soup_table_name: existing.table_name.clone(),
                old_index_specs: existing.index_specs.clone(),
                new_index_specs: index_specs
                    .iter()
                    .map(|s| IndexSpec::new(s.path.clone(), s.index_type))
                    .collect(),
                old_external_storage: existing.external_storage,
                new_external_storage: soup_spec.uses_external_storage(),
                re_index_data,
            };
            let id = long_operation::log_start(&inner.conn, &details)?;
            inner.run_alter_soup(id, &details, AlterSoupStep::Starting)
        })
    }

    /// Recompute index columns for `paths` from each entry's JSON
    pub fn reindex_soup(&self, soup_name: &str, paths: &[String]) -> StoreResult<()> {
        self.with_inner(|inner| {
            let schema = inner.require_soup(soup_name)?;
            for path in paths {
                if schema.index_for_path(path).is_none() {
                    return Err(smartsql_core::SmartSqlError::UnknownPath {
                        soup: soup_name.to_string(),
                        path: path.clone(),
                    }
                    .into());
                }
            }
            let tx = inner.conn.unchecked_transaction()?;
            inner.reindex(&tx, &schema, paths)?;
            tx.commit()?;
            info!("Re-indexed {:?} of soup '{}'", paths, soup_name);
            Ok(())
        })
    }
}

impl StoreInner {
    pub(crate) fn remove_soup(&self, soup_name: &str) -> StoreResult<()> {
        let Some(schema) = self.soup_schema_for(soup_name)? else {
            return Ok(());
        };
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {};",
            schema.table_name,
            schema.fts_table_name()
        ))?;
        tx.execute("DELETE FROM soup_attrs WHERE soupName = ?1", [soup_name])?;
        tx.execute("DELETE FROM soup_index_map WHERE soupName = ?1", [soup_name])?;
        tx.commit()?;

        self.remove_soup_blob_dir(&schema.table_name)?;
        self.evict_soup(soup_name);
        info!("Removed soup '{}'", soup_name);
        Ok(())
    }

    /// Run the alter steps after `last_done`, one transaction per step
    pub(crate) fn run_alter_soup(
        &self,
        id: i64,
        details: &AlterSoupDetails,
        last_done: AlterSoupStep,
    ) -> StoreResult<()> {
        self.evict_soup(&details.soup_name);
        let mut step = last_done;
        while let Some(next) = step.next() {
            let tx = self.conn.unchecked_transaction()?;
            self.alter_soup_step(&tx, details, next)?;
            if next == AlterSoupStep::Cleanup {
                long_operation::delete(&tx, id)?;
            } else {
                long_operation::update_status(&tx, id, next)?;
            }
            tx.commit()?;
            debug!("Alter soup '{}': {}", details.soup_name, next.as_str());
            step = next;
        }
        self.evict_soup(&details.soup_name);
        info!("Altered soup '{}'", details.soup_name);
        Ok(())
    }

    fn alter_soup_step(
        &self,
        conn: &Connection,
        details: &AlterSoupDetails,
        step: AlterSoupStep,
    ) -> StoreResult<()> {
        let table = &details.soup_table_name;
        let old_table = details.old_table_name();

        match step {
            AlterSoupStep::Starting | AlterSoupStep::Cleanup => {}

            AlterSoupStep::RenameOldSoupTable => {
                conn.execute_batch(&format!("ALTER TABLE {} RENAME TO {}", table, old_table))?;
            }

            AlterSoupStep::DropOldIndexes => {
                let mut sql = String::new();
                for i in 0..details.old_index_specs.len() {
                    sql.push_str(&format!("DROP INDEX IF EXISTS {}_{}_idx;", table, i));
                }
                sql.push_str(&format!(
                    "DROP INDEX IF EXISTS {0}_created_idx; DROP INDEX IF EXISTS {0}_modified_idx; \
                     DROP TABLE IF EXISTS {0}_fts;",
                    table
                ));
                conn.execute_batch(&sql)?;
            }

            AlterSoupStep::RegisterSoupUsingTableName => {
                conn.execute(
                    "UPDATE soup_attrs SET externalStorage = ?1 WHERE soupName = ?2",
                    params![details.new_external_storage, details.soup_name],
                )?;
                create_soup_table(conn, &details.soup_name, table, &details.new_index_specs)?;
            }

            AlterSoupStep::CopyTable => {
                let schema = load_soup_schema(conn, &details.soup_name)?
                    .ok_or_else(|| StoreError::SoupNotFound(details.soup_name.clone()))?;

                let mut new_cols = Vec::new();
                let mut old_cols = Vec::new();
                for spec in &schema.index_specs {
                    let old = details
                        .old_index_specs
                        .iter()
                        .find(|o| o.same_shape(spec))
                        .and_then(|o| o.column_name.clone());
                    if let (Some(new_col), Some(old_col)) = (&spec.column_name, old) {
                        new_cols.push(new_col.clone());
                        old_cols.push(old_col);
                    }
                }
                let extra = |cols: &[String]| {
                    cols.iter().map(|c| format!(", {}", c)).collect::<String>()
                };
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (_soupEntryId, soup, _soupCreatedDate, _soupLastModifiedDate{}) \
                         SELECT _soupEntryId, soup, _soupCreatedDate, _soupLastModifiedDate{} FROM {old_table}",
                        extra(&new_cols),
                        extra(&old_cols),
                    ),
                    [],
                )?;

                match (details.old_external_storage, details.new_external_storage) {
                    (true, false) => self.move_entries_into_table(conn, table)?,
                    (false, true) => self.move_entries_out_of_table(conn, table)?,
                    _ => {}
                }
                fulltext::populate_fts(conn, &schema)?;
            }

            AlterSoupStep::ReIndexSoup => {
                if details.re_index_data {
                    let schema = load_soup_schema(conn, &details.soup_name)?
                        .ok_or_else(|| StoreError::SoupNotFound(details.soup_name.clone()))?;
                    let paths: Vec<String> =
                        schema.index_specs.iter().map(|s| s.path.clone()).collect();
                    self.reindex(conn, &schema, &paths)?;
                }
            }

            AlterSoupStep::DropOldTable => {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", old_table))?;
                if details.old_external_storage && !details.new_external_storage {
                    self.remove_soup_blob_dir(table)?;
                }
            }
        }
        Ok(())
    }

    /// Rewrite index columns (and full-text rows) for `paths` from entry JSON
    pub(crate) fn reindex(
        &self,
        conn: &Connection,
        schema: &SoupSchema,
        paths: &[String],
    ) -> StoreResult<()> {
        let specs: Vec<&IndexSpec> = schema
            .index_specs
            .iter()
            .filter(|s| s.column_name.is_some() && paths.contains(&s.path))
            .collect();
        if specs.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = {
            let mut stmt = conn.prepare(&format!("SELECT _soupEntryId FROM {}", schema.table_name))?;
            let ids = stmt
                .query_map([], |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let set_clause = specs
            .iter()
            .filter_map(|s| s.column_name.as_ref().map(|c| format!("{} = ?", c)))
            .collect::<Vec<_>>()
            .join(", ");
        let update_sql = format!(
            "UPDATE {} SET {} WHERE _soupEntryId = ?",
            schema.table_name, set_clause
        );
        let reindexes_fts = specs.iter().any(|s| s.index_type == IndexType::FullText);

        for id in ids {
            let Some(entry) = self.load_entry(conn, schema, id)? else {
                continue;
            };
            let mut values: Vec<rusqlite::types::Value> = specs
                .iter()
                .map(|s| json_to_sql(smartsql_core::project(&entry, &s.path).as_ref(), s.index_type))
                .collect();
            values.push(rusqlite::types::Value::Integer(id));
            conn.execute(&update_sql, rusqlite::params_from_iter(values))?;

            if reindexes_fts {
                fulltext::upsert_fts_row(conn, schema, id, &entry)?;
            }
        }
        Ok(())
    }
}

/// Reject empty, duplicated, or unsupported index specs
fn validate_index_specs(index_specs: &[IndexSpec], external_storage: bool) -> StoreResult<()> {
    if index_specs.is_empty() {
        return Err(StoreError::InvalidIndexSpecs(
            "a soup needs at least one index spec".to_string(),
        ));
    }
    for (i, spec) in index_specs.iter().enumerate() {
        if spec.path.is_empty() {
            return Err(StoreError::InvalidIndexSpecs("empty index path".to_string()));
        }
        if spec.path.contains(['\'', '{', '}']) {
            return Err(StoreError::InvalidIndexSpecs(format!(
                "unsupported characters in path '{}'",
                spec.path
            )));
        }
        if index_specs[..i].iter().any(|other| other.path == spec.path) {
            return Err(StoreError::InvalidIndexSpecs(format!(
                "path '{}' is indexed twice",
                spec.path
            )));
        }
        if external_storage && spec.index_type == IndexType::Json1 {
            return Err(StoreError::InvalidIndexSpecs(
                "json1 indexes need the entry in the table and cannot be used with external storage"
                    .to_string(),
            ));
        }
    }
    Ok(())
}

/// Create the soup table, its indexes and full-text table, and record the
/// index map. Column `i` of the table is `<table>_<i>`.
fn create_soup_table(
    conn: &Connection,
    soup_name: &str,
    table_name: &str,
    index_specs: &[IndexSpec],
) -> StoreResult<()> {
    let mut columns = vec![
        "_soupEntryId INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "soup TEXT".to_string(),
        "_soupCreatedDate INTEGER".to_string(),
        "_soupLastModifiedDate INTEGER".to_string(),
    ];
    let mut statements = Vec::new();
    let mut fts_columns = Vec::new();

    conn.execute("DELETE FROM soup_index_map WHERE soupName = ?1", [soup_name])?;

    for (i, spec) in index_specs.iter().enumerate() {
        let index_name = format!("{}_{}_idx", table_name, i);
        let column_name = match spec.index_type.column_type() {
            Some(column_type) => {
                let column = format!("{}_{}", table_name, i);
                columns.push(format!("{} {}", column, column_type));
                statements.push(format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    index_name, table_name, column
                ));
                if spec.index_type == IndexType::FullText {
                    fts_columns.push(column.clone());
                }
                column
            }
            None => {
                let expr = format!("json_extract(soup, '$.{}')", spec.path);
                statements.push(format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    index_name, table_name, expr
                ));
                expr
            }
        };
        conn.execute(
            "INSERT INTO soup_index_map (soupName, path, columnName, columnType) VALUES (?1, ?2, ?3, ?4)",
            params![soup_name, spec.path, column_name, spec.index_type.as_str()],
        )?;
    }

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table_name,
        columns.join(", ")
    ))?;
    statements.push(format!(
        "CREATE INDEX IF NOT EXISTS {0}_created_idx ON {0} (_soupCreatedDate)",
        table_name
    ));
    statements.push(format!(
        "CREATE INDEX IF NOT EXISTS {0}_modified_idx ON {0} (_soupLastModifiedDate)",
        table_name
    ));
    for statement in statements {
        conn.execute_batch(&statement)?;
    }
    if !fts_columns.is_empty() {
        fulltext::create_fts_table(conn, table_name, &fts_columns)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::DatabaseManager;
    use serde_json::json;
    use smartsql_core::{QuerySpec, SortOrder};
    use tempfile::TempDir;

    #[test]
    fn test_validate_index_specs() {
        assert!(validate_index_specs(&[], false).is_err());
        assert!(validate_index_specs(&[IndexSpec::string("")], false).is_err());
        assert!(
            validate_index_specs(&[IndexSpec::string("a"), IndexSpec::integer("a")], false)
                .is_err()
        );
        assert!(validate_index_specs(&[IndexSpec::json1("a")], true).is_err());
        assert!(validate_index_specs(&[IndexSpec::json1("a")], false).is_ok());
    }

    #[test]
    fn test_create_soup_table_records_index_map() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_META_TABLES).unwrap();
        conn.execute(
            "INSERT INTO soup_attrs (soupName, externalStorage) VALUES ('people', 0)",
            [],
        )
        .unwrap();
        create_soup_table(
            &conn,
            "people",
            "TABLE_1",
            &[
                IndexSpec::string("name"),
                IndexSpec::json1("address.city"),
                IndexSpec::full_text("bio"),
            ],
        )
        .unwrap();

        let schema = load_soup_schema(&conn, "people").unwrap().unwrap();
        assert_eq!(schema.table_name, "TABLE_1");
        assert_eq!(
            schema.index_specs,
            vec![
                IndexSpec::string("name").with_column("TABLE_1_0"),
                IndexSpec::json1("address.city"),
                IndexSpec::full_text("bio").with_column("TABLE_1_2"),
            ]
        );
        assert!(table_exists(&conn, "TABLE_1").unwrap());
        assert!(table_exists(&conn, "TABLE_1_fts").unwrap());
    }

    #[test]
    fn test_interrupted_alter_resumes_on_open() {
        let tmp = TempDir::new().unwrap();
        let manager = DatabaseManager::new(tmp.path(), StoreScope::Global);
        let store = SmartStore::open(&manager, "main", None, 10).unwrap();
        store
            .register_soup("people", &[IndexSpec::string("name")])
            .unwrap();
        store
            .upsert_entry("people", json!({"name": "Ann", "age": 31}))
            .unwrap();

        let table = store
            .with_inner(|inner| {
                let existing = inner.require_soup("people")?;
                let details = AlterSoupDetails {
                    soup_name: "people".to_string(),
                    soup_table_name: existing.table_name.clone(),
                    old_index_specs: existing.index_specs.clone(),
                    new_index_specs: vec![IndexSpec::string("name"), IndexSpec::integer("age")],
                    old_external_storage: false,
                    new_external_storage: false,
                    re_index_data: true,
                };
                let id = long_operation::log_start(&inner.conn, &details)?;
                // Stop after the new table exists but before any data is copied
                for step in [
                    AlterSoupStep::RenameOldSoupTable,
                    AlterSoupStep::DropOldIndexes,
                    AlterSoupStep::RegisterSoupUsingTableName,
                ] {
                    let tx = inner.conn.unchecked_transaction()?;
                    inner.alter_soup_step(&tx, &details, step)?;
                    long_operation::update_status(&tx, id, step)?;
                    tx.commit()?;
                }
                Ok(existing.table_name)
            })
            .unwrap();
        store.close();

        let store = SmartStore::open(&manager, "main", None, 10).unwrap();
        let by_age = QuerySpec::exact("people", "age", 31, None, SortOrder::Ascending, 10);
        let found = store.query(&by_age, 0).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["name"], json!("Ann"));
        store
            .with_inner(|inner| {
                assert!(long_operation::load_all(&inner.conn)?.is_empty());
                assert!(!table_exists(&inner.conn, &format!("{}_old", table))?);
                Ok(())
            })
            .unwrap();
    }
}
