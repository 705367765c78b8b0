use super::*;
use rusqlite::types::ValueRef;
use smartsql_core::{bind_args, QuerySpec, EXTERNAL_ALIAS_PREFIX};

impl SmartStore {
    // ==================== Queries ====================

    /// One page of results. Whole entries, or one JSON array per row for smart
    /// queries and queries with select paths.
    pub fn query(&self, spec: &QuerySpec, page_index: usize) -> StoreResult<Vec<Value>> {
        self.with_inner(|inner| {
            let sql = inner.translate(spec.smart_sql())?;
            let args = bind_args(spec, inner)?;
            let sql = spec.paged_sql(&sql, page_index);
            inner.run_query(&sql, &args, spec.returns_arrays())
        })
    }

    /// Number of rows the spec matches, across all pages
    pub fn count(&self, spec: &QuerySpec) -> StoreResult<usize> {
        self.with_inner(|inner| {
            let sql = inner.translate(spec.count_smart_sql())?;
            let args = bind_args(spec, inner)?;
            let count: i64 = inner.conn.query_row(
                &sql,
                rusqlite::params_from_iter(args.iter().map(json_arg)),
                |r| r.get(0),
            )?;
            Ok(count.max(0) as usize)
        })
    }

    /// Delete the entries a spec matches. A smart spec must select only entry ids.
    pub fn remove_entries_by_query(&self, soup_name: &str, spec: &QuerySpec) -> StoreResult<()> {
        self.with_inner(|inner| {
            let schema = inner.require_soup(soup_name)?;
            let ids_sql = inner.translate(spec.ids_smart_sql())?;
            let args: Vec<rusqlite::types::Value> =
                bind_args(spec, inner)?.iter().map(json_arg).collect();

            // Ids first: a match spec selects through the full-text table
            let ids: Vec<i64> = {
                let mut stmt = inner.conn.prepare(&ids_sql)?;
                let ids = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), |r| r.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                ids
            };
            inner.delete_entries(&schema, &ids)?;
            debug!("Removed {} entries from '{}' by query", ids.len(), soup_name);
            Ok(())
        })
    }

    /// Translate smart sql without running it
    pub fn convert_smart_sql(&self, smart_sql: &str) -> StoreResult<String> {
        self.with_inner(|inner| inner.translate(smart_sql))
    }
}

impl StoreInner {
    pub(crate) fn run_query(
        &self,
        sql: &str,
        args: &[Value],
        as_arrays: bool,
    ) -> StoreResult<Vec<Value>> {
        let mut stmt = self.conn.prepare(sql)?;
        let column_names: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(args.iter().map(json_arg)))?;

        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            if as_arrays {
                let mut cells = Vec::with_capacity(column_names.len());
                for (i, name) in column_names.iter().enumerate() {
                    cells.push(self.cell_to_json(name, row.get_ref(i)?)?);
                }
                results.push(Value::Array(cells));
            } else {
                let name = column_names.first().map(String::as_str).unwrap_or("soup");
                results.push(self.cell_to_json(name, row.get_ref(0)?)?);
            }
        }
        Ok(results)
    }

    /// `soup` columns hold entry JSON; external aliases carry an entry id
    /// whose JSON lives in a file; everything else is a scalar.
    fn cell_to_json(&self, column_name: &str, cell: ValueRef<'_>) -> StoreResult<Value> {
        if let Some(table) = column_name.strip_prefix(EXTERNAL_ALIAS_PREFIX) {
            return match cell {
                ValueRef::Integer(id) => self.load_external_entry(table, id),
                _ => Ok(Value::Null),
            };
        }
        Ok(match cell {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::from(i),
            ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                if column_name == "soup" {
                    serde_json::from_str(&text)?
                } else {
                    Value::String(text.into_owned())
                }
            }
            ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        })
    }
}
