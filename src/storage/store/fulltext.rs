use super::*;

// ==================== Fulltext Index Operations ====================
//
// Soups with full_text index specs get an FTS5 table `<table>_fts` whose
// columns mirror the soup's full-text columns and whose rowid is the entry id.

pub(crate) fn create_fts_table(
    conn: &Connection,
    table_name: &str,
    columns: &[String],
) -> StoreResult<()> {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS {}_fts USING fts5({})",
        table_name,
        columns.join(", ")
    ))?;
    Ok(())
}

fn fts_columns(schema: &SoupSchema) -> Vec<(&str, &str)> {
    schema
        .full_text_specs()
        .filter_map(|s| s.column_name.as_deref().map(|c| (c, s.path.as_str())))
        .collect()
}

/// Replace the full-text row of one entry
pub(crate) fn upsert_fts_row(
    conn: &Connection,
    schema: &SoupSchema,
    entry_id: i64,
    entry: &Value,
) -> StoreResult<()> {
    let columns = fts_columns(schema);
    if columns.is_empty() {
        return Ok(());
    }
    let fts_table = schema.fts_table_name();
    conn.execute(&format!("DELETE FROM {} WHERE rowid = ?1", fts_table), [entry_id])?;

    let names: Vec<&str> = columns.iter().map(|(c, _)| *c).collect();
    let placeholders = vec!["?"; columns.len() + 1].join(", ");
    let mut values = vec![rusqlite::types::Value::Integer(entry_id)];
    values.extend(columns.iter().map(|(_, path)| {
        json_to_sql(
            smartsql_core::project(entry, path).as_ref(),
            IndexType::FullText,
        )
    }));
    conn.execute(
        &format!(
            "INSERT INTO {} (rowid, {}) VALUES ({})",
            fts_table,
            names.join(", "),
            placeholders
        ),
        rusqlite::params_from_iter(values),
    )?;
    Ok(())
}

pub(crate) fn delete_fts_rows(
    conn: &Connection,
    schema: &SoupSchema,
    entry_ids: &[i64],
) -> StoreResult<()> {
    if !schema.has_full_text() || entry_ids.is_empty() {
        return Ok(());
    }
    conn.execute(
        &format!(
            "DELETE FROM {} WHERE rowid IN ({})",
            schema.fts_table_name(),
            id_placeholders(entry_ids.len())
        ),
        rusqlite::params_from_iter(entry_ids),
    )?;
    Ok(())
}

/// Fill the full-text table from the soup table's full-text columns
pub(crate) fn populate_fts(conn: &Connection, schema: &SoupSchema) -> StoreResult<()> {
    let columns = fts_columns(schema);
    if columns.is_empty() {
        return Ok(());
    }
    let names = columns
        .iter()
        .map(|(c, _)| *c)
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute_batch(&format!(
        "DELETE FROM {fts}; INSERT INTO {fts} (rowid, {names}) SELECT _soupEntryId, {names} FROM {table};",
        fts = schema.fts_table_name(),
        names = names,
        table = schema.table_name
    ))?;
    Ok(())
}

pub(crate) fn id_placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
