//! Smart SQL translation.
//!
//! Smart SQL names soups and index paths by their logical names inside braces:
//! `{soup}` is the soup's table, `{soup:path}` an indexed path. Translation
//! resolves every token against a [`SchemaSource`] and fails on anything it
//! cannot resolve.

use crate::error::{SmartSqlError, SmartSqlResult};
use crate::index::{IndexSpec, IndexType};
use crate::query_spec::{QueryKind, QuerySpec};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

pub const SOUP_ENTRY_ID: &str = "_soupEntryId";
pub const SOUP_CREATED_DATE: &str = "_soupCreatedDate";
pub const SOUP_LAST_MODIFIED_DATE: &str = "_soupLastModifiedDate";
/// Path that selects the whole entry
pub const SOUP_PATH: &str = "_soup";
/// Column alias prefix marking an entry that lives in external storage
pub const EXTERNAL_ALIAS_PREFIX: &str = "_external_";

/// Physical layout of one soup
#[derive(Debug, Clone, PartialEq)]
pub struct SoupSchema {
    pub soup_name: String,
    pub table_name: String,
    pub index_specs: Vec<IndexSpec>,
    pub external_storage: bool,
}

impl SoupSchema {
    pub fn index_for_path(&self, path: &str) -> Option<&IndexSpec> {
        self.index_specs.iter().find(|s| s.path == path)
    }

    pub fn full_text_specs(&self) -> impl Iterator<Item = &IndexSpec> {
        self.index_specs
            .iter()
            .filter(|s| s.index_type == IndexType::FullText)
    }

    pub fn has_full_text(&self) -> bool {
        self.full_text_specs().next().is_some()
    }

    pub fn fts_table_name(&self) -> String {
        format!("{}_fts", self.table_name)
    }

    /// SQL expression for an indexed path, qualified by table name
    pub fn column_expr(&self, path: &str) -> Option<String> {
        let spec = self.index_for_path(path)?;
        match (&spec.index_type, &spec.column_name) {
            (IndexType::Json1, _) => Some(format!(
                "json_extract({}.soup, '$.{}')",
                self.table_name, spec.path
            )),
            (_, Some(col)) => Some(format!("{}.{}", self.table_name, col)),
            (_, None) => None,
        }
    }
}

/// Where soup layouts come from.
///
/// Implemented by the store over its metadata tables, and by [`InMemorySchema`]
/// for tests.
pub trait SchemaSource {
    /// Layout of the named soup, or `None` when no such soup exists
    fn soup_schema(&self, soup_name: &str) -> Option<SoupSchema>;
}

/// A fixed set of soup layouts, for tests
#[derive(Debug, Default, Clone)]
pub struct InMemorySchema {
    soups: HashMap<String, SoupSchema>,
}

impl InMemorySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, schema: SoupSchema) {
        self.soups.insert(schema.soup_name.clone(), schema);
    }
}

impl SchemaSource for InMemorySchema {
    fn soup_schema(&self, soup_name: &str) -> Option<SoupSchema> {
        self.soups.get(soup_name).cloned()
    }
}

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^{}:]+)(?::([^{}]+))?\}").expect("valid smart sql token pattern"));

/// Soup names referenced by a smart SQL string, in order of first appearance
pub fn referenced_soups(smart_sql: &str) -> Vec<String> {
    let mut soups: Vec<String> = Vec::new();
    for cap in TOKEN_RE.captures_iter(smart_sql) {
        let name = cap[1].trim().to_string();
        if !soups.contains(&name) {
            soups.push(name);
        }
    }
    soups
}

/// Translate smart SQL into executable SQL
pub fn translate(smart_sql: &str, schema: &dyn SchemaSource) -> SmartSqlResult<String> {
    let trimmed = smart_sql.trim_start();
    if !trimmed
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("select"))
    {
        return Err(SmartSqlError::NotASelect(smart_sql.to_string()));
    }

    let mut out = String::with_capacity(smart_sql.len());
    let mut last = 0;
    let mut resolved: HashMap<String, SoupSchema> = HashMap::new();

    for cap in TOKEN_RE.captures_iter(smart_sql) {
        let whole = cap.get(0).map(|m| m.range()).unwrap_or(0..0);
        out.push_str(&smart_sql[last..whole.start]);
        last = whole.end;

        let soup_name = cap[1].trim();
        if !resolved.contains_key(soup_name) {
            let schema = schema
                .soup_schema(soup_name)
                .ok_or_else(|| SmartSqlError::UnknownSoup(soup_name.to_string()))?;
            resolved.insert(soup_name.to_string(), schema);
        }
        let soup = &resolved[soup_name];

        let replacement = match cap.get(2).map(|m| m.as_str().trim()) {
            None => soup.table_name.clone(),
            Some(SOUP_PATH) if soup.external_storage => format!(
                "{0}.{1} AS \"{2}{0}\"",
                soup.table_name, SOUP_ENTRY_ID, EXTERNAL_ALIAS_PREFIX
            ),
            Some(SOUP_PATH) => format!("{}.soup", soup.table_name),
            Some(p @ (SOUP_ENTRY_ID | SOUP_CREATED_DATE | SOUP_LAST_MODIFIED_DATE)) => {
                format!("{}.{}", soup.table_name, p)
            }
            Some(path) => soup
                .column_expr(path)
                .ok_or_else(|| SmartSqlError::UnknownPath {
                    soup: soup_name.to_string(),
                    path: path.to_string(),
                })?,
        };
        out.push_str(&replacement);
    }
    out.push_str(&smart_sql[last..]);
    Ok(out)
}

/// Bind values for a spec, with match keys qualified by their full-text column.
///
/// Fails when a match query targets a soup without full-text indexes, or a path
/// that is not full-text indexed.
pub fn bind_args(spec: &QuerySpec, schema: &dyn SchemaSource) -> SmartSqlResult<Vec<Value>> {
    let QueryKind::Match {
        index_path,
        match_key,
    } = spec.kind()
    else {
        return Ok(spec.args());
    };

    let soup_name = spec
        .soup_name()
        .ok_or_else(|| SmartSqlError::MissingField("soupName".to_string()))?;
    let soup = schema
        .soup_schema(soup_name)
        .ok_or_else(|| SmartSqlError::UnknownSoup(soup_name.to_string()))?;
    if !soup.has_full_text() {
        return Err(SmartSqlError::NoFullTextIndex(soup_name.to_string()));
    }

    let arg = match index_path.as_deref() {
        None | Some("") => match_key.clone(),
        Some(path) => {
            let column = soup
                .full_text_specs()
                .find(|s| s.path == path)
                .and_then(|s| s.column_name.clone())
                .ok_or_else(|| SmartSqlError::UnknownPath {
                    soup: soup_name.to_string(),
                    path: path.to_string(),
                })?;
            format!("{}:({})", column, match_key)
        }
    };
    Ok(vec![Value::String(arg)])
}
