//! Query specs: the five query shapes a soup can be asked, plus paging and order.
//!
//! A spec is built once (from typed constructors or from the JSON wire format)
//! and carries its smart SQL, count SQL and ids SQL precomputed. Smart SQL still
//! refers to soups and paths by logical name; see [`crate::translator`] for the
//! step that turns it into executable SQL.

use crate::error::{SmartSqlError, SmartSqlResult};
use serde_json::Value;

/// Page size used when the wire format does not carry one
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    /// Parse the wire string; anything other than "ascending"/"descending" is rejected
    pub fn parse(s: &str) -> SmartSqlResult<Self> {
        match s {
            "ascending" => Ok(SortOrder::Ascending),
            "descending" => Ok(SortOrder::Descending),
            other => Err(SmartSqlError::UnknownSortOrder(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ascending",
            SortOrder::Descending => "descending",
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

/// The query shape and its type-specific keys
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKind {
    Exact {
        index_path: String,
        match_key: Value,
    },
    Range {
        index_path: String,
        begin_key: Option<Value>,
        end_key: Option<Value>,
    },
    Like {
        index_path: String,
        like_key: String,
    },
    /// Full-text match; no index path means all full-text columns
    Match {
        index_path: Option<String>,
        match_key: String,
    },
    Smart {
        smart_sql: String,
    },
}

impl QueryKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            QueryKind::Exact { .. } => "exact",
            QueryKind::Range { .. } => "range",
            QueryKind::Like { .. } => "like",
            QueryKind::Match { .. } => "match",
            QueryKind::Smart { .. } => "smart",
        }
    }
}

/// An immutable query description
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    soup_name: Option<String>,
    kind: QueryKind,
    select_paths: Vec<String>,
    order_path: Option<String>,
    order: SortOrder,
    page_size: usize,
    smart_sql: String,
    count_smart_sql: String,
    ids_smart_sql: String,
}

impl QuerySpec {
    pub fn exact(
        soup_name: &str,
        index_path: &str,
        match_key: impl Into<Value>,
        order_path: Option<&str>,
        order: SortOrder,
        page_size: usize,
    ) -> Self {
        Self::build(
            Some(soup_name.to_string()),
            QueryKind::Exact {
                index_path: index_path.to_string(),
                match_key: match_key.into(),
            },
            Vec::new(),
            order_path.map(str::to_string),
            order,
            page_size,
        )
    }

    pub fn range(
        soup_name: &str,
        index_path: &str,
        begin_key: Option<Value>,
        end_key: Option<Value>,
        order_path: Option<&str>,
        order: SortOrder,
        page_size: usize,
    ) -> Self {
        Self::build(
            Some(soup_name.to_string()),
            QueryKind::Range {
                index_path: index_path.to_string(),
                begin_key,
                end_key,
            },
            Vec::new(),
            order_path.map(str::to_string),
            order,
            page_size,
        )
    }

    pub fn like(
        soup_name: &str,
        index_path: &str,
        like_key: &str,
        order_path: Option<&str>,
        order: SortOrder,
        page_size: usize,
    ) -> Self {
        Self::build(
            Some(soup_name.to_string()),
            QueryKind::Like {
                index_path: index_path.to_string(),
                like_key: like_key.to_string(),
            },
            Vec::new(),
            order_path.map(str::to_string),
            order,
            page_size,
        )
    }

    pub fn full_text(
        soup_name: &str,
        index_path: Option<&str>,
        match_key: &str,
        order_path: Option<&str>,
        order: SortOrder,
        page_size: usize,
    ) -> Self {
        Self::build(
            Some(soup_name.to_string()),
            QueryKind::Match {
                index_path: index_path.map(str::to_string),
                match_key: match_key.to_string(),
            },
            Vec::new(),
            order_path.map(str::to_string),
            order,
            page_size,
        )
    }

    pub fn smart(smart_sql: &str, page_size: usize) -> Self {
        Self::build(
            None,
            QueryKind::Smart {
                smart_sql: smart_sql.to_string(),
            },
            Vec::new(),
            None,
            SortOrder::Ascending,
            page_size,
        )
    }

    /// Every entry of the soup, ordered by `order_path`
    pub fn all(soup_name: &str, order_path: &str, order: SortOrder, page_size: usize) -> Self {
        Self::range(
            soup_name,
            order_path,
            None,
            None,
            Some(order_path),
            order,
            page_size,
        )
    }

    /// Return only the given paths (one JSON array per row) instead of whole entries
    pub fn with_select_paths(self, select_paths: Vec<String>) -> Self {
        Self::build(
            self.soup_name,
            self.kind,
            select_paths,
            self.order_path,
            self.order,
            self.page_size,
        )
    }

    /// Parse the dictionary wire format.
    ///
    /// `soup_name` is used for non-smart queries when the dictionary has no
    /// `soupName` key. A missing `order` means ascending; an unrecognized one is
    /// an error. Negative page sizes clamp to 0 (no paging).
    pub fn from_json(value: &Value, soup_name: Option<&str>) -> SmartSqlResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| SmartSqlError::InvalidQuerySpec("expected an object".to_string()))?;

        let query_type = obj
            .get("queryType")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SmartSqlError::MissingField("queryType".to_string()))?;

        let page_size = match obj.get("pageSize") {
            None | Some(Value::Null) => DEFAULT_PAGE_SIZE,
            Some(v) => match v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)) {
                Some(n) => n.max(0) as usize,
                None => {
                    return Err(SmartSqlError::InvalidQuerySpec(format!(
                        "pageSize must be a number, got {}",
                        v
                    )))
                }
            },
        };

        let order = match obj.get("order") {
            None | Some(Value::Null) => SortOrder::Ascending,
            Some(Value::String(s)) => SortOrder::parse(s)?,
            Some(other) => return Err(SmartSqlError::UnknownSortOrder(other.to_string())),
        };

        let select_paths = match obj.get("selectPaths") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|p| {
                    p.as_str().map(str::to_string).ok_or_else(|| {
                        SmartSqlError::InvalidQuerySpec("selectPaths must be strings".to_string())
                    })
                })
                .collect::<SmartSqlResult<Vec<_>>>()?,
            Some(_) => {
                return Err(SmartSqlError::InvalidQuerySpec(
                    "selectPaths must be an array".to_string(),
                ))
            }
        };

        let str_field = |key: &str| obj.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let required = |key: &str| {
            str_field(key).ok_or_else(|| SmartSqlError::MissingField(key.to_string()))
        };
        let optional_key = |key: &str| match obj.get(key) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.clone()),
        };

        let index_path = str_field("indexPath");
        let order_path = str_field("orderPath").or_else(|| index_path.clone());

        let kind = match query_type {
            "exact" => QueryKind::Exact {
                index_path: required("indexPath")?,
                match_key: optional_key("matchKey")
                    .ok_or_else(|| SmartSqlError::MissingField("matchKey".to_string()))?,
            },
            "range" => QueryKind::Range {
                index_path: required("indexPath")?,
                begin_key: optional_key("beginKey"),
                end_key: optional_key("endKey"),
            },
            "like" => QueryKind::Like {
                index_path: required("indexPath")?,
                like_key: required("likeKey")?,
            },
            "match" => QueryKind::Match {
                index_path,
                match_key: required("matchKey")?,
            },
            "smart" => QueryKind::Smart {
                smart_sql: required("smartSql")?,
            },
            other => return Err(SmartSqlError::UnknownQueryType(other.to_string())),
        };

        let soup_name = match kind {
            QueryKind::Smart { .. } => None,
            _ => Some(
                str_field("soupName")
                    .or_else(|| soup_name.map(str::to_string))
                    .ok_or_else(|| SmartSqlError::MissingField("soupName".to_string()))?,
            ),
        };
        let order_path = match kind {
            QueryKind::Smart { .. } => None,
            _ => order_path,
        };

        Ok(Self::build(
            soup_name,
            kind,
            select_paths,
            order_path,
            order,
            page_size,
        ))
    }

    fn build(
        soup_name: Option<String>,
        kind: QueryKind,
        select_paths: Vec<String>,
        order_path: Option<String>,
        order: SortOrder,
        page_size: usize,
    ) -> Self {
        let (smart_sql, count_smart_sql, ids_smart_sql) = match (&kind, &soup_name) {
            (QueryKind::Smart { smart_sql }, _) => (
                smart_sql.clone(),
                format!("SELECT count(*) FROM ({})", smart_sql),
                smart_sql.clone(),
            ),
            (_, Some(soup)) => {
                let select = if select_paths.is_empty() {
                    format!("SELECT {{{}:_soup}}", soup)
                } else {
                    let cols: Vec<String> = select_paths
                        .iter()
                        .map(|p| format!("{{{}:{}}}", soup, p))
                        .collect();
                    format!("SELECT {}", cols.join(", "))
                };
                let predicate = where_clause(soup, &kind);
                let order_by = order_path
                    .as_ref()
                    .map(|p| format!(" ORDER BY {{{}:{}}} {}", soup, p, order.as_sql()))
                    .unwrap_or_default();
                (
                    format!("{} FROM {{{}}}{}{}", select, soup, predicate, order_by),
                    format!("SELECT count(*) FROM {{{}}}{}", soup, predicate),
                    format!("SELECT {{{0}:_soupEntryId}} FROM {{{0}}}{1}", soup, predicate),
                )
            }
            // Non-smart kinds always carry a soup name
            (_, None) => (String::new(), String::new(), String::new()),
        };

        Self {
            soup_name,
            kind,
            select_paths,
            order_path,
            order,
            page_size,
            smart_sql,
            count_smart_sql,
            ids_smart_sql,
        }
    }

    pub fn soup_name(&self) -> Option<&str> {
        self.soup_name.as_deref()
    }

    pub fn kind(&self) -> &QueryKind {
        &self.kind
    }

    pub fn select_paths(&self) -> &[String] {
        &self.select_paths
    }

    pub fn order_path(&self) -> Option<&str> {
        self.order_path.as_deref()
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Rows come back as arrays (smart or projected) rather than whole entries
    pub fn returns_arrays(&self) -> bool {
        matches!(self.kind, QueryKind::Smart { .. }) || !self.select_paths.is_empty()
    }

    pub fn smart_sql(&self) -> &str {
        &self.smart_sql
    }

    pub fn count_smart_sql(&self) -> &str {
        &self.count_smart_sql
    }

    pub fn ids_smart_sql(&self) -> &str {
        &self.ids_smart_sql
    }

    /// Bind values in placeholder order. Match keys are returned as given;
    /// column qualification happens at translation time.
    pub fn args(&self) -> Vec<Value> {
        match &self.kind {
            QueryKind::Exact { match_key, .. } => vec![match_key.clone()],
            QueryKind::Range {
                begin_key, end_key, ..
            } => begin_key.iter().chain(end_key.iter()).cloned().collect(),
            QueryKind::Like { like_key, .. } => vec![Value::String(like_key.clone())],
            QueryKind::Match { match_key, .. } => vec![Value::String(match_key.clone())],
            QueryKind::Smart { .. } => Vec::new(),
        }
    }

    /// Append LIMIT/OFFSET for the given page; page size 0 returns everything
    pub fn paged_sql(&self, sql: &str, page_index: usize) -> String {
        if self.page_size == 0 {
            sql.to_string()
        } else {
            format!(
                "{} LIMIT {} OFFSET {}",
                sql,
                self.page_size,
                self.page_size.saturating_mul(page_index)
            )
        }
    }
}

fn where_clause(soup: &str, kind: &QueryKind) -> String {
    match kind {
        QueryKind::Exact { index_path, .. } => format!(" WHERE {{{}:{}}} = ?", soup, index_path),
        QueryKind::Range {
            index_path,
            begin_key,
            end_key,
        } => {
            let mut parts = Vec::new();
            if begin_key.is_some() {
                parts.push(format!("{{{}:{}}} >= ?", soup, index_path));
            }
            if end_key.is_some() {
                parts.push(format!("{{{}:{}}} <= ?", soup, index_path));
            }
            if parts.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", parts.join(" AND "))
            }
        }
        QueryKind::Like { index_path, .. } => {
            format!(" WHERE {{{}:{}}} LIKE ?", soup, index_path)
        }
        QueryKind::Match { .. } => format!(
            " WHERE {{{0}:_soupEntryId}} IN (SELECT rowid FROM {{{0}}}_fts WHERE {{{0}}}_fts MATCH ?)",
            soup
        ),
        QueryKind::Smart { .. } => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_exact_sql() {
        let spec = QuerySpec::exact(
            "people",
            "name",
            "Alice",
            Some("name"),
            SortOrder::Ascending,
            10,
        );
        assert_eq!(
            spec.smart_sql(),
            "SELECT {people:_soup} FROM {people} WHERE {people:name} = ? ORDER BY {people:name} ASC"
        );
        assert_eq!(
            spec.count_smart_sql(),
            "SELECT count(*) FROM {people} WHERE {people:name} = ?"
        );
        assert_eq!(
            spec.ids_smart_sql(),
            "SELECT {people:_soupEntryId} FROM {people} WHERE {people:name} = ?"
        );
        assert_eq!(spec.args(), vec![json!("Alice")]);
        assert!(!spec.returns_arrays());
    }

    #[test]
    fn test_range_open_ended() {
        let spec = QuerySpec::range(
            "people",
            "age",
            Some(json!(30)),
            None,
            Some("age"),
            SortOrder::Descending,
            5,
        );
        assert_eq!(
            spec.smart_sql(),
            "SELECT {people:_soup} FROM {people} WHERE {people:age} >= ? ORDER BY {people:age} DESC"
        );
        assert_eq!(spec.args(), vec![json!(30)]);

        let all = QuerySpec::all("people", "age", SortOrder::Ascending, 5);
        assert_eq!(
            all.smart_sql(),
            "SELECT {people:_soup} FROM {people} ORDER BY {people:age} ASC"
        );
        assert!(all.args().is_empty());
    }

    #[test]
    fn test_like_and_match_are_parameterized() {
        let like = QuerySpec::like("people", "name", "Al%", None, SortOrder::Ascending, 10);
        assert_eq!(
            like.smart_sql(),
            "SELECT {people:_soup} FROM {people} WHERE {people:name} LIKE ?"
        );
        assert_eq!(like.args(), vec![json!("Al%")]);

        let fts = QuerySpec::full_text("notes", None, "rust*", None, SortOrder::Ascending, 10);
        assert_eq!(
            fts.smart_sql(),
            "SELECT {notes:_soup} FROM {notes} WHERE {notes:_soupEntryId} IN \
             (SELECT rowid FROM {notes}_fts WHERE {notes}_fts MATCH ?)"
        );
        assert_eq!(fts.args(), vec![json!("rust*")]);
    }

    #[test]
    fn test_select_paths() {
        let spec = QuerySpec::exact("people", "name", "Bob", None, SortOrder::Ascending, 10)
            .with_select_paths(vec!["name".to_string(), "age".to_string()]);
        assert_eq!(
            spec.smart_sql(),
            "SELECT {people:name}, {people:age} FROM {people} WHERE {people:name} = ?"
        );
        assert!(spec.returns_arrays());
    }

    #[test]
    fn test_smart_sql_passthrough() {
        let sql = "SELECT {people:name} FROM {people} WHERE {people:age} > 20";
        let spec = QuerySpec::smart(sql, 0);
        assert_eq!(spec.smart_sql(), sql);
        assert_eq!(
            spec.count_smart_sql(),
            format!("SELECT count(*) FROM ({})", sql)
        );
        assert_eq!(spec.paged_sql(sql, 3), sql);
        assert!(spec.returns_arrays());
        assert_eq!(spec.soup_name(), None);
    }

    #[test]
    fn test_paged_sql() {
        let spec = QuerySpec::all("people", "name", SortOrder::Ascending, 10);
        assert_eq!(spec.paged_sql("SELECT 1", 0), "SELECT 1 LIMIT 10 OFFSET 0");
        assert_eq!(spec.paged_sql("SELECT 1", 2), "SELECT 1 LIMIT 10 OFFSET 20");
    }

    #[test]
    fn test_from_json_exact() {
        let spec = QuerySpec::from_json(
            &json!({
                "queryType": "exact",
                "indexPath": "name",
                "matchKey": "Alice",
                "order": "descending",
                "pageSize": 25
            }),
            Some("people"),
        )
        .unwrap();
        assert_eq!(spec.soup_name(), Some("people"));
        assert_eq!(spec.order(), SortOrder::Descending);
        // order path defaults to the index path
        assert_eq!(spec.order_path(), Some("name"));
        assert_eq!(spec.page_size(), 25);
        assert_eq!(
            spec.kind(),
            &QueryKind::Exact {
                index_path: "name".to_string(),
                match_key: json!("Alice")
            }
        );
    }

    #[test]
    fn test_from_json_defaults_and_clamping() {
        let spec = QuerySpec::from_json(
            &json!({"queryType": "range", "indexPath": "age", "beginKey": null, "pageSize": -4}),
            Some("people"),
        )
        .unwrap();
        assert_eq!(spec.page_size(), 0);
        assert_eq!(spec.order(), SortOrder::Ascending);
        assert!(spec.args().is_empty());

        let spec = QuerySpec::from_json(
            &json!({"queryType": "smart", "smartSql": "SELECT {a:_soup} FROM {a}"}),
            None,
        )
        .unwrap();
        assert_eq!(spec.page_size(), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_from_json_unknown_order_fails() {
        let err = QuerySpec::from_json(
            &json!({"queryType": "exact", "indexPath": "a", "matchKey": 1, "order": "up"}),
            Some("s"),
        )
        .unwrap_err();
        assert_eq!(err, SmartSqlError::UnknownSortOrder("up".to_string()));
    }

    #[test]
    fn test_from_json_errors() {
        let err = QuerySpec::from_json(&json!({"queryType": "fuzzy"}), Some("s")).unwrap_err();
        assert_eq!(err, SmartSqlError::UnknownQueryType("fuzzy".to_string()));

        let err =
            QuerySpec::from_json(&json!({"queryType": "like", "indexPath": "a"}), Some("s"))
                .unwrap_err();
        assert_eq!(err, SmartSqlError::MissingField("likeKey".to_string()));

        let err = QuerySpec::from_json(
            &json!({"queryType": "exact", "indexPath": "a", "matchKey": 1}),
            None,
        )
        .unwrap_err();
        assert_eq!(err, SmartSqlError::MissingField("soupName".to_string()));
    }

    #[test]
    fn test_from_json_match_without_path() {
        let spec = QuerySpec::from_json(
            &json!({"queryType": "match", "matchKey": "hello", "indexPath": null}),
            Some("notes"),
        )
        .unwrap();
        assert_eq!(
            spec.kind(),
            &QueryKind::Match {
                index_path: None,
                match_key: "hello".to_string()
            }
        );
        assert_eq!(spec.order_path(), None);
    }
}
