//! SmartSQL Core - storage-independent query specs and smart SQL translation.
//!
//! This crate holds the parts of SmartStore that never touch a database:
//! building query specs, deriving their SQL, projecting JSON paths for index
//! columns, and translating smart SQL (which names soups and paths logically)
//! into physical SQL through a `SchemaSource`.
//!
//! # Example
//!
//! ```rust
//! use smartsql_core::{translate, IndexSpec, InMemorySchema, QuerySpec, SortOrder, SoupSchema};
//!
//! let mut schema = InMemorySchema::new();
//! schema.insert(SoupSchema {
//!     soup_name: "people".to_string(),
//!     table_name: "TABLE_1".to_string(),
//!     index_specs: vec![IndexSpec::string("name").with_column("TABLE_1_0")],
//!     external_storage: false,
//! });
//!
//! let spec = QuerySpec::exact("people", "name", "Alice", None, SortOrder::Ascending, 10);
//! let sql = translate(spec.smart_sql(), &schema).unwrap();
//! assert_eq!(sql, "SELECT TABLE_1.soup FROM TABLE_1 WHERE TABLE_1.TABLE_1_0 = ?");
//! ```

pub mod error;
pub mod index;
pub mod query_spec;
pub mod translator;

// Re-export main types for convenience
pub use error::{SmartSqlError, SmartSqlResult};
pub use index::{project, same_index_specs, IndexSpec, IndexType};
pub use query_spec::{QueryKind, QuerySpec, SortOrder, DEFAULT_PAGE_SIZE};
pub use translator::{
    bind_args, referenced_soups, translate, InMemorySchema, SchemaSource, SoupSchema,
    EXTERNAL_ALIAS_PREFIX, SOUP_CREATED_DATE, SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE, SOUP_PATH,
};
