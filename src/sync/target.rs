//! Local change flags, target descriptors and the custom target registry.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use smartsql_core::{project, QuerySpec, SOUP_ENTRY_ID};
use std::collections::HashMap;
use std::sync::Arc;

use super::down::{SoqlSyncDownTarget, SyncDownTarget};
use super::rest::RestClient;
use super::up::{RestSyncUpTarget, SyncUpTarget};
use crate::error::{StoreError, StoreResult};
use crate::storage::SmartStore;

pub const LOCAL: &str = "__local__";
pub const LOCALLY_CREATED: &str = "__locally_created__";
pub const LOCALLY_UPDATED: &str = "__locally_updated__";
pub const LOCALLY_DELETED: &str = "__locally_deleted__";
pub const SYNC_ID: &str = "__sync_id__";
pub const LAST_ERROR: &str = "__last_error__";

pub const DEFAULT_ID_FIELD_NAME: &str = "Id";
pub const DEFAULT_MODIFICATION_DATE_FIELD_NAME: &str = "LastModifiedDate";

pub const TARGET_TYPE_KEY: &str = "type";
pub const TARGET_IMPL_KEY: &str = "iOSImpl";
pub const ID_FIELD_NAME_KEY: &str = "idFieldName";
pub const MODIFICATION_DATE_FIELD_NAME_KEY: &str = "modificationDateFieldName";

// ==================== Local flags ====================

fn flag(record: &Value, key: &str) -> bool {
    record.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub fn is_dirty(record: &Value) -> bool {
    flag(record, LOCAL)
}

pub fn is_locally_created(record: &Value) -> bool {
    flag(record, LOCALLY_CREATED)
}

pub fn is_locally_updated(record: &Value) -> bool {
    flag(record, LOCALLY_UPDATED)
}

pub fn is_locally_deleted(record: &Value) -> bool {
    flag(record, LOCALLY_DELETED)
}

fn object_mut(record: &mut Value) -> StoreResult<&mut Map<String, Value>> {
    record
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidEntry("sync records must be JSON objects".to_string()))
}

/// Clear the change flags and stamp the record with the sync that wrote it
pub fn clean_record(record: &mut Value, sync_id: Option<i64>) -> StoreResult<()> {
    let obj = object_mut(record)?;
    for key in [LOCAL, LOCALLY_CREATED, LOCALLY_UPDATED, LOCALLY_DELETED] {
        obj.insert(key.to_string(), Value::Bool(false));
    }
    obj.remove(LAST_ERROR);
    if let Some(id) = sync_id {
        obj.insert(SYNC_ID.to_string(), Value::from(id));
    }
    Ok(())
}

/// Set the change flags the way an app does before a sync up
pub fn mark_record(record: &mut Value, created: bool, updated: bool, deleted: bool) -> StoreResult<()> {
    let obj = object_mut(record)?;
    obj.insert(LOCAL.to_string(), Value::Bool(created || updated || deleted));
    obj.insert(LOCALLY_CREATED.to_string(), Value::Bool(created));
    obj.insert(LOCALLY_UPDATED.to_string(), Value::Bool(updated));
    obj.insert(LOCALLY_DELETED.to_string(), Value::Bool(deleted));
    Ok(())
}

/// Record a failed sync up on the entry itself; its change flags stay set
pub fn set_last_error(record: &mut Value, error: &str) -> StoreResult<()> {
    object_mut(record)?.insert(LAST_ERROR.to_string(), Value::String(error.to_string()));
    Ok(())
}

pub fn record_id(record: &Value, id_field_name: &str) -> Option<String> {
    match project(record, id_field_name)? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Server ids of the soup's dirty records
pub fn dirty_record_ids(
    store: &SmartStore,
    soup_name: &str,
    id_field_name: &str,
) -> StoreResult<Vec<String>> {
    let sql = format!(
        "SELECT {{{soup}:{id}}} FROM {{{soup}}} WHERE {{{soup}:{local}}} = 1",
        soup = soup_name,
        id = id_field_name,
        local = LOCAL
    );
    Ok(first_cells(store, &sql)?
        .into_iter()
        .filter_map(|cell| match cell {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect())
}

/// Entry ids of the soup's dirty records, oldest first
pub fn dirty_entry_ids(store: &SmartStore, soup_name: &str) -> StoreResult<Vec<i64>> {
    let sql = format!(
        "SELECT {{{soup}:{entry_id}}} FROM {{{soup}}} WHERE {{{soup}:{local}}} = 1 ORDER BY {{{soup}:{entry_id}}}",
        soup = soup_name,
        entry_id = SOUP_ENTRY_ID,
        local = LOCAL
    );
    Ok(first_cells(store, &sql)?
        .iter()
        .filter_map(Value::as_i64)
        .collect())
}

fn first_cells(store: &SmartStore, smart_sql: &str) -> StoreResult<Vec<Value>> {
    let rows = store.query(&QuerySpec::smart(smart_sql, 0), 0)?;
    Ok(rows
        .into_iter()
        .filter_map(|row| match row {
            Value::Array(mut cells) if !cells.is_empty() => Some(cells.swap_remove(0)),
            _ => None,
        })
        .collect())
}

// ==================== Timestamps ====================

/// Milliseconds since the epoch. Accepts ISO-8601 strings (with `Z`,
/// `+00:00` or `+0000` offsets) and plain millisecond numbers.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
                return Some(dt.timestamp_millis());
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive).timestamp_millis())
        }
        _ => None,
    }
}

/// `2024-01-02T03:04:05.000Z`
pub fn format_timestamp(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ==================== Target descriptors ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownTargetType {
    Mru,
    Sosl,
    Soql,
    Refresh,
    ParentChildren,
    Custom,
    Metadata,
    Layout,
    Briefcase,
}

impl DownTargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownTargetType::Mru => "mru",
            DownTargetType::Sosl => "sosl",
            DownTargetType::Soql => "soql",
            DownTargetType::Refresh => "refresh",
            DownTargetType::ParentChildren => "parent_children",
            DownTargetType::Custom => "custom",
            DownTargetType::Metadata => "metadata",
            DownTargetType::Layout => "layout",
            DownTargetType::Briefcase => "briefcase",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "mru" => DownTargetType::Mru,
            "sosl" => DownTargetType::Sosl,
            "soql" => DownTargetType::Soql,
            "refresh" => DownTargetType::Refresh,
            "parent_children" => DownTargetType::ParentChildren,
            "custom" => DownTargetType::Custom,
            "metadata" => DownTargetType::Metadata,
            "layout" => DownTargetType::Layout,
            "briefcase" => DownTargetType::Briefcase,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpTargetType {
    Rest,
    Custom,
}

impl UpTargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpTargetType::Rest => "rest",
            UpTargetType::Custom => "custom",
        }
    }
}

pub fn id_field_name_of(target: &Value) -> String {
    target
        .get(ID_FIELD_NAME_KEY)
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_ID_FIELD_NAME)
        .to_string()
}

pub fn modification_date_field_name_of(target: &Value) -> String {
    target
        .get(MODIFICATION_DATE_FIELD_NAME_KEY)
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_MODIFICATION_DATE_FIELD_NAME)
        .to_string()
}

pub type DownTargetFactory =
    Arc<dyn Fn(&Value, Arc<dyn RestClient>) -> StoreResult<Arc<dyn SyncDownTarget>> + Send + Sync>;
pub type UpTargetFactory =
    Arc<dyn Fn(&Value, Arc<dyn RestClient>) -> StoreResult<Arc<dyn SyncUpTarget>> + Send + Sync>;

/// Rebuilds targets from their persisted JSON.
///
/// `soql` down targets and `rest` up targets are built in. Custom targets
/// are looked up by the name under `iOSImpl`, which must be registered first.
#[derive(Default)]
pub struct TargetRegistry {
    down: RwLock<HashMap<String, DownTargetFactory>>,
    up: RwLock<HashMap<String, UpTargetFactory>>,
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("down", &self.down.read().keys().collect::<Vec<_>>())
            .field("up", &self.up.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_down(&self, impl_name: &str, factory: DownTargetFactory) {
        self.down.write().insert(impl_name.to_string(), factory);
    }

    pub fn register_up(&self, impl_name: &str, factory: UpTargetFactory) {
        self.up.write().insert(impl_name.to_string(), factory);
    }

    pub fn down_target(
        &self,
        target: &Value,
        rest: Arc<dyn RestClient>,
    ) -> StoreResult<Arc<dyn SyncDownTarget>> {
        let type_name = target
            .get(TARGET_TYPE_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default();
        match DownTargetType::parse(type_name) {
            Some(DownTargetType::Soql) => Ok(Arc::new(SoqlSyncDownTarget::from_json(target, rest)?)),
            Some(DownTargetType::Custom) => {
                let impl_name = impl_name_of(target)?;
                let factory = self.down.read().get(impl_name).cloned().ok_or_else(|| {
                    StoreError::UnsupportedTarget(format!("no sync down target registered as '{}'", impl_name))
                })?;
                factory(target, rest)
            }
            Some(other) => Err(StoreError::UnsupportedTarget(format!(
                "{} sync down targets are not built in; register a custom target",
                other.as_str()
            ))),
            None => Err(StoreError::UnsupportedTarget(format!(
                "unknown sync down target type '{}'",
                type_name
            ))),
        }
    }

    pub fn up_target(
        &self,
        target: &Value,
        rest: Arc<dyn RestClient>,
    ) -> StoreResult<Arc<dyn SyncUpTarget>> {
        match target.get(TARGET_TYPE_KEY).and_then(Value::as_str) {
            None | Some("rest") => Ok(Arc::new(RestSyncUpTarget::from_json(target, rest))),
            Some("custom") => {
                let impl_name = impl_name_of(target)?;
                let factory = self.up.read().get(impl_name).cloned().ok_or_else(|| {
                    StoreError::UnsupportedTarget(format!("no sync up target registered as '{}'", impl_name))
                })?;
                factory(target, rest)
            }
            Some(other) => Err(StoreError::UnsupportedTarget(format!(
                "unknown sync up target type '{}'",
                other
            ))),
        }
    }
}

fn impl_name_of(target: &Value) -> StoreResult<&str> {
    target
        .get(TARGET_IMPL_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::UnsupportedTarget(format!("custom target without {}", TARGET_IMPL_KEY)))
}
