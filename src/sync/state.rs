//! Sync state management
//!
//! One persisted record per configured sync, stored in the `syncs_soup` soup
//! of the store being synced. The JSON field names are read by other clients
//! as-is and must not change.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smartsql_core::{IndexSpec, QuerySpec, SortOrder};

use crate::error::{StoreError, StoreResult};
use crate::storage::SmartStore;

pub const SYNCS_SOUP: &str = "syncs_soup";
pub const SYNC_NAME_PATH: &str = "name";
pub const SYNC_TYPE_PATH: &str = "type";

/// Direction of a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncType {
    #[serde(rename = "syncDown")]
    Down,
    #[serde(rename = "syncUp")]
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    New,
    Stopped,
    Running,
    Done,
    Failed,
}

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Stopped | SyncStatus::Done | SyncStatus::Failed
        )
    }
}

/// What to do with records changed both locally and on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeMode {
    #[default]
    Overwrite,
    LeaveIfChanged,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    #[serde(default)]
    pub merge_mode: MergeMode,
    #[serde(rename = "fieldlist", default, skip_serializing_if = "Option::is_none")]
    pub field_list: Option<Vec<String>>,
    #[serde(rename = "createFieldlist", default, skip_serializing_if = "Option::is_none")]
    pub create_field_list: Option<Vec<String>>,
    #[serde(rename = "updateFieldlist", default, skip_serializing_if = "Option::is_none")]
    pub update_field_list: Option<Vec<String>>,
}

impl SyncOptions {
    pub fn new(merge_mode: MergeMode) -> Self {
        Self {
            merge_mode,
            ..Self::default()
        }
    }

    pub fn with_field_list(mut self, fields: Vec<String>) -> Self {
        self.field_list = Some(fields);
        self
    }

    pub fn with_create_field_list(mut self, fields: Vec<String>) -> Self {
        self.create_field_list = Some(fields);
        self
    }

    pub fn with_update_field_list(mut self, fields: Vec<String>) -> Self {
        self.update_field_list = Some(fields);
        self
    }

    /// Fields sent on create: createFieldlist, else fieldlist, else all
    pub fn fields_for_create(&self) -> &[String] {
        self.create_field_list
            .as_deref()
            .or(self.field_list.as_deref())
            .unwrap_or(&[])
    }

    pub fn fields_for_update(&self) -> &[String] {
        self.update_field_list
            .as_deref()
            .or(self.field_list.as_deref())
            .unwrap_or(&[])
    }
}

fn unsaved(id: &i64) -> bool {
    *id <= 0
}

fn unknown() -> i64 {
    -1
}

/// Persisted description and progress of one sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    #[serde(rename = "_soupEntryId", default, skip_serializing_if = "unsaved")]
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub sync_type: SyncType,
    pub target: Value,
    pub soup_name: String,
    #[serde(default)]
    pub options: SyncOptions,
    pub status: SyncStatus,
    /// Percent complete, 0 to 100
    #[serde(default)]
    pub progress: i32,
    #[serde(default = "unknown")]
    pub total_size: i64,
    #[serde(default = "unknown")]
    pub max_time_stamp: i64,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Where an interrupted sync down resumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_cursor: Option<String>,
}

impl SyncState {
    fn new(
        sync_type: SyncType,
        target: Value,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
    ) -> Self {
        Self {
            id: 0,
            name: name.map(str::to_string),
            sync_type,
            target,
            soup_name: soup_name.to_string(),
            options,
            status: SyncStatus::New,
            progress: 0,
            total_size: -1,
            max_time_stamp: -1,
            start_time: 0,
            end_time: 0,
            error: None,
            page_cursor: None,
        }
    }

    /// Register `syncs_soup` if this store has never held syncs
    pub fn setup_syncs_soup_if_needed(store: &SmartStore) -> StoreResult<()> {
        store.register_soup(
            SYNCS_SOUP,
            &[
                IndexSpec::string(SYNC_NAME_PATH),
                IndexSpec::string(SYNC_TYPE_PATH),
            ],
        )
    }

    pub fn create_sync_down(
        store: &SmartStore,
        target: Value,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
    ) -> StoreResult<Self> {
        Self::create(store, SyncType::Down, target, options, soup_name, name)
    }

    pub fn create_sync_up(
        store: &SmartStore,
        target: Value,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
    ) -> StoreResult<Self> {
        Self::create(store, SyncType::Up, target, options, soup_name, name)
    }

    fn create(
        store: &SmartStore,
        sync_type: SyncType,
        target: Value,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
    ) -> StoreResult<Self> {
        if let Some(name) = name {
            if Self::by_name(store, name)?.is_some() {
                return Err(StoreError::SyncNameTaken(name.to_string()));
            }
        }
        let mut state = Self::new(sync_type, target, options, soup_name, name);
        state.save(store)?;
        Ok(state)
    }

    pub fn to_json(&self) -> StoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: &Value) -> StoreResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Insert or update the persisted record; assigns the id on first save
    pub fn save(&mut self, store: &SmartStore) -> StoreResult<()> {
        let saved = store.upsert_entry(SYNCS_SOUP, self.to_json()?)?;
        self.id = saved
            .get(smartsql_core::SOUP_ENTRY_ID)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| StoreError::InternalError("saved sync state has no id".to_string()))?;
        Ok(())
    }

    pub fn by_id(store: &SmartStore, id: i64) -> StoreResult<Option<Self>> {
        store
            .retrieve_entries(SYNCS_SOUP, &[id])?
            .first()
            .map(Self::from_json)
            .transpose()
    }

    pub fn by_name(store: &SmartStore, name: &str) -> StoreResult<Option<Self>> {
        let spec = QuerySpec::exact(SYNCS_SOUP, SYNC_NAME_PATH, name, None, SortOrder::Ascending, 1);
        store
            .query(&spec, 0)?
            .first()
            .map(Self::from_json)
            .transpose()
    }

    /// Every persisted sync, in creation order
    pub fn all(store: &SmartStore) -> StoreResult<Vec<Self>> {
        let spec = QuerySpec::smart(
            "SELECT {syncs_soup:_soup} FROM {syncs_soup} ORDER BY {syncs_soup:_soupEntryId}",
            0,
        );
        store
            .query(&spec, 0)?
            .iter()
            .filter_map(|row| row.as_array().and_then(|cells| cells.first()))
            .map(Self::from_json)
            .collect()
    }

    pub fn delete_by_id(store: &SmartStore, id: i64) -> StoreResult<()> {
        store.remove_entries(SYNCS_SOUP, &[id])
    }

    pub fn delete_by_name(store: &SmartStore, name: &str) -> StoreResult<()> {
        match Self::by_name(store, name)? {
            Some(state) => Self::delete_by_id(store, state.id),
            None => Ok(()),
        }
    }

    pub fn is_sync_down(&self) -> bool {
        self.sync_type == SyncType::Down
    }

    pub fn is_stopped(&self) -> bool {
        self.status == SyncStatus::Stopped
    }

    pub fn is_running(&self) -> bool {
        self.status == SyncStatus::Running
    }

    pub fn is_done(&self) -> bool {
        self.status == SyncStatus::Done
    }

    pub fn has_failed(&self) -> bool {
        self.status == SyncStatus::Failed
    }

    /// Set progress from processed/total, treating an empty total as complete
    pub fn set_progress(&mut self, processed: i64, total: i64) {
        self.progress = if total <= 0 {
            100
        } else {
            ((processed.min(total) * 100) / total) as i32
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let mut state = SyncState::new(
            SyncType::Down,
            json!({"type": "soql", "query": "SELECT Id FROM Account"}),
            SyncOptions::new(MergeMode::LeaveIfChanged)
                .with_field_list(vec!["Name".to_string()]),
            "accounts",
            Some("nightly"),
        );
        state.id = 5;
        let value = state.to_json().unwrap();
        assert_eq!(
            value,
            json!({
                "_soupEntryId": 5,
                "name": "nightly",
                "type": "syncDown",
                "target": {"type": "soql", "query": "SELECT Id FROM Account"},
                "soupName": "accounts",
                "options": {"mergeMode": "LEAVE_IF_CHANGED", "fieldlist": ["Name"]},
                "status": "NEW",
                "progress": 0,
                "totalSize": -1,
                "maxTimeStamp": -1,
                "startTime": 0,
                "endTime": 0
            })
        );
        assert_eq!(SyncState::from_json(&value).unwrap(), state);
    }

    #[test]
    fn test_unsaved_state_has_no_id() {
        let state = SyncState::new(SyncType::Up, json!({}), SyncOptions::default(), "s", None);
        let value = state.to_json().unwrap();
        assert!(value.get("_soupEntryId").is_none());
        assert_eq!(value["type"], json!("syncUp"));
        assert_eq!(value["options"]["mergeMode"], json!("OVERWRITE"));
    }

    #[test]
    fn test_field_list_fallbacks() {
        let options = SyncOptions::default().with_field_list(vec!["A".to_string()]);
        assert_eq!(options.fields_for_create(), ["A".to_string()]);
        let options = options.with_update_field_list(vec!["B".to_string()]);
        assert_eq!(options.fields_for_update(), ["B".to_string()]);
        assert!(SyncOptions::default().fields_for_create().is_empty());
    }

    #[test]
    fn test_progress() {
        let mut state = SyncState::new(SyncType::Up, json!({}), SyncOptions::default(), "s", None);
        state.set_progress(1, 3);
        assert_eq!(state.progress, 33);
        state.set_progress(0, 0);
        assert_eq!(state.progress, 100);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SyncStatus::Done.is_terminal());
        assert!(SyncStatus::Failed.is_terminal());
        assert!(SyncStatus::Stopped.is_terminal());
        assert!(!SyncStatus::Running.is_terminal());
        assert!(!SyncStatus::New.is_terminal());
    }
}
