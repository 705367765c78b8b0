//! Common test utilities for store and sync tests
//!
//! Provides shared helper functions for:
//! - Creating test stores in temporary directories
//! - Seeding soups with sample entries
//! - Mock REST clients and sync targets

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use smartstore::sync::{
    DownTargetType, RecordModDate, RemotePage, RemoteRecord, RestClient, RestRequest,
    RestResponse, SyncDownTarget, SyncUpTarget, UpOutcome, UpTargetType,
};
use smartstore::{IndexSpec, SmartStore, StoreError, StoreRegistry, StoreResult};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub fn create_test_registry() -> (StoreRegistry, TempDir) {
    let tmp_dir = TempDir::new().expect("Failed to create temp dir");
    let registry = StoreRegistry::new(tmp_dir.path());
    (registry, tmp_dir)
}

pub fn create_test_store() -> (Arc<SmartStore>, StoreRegistry, TempDir) {
    let (registry, tmp) = create_test_registry();
    let store = registry
        .shared_store("test", "user1")
        .expect("Failed to open store");
    (store, registry, tmp)
}

/// `employees` soup with five entries across two departments
pub fn create_seeded_store() -> (Arc<SmartStore>, StoreRegistry, TempDir) {
    let (store, registry, tmp) = create_test_store();
    store
        .register_soup(
            "employees",
            &[
                IndexSpec::string("lastName"),
                IndexSpec::string("dept"),
                IndexSpec::integer("salary"),
                IndexSpec::floating("rating"),
                IndexSpec::full_text("bio"),
            ],
        )
        .unwrap();
    let entries = vec![
        json!({"firstName": "Ann", "lastName": "Adams", "dept": "eng", "salary": 120, "rating": 4.5, "bio": "rust compilers"}),
        json!({"firstName": "Bob", "lastName": "Baker", "dept": "eng", "salary": 100, "rating": 3.9, "bio": "databases and rust"}),
        json!({"firstName": "Cid", "lastName": "Clark", "dept": "sales", "salary": 90, "rating": 4.1, "bio": "enterprise deals"}),
        json!({"firstName": "Dee", "lastName": "Davis", "dept": "sales", "salary": 95, "rating": 2.8, "bio": "retail"}),
        json!({"firstName": "Eve", "lastName": "Evans", "dept": "eng", "salary": 130, "rating": 4.9, "bio": "security"}),
    ];
    store.upsert_entries("employees", &entries, None).unwrap();
    (store, registry, tmp)
}

/// Soup layout sync tests use: server id and the dirty flag are indexed
pub fn register_sync_soup(store: &SmartStore, soup_name: &str) {
    store
        .register_soup(
            soup_name,
            &[
                IndexSpec::string("Id"),
                IndexSpec::string("__local__"),
                IndexSpec::string("Name"),
            ],
        )
        .unwrap();
}

pub fn names(entries: &[Value], key: &str) -> Vec<String> {
    entries
        .iter()
        .filter_map(|e| e.get(key).and_then(Value::as_str).map(str::to_string))
        .collect()
}

// ==================== Mocks ====================

/// REST client for tests that never reach the network
pub struct OfflineRest;

#[async_trait]
impl RestClient for OfflineRest {
    fn api_version(&self) -> &str {
        "v60.0"
    }

    async fn send(&self, request: RestRequest) -> StoreResult<RestResponse> {
        Err(StoreError::NetworkError(format!("offline: {}", request.path)))
    }
}

/// Sync down target serving pages from an in-memory server
pub struct MockDownTarget {
    /// server id -> record
    pub server: Mutex<HashMap<String, Value>>,
    pub page_size: usize,
    pub deleted: Mutex<Vec<String>>,
    pub fetches: AtomicUsize,
    /// Fail the fetch with this index (0-based)
    pub fail_on_fetch: Mutex<Option<usize>>,
    /// Called before every page is returned
    pub on_fetch: Mutex<Option<Box<dyn Fn(usize) + Send + Sync>>>,
}

impl MockDownTarget {
    pub fn new(records: Vec<Value>, page_size: usize) -> Arc<Self> {
        let server = records
            .into_iter()
            .map(|r| (r["Id"].as_str().unwrap_or_default().to_string(), r))
            .collect();
        Arc::new(Self {
            server: Mutex::new(server),
            page_size,
            deleted: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            fail_on_fetch: Mutex::new(None),
            on_fetch: Mutex::new(None),
        })
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn sorted_since(&self, max_time_stamp: i64) -> Vec<Value> {
        let mut records: Vec<Value> = self
            .server
            .lock()
            .values()
            .filter(|r| r["LastModifiedDate"].as_i64().unwrap_or(0) > max_time_stamp)
            .cloned()
            .collect();
        records.sort_by_key(|r| r["Id"].as_str().unwrap_or_default().to_string());
        records
    }
}

#[async_trait]
impl SyncDownTarget for MockDownTarget {
    fn target_type(&self) -> DownTargetType {
        DownTargetType::Custom
    }

    fn to_json(&self) -> Value {
        json!({"type": "custom", "iOSImpl": "MockDownTarget"})
    }

    fn id_field_name(&self) -> &str {
        "Id"
    }

    fn modification_date_field_name(&self) -> &str {
        "LastModifiedDate"
    }

    async fn fetch(&self, max_time_stamp: i64, cursor: Option<&str>) -> StoreResult<RemotePage> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        if *self.fail_on_fetch.lock() == Some(n) {
            return Err(StoreError::NetworkError("connection reset".to_string()));
        }
        if let Some(hook) = self.on_fetch.lock().as_ref() {
            hook(n);
        }
        tokio::task::yield_now().await;

        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let records = self.sorted_since(max_time_stamp);
        let total = records.len() as i64;
        let page: Vec<RemoteRecord> = records
            .into_iter()
            .skip(offset)
            .take(self.page_size)
            .map(RemoteRecord::new)
            .collect();
        let next = offset + page.len();
        let mut page = RemotePage {
            next_cursor: (next < total as usize).then(|| next.to_string()),
            records: page,
            total_size: total,
        };
        if page.next_cursor.is_none() {
            let deleted = std::mem::take(&mut *self.deleted.lock());
            page.records
                .extend(deleted.into_iter().map(|id| RemoteRecord::deleted(json!({"Id": id}))));
        }
        Ok(page)
    }

    async fn remote_ids(&self, local_ids: &[String]) -> StoreResult<HashSet<String>> {
        let server = self.server.lock();
        Ok(local_ids
            .iter()
            .filter(|id| server.contains_key(*id))
            .cloned()
            .collect())
    }

    fn latest_modification_time_stamp(&self, records: &[Value]) -> i64 {
        records
            .iter()
            .filter_map(|r| r["LastModifiedDate"].as_i64())
            .max()
            .unwrap_or(-1)
    }
}

/// Sync up target recording calls against an in-memory server
pub struct MockUpTarget {
    pub server: Mutex<HashMap<String, Value>>,
    /// Server modification times, compared with local ones
    pub server_mod_dates: Mutex<HashMap<String, i64>>,
    pub calls: Mutex<Vec<String>>,
    /// Server ids whose writes fail with a 500
    pub failing_ids: Mutex<HashSet<String>>,
    next_id: AtomicUsize,
}

impl MockUpTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            server: Mutex::new(HashMap::new()),
            server_mod_dates: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failing_ids: Mutex::new(HashSet::new()),
            next_id: AtomicUsize::new(1),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn id_of(record: &Value) -> String {
        record["Id"].as_str().unwrap_or_default().to_string()
    }

    fn failure(&self, id: &str) -> Option<UpOutcome> {
        self.failing_ids.lock().contains(id).then(|| UpOutcome {
            status: 500,
            created_id: None,
            body: json!([{"errorCode": "UNKNOWN_EXCEPTION"}]),
        })
    }
}

fn outcome(status: u16, created_id: Option<String>) -> UpOutcome {
    UpOutcome {
        status,
        created_id,
        body: Value::Null,
    }
}

#[async_trait]
impl SyncUpTarget for MockUpTarget {
    fn target_type(&self) -> UpTargetType {
        UpTargetType::Custom
    }

    fn to_json(&self) -> Value {
        json!({"type": "custom", "iOSImpl": "MockUpTarget"})
    }

    fn id_field_name(&self) -> &str {
        "Id"
    }

    fn modification_date_field_name(&self) -> &str {
        "LastModifiedDate"
    }

    async fn create_on_server(&self, record: &Value, _fields: &[String]) -> StoreResult<UpOutcome> {
        let name = record["Name"].as_str().unwrap_or_default().to_string();
        self.calls.lock().push(format!("create {}", name));
        if let Some(failed) = self.failure(&name) {
            return Ok(failed);
        }
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.server.lock().insert(id.clone(), record.clone());
        Ok(outcome(201, Some(id)))
    }

    async fn update_on_server(&self, record: &Value, _fields: &[String]) -> StoreResult<UpOutcome> {
        let id = Self::id_of(record);
        self.calls.lock().push(format!("update {}", id));
        if let Some(failed) = self.failure(&id) {
            return Ok(failed);
        }
        let mut server = self.server.lock();
        if !server.contains_key(&id) {
            return Ok(outcome(404, None));
        }
        server.insert(id, record.clone());
        Ok(outcome(204, None))
    }

    async fn delete_on_server(&self, record: &Value) -> StoreResult<UpOutcome> {
        let id = Self::id_of(record);
        self.calls.lock().push(format!("delete {}", id));
        if let Some(failed) = self.failure(&id) {
            return Ok(failed);
        }
        match self.server.lock().remove(&id) {
            Some(_) => Ok(outcome(204, None)),
            None => Ok(outcome(404, None)),
        }
    }

    async fn fetch_last_modified_date(&self, record: &Value) -> StoreResult<RecordModDate> {
        let id = Self::id_of(record);
        if !self.server.lock().contains_key(&id) {
            return Ok(RecordModDate::new(None, true));
        }
        Ok(RecordModDate::new(
            self.server_mod_dates.lock().get(&id).copied(),
            false,
        ))
    }
}
