use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::rest::{RestClient, RestRequest, RestResponse};
use super::target::{
    dirty_entry_ids, id_field_name_of, is_locally_created, is_locally_deleted,
    modification_date_field_name_of, parse_timestamp, record_id, UpTargetType,
    ID_FIELD_NAME_KEY, MODIFICATION_DATE_FIELD_NAME_KEY, TARGET_TYPE_KEY,
};
use crate::error::{StoreError, StoreResult};
use crate::storage::SmartStore;

/// Modification state of one record on one side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordModDate {
    pub timestamp: Option<i64>,
    pub is_deleted: bool,
}

impl RecordModDate {
    pub fn new(timestamp: Option<i64>, is_deleted: bool) -> Self {
        Self {
            timestamp,
            is_deleted,
        }
    }
}

/// Whether local changes may overwrite the server copy.
///
/// True when both timestamps are known and local is not older, when both
/// sides are deleted, or when the local timestamp is unknown.
pub fn is_newer_than(local: &RecordModDate, remote: &RecordModDate) -> bool {
    match (local.timestamp, remote.timestamp) {
        _ if local.is_deleted && remote.is_deleted => true,
        (None, _) => true,
        (Some(l), Some(r)) => l >= r,
        (Some(_), None) => false,
    }
}

/// Server answer to a create/update/delete
#[derive(Debug, Clone, PartialEq)]
pub struct UpOutcome {
    pub status: u16,
    /// Id assigned by the server on create
    pub created_id: Option<String>,
    pub body: Value,
}

impl UpOutcome {
    pub fn from_response(response: RestResponse) -> Self {
        let created_id = response
            .body
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            status: response.status,
            created_id,
            body: response.body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub fn into_error(self) -> StoreError {
        StoreError::ServerError {
            status: self.status,
            message: self.body.to_string(),
        }
    }
}

/// Where a sync up writes to
#[async_trait]
pub trait SyncUpTarget: Send + Sync {
    fn target_type(&self) -> UpTargetType;

    fn to_json(&self) -> Value;

    fn id_field_name(&self) -> &str;

    fn modification_date_field_name(&self) -> &str;

    /// `fields` empty means every non-local field
    async fn create_on_server(&self, record: &Value, fields: &[String]) -> StoreResult<UpOutcome>;

    async fn update_on_server(&self, record: &Value, fields: &[String]) -> StoreResult<UpOutcome>;

    async fn delete_on_server(&self, record: &Value) -> StoreResult<UpOutcome>;

    /// Server-side modification state of the record
    async fn fetch_last_modified_date(&self, record: &Value) -> StoreResult<RecordModDate>;

    /// Locally created records are always newer
    async fn is_newer_than_server(&self, record: &Value) -> StoreResult<bool> {
        if is_locally_created(record) {
            return Ok(true);
        }
        let local = RecordModDate::new(
            record
                .get(self.modification_date_field_name())
                .and_then(parse_timestamp),
            is_locally_deleted(record),
        );
        let remote = self.fetch_last_modified_date(record).await?;
        Ok(is_newer_than(&local, &remote))
    }

    /// Entry ids to push, in the order they are pushed
    fn ids_of_records_to_sync_up(&self, store: &SmartStore, soup_name: &str) -> StoreResult<Vec<i64>> {
        dirty_entry_ids(store, soup_name)
    }
}

/// Fields of `record` to send. Local bookkeeping, soup metadata, the id and
/// the modification date never go out.
pub fn record_fields(record: &Value, fields: &[String], id_field_name: &str, mod_field_name: &str) -> Value {
    let Some(obj) = record.as_object() else {
        return Value::Object(Map::new());
    };
    let keep = |key: &str| {
        !key.starts_with("__")
            && !key.starts_with("_soup")
            && key != "attributes"
            && key != id_field_name
            && key != mod_field_name
    };
    let out: Map<String, Value> = if fields.is_empty() {
        obj.iter()
            .filter(|(k, _)| keep(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else {
        fields
            .iter()
            .filter(|f| keep(f))
            .filter_map(|f| obj.get(f).map(|v| (f.clone(), v.clone())))
            .collect()
    };
    Value::Object(out)
}

/// Sync up through the sObject REST endpoints; the object type comes from
/// each record's `attributes.type`
pub struct RestSyncUpTarget {
    id_field_name: String,
    modification_date_field_name: String,
    rest: Arc<dyn RestClient>,
}

impl std::fmt::Debug for RestSyncUpTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestSyncUpTarget")
            .field("id_field_name", &self.id_field_name)
            .finish()
    }
}

impl RestSyncUpTarget {
    pub fn new(rest: Arc<dyn RestClient>) -> Self {
        Self::from_json(&Value::Null, rest)
    }

    pub fn from_json(target: &Value, rest: Arc<dyn RestClient>) -> Self {
        Self {
            id_field_name: id_field_name_of(target),
            modification_date_field_name: modification_date_field_name_of(target),
            rest,
        }
    }

    fn object_type(record: &Value) -> StoreResult<&str> {
        record
            .pointer("/attributes/type")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::InvalidEntry("record has no attributes.type".to_string()))
    }

    fn server_id(&self, record: &Value) -> StoreResult<String> {
        record_id(record, &self.id_field_name).ok_or_else(|| {
            StoreError::InvalidEntry(format!("record has no {}", self.id_field_name))
        })
    }
}

#[async_trait]
impl SyncUpTarget for RestSyncUpTarget {
    fn target_type(&self) -> UpTargetType {
        UpTargetType::Rest
    }

    fn to_json(&self) -> Value {
        json!({
            TARGET_TYPE_KEY: UpTargetType::Rest.as_str(),
            ID_FIELD_NAME_KEY: self.id_field_name,
            MODIFICATION_DATE_FIELD_NAME_KEY: self.modification_date_field_name,
        })
    }

    fn id_field_name(&self) -> &str {
        &self.id_field_name
    }

    fn modification_date_field_name(&self) -> &str {
        &self.modification_date_field_name
    }

    async fn create_on_server(&self, record: &Value, fields: &[String]) -> StoreResult<UpOutcome> {
        let body = record_fields(record, fields, &self.id_field_name, &self.modification_date_field_name);
        let request = RestRequest::create_record(self.rest.api_version(), Self::object_type(record)?, body);
        Ok(UpOutcome::from_response(self.rest.send(request).await?))
    }

    async fn update_on_server(&self, record: &Value, fields: &[String]) -> StoreResult<UpOutcome> {
        let body = record_fields(record, fields, &self.id_field_name, &self.modification_date_field_name);
        let request = RestRequest::update_record(
            self.rest.api_version(),
            Self::object_type(record)?,
            &self.server_id(record)?,
            body,
        );
        Ok(UpOutcome::from_response(self.rest.send(request).await?))
    }

    async fn delete_on_server(&self, record: &Value) -> StoreResult<UpOutcome> {
        let request = RestRequest::delete_record(
            self.rest.api_version(),
            Self::object_type(record)?,
            &self.server_id(record)?,
        );
        Ok(UpOutcome::from_response(self.rest.send(request).await?))
    }

    async fn fetch_last_modified_date(&self, record: &Value) -> StoreResult<RecordModDate> {
        let request = RestRequest::retrieve_record(
            self.rest.api_version(),
            Self::object_type(record)?,
            &self.server_id(record)?,
            &[self.modification_date_field_name.as_str()],
        );
        let response = self.rest.send(request).await?;
        if response.is_not_found() {
            return Ok(RecordModDate::new(None, true));
        }
        let response = response.error_for_status()?;
        Ok(RecordModDate::new(
            response
                .body
                .get(&self.modification_date_field_name)
                .and_then(parse_timestamp),
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::rest::RestMethod;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct RecordingRest {
        requests: Mutex<Vec<RestRequest>>,
        response: RestResponse,
    }

    #[async_trait]
    impl RestClient for RecordingRest {
        fn api_version(&self) -> &str {
            "v60.0"
        }

        async fn send(&self, request: RestRequest) -> StoreResult<RestResponse> {
            self.requests.lock().push(request);
            Ok(self.response.clone())
        }
    }

    fn rest(status: u16, body: Value) -> Arc<RecordingRest> {
        Arc::new(RecordingRest {
            requests: Mutex::new(Vec::new()),
            response: RestResponse::new(status, body),
        })
    }

    fn account() -> Value {
        json!({
            "attributes": {"type": "Account"},
            "Id": "001",
            "Name": "Acme",
            "Industry": "Retail",
            "LastModifiedDate": "2024-01-02T03:04:05.000Z",
            "__local__": true,
            "__locally_updated__": true,
            "_soupEntryId": 3
        })
    }

    #[test]
    fn test_is_newer_than() {
        let at = |t| RecordModDate::new(Some(t), false);
        assert!(is_newer_than(&at(10), &at(10)));
        assert!(is_newer_than(&at(11), &at(10)));
        assert!(!is_newer_than(&at(9), &at(10)));
        assert!(is_newer_than(&RecordModDate::new(None, false), &at(10)));
        assert!(is_newer_than(
            &RecordModDate::new(Some(1), true),
            &RecordModDate::new(None, true)
        ));
        assert!(!is_newer_than(&at(10), &RecordModDate::new(None, true)));
    }

    #[test]
    fn test_record_fields() {
        let all = record_fields(&account(), &[], "Id", "LastModifiedDate");
        assert_eq!(all, json!({"Name": "Acme", "Industry": "Retail"}));

        let some = record_fields(
            &account(),
            &["Name".to_string(), "Id".to_string(), "Missing".to_string()],
            "Id",
            "LastModifiedDate",
        );
        assert_eq!(some, json!({"Name": "Acme"}));
    }

    #[tokio::test]
    async fn test_create_sends_post() {
        let rest = rest(201, json!({"id": "001NEW", "success": true}));
        let target = RestSyncUpTarget::new(rest.clone());
        let outcome = target
            .create_on_server(&account(), &["Name".to_string()])
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.created_id.as_deref(), Some("001NEW"));

        let requests = rest.requests.lock();
        assert_eq!(requests[0].method, RestMethod::Post);
        assert_eq!(requests[0].path, "/services/data/v60.0/sobjects/Account");
        assert_eq!(requests[0].body, Some(json!({"Name": "Acme"})));
    }

    #[tokio::test]
    async fn test_update_and_delete_use_record_id() {
        let rest = rest(204, Value::Null);
        let target = RestSyncUpTarget::new(rest.clone());
        target.update_on_server(&account(), &[]).await.unwrap();
        target.delete_on_server(&account()).await.unwrap();

        let requests = rest.requests.lock();
        assert_eq!(requests[0].method, RestMethod::Patch);
        assert_eq!(requests[1].method, RestMethod::Delete);
        assert_eq!(requests[1].path, "/services/data/v60.0/sobjects/Account/001");
    }

    #[tokio::test]
    async fn test_missing_object_type_is_an_error() {
        let target = RestSyncUpTarget::new(rest(201, Value::Null));
        let err = target
            .create_on_server(&json!({"Name": "x"}), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidEntry(_)));
    }

    #[tokio::test]
    async fn test_is_newer_than_server() {
        let target = RestSyncUpTarget::new(rest(200, json!({"LastModifiedDate": "2024-01-03T00:00:00.000Z"})));
        assert!(!target.is_newer_than_server(&account()).await.unwrap());

        let target = RestSyncUpTarget::new(rest(404, json!([{"errorCode": "NOT_FOUND"}])));
        assert!(!target.is_newer_than_server(&account()).await.unwrap());

        let mut created = account();
        created["__locally_created__"] = json!(true);
        let target = RestSyncUpTarget::new(rest(500, Value::Null));
        assert!(target.is_newer_than_server(&created).await.unwrap());
    }
}
