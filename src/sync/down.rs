use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

use super::rest::{RestClient, RestRequest};
use super::target::{
    format_timestamp, id_field_name_of, modification_date_field_name_of, parse_timestamp,
    record_id, DownTargetType, ID_FIELD_NAME_KEY, MODIFICATION_DATE_FIELD_NAME_KEY,
    TARGET_TYPE_KEY,
};
use crate::error::{StoreError, StoreResult};

/// One record fetched from the server
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub record: Value,
    /// Deleted on the server; removed locally when saved
    pub is_deleted: bool,
}

impl RemoteRecord {
    pub fn new(record: Value) -> Self {
        Self {
            record,
            is_deleted: false,
        }
    }

    pub fn deleted(record: Value) -> Self {
        Self {
            record,
            is_deleted: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemotePage {
    pub records: Vec<RemoteRecord>,
    /// Total records the fetch will return, across all pages
    pub total_size: i64,
    /// Where to continue; `None` on the last page
    pub next_cursor: Option<String>,
}

/// Where a sync down reads from.
///
/// `fetch` with no cursor starts a fetch of everything modified after
/// `max_time_stamp` (all records when it is negative); passing back the
/// returned cursor continues it.
#[async_trait]
pub trait SyncDownTarget: Send + Sync {
    fn target_type(&self) -> DownTargetType;

    /// Persisted form; must rebuild an equivalent target through the registry
    fn to_json(&self) -> Value;

    fn id_field_name(&self) -> &str;

    fn modification_date_field_name(&self) -> &str;

    async fn fetch(&self, max_time_stamp: i64, cursor: Option<&str>) -> StoreResult<RemotePage>;

    /// Which of `local_ids` still exist on the server
    async fn remote_ids(&self, local_ids: &[String]) -> StoreResult<HashSet<String>>;

    /// Latest modification time in the batch, -1 when none parse
    fn latest_modification_time_stamp(&self, records: &[Value]) -> i64 {
        records
            .iter()
            .filter_map(|r| r.get(self.modification_date_field_name()))
            .filter_map(parse_timestamp)
            .max()
            .unwrap_or(-1)
    }

    /// Pages arrive oldest first, so the high-water mark can advance per page
    fn is_sorted_by_latest_modification(&self) -> bool {
        false
    }
}

static SELECT_CLAUSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^\s*select\s+.+?\s+from\s+").expect("valid select pattern"));
static WHERE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\swhere\s").expect("valid where pattern"));
static TAIL_CLAUSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s(group\s+by|order\s+by|limit|offset)\s").expect("valid clause pattern")
});

/// Sync down driven by a SOQL query
pub struct SoqlSyncDownTarget {
    query: String,
    id_field_name: String,
    modification_date_field_name: String,
    rest: Arc<dyn RestClient>,
}

impl std::fmt::Debug for SoqlSyncDownTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoqlSyncDownTarget")
            .field("query", &self.query)
            .finish()
    }
}

impl SoqlSyncDownTarget {
    pub fn new(query: &str, rest: Arc<dyn RestClient>) -> Self {
        Self {
            query: query.trim().to_string(),
            id_field_name: super::target::DEFAULT_ID_FIELD_NAME.to_string(),
            modification_date_field_name: super::target::DEFAULT_MODIFICATION_DATE_FIELD_NAME
                .to_string(),
            rest,
        }
    }

    pub fn from_json(target: &Value, rest: Arc<dyn RestClient>) -> StoreResult<Self> {
        let query = target
            .get("query")
            .and_then(Value::as_str)
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| StoreError::UnsupportedTarget("soql target without a query".to_string()))?;
        Ok(Self {
            query: query.trim().to_string(),
            id_field_name: id_field_name_of(target),
            modification_date_field_name: modification_date_field_name_of(target),
            rest,
        })
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// The query restricted to records modified after `max_time_stamp`
    pub fn query_since(&self, max_time_stamp: i64) -> String {
        if max_time_stamp <= 0 {
            return self.query.clone();
        }
        let filter = format!(
            "{} > {}",
            self.modification_date_field_name,
            format_timestamp(max_time_stamp)
        );
        insert_filter(&self.query, &filter)
    }

    /// The query selecting only ids
    pub fn ids_query(&self) -> String {
        SELECT_CLAUSE_RE
            .replace(&self.query, format!("SELECT {} FROM ", self.id_field_name).as_str())
            .into_owned()
    }

    async fn run(&self, request: RestRequest) -> StoreResult<RemotePage> {
        let response = self.rest.send(request).await?.error_for_status()?;
        let body = response.body;
        let records = body
            .get("records")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|record| {
                let deleted = record.get("IsDeleted").and_then(Value::as_bool) == Some(true);
                if deleted {
                    RemoteRecord::deleted(record)
                } else {
                    RemoteRecord::new(record)
                }
            })
            .collect();
        let next_cursor = body
            .get("nextRecordsUrl")
            .and_then(Value::as_str)
            .filter(|_| body.get("done").and_then(Value::as_bool) != Some(true))
            .map(str::to_string);
        Ok(RemotePage {
            records,
            total_size: body.get("totalSize").and_then(Value::as_i64).unwrap_or(-1),
            next_cursor,
        })
    }
}

/// Add `filter` to the WHERE clause, creating one before any trailing clause
fn insert_filter(query: &str, filter: &str) -> String {
    if let Some(m) = WHERE_RE.find(query) {
        let (head, tail) = query.split_at(m.end());
        return format!("{}{} AND {}", head, filter, tail);
    }
    match TAIL_CLAUSE_RE.find(query) {
        Some(m) => {
            let (head, tail) = query.split_at(m.start());
            format!("{} WHERE {}{}", head, filter, tail)
        }
        None => format!("{} WHERE {}", query, filter),
    }
}

#[async_trait]
impl SyncDownTarget for SoqlSyncDownTarget {
    fn target_type(&self) -> DownTargetType {
        DownTargetType::Soql
    }

    fn to_json(&self) -> Value {
        json!({
            TARGET_TYPE_KEY: DownTargetType::Soql.as_str(),
            "query": self.query,
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

    async fn fetch(&self, max_time_stamp: i64, cursor: Option<&str>) -> StoreResult<RemotePage> {
        let request = match cursor {
            Some(next_records_url) => RestRequest::get(next_records_url),
            None => RestRequest::soql_query(self.rest.api_version(), &self.query_since(max_time_stamp)),
        };
        self.run(request).await
    }

    async fn remote_ids(&self, local_ids: &[String]) -> StoreResult<HashSet<String>> {
        if local_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut ids = HashSet::new();
        let mut page = self
            .run(RestRequest::soql_query(self.rest.api_version(), &self.ids_query()))
            .await?;
        loop {
            ids.extend(
                page.records
                    .iter()
                    .filter(|r| !r.is_deleted)
                    .filter_map(|r| record_id(&r.record, &self.id_field_name)),
            );
            match page.next_cursor.take() {
                Some(cursor) => page = self.run(RestRequest::get(cursor)).await?,
                None => break,
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::rest::RestResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Answers queries from a script and records what was asked
    struct ScriptedRest {
        responses: Mutex<Vec<RestResponse>>,
        requests: Mutex<Vec<RestRequest>>,
    }

    impl ScriptedRest {
        fn new(mut responses: Vec<RestResponse>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RestClient for ScriptedRest {
        fn api_version(&self) -> &str {
            "v60.0"
        }

        async fn send(&self, request: RestRequest) -> StoreResult<RestResponse> {
            self.requests.lock().push(request);
            self.responses
                .lock()
                .pop()
                .ok_or_else(|| StoreError::NetworkError("no more responses".to_string()))
        }
    }

    #[test]
    fn test_query_since_adds_filter() {
        let rest = ScriptedRest::new(vec![]);
        let target = SoqlSyncDownTarget::new("SELECT Id, Name FROM Account", rest.clone());
        assert_eq!(target.query_since(-1), "SELECT Id, Name FROM Account");
        assert_eq!(
            target.query_since(1_704_164_645_000),
            "SELECT Id, Name FROM Account WHERE LastModifiedDate > 2024-01-02T03:04:05.000Z"
        );

        let target = SoqlSyncDownTarget::new(
            "SELECT Id FROM Contact WHERE Name != null ORDER BY Name",
            rest.clone(),
        );
        assert_eq!(
            target.query_since(1_704_164_645_000),
            "SELECT Id FROM Contact WHERE LastModifiedDate > 2024-01-02T03:04:05.000Z AND Name != null ORDER BY Name"
        );

        let target = SoqlSyncDownTarget::new("SELECT Id FROM Contact LIMIT 5", rest);
        assert_eq!(
            target.query_since(1_704_164_645_000),
            "SELECT Id FROM Contact WHERE LastModifiedDate > 2024-01-02T03:04:05.000Z LIMIT 5"
        );
    }

    #[test]
    fn test_ids_query() {
        let target = SoqlSyncDownTarget::new(
            "select Id, Name, Owner.Name from Account where Name like 'A%'",
            ScriptedRest::new(vec![]),
        );
        assert_eq!(target.ids_query(), "SELECT Id FROM Account where Name like 'A%'");
    }

    #[test]
    fn test_json_round_trip_keeps_field_names() {
        let rest = ScriptedRest::new(vec![]);
        let json = json!({
            "type": "soql",
            "query": "SELECT Id FROM Account",
            "idFieldName": "ExternalId",
            "modificationDateFieldName": "SystemModstamp"
        });
        let target = SoqlSyncDownTarget::from_json(&json, rest).unwrap();
        assert_eq!(target.id_field_name(), "ExternalId");
        assert_eq!(target.to_json(), json);
    }

    #[tokio::test]
    async fn test_fetch_follows_next_records_url() {
        let rest = ScriptedRest::new(vec![
            RestResponse::new(
                200,
                json!({
                    "totalSize": 3,
                    "done": false,
                    "nextRecordsUrl": "/services/data/v60.0/query/01g-2",
                    "records": [{"Id": "1"}, {"Id": "2"}]
                }),
            ),
            RestResponse::new(
                200,
                json!({"totalSize": 3, "done": true, "records": [{"Id": "3", "IsDeleted": true}]}),
            ),
        ]);
        let target = SoqlSyncDownTarget::new("SELECT Id FROM Account", rest.clone());

        let first = target.fetch(-1, None).await.unwrap();
        assert_eq!(first.total_size, 3);
        assert_eq!(first.records.len(), 2);
        let cursor = first.next_cursor.unwrap();

        let second = target.fetch(-1, Some(&cursor)).await.unwrap();
        assert!(second.next_cursor.is_none());
        assert!(second.records[0].is_deleted);

        let requests = rest.requests.lock();
        assert_eq!(requests[0].path, "/services/data/v60.0/query");
        assert_eq!(requests[1].path, "/services/data/v60.0/query/01g-2");
    }

    #[tokio::test]
    async fn test_fetch_server_error() {
        let rest = ScriptedRest::new(vec![RestResponse::new(
            400,
            json!([{"errorCode": "MALFORMED_QUERY"}]),
        )]);
        let target = SoqlSyncDownTarget::new("SELECT Id FROM Nope", rest);
        let err = target.fetch(-1, None).await.unwrap_err();
        assert!(matches!(err, StoreError::ServerError { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_remote_ids() {
        let rest = ScriptedRest::new(vec![RestResponse::new(
            200,
            json!({"totalSize": 2, "done": true, "records": [{"Id": "1"}, {"Id": "3"}]}),
        )]);
        let target = SoqlSyncDownTarget::new("SELECT Id, Name FROM Account", rest.clone());
        let ids = target
            .remote_ids(&["1".to_string(), "2".to_string()])
            .await
            .unwrap();
        assert_eq!(ids, HashSet::from(["1".to_string(), "3".to_string()]));
        assert_eq!(
            rest.requests.lock()[0].query[0].1,
            "SELECT Id FROM Account"
        );
    }

    #[test]
    fn test_latest_modification_time_stamp() {
        let target = SoqlSyncDownTarget::new("SELECT Id FROM Account", ScriptedRest::new(vec![]));
        let records = vec![
            json!({"LastModifiedDate": "2024-01-01T00:00:00.000Z"}),
            json!({"LastModifiedDate": "2024-01-02T03:04:05.000Z"}),
            json!({"Name": "no date"}),
        ];
        assert_eq!(target.latest_modification_time_stamp(&records), 1_704_164_645_000);
        assert_eq!(target.latest_modification_time_stamp(&[]), -1);
    }
}
