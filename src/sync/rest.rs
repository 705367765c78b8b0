//! REST plumbing for sync targets.
//!
//! Targets build [`RestRequest`]s and hand them to a [`RestClient`]; the
//! default client speaks HTTP through reqwest, tests plug in their own.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl RestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestMethod::Get => "GET",
            RestMethod::Post => "POST",
            RestMethod::Patch => "PATCH",
            RestMethod::Delete => "DELETE",
        }
    }
}

/// A request relative to the instance URL
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: RestMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RestRequest {
    fn new(method: RestMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(RestMethod::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            body: Some(body),
            ..Self::new(RestMethod::Post, path)
        }
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self {
            body: Some(body),
            ..Self::new(RestMethod::Patch, path)
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(RestMethod::Delete, path)
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    // ==================== Data API requests ====================

    pub fn soql_query(api_version: &str, soql: &str) -> Self {
        Self::get(format!("/services/data/{}/query", api_version)).with_query("q", soql)
    }

    pub fn create_record(api_version: &str, object_type: &str, fields: Value) -> Self {
        Self::post(
            format!("/services/data/{}/sobjects/{}", api_version, object_type),
            fields,
        )
    }

    pub fn update_record(api_version: &str, object_type: &str, id: &str, fields: Value) -> Self {
        Self::patch(
            format!("/services/data/{}/sobjects/{}/{}", api_version, object_type, id),
            fields,
        )
    }

    pub fn delete_record(api_version: &str, object_type: &str, id: &str) -> Self {
        Self::delete(format!(
            "/services/data/{}/sobjects/{}/{}",
            api_version, object_type, id
        ))
    }

    pub fn retrieve_record(api_version: &str, object_type: &str, id: &str, fields: &[&str]) -> Self {
        Self::get(format!(
            "/services/data/{}/sobjects/{}/{}",
            api_version, object_type, id
        ))
        .with_query("fields", fields.join(","))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestResponse {
    pub status: u16,
    pub body: Value,
}

impl RestResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// Turn a non-2xx response into a `ServerError`
    pub fn error_for_status(self) -> StoreResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(StoreError::ServerError {
                status: self.status,
                message: self.body.to_string(),
            })
        }
    }
}

#[async_trait]
pub trait RestClient: Send + Sync {
    fn api_version(&self) -> &str;

    /// Transport failures are errors; any HTTP status is a response
    async fn send(&self, request: RestRequest) -> StoreResult<RestResponse>;
}

/// Bearer-token client over reqwest
pub struct HttpRestClient {
    base_url: String,
    access_token: String,
    api_version: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRestClient")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl HttpRestClient {
    pub fn new(base_url: &str, access_token: &str, api_version: &str) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            api_version: api_version.to_string(),
            client,
        })
    }

    /// `None` when the configuration has no API URL or token
    pub fn from_config(config: &StoreConfig) -> StoreResult<Option<Self>> {
        match (&config.api_url, &config.access_token) {
            (Some(url), Some(token)) => Ok(Some(Self::new(url, token, &config.api_version)?)),
            _ => Ok(None),
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    fn api_version(&self) -> &str {
        &self.api_version
    }

    async fn send(&self, request: RestRequest) -> StoreResult<RestResponse> {
        let url = self.url_for(&request.path);
        debug!("{} {}", request.method.as_str(), url);

        let mut builder = match request.method {
            RestMethod::Get => self.client.get(&url),
            RestMethod::Post => self.client.post(&url),
            RestMethod::Patch => self.client.patch(&url),
            RestMethod::Delete => self.client.delete(&url),
        }
        .bearer_auth(&self.access_token);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(RestResponse { status, body })
    }
}
