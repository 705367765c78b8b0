//! Soup-level attributes that are not index specs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Feature name for soups whose entries live in files beside the database
pub const FEATURE_EXTERNAL_STORAGE: &str = "externalStorage";

/// A soup name plus its storage features
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoupSpec {
    #[serde(rename = "soupName")]
    pub name: String,
    #[serde(default)]
    pub features: Vec<String>,
}

impl SoupSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: Vec::new(),
        }
    }

    pub fn with_external_storage(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: vec![FEATURE_EXTERNAL_STORAGE.to_string()],
        }
    }

    pub fn uses_external_storage(&self) -> bool {
        self.features.iter().any(|f| f == FEATURE_EXTERNAL_STORAGE)
    }

    pub fn to_json(&self) -> Value {
        json!({ "soupName": self.name, "features": self.features })
    }
}
