//! Store configuration loaded from the environment.

use std::path::PathBuf;

/// Runtime settings for stores and the sync layer
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory holding `users/` and `global/`
    pub root_dir: PathBuf,
    /// Current user; `None` means only global stores are reachable
    pub user: Option<String>,
    /// Page size for queries built without one
    pub default_page_size: usize,
    /// Capacity of each store's smart SQL translation cache
    pub smart_sql_cache_size: usize,
    /// Instance URL for the REST sync targets
    pub api_url: Option<String>,
    pub access_token: Option<String>,
    pub api_version: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./smartstore-data"),
            user: None,
            default_page_size: smartsql_core::DEFAULT_PAGE_SIZE,
            smart_sql_cache_size: 100,
            api_url: None,
            access_token: None,
            api_version: "v60.0".to_string(),
        }
    }
}

impl StoreConfig {
    /// Load from `SMARTSTORE_*` variables, reading a `.env` file first if present
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            root_dir: get("SMARTSTORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.root_dir),
            user: get("SMARTSTORE_USER").filter(|u| !u.is_empty()),
            default_page_size: get("SMARTSTORE_PAGE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_page_size),
            smart_sql_cache_size: get("SMARTSTORE_SQL_CACHE")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.smart_sql_cache_size),
            api_url: get("SMARTSTORE_API_URL"),
            access_token: get("SMARTSTORE_ACCESS_TOKEN"),
            api_version: get("SMARTSTORE_API_VERSION").unwrap_or(defaults.api_version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::from_lookup(|_| None);
        assert_eq!(config.default_page_size, 10);
        assert_eq!(config.smart_sql_cache_size, 100);
        assert!(config.user.is_none());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SMARTSTORE_ROOT", "/tmp/stores"),
            ("SMARTSTORE_USER", "005xx"),
            ("SMARTSTORE_PAGE_SIZE", "50"),
            ("SMARTSTORE_SQL_CACHE", "0"),
        ]
        .into_iter()
        .collect();
        let config = StoreConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.root_dir, PathBuf::from("/tmp/stores"));
        assert_eq!(config.user.as_deref(), Some("005xx"));
        assert_eq!(config.default_page_size, 50);
        // zero is not a usable cache size
        assert_eq!(config.smart_sql_cache_size, 100);
    }
}
