use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::database::{DatabaseManager, StoreScope};
use super::store::SmartStore;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

/// Supplies the key every store is opened with; `None` means unencrypted
pub type EncryptionKeyProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Registry of open stores, keyed by scope and store name.
///
/// Owned by the application; stores are opened lazily on first fetch and stay
/// cached until removed.
pub struct StoreRegistry {
    root: PathBuf,
    sql_cache_size: usize,
    key_provider: RwLock<Option<EncryptionKeyProvider>>,
    stores: RwLock<HashMap<(StoreScope, String), Arc<SmartStore>>>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("root", &self.root)
            .field("open_stores", &self.stores.read().len())
            .finish()
    }
}

impl StoreRegistry {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            sql_cache_size: StoreConfig::default().smart_sql_cache_size,
            key_provider: RwLock::new(None),
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        let mut registry = Self::new(&config.root_dir);
        registry.sql_cache_size = config.smart_sql_cache_size;
        registry
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Install the key provider. Changing keys under existing stores makes
    /// them unreadable, so this is refused while any store is open.
    pub fn set_encryption_key_provider(&self, provider: EncryptionKeyProvider) -> StoreResult<()> {
        if !self.stores.read().is_empty() {
            return Err(StoreError::KeyProviderLocked);
        }
        *self.key_provider.write() = Some(provider);
        Ok(())
    }

    fn current_key(&self) -> Option<String> {
        self.key_provider
            .read()
            .as_ref()
            .and_then(|provider| provider())
            .filter(|k| !k.is_empty())
    }

    pub fn database_manager(&self, scope: StoreScope) -> DatabaseManager {
        DatabaseManager::new(&self.root, scope)
    }

    /// The user's store with this name, opening it on first use
    pub fn shared_store(&self, store_name: &str, user: &str) -> StoreResult<Arc<SmartStore>> {
        self.store(StoreScope::User(user.to_string()), store_name)
    }

    pub fn global_store(&self, store_name: &str) -> StoreResult<Arc<SmartStore>> {
        self.store(StoreScope::Global, store_name)
    }

    pub fn store(&self, scope: StoreScope, store_name: &str) -> StoreResult<Arc<SmartStore>> {
        let key = (scope.clone(), store_name.to_string());
        if let Some(store) = self.stores.read().get(&key) {
            return Ok(store.clone());
        }

        let mut stores = self.stores.write();
        if let Some(store) = stores.get(&key) {
            return Ok(store.clone());
        }
        let manager = self.database_manager(scope);
        let store = Arc::new(SmartStore::open(
            &manager,
            store_name,
            self.current_key().as_deref(),
            self.sql_cache_size,
        )?);
        stores.insert(key, store.clone());
        Ok(store)
    }

    /// Cached store, without opening
    pub fn get(&self, scope: &StoreScope, store_name: &str) -> Option<Arc<SmartStore>> {
        self.stores
            .read()
            .get(&(scope.clone(), store_name.to_string()))
            .cloned()
    }

    /// Close the store, drop it from the registry and delete its files.
    /// Handles obtained earlier fail with `StoreClosed` afterwards.
    pub fn remove_shared_store(&self, scope: &StoreScope, store_name: &str) -> StoreResult<()> {
        if let Some(store) = self
            .stores
            .write()
            .remove(&(scope.clone(), store_name.to_string()))
        {
            store.close();
        }
        self.database_manager(scope.clone())
            .remove_store_dir(store_name)?;
        info!("Removed store '{}' ({})", store_name, scope);
        Ok(())
    }

    /// Remove every store of the scope, open or not
    pub fn remove_all_stores(&self, scope: &StoreScope) -> StoreResult<()> {
        let mut names = self.all_store_names(scope)?;
        for (cached_scope, name) in self.stores.read().keys() {
            if cached_scope == scope && !names.contains(name) {
                names.push(name.clone());
            }
        }
        for name in names {
            self.remove_shared_store(scope, &name)?;
        }
        Ok(())
    }

    pub fn all_store_names(&self, scope: &StoreScope) -> StoreResult<Vec<String>> {
        self.database_manager(scope.clone()).all_store_names()
    }

    /// Close every open store and empty the registry, leaving files in place
    pub fn close_all(&self) {
        let stores: Vec<Arc<SmartStore>> = self.stores.write().drain().map(|(_, s)| s).collect();
        for store in stores {
            store.close();
        }
    }

    pub fn open_store_count(&self) -> usize {
        self.stores.read().len()
    }
}
