use smartsql_core::SmartSqlError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    // Schema errors
    #[error("Soup '{0}' not found")]
    SoupNotFound(String),

    #[error("Soup '{0}' already exists with different index specs")]
    SoupSpecConflict(String),

    #[error("Invalid index specs: {0}")]
    InvalidIndexSpecs(String),

    // Entry errors
    #[error("Entry {id} not found in soup '{soup}'")]
    EntryNotFound { soup: String, id: i64 },

    #[error("More than one entry in soup '{soup}' has {path} = {value}")]
    DuplicateExternalId {
        soup: String,
        path: String,
        value: String,
    },

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    // Query errors
    #[error("Query error: {0}")]
    Query(#[from] SmartSqlError),

    // Storage errors
    #[error("Store '{0}' not found")]
    StoreNotFound(String),

    #[error("Invalid store name '{0}'")]
    InvalidStoreName(String),

    #[error("Store '{0}' is closed")]
    StoreClosed(String),

    #[error("Cannot open store '{0}': wrong encryption key or not a database")]
    KeyMismatch(String),

    #[error("Encryption key provider cannot change while stores are open")]
    KeyProviderLocked,

    #[error("Long operation failed: {0}")]
    LongOperation(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    // Sync errors
    #[error("Sync manager is stopped")]
    ManagerStopped,

    #[error("Sync manager cannot restart while it is still stopping")]
    CannotRestart,

    #[error("Sync {0} is already running")]
    SyncAlreadyRunning(i64),

    #[error("Sync '{0}' does not exist")]
    SyncNotFound(String),

    #[error("A sync named '{0}' already exists")]
    SyncNameTaken(String),

    #[error("Sync {0} is not a sync down: ghosts can only be cleaned for sync downs")]
    CleanGhostsOnlyForSyncDown(i64),

    #[error("Unsupported sync target: {0}")]
    UnsupportedTarget(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl serde::Serialize for StoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::NetworkError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::InternalError(format!("background task failed: {}", err))
    }
}
