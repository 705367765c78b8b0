pub mod config;
pub mod error;
pub mod storage;
pub mod sync;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use smartsql_core::{IndexSpec, IndexType, QueryKind, QuerySpec, SortOrder};
pub use storage::{DatabaseManager, SmartStore, SoupSpec, StoreRegistry, StoreScope};
pub use sync::{MergeMode, SyncManager, SyncManagerRegistry, SyncOptions, SyncState, SyncStatus};
