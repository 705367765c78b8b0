//! Record synchronization between a soup and a remote API
//!
//! This module provides:
//! - Sync down: fetch server records into a soup, incrementally and resumably
//! - Sync up: push locally created, updated and deleted records
//! - Persisted sync state in the store's `syncs_soup`
//! - A per-store manager that runs syncs as background tasks
//!
//! Records carry local change flags (`__local__`, `__locally_created__`,
//! `__locally_updated__`, `__locally_deleted__`). Soups used by syncs must
//! index `__local__` and the target's id field.

pub mod down;
pub mod manager;
pub mod rest;
pub mod state;
pub mod target;
pub mod up;
pub mod worker;

pub use down::{RemotePage, RemoteRecord, SoqlSyncDownTarget, SyncDownTarget};
pub use manager::{ManagerState, SyncManager, SyncManagerRegistry, SyncRun};
pub use rest::{HttpRestClient, RestClient, RestMethod, RestRequest, RestResponse};
pub use state::{MergeMode, SyncOptions, SyncState, SyncStatus, SyncType, SYNCS_SOUP};
pub use target::{DownTargetFactory, DownTargetType, TargetRegistry, UpTargetFactory, UpTargetType};
pub use up::{is_newer_than, RecordModDate, RestSyncUpTarget, SyncUpTarget, UpOutcome};
