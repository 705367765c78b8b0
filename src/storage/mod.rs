pub mod cipher;
pub mod database;
pub mod engine;
pub mod long_operation;
pub mod soup_spec;
pub mod store;

pub use cipher::EntryCipher;
pub use database::{DatabaseManager, StoreScope};
pub use engine::{EncryptionKeyProvider, StoreRegistry};
pub use long_operation::{AlterSoupStep, LONG_OPERATIONS_STATUS_TABLE};
pub use soup_spec::{SoupSpec, FEATURE_EXTERNAL_STORAGE};
pub use store::{SmartStore, SOUP_ATTRS_TABLE, SOUP_INDEX_MAP_TABLE};
