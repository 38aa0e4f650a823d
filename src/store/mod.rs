//! Data-store boundary.
//!
//! The backup engine and the notification handlers only ever talk to the
//! [`DocumentStore`] trait: collection enumeration, full dumps, unordered
//! bulk inserts, index recreation, and a typed user-cohort query. The
//! in-memory implementation backs tests and store-less deployments.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Collections with this prefix are internal to the store and excluded
/// from backups.
pub const SYSTEM_COLLECTION_PREFIX: &str = "system.";

/// Size and index statistics for a collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    /// Document count
    pub count: u64,
    /// Logical data size in bytes
    pub size: u64,
    /// Average object size in bytes
    pub avg_obj_size: u64,
    /// On-disk storage size in bytes
    pub storage_size: u64,
    /// Number of indexes
    pub index_count: u64,
}

/// An index definition, as captured at backup time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    /// Index name; `_id_` is the default index and is never recreated
    pub name: String,
    /// Indexed keys and directions
    pub keys: Value,
    /// Whether the index enforces uniqueness
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    /// Check whether this is the default primary-key index.
    pub fn is_default(&self) -> bool {
        self.name == "_id_"
    }
}

/// A full dump of one collection: documents, stats and index definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDump {
    /// Number of documents captured
    pub document_count: u64,
    /// All documents in the collection
    pub documents: Vec<Value>,
    /// Collection statistics at dump time
    pub stats: CollectionStats,
    /// Index definitions at dump time
    pub indexes: Vec<IndexSpec>,
}

/// Filter criteria for selecting a user cohort.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserFilter {
    /// Match a single address exactly
    pub email: Option<String>,
    /// Only users who logged in within the last N days
    pub last_login_within_days: Option<i64>,
    /// Additional equality matches against raw document fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The minimal user shape the notification handlers need.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserRecord {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub active: bool,
    pub email_verified: bool,
    pub deleted: bool,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl Default for UserRecord {
    fn default() -> Self {
        Self {
            email: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            active: true,
            email_verified: true,
            deleted: false,
            last_login_at: None,
        }
    }
}

/// Abstraction over the document database backing the service.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Check whether the store connection is live.
    async fn is_connected(&self) -> bool;

    /// The name of the backing database.
    fn database_name(&self) -> &str;

    /// Enumerate all collection names, system collections included.
    async fn collection_names(&self) -> Result<Vec<String>>;

    /// Dump an entire collection: documents, stats and indexes.
    async fn dump_collection(&self, name: &str) -> Result<CollectionDump>;

    /// Count documents in a collection.
    async fn count_documents(&self, name: &str) -> Result<u64>;

    /// Insert documents with unordered semantics: one bad document does not
    /// stop the rest. Returns the number actually inserted.
    async fn insert_many(&self, name: &str, docs: &[Value]) -> Result<u64>;

    /// Drop a collection. Returns false if it did not exist; absence is not
    /// an error.
    async fn drop_collection(&self, name: &str) -> Result<bool>;

    /// Create the given indexes on a collection.
    async fn create_indexes(&self, name: &str, indexes: &[IndexSpec]) -> Result<()>;

    /// Select the user cohort matching a filter. Inactive, deleted and
    /// unverified users are always excluded.
    async fn find_users(&self, filter: &UserFilter) -> Result<Vec<UserRecord>>;

    /// Count the cohort a filter would match, without materializing it.
    async fn count_users(&self, filter: &UserFilter) -> Result<u64> {
        Ok(self.find_users(filter).await?.len() as u64)
    }
}
