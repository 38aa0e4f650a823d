//! In-memory document store.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ForgeError, Result};

use super::{
    CollectionDump, CollectionStats, DocumentStore, IndexSpec, UserFilter, UserRecord,
};

#[derive(Debug, Default, Clone)]
struct MemoryCollection {
    documents: Vec<Value>,
    indexes: Vec<IndexSpec>,
}

/// A [`DocumentStore`] backed by process memory.
pub struct MemoryStore {
    database_name: String,
    collections: RwLock<BTreeMap<String, MemoryCollection>>,
    connected: AtomicBool,
}

impl MemoryStore {
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            collections: RwLock::new(BTreeMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Toggle the simulated connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Replace the contents of a collection.
    pub fn put_collection(&self, name: impl Into<String>, documents: Vec<Value>) {
        self.collections.write().insert(
            name.into(),
            MemoryCollection {
                documents,
                indexes: vec![IndexSpec {
                    name: "_id_".to_string(),
                    keys: serde_json::json!({ "_id": 1 }),
                    unique: true,
                }],
            },
        );
    }

    /// Define indexes on a collection, creating the collection if absent.
    pub fn put_indexes(&self, name: &str, indexes: Vec<IndexSpec>) {
        let mut collections = self.collections.write();
        let collection = collections.entry(name.to_string()).or_default();
        collection.indexes = indexes;
    }

    fn guard_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ForgeError::store_unavailable())
        }
    }

    fn doc_id(doc: &Value) -> Option<&Value> {
        doc.get("_id")
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn database_name(&self) -> &str {
        &self.database_name
    }

    async fn collection_names(&self) -> Result<Vec<String>> {
        self.guard_connected()?;
        Ok(self.collections.read().keys().cloned().collect())
    }

    async fn dump_collection(&self, name: &str) -> Result<CollectionDump> {
        self.guard_connected()?;
        let collections = self.collections.read();
        let collection = collections
            .get(name)
            .ok_or_else(|| ForgeError::internal(format!("no such collection: {}", name)))?;

        let size: u64 = collection
            .documents
            .iter()
            .map(|d| d.to_string().len() as u64)
            .sum();
        let count = collection.documents.len() as u64;

        Ok(CollectionDump {
            document_count: count,
            documents: collection.documents.clone(),
            stats: CollectionStats {
                count,
                size,
                avg_obj_size: if count > 0 { size / count } else { 0 },
                storage_size: size,
                index_count: collection.indexes.len() as u64,
            },
            indexes: collection.indexes.clone(),
        })
    }

    async fn count_documents(&self, name: &str) -> Result<u64> {
        self.guard_connected()?;
        Ok(self
            .collections
            .read()
            .get(name)
            .map(|c| c.documents.len() as u64)
            .unwrap_or(0))
    }

    async fn insert_many(&self, name: &str, docs: &[Value]) -> Result<u64> {
        self.guard_connected()?;
        let mut collections = self.collections.write();
        let collection = collections.entry(name.to_string()).or_default();

        let mut inserted = 0u64;
        for doc in docs {
            // Unordered semantics: a duplicate _id is skipped, the rest
            // continue.
            let duplicate = match Self::doc_id(doc) {
                Some(id) => collection
                    .documents
                    .iter()
                    .any(|existing| Self::doc_id(existing) == Some(id)),
                None => false,
            };
            if duplicate {
                continue;
            }
            collection.documents.push(doc.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn drop_collection(&self, name: &str) -> Result<bool> {
        self.guard_connected()?;
        Ok(self.collections.write().remove(name).is_some())
    }

    async fn create_indexes(&self, name: &str, indexes: &[IndexSpec]) -> Result<()> {
        self.guard_connected()?;
        let mut collections = self.collections.write();
        let collection = collections.entry(name.to_string()).or_default();
        for index in indexes {
            if !collection.indexes.iter().any(|i| i.name == index.name) {
                collection.indexes.push(index.clone());
            }
        }
        Ok(())
    }

    async fn find_users(&self, filter: &UserFilter) -> Result<Vec<UserRecord>> {
        self.guard_connected()?;
        let collections = self.collections.read();
        let Some(collection) = collections.get("users") else {
            return Ok(Vec::new());
        };

        let cutoff = filter
            .last_login_within_days
            .map(|days| Utc::now() - Duration::days(days));

        let mut users = Vec::new();
        for doc in &collection.documents {
            let Ok(user) = serde_json::from_value::<UserRecord>(doc.clone()) else {
                continue;
            };
            if !user.active || user.deleted || !user.email_verified {
                continue;
            }
            if let Some(ref email) = filter.email {
                if &user.email != email {
                    continue;
                }
            }
            if let Some(cutoff) = cutoff {
                match user.last_login_at {
                    Some(at) if at >= cutoff => {}
                    _ => continue,
                }
            }
            if !filter
                .extra
                .iter()
                .all(|(key, value)| doc.get(key) == Some(value))
            {
                continue;
            }
            users.push(user);
        }
        Ok(users)
    }
}
