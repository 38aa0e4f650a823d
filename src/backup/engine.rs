//! Full-database backup and restore.
//!
//! One artifact per backup, written atomically via a temp file rename.
//! Collection-level failures are tolerated in both directions: a backup
//! records what it could not dump, a restore reports what it could not
//! load, and neither aborts the rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::config::BackupConfig;
use crate::error::{ForgeError, Result};
use crate::store::{DocumentStore, SYSTEM_COLLECTION_PREFIX};

use super::artifact::{
    format_size, ArtifactEntry, ArtifactMetadata, BackupArtifact, CollectionEntry,
    FailedCollection, ARTIFACT_EXTENSION,
};

/// Documents are restored in chunks this large.
const RESTORE_BATCH_SIZE: usize = 1000;

fn default_cleanup() -> bool {
    true
}

/// Options accepted when creating a backup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupOptions {
    /// Artifact name; generated from the timestamp when omitted
    pub backup_name: Option<String>,
    /// Limit the backup to these collections
    pub collections: Option<Vec<String>>,
    /// Run retention cleanup after the backup
    #[serde(default = "default_cleanup")]
    pub cleanup: bool,
    /// Accepted and echoed into metadata; compression is not applied
    pub compress: Option<bool>,
    pub gzip: Option<bool>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            backup_name: None,
            collections: None,
            cleanup: default_cleanup(),
            compress: None,
            gzip: None,
        }
    }
}

/// Options accepted when restoring.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreOptions {
    /// Limit the restore to these collections
    pub collections: Option<Vec<String>>,
    /// Drop each collection before reloading it; off by default, so a
    /// restore merges into what is already there
    pub drop: bool,
    /// Accepted for parity with backup options; artifacts are plain JSON
    pub gzip: Option<bool>,
}

/// Outcome of one backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupReport {
    pub backup_name: String,
    pub path: String,
    pub size_bytes: u64,
    pub size_formatted: String,
    pub duration_ms: u64,
    pub collections_backed_up: Vec<String>,
    pub collections_failed: Vec<String>,
    pub total_documents: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupReport>,
}

/// Outcome of a retention cleanup pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub retention_days: i64,
}

/// One collection that failed during restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of one restore run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub backup_name: String,
    pub collections_restored: Vec<String>,
    pub collections_failed: Vec<RestoreFailure>,
    pub total_documents_restored: u64,
    pub duration_ms: u64,
}

/// Aggregate view of the backup directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub in_progress: bool,
    pub total_backups: u64,
    pub total_size_bytes: u64,
    pub total_size_formatted: String,
    pub last_backup: Option<ArtifactEntry>,
    pub directory: String,
    pub retention_days: i64,
}

/// Snapshot and restore engine over a [`DocumentStore`].
pub struct BackupEngine {
    store: Arc<dyn DocumentStore>,
    dir: PathBuf,
    retention_days: i64,
    // Single-flight: at most one backup at a time.
    lock: Mutex<()>,
}

impl BackupEngine {
    pub fn new(store: Arc<dyn DocumentStore>, config: &BackupConfig) -> Self {
        Self {
            store,
            dir: PathBuf::from(&config.dir),
            retention_days: config.retention_days,
            lock: Mutex::new(()),
        }
    }

    /// Whether a backup is currently running.
    pub fn in_progress(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Create a backup artifact. A concurrent create is rejected, not
    /// queued.
    pub async fn create(&self, options: BackupOptions) -> Result<BackupReport> {
        let _guard = self
            .lock
            .try_lock()
            .map_err(|_| ForgeError::backup_in_progress())?;
        let started = Instant::now();

        tokio::fs::create_dir_all(&self.dir).await?;

        let name = match options.backup_name {
            Some(name) => normalize_name(&name)?,
            None => default_backup_name(Utc::now()),
        };

        if !self.store.is_connected().await {
            return Err(ForgeError::store_unavailable());
        }

        let mut names: Vec<String> = self
            .store
            .collection_names()
            .await?
            .into_iter()
            .filter(|n| !n.starts_with(SYSTEM_COLLECTION_PREFIX))
            .collect();
        if let Some(requested) = &options.collections {
            names.retain(|n| requested.contains(n));
        }

        let mut collections = std::collections::BTreeMap::new();
        let mut backed_up = Vec::new();
        let mut failed = Vec::new();
        let mut total_documents = 0u64;

        for collection in &names {
            match self.store.dump_collection(collection).await {
                Ok(dump) => {
                    total_documents += dump.document_count;
                    tracing::info!(
                        collection = %collection,
                        documents = dump.document_count,
                        "Collection backed up"
                    );
                    backed_up.push(collection.clone());
                    collections.insert(collection.clone(), CollectionEntry::Data(dump));
                }
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "Collection backup failed");
                    failed.push(collection.clone());
                    collections.insert(
                        collection.clone(),
                        CollectionEntry::Failed(FailedCollection {
                            error: e.user_message().to_string(),
                            document_count: 0,
                        }),
                    );
                }
            }
        }

        // The recorded size covers the collection data; the file itself is
        // marginally larger once metadata is included.
        let data_bytes = serde_json::to_vec(&collections)?.len() as u64;
        let artifact = BackupArtifact {
            metadata: ArtifactMetadata {
                backup_name: name.clone(),
                timestamp: Utc::now(),
                database: self.store.database_name().to_string(),
                collection_count: names.len() as u64,
                total_documents,
                total_size_bytes: data_bytes,
                total_size_formatted: format_size(data_bytes),
                compress: options.compress,
                gzip: options.gzip,
            },
            collections,
        };

        let path = self.dir.join(&name);
        let size_bytes = write_artifact(&path, &artifact).await?;

        let cleanup = if options.cleanup {
            match self.cleanup_expired().await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::warn!(error = %e, "Retention cleanup failed");
                    None
                }
            }
        } else {
            None
        };

        let report = BackupReport {
            backup_name: name,
            path: path.display().to_string(),
            size_bytes,
            size_formatted: format_size(size_bytes),
            duration_ms: started.elapsed().as_millis() as u64,
            collections_backed_up: backed_up,
            collections_failed: failed,
            total_documents,
            cleanup,
        };
        tracing::info!(
            backup = %report.backup_name,
            size = %report.size_formatted,
            documents = report.total_documents,
            failed = report.collections_failed.len(),
            "Backup complete"
        );
        Ok(report)
    }

    /// Restore collections from an artifact. Documents merge into the
    /// existing collections unless `drop` is set; indexes other than the
    /// default are recreated on a best-effort basis.
    pub async fn restore(&self, name: &str, options: RestoreOptions) -> Result<RestoreReport> {
        let name = normalize_name(name)?;
        let started = Instant::now();
        let path = self.dir.join(&name);

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ForgeError::artifact_not_found(&name))
            }
            Err(e) => return Err(e.into()),
        };
        let artifact: BackupArtifact = serde_json::from_str(&raw)
            .map_err(|e| ForgeError::invalid_artifact(format!("{}: {}", name, e)))?;

        if !self.store.is_connected().await {
            return Err(ForgeError::store_unavailable());
        }

        let mut restored = Vec::new();
        let mut failed = Vec::new();
        let mut total_documents = 0u64;

        for (collection, entry) in &artifact.collections {
            if let Some(requested) = &options.collections {
                if !requested.contains(collection) {
                    continue;
                }
            }

            let dump = match entry {
                CollectionEntry::Data(dump) => dump,
                CollectionEntry::Failed(failure) => {
                    failed.push(RestoreFailure {
                        name: collection.clone(),
                        error: format!("not captured in backup: {}", failure.error),
                    });
                    continue;
                }
            };

            match self.restore_collection(collection, dump, options.drop).await {
                Ok(count) => {
                    total_documents += count;
                    restored.push(collection.clone());
                    tracing::info!(collection = %collection, documents = count, "Collection restored");
                }
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "Collection restore failed");
                    failed.push(RestoreFailure {
                        name: collection.clone(),
                        error: e.user_message().to_string(),
                    });
                }
            }
        }

        let report = RestoreReport {
            backup_name: name,
            collections_restored: restored,
            collections_failed: failed,
            total_documents_restored: total_documents,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            backup = %report.backup_name,
            restored = report.collections_restored.len(),
            failed = report.collections_failed.len(),
            documents = report.total_documents_restored,
            "Restore complete"
        );
        Ok(report)
    }

    async fn restore_collection(
        &self,
        name: &str,
        dump: &crate::store::CollectionDump,
        drop: bool,
    ) -> Result<u64> {
        if drop {
            self.store.drop_collection(name).await?;
        }

        let mut inserted = 0u64;
        for batch in dump.documents.chunks(RESTORE_BATCH_SIZE) {
            inserted += self.store.insert_many(name, batch).await?;
        }

        let indexes: Vec<_> = dump
            .indexes
            .iter()
            .filter(|i| !i.is_default())
            .cloned()
            .collect();
        // Index recreation never fails the restore; the documents are
        // already in place.
        if !indexes.is_empty() {
            if let Err(e) = self.store.create_indexes(name, &indexes).await {
                tracing::warn!(collection = %name, error = %e, "Index recreation failed");
            }
        }
        Ok(inserted)
    }

    /// All artifacts in the backup directory, newest first.
    pub async fn list(&self) -> Result<Vec<ArtifactEntry>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let metadata = entry.metadata().await?;
            let created_at: DateTime<Utc> = metadata
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH)
                .into();
            entries.push(ArtifactEntry {
                name: name.to_string(),
                size_bytes: metadata.len(),
                size_formatted: format_size(metadata.len()),
                created_at,
                age_days: (now - created_at).num_days(),
            });
        }

        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    /// Delete one artifact by name.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let name = normalize_name(name)?;
        let path = self.dir.join(&name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(backup = %name, "Backup deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ForgeError::artifact_not_found(&name))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete artifacts older than the retention window. Returns the names
    /// removed.
    pub async fn cleanup_expired(&self) -> Result<CleanupReport> {
        let mut deleted = Vec::new();
        for entry in self.list().await? {
            if entry.age_days > self.retention_days {
                match tokio::fs::remove_file(self.dir.join(&entry.name)).await {
                    Ok(()) => {
                        tracing::info!(backup = %entry.name, age_days = entry.age_days, "Expired backup removed");
                        deleted.push(entry.name);
                    }
                    Err(e) => {
                        tracing::warn!(backup = %entry.name, error = %e, "Failed to remove expired backup")
                    }
                }
            }
        }
        Ok(CleanupReport {
            deleted,
            retention_days: self.retention_days,
        })
    }

    /// Directory-level summary for the admin surface.
    pub async fn status(&self) -> Result<BackupStatus> {
        let entries = self.list().await?;
        let total_size: u64 = entries.iter().map(|e| e.size_bytes).sum();
        Ok(BackupStatus {
            in_progress: self.in_progress(),
            total_backups: entries.len() as u64,
            total_size_bytes: total_size,
            total_size_formatted: format_size(total_size),
            last_backup: entries.into_iter().next(),
            directory: self.dir.display().to_string(),
            retention_days: self.retention_days,
        })
    }
}

/// Default artifact name derived from the backup start time.
fn default_backup_name(at: DateTime<Utc>) -> String {
    format!(
        "backup_{}.{}",
        at.format("%Y-%m-%dT%H-%M-%S"),
        ARTIFACT_EXTENSION
    )
}

/// Validate a caller-supplied artifact name and ensure the extension.
/// Names must be bare file names; anything that could escape the backup
/// directory is rejected.
fn normalize_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ForgeError::validation("Backup name must not be empty"));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(ForgeError::validation(
            "Backup name must be a bare file name",
        ));
    }
    if Path::new(name).extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXTENSION) {
        Ok(name.to_string())
    } else {
        Ok(format!("{}.{}", name, ARTIFACT_EXTENSION))
    }
}

/// Serialize and atomically persist the artifact, returning its size in
/// bytes. The temp file lives in the target directory so the final rename
/// stays on one filesystem.
async fn write_artifact(path: &Path, artifact: &BackupArtifact) -> Result<u64> {
    let serialized = serde_json::to_vec_pretty(artifact)?;
    let size = serialized.len() as u64;
    let dir = path
        .parent()
        .ok_or_else(|| ForgeError::internal("Backup path has no parent directory"))?
        .to_path_buf();
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&serialized)?;
        tmp.flush()?;
        tmp.persist(&path)
            .map_err(|e| ForgeError::from(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| ForgeError::internal(format!("Backup write task panicked: {}", e)))??;

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn engine_with(store: Arc<MemoryStore>, dir: &Path, retention_days: i64) -> BackupEngine {
        BackupEngine::new(
            store,
            &BackupConfig {
                dir: dir.display().to_string(),
                retention_days,
            },
        )
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new("appdb"));
        store.put_collection(
            "users",
            vec![json!({"_id": 1, "email": "a@example.com"}), json!({"_id": 2})],
        );
        store.put_collection("settings", vec![json!({"_id": "theme", "value": "dark"})]);
        store.put_collection("system.profile", vec![json!({"op": "query"})]);
        store
    }

    #[tokio::test]
    async fn test_create_excludes_system_collections() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with(seeded_store(), tmp.path(), 7);

        let report = engine.create(BackupOptions::default()).await.unwrap();
        assert_eq!(report.collections_backed_up, vec!["settings", "users"]);
        assert!(report.collections_failed.is_empty());
        assert_eq!(report.total_documents, 3);
        assert!(report.backup_name.ends_with(".json"));

        let raw = tokio::fs::read_to_string(&report.path).await.unwrap();
        let artifact: BackupArtifact = serde_json::from_str(&raw).unwrap();
        assert!(!artifact.collections.contains_key("system.profile"));
        assert_eq!(artifact.metadata.database, "appdb");
        assert_eq!(artifact.metadata.backup_name, report.backup_name);
        assert_eq!(artifact.metadata.total_documents, 3);
        assert!(artifact.metadata.total_size_bytes > 0);
        assert!(!artifact.metadata.total_size_formatted.is_empty());
    }

    #[tokio::test]
    async fn test_create_with_collection_subset() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with(seeded_store(), tmp.path(), 7);

        let report = engine
            .create(BackupOptions {
                backup_name: Some("subset".to_string()),
                collections: Some(vec!["users".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.backup_name, "subset.json");
        assert_eq!(report.collections_backed_up, vec!["users"]);
        assert_eq!(report.total_documents, 2);
    }

    #[tokio::test]
    async fn test_round_trip_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let engine = engine_with(store.clone(), tmp.path(), 7);

        let report = engine
            .create(BackupOptions {
                backup_name: Some("rt".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        // Wipe, then restore.
        store.drop_collection("users").await.unwrap();
        store.drop_collection("settings").await.unwrap();

        let restore = engine
            .restore(&report.backup_name, RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(restore.collections_restored.len(), 2);
        assert!(restore.collections_failed.is_empty());
        assert_eq!(restore.total_documents_restored, 3);
        assert_eq!(store.count_documents("users").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_restore_without_drop_merges() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let engine = engine_with(store.clone(), tmp.path(), 7);
        engine
            .create(BackupOptions {
                backup_name: Some("merge".to_string()),
                collections: Some(vec!["users".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();

        // A document added after the backup survives a default restore;
        // captured documents with existing ids are skipped.
        store
            .insert_many("users", &[json!({"_id": 3, "email": "new@example.com"})])
            .await
            .unwrap();
        let restore = engine
            .restore("merge", RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(restore.total_documents_restored, 0);
        assert_eq!(store.count_documents("users").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_restore_with_drop_replaces_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let engine = engine_with(store.clone(), tmp.path(), 7);
        engine
            .create(BackupOptions {
                backup_name: Some("replace".to_string()),
                collections: Some(vec!["users".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();

        store
            .insert_many("users", &[json!({"_id": 3, "email": "new@example.com"})])
            .await
            .unwrap();
        let restore = engine
            .restore(
                "replace",
                RestoreOptions {
                    drop: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(restore.total_documents_restored, 2);
        // The post-backup document is gone.
        assert_eq!(store.count_documents("users").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_restore_missing_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with(seeded_store(), tmp.path(), 7);
        let err = engine
            .restore("nope", RestoreOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ArtifactNotFound);
    }

    #[tokio::test]
    async fn test_restore_rejects_malformed_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("bad.json"), b"{not json")
            .await
            .unwrap();
        let engine = engine_with(seeded_store(), tmp.path(), 7);
        let err = engine
            .restore("bad", RestoreOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArtifactFormat);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with(seeded_store(), tmp.path(), 7);
        for name in ["../escape", "a/b", "..", "dir\\file"] {
            let err = engine.delete(name).await.unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::ValidationError);
        }
    }

    #[tokio::test]
    async fn test_delete_missing_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with(seeded_store(), tmp.path(), 7);
        let err = engine.delete("ghost").await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ArtifactNotFound);
    }

    #[tokio::test]
    async fn test_cleanup_with_zero_retention_removes_older_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store();
        // Retention of -1 days means every artifact is already expired.
        let engine = engine_with(store, tmp.path(), -1);

        let report = engine
            .create(BackupOptions {
                backup_name: Some("old".to_string()),
                cleanup: false,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(tokio::fs::try_exists(&report.path).await.unwrap());

        let cleanup = engine.cleanup_expired().await.unwrap();
        assert_eq!(cleanup.deleted, vec!["old.json"]);
        assert!(!tokio::fs::try_exists(&report.path).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_files() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with(seeded_store(), tmp.path(), 7);
        engine
            .create(BackupOptions {
                backup_name: Some("fresh".to_string()),
                cleanup: false,
                ..Default::default()
            })
            .await
            .unwrap();

        let cleanup = engine.cleanup_expired().await.unwrap();
        assert!(cleanup.deleted.is_empty());
        assert_eq!(engine.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_ignores_non_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("notes.txt"), b"hi")
            .await
            .unwrap();
        let engine = engine_with(seeded_store(), tmp.path(), 7);
        engine
            .create(BackupOptions {
                backup_name: Some("only".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let entries = engine.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "only.json");
    }

    #[tokio::test]
    async fn test_status_reflects_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with(seeded_store(), tmp.path(), 7);
        let status = engine.status().await.unwrap();
        assert_eq!(status.total_backups, 0);
        assert!(status.last_backup.is_none());
        assert!(!status.in_progress);

        engine
            .create(BackupOptions {
                backup_name: Some("s1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let status = engine.status().await.unwrap();
        assert_eq!(status.total_backups, 1);
        assert_eq!(status.last_backup.unwrap().name, "s1.json");
    }

    /// Delegates to a [`MemoryStore`] but refuses to dump one collection.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        poisoned: String,
    }

    #[async_trait::async_trait]
    impl crate::store::DocumentStore for FlakyStore {
        async fn is_connected(&self) -> bool {
            self.inner.is_connected().await
        }
        fn database_name(&self) -> &str {
            self.inner.database_name()
        }
        async fn collection_names(&self) -> crate::error::Result<Vec<String>> {
            self.inner.collection_names().await
        }
        async fn dump_collection(
            &self,
            name: &str,
        ) -> crate::error::Result<crate::store::CollectionDump> {
            if name == self.poisoned {
                Err(ForgeError::internal("stats unavailable"))
            } else {
                self.inner.dump_collection(name).await
            }
        }
        async fn count_documents(&self, name: &str) -> crate::error::Result<u64> {
            self.inner.count_documents(name).await
        }
        async fn insert_many(&self, name: &str, docs: &[serde_json::Value]) -> crate::error::Result<u64> {
            self.inner.insert_many(name, docs).await
        }
        async fn drop_collection(&self, name: &str) -> crate::error::Result<bool> {
            self.inner.drop_collection(name).await
        }
        async fn create_indexes(
            &self,
            name: &str,
            indexes: &[crate::store::IndexSpec],
        ) -> crate::error::Result<()> {
            self.inner.create_indexes(name, indexes).await
        }
        async fn find_users(
            &self,
            filter: &crate::store::UserFilter,
        ) -> crate::error::Result<Vec<crate::store::UserRecord>> {
            self.inner.find_users(filter).await
        }
    }

    #[tokio::test]
    async fn test_backup_tolerates_failed_collection_dump() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore {
            inner: seeded_store(),
            poisoned: "settings".to_string(),
        });
        let engine = BackupEngine::new(
            store,
            &BackupConfig {
                dir: tmp.path().display().to_string(),
                retention_days: 7,
            },
        );

        let report = engine
            .create(BackupOptions {
                backup_name: Some("partial".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.collections_backed_up, vec!["users"]);
        assert_eq!(report.collections_failed, vec!["settings"]);
        assert_eq!(report.total_documents, 2);

        // The failure is recorded inline in the artifact.
        let raw = tokio::fs::read_to_string(&report.path).await.unwrap();
        let artifact: BackupArtifact = serde_json::from_str(&raw).unwrap();
        assert!(artifact.collections["settings"].is_failed());

        // Restoring reports the uncaptured collection without failing the
        // rest.
        let restore = engine
            .restore("partial", RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(restore.collections_restored, vec!["users"]);
        assert_eq!(restore.collections_failed.len(), 1);
        assert_eq!(restore.collections_failed[0].name, "settings");
    }

    /// Delegates to a [`MemoryStore`] but refuses every index creation.
    struct IndexlessStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait::async_trait]
    impl crate::store::DocumentStore for IndexlessStore {
        async fn is_connected(&self) -> bool {
            self.inner.is_connected().await
        }
        fn database_name(&self) -> &str {
            self.inner.database_name()
        }
        async fn collection_names(&self) -> crate::error::Result<Vec<String>> {
            self.inner.collection_names().await
        }
        async fn dump_collection(
            &self,
            name: &str,
        ) -> crate::error::Result<crate::store::CollectionDump> {
            self.inner.dump_collection(name).await
        }
        async fn count_documents(&self, name: &str) -> crate::error::Result<u64> {
            self.inner.count_documents(name).await
        }
        async fn insert_many(&self, name: &str, docs: &[serde_json::Value]) -> crate::error::Result<u64> {
            self.inner.insert_many(name, docs).await
        }
        async fn drop_collection(&self, name: &str) -> crate::error::Result<bool> {
            self.inner.drop_collection(name).await
        }
        async fn create_indexes(
            &self,
            _name: &str,
            _indexes: &[crate::store::IndexSpec],
        ) -> crate::error::Result<()> {
            Err(ForgeError::internal("index build rejected"))
        }
        async fn find_users(
            &self,
            filter: &crate::store::UserFilter,
        ) -> crate::error::Result<Vec<crate::store::UserRecord>> {
            self.inner.find_users(filter).await
        }
    }

    #[tokio::test]
    async fn test_restore_survives_index_recreation_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let inner = seeded_store();
        inner.put_indexes(
            "users",
            vec![
                crate::store::IndexSpec {
                    name: "_id_".to_string(),
                    keys: json!({"_id": 1}),
                    unique: true,
                },
                crate::store::IndexSpec {
                    name: "email_1".to_string(),
                    keys: json!({"email": 1}),
                    unique: false,
                },
            ],
        );
        let store = Arc::new(IndexlessStore {
            inner: inner.clone(),
        });
        let engine = BackupEngine::new(
            store,
            &BackupConfig {
                dir: tmp.path().display().to_string(),
                retention_days: 7,
            },
        );

        engine
            .create(BackupOptions {
                backup_name: Some("indexed".to_string()),
                collections: Some(vec!["users".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();
        inner.drop_collection("users").await.unwrap();

        // Documents come back even though the index build is refused.
        let restore = engine
            .restore("indexed", RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(restore.collections_restored, vec!["users"]);
        assert!(restore.collections_failed.is_empty());
        assert_eq!(restore.total_documents_restored, 2);
        assert_eq!(inner.count_documents("users").await.unwrap(), 2);
    }

    /// Delegates to a [`MemoryStore`] but parks every dump until the gate
    /// hands out permits, holding a backup in flight.
    struct GatedStore {
        inner: Arc<MemoryStore>,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait::async_trait]
    impl crate::store::DocumentStore for GatedStore {
        async fn is_connected(&self) -> bool {
            self.inner.is_connected().await
        }
        fn database_name(&self) -> &str {
            self.inner.database_name()
        }
        async fn collection_names(&self) -> crate::error::Result<Vec<String>> {
            self.inner.collection_names().await
        }
        async fn dump_collection(
            &self,
            name: &str,
        ) -> crate::error::Result<crate::store::CollectionDump> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| ForgeError::internal("gate closed"))?;
            self.inner.dump_collection(name).await
        }
        async fn count_documents(&self, name: &str) -> crate::error::Result<u64> {
            self.inner.count_documents(name).await
        }
        async fn insert_many(&self, name: &str, docs: &[serde_json::Value]) -> crate::error::Result<u64> {
            self.inner.insert_many(name, docs).await
        }
        async fn drop_collection(&self, name: &str) -> crate::error::Result<bool> {
            self.inner.drop_collection(name).await
        }
        async fn create_indexes(
            &self,
            name: &str,
            indexes: &[crate::store::IndexSpec],
        ) -> crate::error::Result<()> {
            self.inner.create_indexes(name, indexes).await
        }
        async fn find_users(
            &self,
            filter: &crate::store::UserFilter,
        ) -> crate::error::Result<Vec<crate::store::UserRecord>> {
            self.inner.find_users(filter).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_create_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let store = Arc::new(GatedStore {
            inner: seeded_store(),
            gate: gate.clone(),
        });
        let engine = Arc::new(BackupEngine::new(
            store,
            &BackupConfig {
                dir: tmp.path().display().to_string(),
                retention_days: 7,
            },
        ));

        let first = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .create(BackupOptions {
                        backup_name: Some("slow".to_string()),
                        cleanup: false,
                        ..Default::default()
                    })
                    .await
            }
        });

        // Wait until the first create holds the lock, parked on the gate.
        for _ in 0..200 {
            if engine.in_progress() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(engine.in_progress());

        let err = engine.create(BackupOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BackupInProgress);

        gate.add_permits(16);
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.backup_name, "slow.json");
        assert!(!engine.in_progress());
    }
}
