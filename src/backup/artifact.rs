//! Backup artifact format.
//!
//! An artifact is a single JSON document: metadata plus one entry per
//! collection. Collections that failed to dump are recorded inline with
//! their error instead of aborting the whole backup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::store::CollectionDump;

/// Artifact file extension. Files without it are ignored by listing and
/// retention cleanup.
pub const ARTIFACT_EXTENSION: &str = "json";

/// Top-level shape of a backup artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifact {
    pub metadata: ArtifactMetadata,
    pub collections: BTreeMap<String, CollectionEntry>,
}

/// Artifact-level metadata, captured at backup time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    /// File name the artifact was written under
    pub backup_name: String,
    /// When the backup started
    pub timestamp: DateTime<Utc>,
    /// Source database name
    pub database: String,
    /// Number of collections attempted
    pub collection_count: u64,
    /// Documents captured across all successful collections
    pub total_documents: u64,
    /// Serialized size of the collection data in bytes
    pub total_size_bytes: u64,
    pub total_size_formatted: String,
    /// Requested-but-unapplied options, echoed for the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gzip: Option<bool>,
}

/// One collection inside an artifact: either a full dump or a recorded
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollectionEntry {
    Data(CollectionDump),
    Failed(FailedCollection),
}

impl CollectionEntry {
    pub fn document_count(&self) -> u64 {
        match self {
            Self::Data(dump) => dump.document_count,
            Self::Failed(_) => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// A collection that could not be dumped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedCollection {
    pub error: String,
    pub document_count: u64,
}

/// One artifact on disk, as reported by listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactEntry {
    pub name: String,
    pub size_bytes: u64,
    pub size_formatted: String,
    pub created_at: DateTime<Utc>,
    pub age_days: i64,
}

/// Human-readable byte count: `B`, `KB`, `MB`, `GB` or `TB` with two
/// decimals.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
