//! Database snapshot and restore.

pub mod artifact;
pub mod engine;

pub use artifact::{format_size, ArtifactEntry, ArtifactMetadata, BackupArtifact, CollectionEntry};
pub use engine::{
    BackupEngine, BackupOptions, BackupReport, BackupStatus, CleanupReport, RestoreOptions,
    RestoreReport,
};
