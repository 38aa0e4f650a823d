//! jobforge: background job queue, cron scheduler and database backup
//! service.
//!
//! Three pillars:
//!
//! - [`jobs`]: a job queue that runs durably through Redis when the broker
//!   is reachable and transparently degrades to an in-process executor
//!   when it is not, plus the cron scheduler that feeds it.
//! - [`backup`]: atomic full-database snapshots with partial-failure
//!   tolerance, restore, and retention cleanup.
//! - [`api`]: the admin HTTP surface over both.

pub mod api;
pub mod backup;
pub mod config;
pub mod error;
pub mod jobs;
pub mod mailer;
pub mod observability;
pub mod store;

pub use config::Config;
pub use error::{ErrorCode, ForgeError, Result};
