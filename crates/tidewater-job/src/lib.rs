//! # Tidewater Job
//!
//! Runs migration jobs on top of the connectors and answers the
//! administrative status queries.
//!
//! ```text
//!   JobConfig ──► JobManager::start_job
//!                   │  split tables into job items
//!                   ▼
//!   ┌─ job item task ────────────────────────────┐
//!   │ Preparing ─► Inventory ─► Incremental      │──► RecordReceiver ──► importer
//!   └────────────────────────────────────────────┘         │ ack
//!                   ▲                                      ▼
//!   ProgressStore ◄─┴── persister ◄──── JobItemProgressTracker
//!
//!   ConsistencyCheckJob ──► DataConsistencyChecker (source vs target)
//! ```
//!
//! - [`config`]: job definitions and process tuning properties
//! - [`runner`]: the per-item task and its progress persister
//! - [`progress`]: job status and live item progress
//! - [`store`] / [`repository`]: persisted jobs, items and checks
//! - [`consistency`]: data consistency check jobs
//! - [`report`]: rows of the list / status / check status commands
//! - [`manager`]: ties it all together

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod consistency;
pub mod error;
pub mod manager;
pub mod progress;
pub mod report;
pub mod repository;
pub mod runner;
pub mod store;

pub use config::{JobConfig, ProcessConfig, TableRef};
pub use consistency::{CheckAlgorithm, CheckEndpoint, ConsistencyCheckJob, DataConsistencyChecker};
pub use error::{JobError, StoreError};
pub use manager::{JobItemReceiver, JobManager};
pub use progress::{JobItemProgress, JobItemProgressTracker, JobStatus};
pub use report::{render_table, ConsistencyCheckJobItemInfo, JobInfo, JobItemInfo};
pub use repository::{JobMeta, JobRepository};
pub use runner::{JobItemHandle, JobItemSpec, LogSourceFactory};
pub use store::{FileSystemProgressStore, InMemoryProgressStore, ProgressStore};
