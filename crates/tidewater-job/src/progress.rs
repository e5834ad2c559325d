//! Per-job-item progress.
//!
//! ```text
//!   importer ──ack(records)──► JobItemProgressTracker ──take_dirty──► store
//!                                      │
//!   runner ──set_status / fail─────────┤
//!                                      └──snapshot──► status queries
//! ```
//!
//! The tracker is the single writer of a job item's [`JobItemProgress`];
//! readers always get a copy.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tidewater_core::position::IngestPosition;
use tidewater_core::record::Record;

/// Job (and job item) status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Scheduled, no phase started yet.
    Running,
    /// Reading metadata and initializing positions.
    Preparing,
    /// Inventory dump in progress.
    ExecuteInventoryTask,
    /// Incremental dump in progress.
    ExecuteIncrementalTask,
    /// All phases completed.
    Finished,
    /// A stop was requested and is being honored.
    Stopping,
    /// Stopped before completion.
    Stopped,
    /// Preparation failed.
    PreparingFailure,
    /// Inventory dump failed.
    ExecuteInventoryTaskFailure,
    /// Incremental dump failed.
    ExecuteIncrementalTaskFailure,
    /// Consistency check failed.
    ConsistencyCheckFailure,
}

impl JobStatus {
    /// Returns `true` for the failure statuses.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::PreparingFailure
                | Self::ExecuteInventoryTaskFailure
                | Self::ExecuteIncrementalTaskFailure
                | Self::ConsistencyCheckFailure
        )
    }

    /// Upper-case name, as shown in status reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Preparing => "PREPARING",
            Self::ExecuteInventoryTask => "EXECUTE_INVENTORY_TASK",
            Self::ExecuteIncrementalTask => "EXECUTE_INCREMENTAL_TASK",
            Self::Finished => "FINISHED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::PreparingFailure => "PREPARING_FAILURE",
            Self::ExecuteInventoryTaskFailure => "EXECUTE_INVENTORY_TASK_FAILURE",
            Self::ExecuteIncrementalTaskFailure => "EXECUTE_INCREMENTAL_TASK_FAILURE",
            Self::ConsistencyCheckFailure => "CONSISTENCY_CHECK_FAILURE",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistable state of one job item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItemProgress {
    /// Current status.
    pub status: JobStatus,
    /// Whether the item is currently scheduled.
    pub active: bool,
    /// Source data source name.
    pub data_source_name: String,
    /// Comma-separated logical table names.
    pub table_names: String,
    /// Source dialect identifier.
    pub source_dialect: String,
    /// Committed inventory position.
    pub inventory_position: IngestPosition,
    /// Whether a stopped inventory phase continues where it left off.
    /// `false` for tables without a usable unique key, which are dumped
    /// again from scratch.
    #[serde(default = "resumable_by_default")]
    pub resumable: bool,
    /// Committed incremental position, once the phase has one.
    #[serde(default)]
    pub incremental_position: Option<IngestPosition>,
    /// Data records acknowledged by the importer, both phases.
    pub processed_records_count: u64,
    /// Estimated inventory rows of this item (0 when unknown).
    pub inventory_records_count: u64,
    /// When the item was (re)started, epoch milliseconds.
    pub started_at_ms: i64,
    /// When the last incremental event was acknowledged.
    #[serde(default)]
    pub incremental_latest_active_ms: Option<i64>,
    /// Failure description for the failure statuses.
    #[serde(default)]
    pub error_message: Option<String>,
}

fn resumable_by_default() -> bool {
    true
}

impl JobItemProgress {
    /// Fresh progress for an item starting at `inventory_position`.
    #[must_use]
    pub fn new(
        data_source_name: impl Into<String>,
        table_names: impl Into<String>,
        source_dialect: impl Into<String>,
        inventory_position: IngestPosition,
        started_at_ms: i64,
    ) -> Self {
        Self {
            status: JobStatus::Running,
            active: true,
            data_source_name: data_source_name.into(),
            table_names: table_names.into(),
            source_dialect: source_dialect.into(),
            resumable: inventory_position.is_resumable(),
            inventory_position,
            incremental_position: None,
            processed_records_count: 0,
            inventory_records_count: 0,
            started_at_ms,
            incremental_latest_active_ms: None,
            error_message: None,
        }
    }

    /// Inventory completion, 0..=100.
    ///
    /// 100 once the inventory position is `Finished` or the item has moved
    /// on to the incremental phase; otherwise processed over estimated
    /// rows, capped at 99.
    #[must_use]
    pub fn inventory_finished_percentage(&self) -> u8 {
        if self.inventory_position.is_finished()
            || matches!(
                self.status,
                JobStatus::ExecuteIncrementalTask | JobStatus::Finished
            )
        {
            return 100;
        }
        if self.processed_records_count == 0 || self.inventory_records_count == 0 {
            return 0;
        }
        let pct = self.processed_records_count.saturating_mul(100) / self.inventory_records_count;
        u8::try_from(pct.min(99)).unwrap_or(99)
    }

    /// Failure status for the phase this item is in.
    ///
    /// While stopping, the phase is inferred from the inventory position.
    #[must_use]
    pub fn phase_failure(&self) -> JobStatus {
        match self.status {
            JobStatus::Running | JobStatus::Preparing | JobStatus::PreparingFailure => {
                JobStatus::PreparingFailure
            }
            JobStatus::ExecuteInventoryTask | JobStatus::ExecuteInventoryTaskFailure => {
                JobStatus::ExecuteInventoryTaskFailure
            }
            JobStatus::ExecuteIncrementalTask | JobStatus::ExecuteIncrementalTaskFailure => {
                JobStatus::ExecuteIncrementalTaskFailure
            }
            _ if self.inventory_position.is_finished() => JobStatus::ExecuteIncrementalTaskFailure,
            _ => JobStatus::ExecuteInventoryTaskFailure,
        }
    }

    /// Seconds since the last incremental activity, or since the start if
    /// that is later. `None` unless active with at least one incremental
    /// event seen.
    #[must_use]
    pub fn incremental_idle_seconds(&self, now_ms: i64) -> Option<i64> {
        if !self.active {
            return None;
        }
        let latest = self.incremental_latest_active_ms?;
        Some((now_ms - self.started_at_ms.max(latest)).max(0) / 1000)
    }
}

/// Single-writer progress cell of a running job item.
///
/// A phase counts as finished only once its dumper reported completion
/// through [`complete_phase`](Self::complete_phase) *and* the importer
/// acked the phase's `Finished` sentinel, in either order. A dumper that
/// fails also pushes a sentinel, which must not finish the phase.
pub struct JobItemProgressTracker {
    state: RwLock<TrackerState>,
    dirty: AtomicBool,
}

struct TrackerState {
    progress: JobItemProgress,
    sentinels_acked: u32,
    phases_completed: u32,
}

impl TrackerState {
    fn settle_phases(&mut self) {
        while self.sentinels_acked > 0 && self.phases_completed > 0 {
            self.sentinels_acked -= 1;
            self.phases_completed -= 1;
            let p = &mut self.progress;
            if p.inventory_position.is_finished() {
                p.incremental_position = Some(IngestPosition::Finished);
            } else {
                p.inventory_position = IngestPosition::Finished;
            }
        }
    }
}

impl JobItemProgressTracker {
    /// Wraps `progress`; the tracker starts dirty so it is persisted once.
    #[must_use]
    pub fn new(progress: JobItemProgress) -> Self {
        Self {
            state: RwLock::new(TrackerState {
                progress,
                sentinels_acked: 0,
                phases_completed: 0,
            }),
            dirty: AtomicBool::new(true),
        }
    }

    /// Copy of the current progress.
    #[must_use]
    pub fn snapshot(&self) -> JobItemProgress {
        self.state.read().progress.clone()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.state.read().progress.status
    }

    /// Moves to `status`.
    pub fn set_status(&self, status: JobStatus) {
        self.update(|p| p.status = status);
    }

    /// Records a failure status with its message and deactivates the item.
    pub fn fail(&self, status: JobStatus, message: impl Into<String>) {
        let message = message.into();
        self.update(|p| {
            p.status = status;
            p.active = false;
            p.error_message = Some(message);
        });
    }

    /// Marks the item active or inactive.
    pub fn set_active(&self, active: bool) {
        self.update(|p| p.active = active);
    }

    /// Sets the estimated inventory row count.
    pub fn set_inventory_records_count(&self, count: u64) {
        self.update(|p| p.inventory_records_count = count);
    }

    /// Sets the incremental start position before the phase begins.
    pub fn set_incremental_position(&self, position: IngestPosition) {
        self.update(|p| p.incremental_position = Some(position));
    }

    /// Records that the current phase's dumper ran to completion.
    pub fn complete_phase(&self) {
        let mut state = self.state.write();
        state.phases_completed += 1;
        state.settle_phases();
        self.dirty.store(true, Ordering::Release);
    }

    /// Applies a batch of importer acknowledgements.
    ///
    /// Data records count towards `processed_records_count` and advance
    /// the committed position of their phase; range positions only move
    /// forward. `Finished` sentinels settle completed phases, inventory
    /// first.
    pub fn on_ack(&self, records: &[Record]) {
        if records.is_empty() {
            return;
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut guard = self.state.write();
        let state = &mut *guard;
        for record in records {
            let p = &mut state.progress;
            match record {
                Record::Data(data) => {
                    p.processed_records_count += 1;
                    match &data.position {
                        IngestPosition::Log(_) => {
                            p.incremental_position = Some(data.position.clone());
                            p.incremental_latest_active_ms = Some(now_ms);
                        }
                        IngestPosition::PrimaryKeyRange(_) => {
                            let ahead = data
                                .position
                                .progress_cmp(&p.inventory_position)
                                .is_some_and(std::cmp::Ordering::is_gt);
                            if ahead {
                                p.inventory_position = data.position.clone();
                            }
                        }
                        IngestPosition::Placeholder | IngestPosition::Finished => {}
                    }
                }
                Record::Finished => state.sentinels_acked += 1,
            }
        }
        state.settle_phases();
        drop(guard);
        self.dirty.store(true, Ordering::Release);
    }

    /// Returns a snapshot if anything changed since the last call.
    pub fn take_dirty(&self) -> Option<JobItemProgress> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            Some(self.snapshot())
        } else {
            None
        }
    }

    /// Flags the progress for another persist attempt.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn update(&self, f: impl FnOnce(&mut JobItemProgress)) {
        f(&mut self.state.write().progress);
        self.dirty.store(true, Ordering::Release);
    }
}

impl fmt::Debug for JobItemProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobItemProgressTracker")
            .field("progress", &self.state.read().progress)
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
