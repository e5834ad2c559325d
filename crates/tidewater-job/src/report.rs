//! Administrative status rows.
//!
//! Each row type knows its column names and how to render itself, so a
//! command layer can print any of them with [`render_table`]. Rows are
//! assembled from live or persisted state and never fail: missing data
//! shows up as empty cells.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};

use crate::consistency::{ConsistencyCheckProgress, TableCheckResult};
use crate::progress::{JobItemProgress, JobStatus};
use crate::repository::JobMeta;

/// Timestamp format of report cells.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Formats epoch milliseconds (UTC) for a report cell.
#[must_use]
pub fn format_millis(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format(DATE_TIME_FORMAT).to_string())
        .unwrap_or_default()
}

/// A printable status row.
pub trait StatusRow {
    /// Column names, in order.
    const COLUMNS: &'static [&'static str];

    /// Cell values, aligned with [`COLUMNS`](Self::COLUMNS).
    fn cells(&self) -> Vec<String>;
}

/// Renders rows as a left-aligned text table with a header line.
#[must_use]
pub fn render_table<T: StatusRow>(rows: &[T]) -> String {
    let cells: Vec<Vec<String>> = rows.iter().map(StatusRow::cells).collect();
    let widths: Vec<usize> = T::COLUMNS
        .iter()
        .enumerate()
        .map(|(i, name)| {
            cells
                .iter()
                .filter_map(|row| row.get(i))
                .map(String::len)
                .fold(name.len(), usize::max)
        })
        .collect();
    let line = |values: Vec<&str>| {
        values
            .iter()
            .zip(&widths)
            .map(|(v, &w)| format!("{v:<w$}"))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };
    let mut out = line(T::COLUMNS.to_vec());
    for row in &cells {
        out.push('\n');
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    out
}

fn opt<T: ToString>(value: Option<&T>) -> String {
    value.map(ToString::to_string).unwrap_or_default()
}

/// One migration job, for the list command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    /// Job id.
    pub job_id: String,
    /// Comma-separated logical table names.
    pub tables: String,
    /// Whether the job is scheduled.
    pub active: bool,
    /// Creation time.
    pub create_time: String,
    /// Last stop time.
    pub stop_time: Option<String>,
    /// Number of job items.
    pub job_item_count: u32,
    /// Worker node assignment.
    pub job_sharding_nodes: String,
}

impl JobInfo {
    /// Builds the row from persisted job metadata.
    #[must_use]
    pub fn from_meta(meta: &JobMeta) -> Self {
        Self {
            job_id: meta.config.job_id.clone(),
            tables: meta.config.table_names(),
            active: meta.active,
            create_time: format_millis(meta.create_time_ms),
            stop_time: meta.stop_time_ms.map(format_millis),
            job_item_count: meta.job_item_count,
            job_sharding_nodes: meta.config.sharding_node.clone().unwrap_or_default(),
        }
    }
}

impl StatusRow for JobInfo {
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "tables",
        "active",
        "create_time",
        "stop_time",
        "job_item_count",
        "job_sharding_nodes",
    ];

    fn cells(&self) -> Vec<String> {
        vec![
            self.job_id.clone(),
            self.tables.clone(),
            self.active.to_string(),
            self.create_time.clone(),
            opt(self.stop_time.as_ref()),
            self.job_item_count.to_string(),
            self.job_sharding_nodes.clone(),
        ]
    }
}

/// One job item, for the status command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobItemInfo {
    /// Item number within the job.
    pub item: u32,
    /// Source data source name.
    pub data_source: String,
    /// Comma-separated logical table names.
    pub tables: String,
    /// Item status.
    pub status: JobStatus,
    /// Whether the item is scheduled.
    pub active: bool,
    /// Whether a stop keeps inventory progress. Tables without a unique
    /// key report `false`: they are dumped again from scratch.
    pub resumable: bool,
    /// Acknowledged data records.
    pub processed_records_count: u64,
    /// Inventory completion, 0..=100.
    pub inventory_finished_percentage: u8,
    /// Seconds since the last incremental event.
    pub incremental_idle_seconds: Option<i64>,
    /// Failure description.
    pub error_message: Option<String>,
}

impl JobItemInfo {
    /// Builds the row from a progress snapshot.
    #[must_use]
    pub fn from_progress(item: u32, progress: &JobItemProgress, now_ms: i64) -> Self {
        Self {
            item,
            data_source: progress.data_source_name.clone(),
            tables: progress.table_names.clone(),
            status: progress.status,
            active: progress.active,
            resumable: progress.resumable,
            processed_records_count: progress.processed_records_count,
            inventory_finished_percentage: progress.inventory_finished_percentage(),
            incremental_idle_seconds: progress.incremental_idle_seconds(now_ms),
            error_message: progress.error_message.clone(),
        }
    }
}

impl StatusRow for JobItemInfo {
    const COLUMNS: &'static [&'static str] = &[
        "item",
        "data_source",
        "tables",
        "status",
        "active",
        "resumable",
        "processed_records_count",
        "inventory_finished_percentage",
        "incremental_idle_seconds",
        "error_message",
    ];

    fn cells(&self) -> Vec<String> {
        vec![
            self.item.to_string(),
            self.data_source.clone(),
            self.tables.clone(),
            self.status.to_string(),
            self.active.to_string(),
            self.resumable.to_string(),
            self.processed_records_count.to_string(),
            self.inventory_finished_percentage.to_string(),
            opt(self.incremental_idle_seconds.as_ref()),
            opt(self.error_message.as_ref()),
        ]
    }
}

/// One row of the check status command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyCheckJobItemInfo {
    /// Comma-separated tables covered by this row.
    pub table_names: String,
    /// Aggregate result; `None` while unknown or for ignored tables.
    pub check_success: Option<bool>,
    /// Comma-separated tables that did not match.
    pub check_failed_table_names: String,
    /// Comma-separated ignored tables.
    pub ignored_table_names: String,
    /// Whether the check is running.
    pub active: bool,
    /// Checked over total records, 0..=100.
    pub inventory_finished_percentage: u8,
    /// Estimated seconds until completion.
    pub inventory_remaining_seconds: Option<i64>,
    /// Idle seconds of the parent migration job's incremental phase.
    pub incremental_idle_seconds: Option<i64>,
    /// Start time.
    pub check_begin_time: Option<String>,
    /// End (or stop) time.
    pub check_end_time: Option<String>,
    /// Elapsed seconds.
    pub duration_seconds: Option<i64>,
    /// Algorithm type name.
    pub algorithm_type: String,
    /// Algorithm properties.
    pub algorithm_props: String,
    /// Failure or ignore reason.
    pub error_message: Option<String>,
}

impl ConsistencyCheckJobItemInfo {
    /// Builds the check status rows of one check job.
    ///
    /// Ignored tables each get their own row carrying the ignore reason.
    /// If every table was ignored those are the only rows; otherwise one
    /// aggregate row for the checked tables follows.
    #[must_use]
    pub fn rows(
        progress: Option<&ConsistencyCheckProgress>,
        results: &BTreeMap<String, TableCheckResult>,
        incremental_idle_seconds: Option<i64>,
        now_ms: i64,
    ) -> Vec<Self> {
        let Some(progress) = progress else {
            return Vec::new();
        };
        let mut rows = Vec::new();
        if !progress.ignored_table_names.is_empty() {
            for table in progress.ignored_table_names.split(',') {
                rows.push(Self {
                    table_names: table.to_string(),
                    check_success: None,
                    error_message: results
                        .get(table)
                        .and_then(|r| r.ignored_reason.clone()),
                    ..Self::default()
                });
            }
        }
        if progress.ignored_table_names == progress.table_names {
            return rows;
        }
        rows.push(Self::aggregate(
            progress,
            results,
            incremental_idle_seconds,
            now_ms,
        ));
        rows
    }

    fn aggregate(
        progress: &ConsistencyCheckProgress,
        results: &BTreeMap<String, TableCheckResult>,
        incremental_idle_seconds: Option<i64>,
        now_ms: i64,
    ) -> Self {
        let mut info = Self {
            table_names: progress.table_names.clone(),
            ignored_table_names: progress.ignored_table_names.clone(),
            active: progress.active,
            incremental_idle_seconds,
            algorithm_type: progress.algorithm_type.clone(),
            algorithm_props: progress.algorithm_props.to_string(),
            ..Self::default()
        };
        let (Some(total), Some(checked)) = (progress.records_count, progress.checked_records_count)
        else {
            return info;
        };
        let begin = progress.check_begin_time_ms;
        let checked = checked.min(total);
        if progress.status == JobStatus::Finished {
            let end = progress.check_end_time_ms.unwrap_or(now_ms);
            info.inventory_finished_percentage = 100;
            info.duration_seconds = Some((end - begin) / 1000);
            info.check_end_time = Some(format_millis(end));
            info.inventory_remaining_seconds = Some(0);
        } else if total != 0 && checked != 0 {
            info.inventory_finished_percentage =
                u8::try_from(checked * 100 / total).unwrap_or(100);
            let duration_ms = progress.stop_time_ms.unwrap_or(now_ms) - begin;
            info.duration_seconds = Some(duration_ms / 1000);
            info.check_end_time = progress.stop_time_ms.map(format_millis);
            let remaining_ms = u128::from(total - checked)
                * u128::try_from(duration_ms.max(0)).unwrap_or(0)
                / u128::from(checked);
            info.inventory_remaining_seconds =
                Some(i64::try_from(remaining_ms / 1000).unwrap_or(i64::MAX));
        }
        info.check_begin_time = Some(format_millis(begin));
        info.error_message = progress.error_message.clone();
        info.check_success = if results.is_empty() {
            None
        } else {
            Some(results.values().all(|r| r.is_ignored() || r.matched))
        };
        info.check_failed_table_names = results
            .iter()
            .filter(|(_, r)| !r.is_ignored() && !r.matched)
            .map(|(table, _)| table.as_str())
            .collect::<Vec<_>>()
            .join(",");
        info
    }
}

impl StatusRow for ConsistencyCheckJobItemInfo {
    const COLUMNS: &'static [&'static str] = &[
        "tables",
        "result",
        "check_failed_tables",
        "ignored_tables",
        "active",
        "inventory_finished_percentage",
        "inventory_remaining_seconds",
        "incremental_idle_seconds",
        "check_begin_time",
        "check_end_time",
        "duration_seconds",
        "algorithm_type",
        "algorithm_props",
        "error_message",
    ];

    fn cells(&self) -> Vec<String> {
        vec![
            self.table_names.clone(),
            opt(self.check_success.as_ref()),
            self.check_failed_table_names.clone(),
            self.ignored_table_names.clone(),
            self.active.to_string(),
            self.inventory_finished_percentage.to_string(),
            opt(self.inventory_remaining_seconds.as_ref()),
            opt(self.incremental_idle_seconds.as_ref()),
            opt(self.check_begin_time.as_ref()),
            opt(self.check_end_time.as_ref()),
            opt(self.duration_seconds.as_ref()),
            self.algorithm_type.clone(),
            self.algorithm_props.clone(),
            opt(self.error_message.as_ref()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewater_core::config::Properties;

    fn check_progress(status: JobStatus) -> ConsistencyCheckProgress {
        ConsistencyCheckProgress {
            status,
            active: status == JobStatus::Running,
            table_names: "orders,logs".into(),
            ignored_table_names: "logs".into(),
            checked_records_count: Some(250),
            records_count: Some(1000),
            check_begin_time_ms: 1_000_000,
            check_end_time_ms: None,
            stop_time_ms: None,
            algorithm_type: "DATA_MATCH".into(),
            algorithm_props: Properties::from_pairs([("chunk-size", "100")]),
            error_message: None,
        }
    }

    fn results(orders_matched: bool) -> BTreeMap<String, TableCheckResult> {
        let mut results = BTreeMap::new();
        results.insert("logs".to_string(), TableCheckResult::ignored("no unique key"));
        results.insert(
            "orders".to_string(),
            TableCheckResult {
                source_records_count: 250,
                target_records_count: 250,
                matched: orders_matched,
                ignored_reason: None,
            },
        );
        results
    }

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(0), "1970-01-01 00:00:00.000");
        assert_eq!(format_millis(1_700_000_000_123), "2023-11-14 22:13:20.123");
    }

    #[test]
    fn test_running_check_estimates_remaining_time() {
        let rows = ConsistencyCheckJobItemInfo::rows(
            Some(&check_progress(JobStatus::Running)),
            &results(true),
            Some(7),
            1_010_000,
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].table_names, "logs");
        assert_eq!(rows[0].check_success, None);
        assert_eq!(rows[0].error_message.as_deref(), Some("no unique key"));

        let main = &rows[1];
        assert_eq!(main.inventory_finished_percentage, 25);
        assert_eq!(main.duration_seconds, Some(10));
        assert_eq!(main.inventory_remaining_seconds, Some(30));
        assert_eq!(main.check_end_time, None);
        assert_eq!(main.check_success, Some(true));
        assert_eq!(main.incremental_idle_seconds, Some(7));
        assert_eq!(main.algorithm_props, "chunk-size=100");
    }

    #[test]
    fn test_finished_and_failed_tables() {
        let mut progress = check_progress(JobStatus::Finished);
        progress.check_end_time_ms = Some(1_042_000);
        let rows = ConsistencyCheckJobItemInfo::rows(Some(&progress), &results(false), None, 9_999_999);
        let main = rows.last().unwrap();
        assert_eq!(main.inventory_finished_percentage, 100);
        assert_eq!(main.duration_seconds, Some(42));
        assert_eq!(main.inventory_remaining_seconds, Some(0));
        assert_eq!(main.check_success, Some(false));
        assert_eq!(main.check_failed_table_names, "orders");
    }

    #[test]
    fn test_stopped_check_uses_stop_time() {
        let mut progress = check_progress(JobStatus::Stopped);
        progress.stop_time_ms = Some(1_020_000);
        let rows = ConsistencyCheckJobItemInfo::rows(Some(&progress), &BTreeMap::new(), None, 9_999_999);
        let main = rows.last().unwrap();
        assert_eq!(main.duration_seconds, Some(20));
        assert_eq!(main.check_end_time.as_deref(), Some(format_millis(1_020_000).as_str()));
        assert_eq!(main.check_success, None);
    }

    #[test]
    fn test_all_ignored_and_unprepared() {
        let mut progress = check_progress(JobStatus::Finished);
        progress.table_names = "logs".into();
        assert_eq!(ConsistencyCheckJobItemInfo::rows(Some(&progress), &results(true), None, 0).len(), 1);

        let mut unprepared = check_progress(JobStatus::Running);
        unprepared.ignored_table_names.clear();
        unprepared.records_count = None;
        let rows = ConsistencyCheckJobItemInfo::rows(Some(&unprepared), &BTreeMap::new(), None, 0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].inventory_finished_percentage, 0);
        assert_eq!(rows[0].check_success, None);
        assert!(ConsistencyCheckJobItemInfo::rows(None, &BTreeMap::new(), None, 0).is_empty());
    }

    #[test]
    fn test_render_table_aligns_columns() {
        let progress = JobItemProgress::new(
            "ds_0",
            "orders",
            "mysql",
            tidewater_core::position::IngestPosition::Finished,
            0,
        );
        let text = render_table(&[JobItemInfo::from_progress(0, &progress, 0)]);
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("item | data_source | tables | status"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("0    | ds_0        | orders | RUNNING"));
        assert!(row.contains("| 100"));
    }

    #[test]
    fn test_table_without_unique_key_is_not_resumable() {
        use tidewater_core::position::IngestPosition;

        let mut progress = JobItemProgress::new("ds_0", "logs", "mysql", IngestPosition::Placeholder, 0);
        progress.inventory_position = IngestPosition::Finished;
        let info = JobItemInfo::from_progress(0, &progress, 0);
        assert!(!info.resumable);
        assert_eq!(info.error_message, None);
        assert!(render_table(&[info]).lines().nth(1).unwrap().contains("| false "));

        let ranged = JobItemProgress::new("ds_0", "orders", "mysql", IngestPosition::range(None, None), 0);
        assert!(JobItemInfo::from_progress(1, &ranged, 0).resumable);
    }
}
