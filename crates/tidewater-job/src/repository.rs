//! Typed access to a [`ProgressStore`].
//!
//! Key layout:
//!
//! ```text
//!   jobs/<job>/meta                      JobMeta
//!   jobs/<job>/items/<n>                 JobItemProgress
//!   jobs/<job>/check/latest              latest check job id
//!   jobs/<job>/checks/<check>/progress   ConsistencyCheckProgress
//!   jobs/<job>/checks/<check>/results    table -> TableCheckResult
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::JobConfig;
use crate::consistency::{ConsistencyCheckProgress, TableCheckResult};
use crate::error::StoreError;
use crate::progress::JobItemProgress;
use crate::store::ProgressStore;

/// Persisted description of a migration job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    /// Job definition.
    pub config: JobConfig,
    /// Whether the job is currently scheduled.
    pub active: bool,
    /// Creation time, epoch milliseconds.
    pub create_time_ms: i64,
    /// Last stop time, epoch milliseconds.
    #[serde(default)]
    pub stop_time_ms: Option<i64>,
    /// Number of job items the job was split into.
    pub job_item_count: u32,
}

/// Typed repository over a shared [`ProgressStore`].
#[derive(Clone)]
pub struct JobRepository {
    store: Arc<dyn ProgressStore>,
}

impl JobRepository {
    /// Wraps `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    /// Persists job metadata.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend or encoding failure.
    pub fn save_job(&self, meta: &JobMeta) -> Result<(), StoreError> {
        self.put(&format!("jobs/{}/meta", meta.config.job_id), meta)
    }

    /// Loads job metadata.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend or decoding failure.
    pub fn load_job(&self, job_id: &str) -> Result<Option<JobMeta>, StoreError> {
        self.get(&format!("jobs/{job_id}/meta"))
    }

    /// Every persisted job, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend or decoding failure.
    pub fn list_jobs(&self) -> Result<Vec<JobMeta>, StoreError> {
        let mut jobs = Vec::new();
        for key in self.store.keys_with_prefix("jobs/")? {
            let segments: Vec<&str> = key.split('/').collect();
            if segments.len() == 3 && segments[2] == "meta" {
                if let Some(meta) = self.get(&key)? {
                    jobs.push(meta);
                }
            }
        }
        Ok(jobs)
    }

    /// Removes a job and everything stored under it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend failure.
    pub fn delete_job(&self, job_id: &str) -> Result<(), StoreError> {
        for key in self.store.keys_with_prefix(&format!("jobs/{job_id}/"))? {
            self.store.delete(&key)?;
        }
        Ok(())
    }

    /// Persists one job item's progress.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend or encoding failure.
    pub fn save_item_progress(
        &self,
        job_id: &str,
        item: u32,
        progress: &JobItemProgress,
    ) -> Result<(), StoreError> {
        self.put(&format!("jobs/{job_id}/items/{item}"), progress)
    }

    /// Loads one job item's progress.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend or decoding failure.
    pub fn load_item_progress(
        &self,
        job_id: &str,
        item: u32,
    ) -> Result<Option<JobItemProgress>, StoreError> {
        self.get(&format!("jobs/{job_id}/items/{item}"))
    }

    /// Every persisted item of a job, ordered by item number.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend or decoding failure.
    pub fn item_progresses(&self, job_id: &str) -> Result<Vec<(u32, JobItemProgress)>, StoreError> {
        let prefix = format!("jobs/{job_id}/items/");
        let mut items = Vec::new();
        for key in self.store.keys_with_prefix(&prefix)? {
            let Some(item) = key
                .strip_prefix(&prefix)
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            if let Some(progress) = self.get(&key)? {
                items.push((item, progress));
            }
        }
        items.sort_by_key(|(item, _)| *item);
        Ok(items)
    }

    /// Latest consistency check job id of a migration job.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend or decoding failure.
    pub fn latest_check_id(&self, parent_job_id: &str) -> Result<Option<String>, StoreError> {
        self.get(&format!("jobs/{parent_job_id}/check/latest"))
    }

    /// Records the latest consistency check job id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend failure.
    pub fn set_latest_check_id(
        &self,
        parent_job_id: &str,
        check_job_id: &str,
    ) -> Result<(), StoreError> {
        self.put(&format!("jobs/{parent_job_id}/check/latest"), &check_job_id)
    }

    /// Forgets the latest consistency check job id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend failure.
    pub fn clear_latest_check_id(&self, parent_job_id: &str) -> Result<(), StoreError> {
        self.store
            .delete(&format!("jobs/{parent_job_id}/check/latest"))
    }

    /// Persists consistency check progress.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend or encoding failure.
    pub fn save_check_progress(
        &self,
        parent_job_id: &str,
        check_job_id: &str,
        progress: &ConsistencyCheckProgress,
    ) -> Result<(), StoreError> {
        self.put(
            &format!("jobs/{parent_job_id}/checks/{check_job_id}/progress"),
            progress,
        )
    }

    /// Loads consistency check progress.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend or decoding failure.
    pub fn load_check_progress(
        &self,
        parent_job_id: &str,
        check_job_id: &str,
    ) -> Result<Option<ConsistencyCheckProgress>, StoreError> {
        self.get(&format!("jobs/{parent_job_id}/checks/{check_job_id}/progress"))
    }

    /// Persists per-table check results.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend or encoding failure.
    pub fn save_check_results(
        &self,
        parent_job_id: &str,
        check_job_id: &str,
        results: &BTreeMap<String, TableCheckResult>,
    ) -> Result<(), StoreError> {
        self.put(
            &format!("jobs/{parent_job_id}/checks/{check_job_id}/results"),
            results,
        )
    }

    /// Loads per-table check results; empty when none were stored.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend or decoding failure.
    pub fn load_check_results(
        &self,
        parent_job_id: &str,
        check_job_id: &str,
    ) -> Result<BTreeMap<String, TableCheckResult>, StoreError> {
        Ok(self
            .get(&format!("jobs/{parent_job_id}/checks/{check_job_id}/results"))?
            .unwrap_or_default())
    }

    /// Removes a check job's progress and results.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on backend failure.
    pub fn delete_check(&self, parent_job_id: &str, check_job_id: &str) -> Result<(), StoreError> {
        for key in self
            .store
            .keys_with_prefix(&format!("jobs/{parent_job_id}/checks/{check_job_id}/"))?
        {
            self.store.delete(&key)?;
        }
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.store
            .get(key)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::from)
    }

    fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.store.put(key, &serde_json::to_value(value)?)
    }
}

impl fmt::Debug for JobRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRepository").finish_non_exhaustive()
    }
}
