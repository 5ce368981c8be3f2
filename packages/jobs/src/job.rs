//! The pull job model.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Lifecycle state of a pull job.
///
/// A job advances monotonically through `Queued` → `InProcess` →
/// (`Finished` | `Failed`); terminal states are final.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum JobStatus {
    /// Waiting in the queue.
    Queued,
    /// A worker is executing the pull.
    InProcess,
    /// The pull committed successfully.
    Finished,
    /// The pull failed; the target table was left untouched.
    Failed,
}

impl JobStatus {
    /// Whether the job has reached a final state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Row counts collected while executing a pull.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatistics {
    /// Features read from the source and staged.
    pub pulled: u64,
    /// Rows newly inserted into the target table.
    pub created: u64,
    /// Existing rows that were changed.
    pub updated: u64,
    /// Rows removed because they vanished from the source.
    pub deleted: u64,
}

/// A single pull job, shared between the queue, the job list, and the
/// worker executing it.
///
/// Identity fields are immutable. Progress fields sit behind an `RwLock`
/// so the executing worker can publish updates that HTTP readers observe
/// through [`Job::record`] snapshots.
#[derive(Debug)]
pub struct Job {
    id: String,
    layer_name: String,
    filter: Option<String>,
    time_added: DateTime<Utc>,
    state: RwLock<JobState>,
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    message: String,
    statistics: JobStatistics,
    time_started: Option<DateTime<Utc>>,
    time_finished: Option<DateTime<Utc>>,
}

/// Snapshot of a job as returned by the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Unique job id.
    pub id: String,
    /// Name of the layer being pulled.
    pub layer_name: String,
    /// Attribute filter applied to the source, if any.
    pub filter: Option<String>,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Last human-readable status line, empty when there is nothing to say.
    pub message: String,
    /// Row counts collected so far.
    pub statistics: JobStatistics,
    /// When the job was submitted.
    pub time_added: DateTime<Utc>,
    /// When a worker started executing the job.
    pub time_started: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub time_finished: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a new queued job for the given layer.
    ///
    /// Job ids are hyphenless UUIDs — alphanumeric, and therefore safe as
    /// the suffix of an unquoted SQL identifier (the staging table is named
    /// after the job id).
    #[must_use]
    pub fn new(layer_name: impl Into<String>, filter: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            layer_name: layer_name.into(),
            filter,
            time_added: Utc::now(),
            state: RwLock::new(JobState {
                status: JobStatus::Queued,
                message: String::new(),
                statistics: JobStatistics::default(),
                time_started: None,
                time_finished: None,
            }),
        }
    }

    /// The unique job id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The name of the layer this job pulls.
    #[must_use]
    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    /// The attribute filter applied to the source, if any.
    #[must_use]
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// The current lifecycle state.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.read().status
    }

    /// Advances the lifecycle state.
    ///
    /// Entering `InProcess` stamps the start time; entering a terminal
    /// state stamps the finish time. Once a terminal state is reached the
    /// status can no longer change.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn set_status(&self, status: JobStatus) {
        let mut state = self.write();
        if state.status.is_terminal() {
            log::warn!(
                "Ignoring status change of job {} from {} to {status}",
                self.id,
                state.status
            );
            return;
        }
        state.status = status;
        match status {
            JobStatus::InProcess => state.time_started = Some(Utc::now()),
            JobStatus::Finished | JobStatus::Failed => state.time_finished = Some(Utc::now()),
            JobStatus::Queued => {}
        }
    }

    /// Replaces the human-readable status line.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn set_message(&self, message: impl Into<String>) {
        self.write().message = message.into();
    }

    /// Publishes intermediate statistics. Ignored unless the job is
    /// `InProcess`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn set_statistics(&self, statistics: JobStatistics) {
        let mut state = self.write();
        if state.status == JobStatus::InProcess {
            state.statistics = statistics;
        }
    }

    /// Marks the job finished with its final statistics.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn finish(&self, statistics: JobStatistics) {
        {
            let mut state = self.write();
            if state.status == JobStatus::InProcess {
                state.statistics = statistics;
            }
        }
        self.set_status(JobStatus::Finished);
    }

    /// Marks the job failed with a human-readable reason.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn fail(&self, message: impl Into<String>) {
        self.set_message(message);
        self.set_status(JobStatus::Failed);
    }

    /// Takes a consistent snapshot of the job for the HTTP API.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn record(&self) -> JobRecord {
        let state = self.read();
        JobRecord {
            id: self.id.clone(),
            layer_name: self.layer_name.clone(),
            filter: self.filter.clone(),
            status: state.status,
            message: state.message.clone(),
            statistics: state.statistics,
            time_added: self.time_added,
            time_started: state.time_started,
            time_finished: state.time_finished,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, JobState> {
        self.state.read().expect("job state lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, JobState> {
        self.state.write().expect("job state lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_jobs_are_queued_with_identifier_safe_ids() {
        let job = Job::new("parcels", None);
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.id().len(), 32);
        assert!(job.id().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn status_stamps_timestamps() {
        let job = Job::new("parcels", None);
        assert!(job.record().time_started.is_none());

        job.set_status(JobStatus::InProcess);
        let record = job.record();
        assert!(record.time_started.is_some());
        assert!(record.time_finished.is_none());

        job.set_status(JobStatus::Finished);
        assert!(job.record().time_finished.is_some());
    }

    #[test]
    fn terminal_status_is_final() {
        let job = Job::new("parcels", None);
        job.set_status(JobStatus::InProcess);
        job.fail("source unreachable");
        job.set_status(JobStatus::Finished);
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.record().message, "source unreachable");
    }

    #[test]
    fn statistics_are_only_mutable_in_process() {
        let job = Job::new("parcels", None);
        let stats = JobStatistics {
            pulled: 3,
            created: 1,
            updated: 1,
            deleted: 1,
        };

        job.set_statistics(stats);
        assert_eq!(job.record().statistics, JobStatistics::default());

        job.set_status(JobStatus::InProcess);
        job.set_statistics(stats);
        assert_eq!(job.record().statistics, stats);

        job.finish(JobStatistics {
            pulled: 4,
            ..stats
        });
        assert_eq!(job.record().statistics.pulled, 4);

        job.set_statistics(JobStatistics::default());
        assert_eq!(job.record().statistics.pulled, 4);
    }

    #[test]
    fn record_serializes_with_api_field_names() {
        let job = Job::new("parcels", Some("owner = 'A'".to_string()));
        job.set_status(JobStatus::InProcess);

        let json = serde_json::to_value(job.record()).unwrap();
        assert_eq!(json["layerName"], "parcels");
        assert_eq!(json["status"], "in-process");
        assert_eq!(json["filter"], "owner = 'A'");
        assert_eq!(json["statistics"]["pulled"], 0);
        assert!(json["timeAdded"].is_string());
        assert!(json["timeFinished"].is_null());
    }
}
