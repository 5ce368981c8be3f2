//! The id-indexed job registry.

use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};

use crate::job::Job;

/// Errors returned by [`JobList`] operations.
#[derive(Debug, thiserror::Error)]
pub enum JobListError {
    /// A job with the same id is already registered.
    #[error("A job with id \"{0}\" is already registered")]
    DuplicateId(String),
}

/// Retention bounds for terminal jobs.
///
/// Eviction never touches jobs that are still queued or in process.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Maximum number of finished/failed jobs kept.
    pub max_finished_jobs: usize,
    /// Finished/failed jobs older than this are dropped.
    pub max_finished_age: Duration,
}

/// Insertion-ordered registry of jobs, shared between the HTTP handlers
/// (readers) and the workers (writers).
///
/// Observers hold job ids and look jobs up here rather than holding raw
/// pointers, so eviction is always safe.
pub struct JobList {
    retention: RetentionPolicy,
    jobs: RwLock<Vec<Arc<Job>>>,
}

impl JobList {
    /// Creates an empty list with the given retention bounds.
    #[must_use]
    pub const fn new(retention: RetentionPolicy) -> Self {
        Self {
            retention,
            jobs: RwLock::new(Vec::new()),
        }
    }

    /// Registers a job. Fails if a job with the same id already exists.
    ///
    /// # Errors
    ///
    /// Returns [`JobListError::DuplicateId`] on id collision.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn insert(&self, job: Arc<Job>) -> Result<(), JobListError> {
        let mut jobs = self.jobs.write().expect("job list lock poisoned");
        if jobs.iter().any(|existing| existing.id() == job.id()) {
            return Err(JobListError::DuplicateId(job.id().to_string()));
        }
        jobs.push(job);
        Self::evict_locked(self.retention, &mut jobs);
        Ok(())
    }

    /// Looks up a job by id.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs
            .read()
            .expect("job list lock poisoned")
            .iter()
            .find(|job| job.id() == id)
            .cloned()
    }

    /// Returns a snapshot of all jobs in insertion order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.read().expect("job list lock poisoned").clone()
    }

    /// Number of registered jobs.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.read().expect("job list lock poisoned").len()
    }

    /// Whether the list is empty.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies the retention bounds, dropping old terminal jobs.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn evict(&self) {
        let mut jobs = self.jobs.write().expect("job list lock poisoned");
        Self::evict_locked(self.retention, &mut jobs);
    }

    fn evict_locked(retention: RetentionPolicy, jobs: &mut Vec<Arc<Job>>) {
        let before = jobs.len();
        let now = Utc::now();

        jobs.retain(|job| {
            let record = job.record();
            if !record.status.is_terminal() {
                return true;
            }
            record
                .time_finished
                .is_none_or(|finished| now - finished <= retention.max_finished_age)
        });

        let mut excess = jobs
            .iter()
            .filter(|job| job.status().is_terminal())
            .count()
            .saturating_sub(retention.max_finished_jobs);
        if excess > 0 {
            // oldest terminal jobs go first
            jobs.retain(|job| {
                if excess > 0 && job.status().is_terminal() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }

        let evicted = before - jobs.len();
        if evicted > 0 {
            log::debug!("Evicted {evicted} terminal job(s) from the job list");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatistics, JobStatus};

    fn unbounded() -> RetentionPolicy {
        RetentionPolicy {
            max_finished_jobs: usize::MAX,
            max_finished_age: Duration::days(365),
        }
    }

    #[test]
    fn inserts_and_looks_up_by_id() {
        let list = JobList::new(unbounded());
        let job = Arc::new(Job::new("parcels", None));
        let id = job.id().to_string();

        list.insert(job).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(&id).unwrap().layer_name(), "parcels");
        assert!(list.get("missing").is_none());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let list = JobList::new(unbounded());
        let job = Arc::new(Job::new("parcels", None));

        list.insert(Arc::clone(&job)).unwrap();
        let err = list.insert(job).unwrap_err();
        assert!(matches!(err, JobListError::DuplicateId(_)));
    }

    #[test]
    fn preserves_insertion_order() {
        let list = JobList::new(unbounded());
        for layer in ["a", "b", "c"] {
            list.insert(Arc::new(Job::new(layer, None))).unwrap();
        }

        let layers: Vec<String> = list
            .jobs()
            .iter()
            .map(|job| job.layer_name().to_string())
            .collect();
        assert_eq!(layers, ["a", "b", "c"]);
    }

    #[test]
    fn count_bound_evicts_oldest_terminal_jobs_only() {
        let list = JobList::new(RetentionPolicy {
            max_finished_jobs: 1,
            max_finished_age: Duration::days(365),
        });

        let running = Arc::new(Job::new("running", None));
        running.set_status(JobStatus::InProcess);
        list.insert(Arc::clone(&running)).unwrap();

        let mut finished_ids = Vec::new();
        for _ in 0..3 {
            let job = Arc::new(Job::new("done", None));
            job.set_status(JobStatus::InProcess);
            job.finish(JobStatistics::default());
            finished_ids.push(job.id().to_string());
            list.insert(job).unwrap();
        }

        // the running job survives, only the newest finished job is kept
        assert_eq!(list.len(), 2);
        assert!(list.get(running.id()).is_some());
        assert!(list.get(&finished_ids[0]).is_none());
        assert!(list.get(&finished_ids[1]).is_none());
        assert!(list.get(&finished_ids[2]).is_some());
    }

    #[test]
    fn age_bound_never_evicts_non_terminal_jobs() {
        let list = JobList::new(RetentionPolicy {
            max_finished_jobs: usize::MAX,
            max_finished_age: Duration::zero(),
        });

        let queued = Arc::new(Job::new("queued", None));
        list.insert(Arc::clone(&queued)).unwrap();

        let finished = Arc::new(Job::new("done", None));
        finished.set_status(JobStatus::InProcess);
        finished.finish(JobStatistics::default());
        list.insert(finished).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(2));
        list.evict();
        assert_eq!(list.len(), 1);
        assert!(list.get(queued.id()).is_some());
    }
}
