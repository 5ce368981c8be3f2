#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Pull-job bookkeeping: the shared [`Job`] model, the id-indexed
//! [`JobList`] registry, and the [`JobQueue`] feeding the workers.
//!
//! A job is created by an HTTP handler, registered in the list, pushed
//! into the queue, and mutated in place by the worker that executes it.
//! HTTP readers observe progress through [`Job::record`] snapshots.

pub mod job;
pub mod list;
pub mod queue;

pub use job::{Job, JobRecord, JobStatistics, JobStatus};
pub use list::{JobList, JobListError, RetentionPolicy};
pub use queue::{JobQueue, QueueError};
