//! The worker loop: pops jobs from the queue and drives the pull protocol.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use geopull_config::LayerConfig;
use geopull_database::DbGateway;
use geopull_jobs::{Job, JobQueue, JobStatus};

use crate::pull::pull_layer;

/// A long-running job executor. Each worker owns its own database gateway;
/// several workers may share one queue, though a single worker is the
/// typical configuration.
pub struct Worker {
    worker_id: usize,
    queue: Arc<JobQueue>,
    layers: Arc<BTreeMap<String, LayerConfig>>,
    gateway: DbGateway,
    reconnect_wait: Duration,
}

impl Worker {
    /// Creates a worker bound to the given queue and layer registry.
    #[must_use]
    pub const fn new(
        worker_id: usize,
        queue: Arc<JobQueue>,
        layers: Arc<BTreeMap<String, LayerConfig>>,
        gateway: DbGateway,
        reconnect_wait: Duration,
    ) -> Self {
        Self {
            worker_id,
            queue,
            layers,
            gateway,
            reconnect_wait,
        }
    }

    /// Runs until the queue signals shutdown. The in-flight job is always
    /// driven to a terminal state before the loop exits.
    pub async fn run(mut self) {
        log::debug!("Worker {} started", self.worker_id);

        while let Some(job) = self.queue.pop().await {
            log::debug!("Worker {} picked up job {}", self.worker_id, job.id());
            job.set_status(JobStatus::InProcess);

            self.ensure_connected(&job).await;

            let Some(layer) = self.layers.get(job.layer_name()) else {
                job.fail(format!("Layer \"{}\" is not configured", job.layer_name()));
                continue;
            };

            match pull_layer(&mut self.gateway, layer, &job).await {
                Ok(statistics) => {
                    log::info!(
                        "Job {} for layer \"{}\" finished: {} pulled, {} created, {} updated, {} deleted",
                        job.id(),
                        job.layer_name(),
                        statistics.pulled,
                        statistics.created,
                        statistics.updated,
                        statistics.deleted,
                    );
                    job.finish(statistics);
                }
                Err(e) => {
                    log::error!("Job {} for layer \"{}\" failed: {e}", job.id(), job.layer_name());
                    job.fail(e.to_string());
                }
            }
        }

        log::debug!("Worker {} shutting down", self.worker_id);
    }

    /// Blocks until the gateway holds a healthy connection, surfacing the
    /// wait on the job so clients polling the API can see why nothing is
    /// happening yet.
    async fn ensure_connected(&mut self, job: &Job) {
        let mut attempts: u64 = 0;
        while !self.gateway.reconnect().await {
            if attempts == 0 {
                job.set_message("Waiting to acquire a database connection");
            }
            attempts += 1;
            tokio::time::sleep(self.reconnect_wait).await;
        }
        if attempts > 0 {
            job.set_message("");
        }
    }
}
