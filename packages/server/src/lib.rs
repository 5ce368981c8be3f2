#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server wiring the job API to the sync workers.
//!
//! HTTP handlers create jobs, register them in the shared [`JobList`], and
//! enqueue them; worker tasks pop jobs and execute the pull protocol.
//! Shutdown is cooperative: `ctrl-c` closes the queue, workers finish the
//! in-flight job (committing or rolling back), then the process exits.

mod handlers;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use geopull_config::{LayerConfig, Settings};
use geopull_database::DbGateway;
use geopull_jobs::{JobList, JobQueue, RetentionPolicy};
use geopull_sync::Worker;

/// Shared application state.
pub struct AppState {
    /// Validated server settings, including the layer registry.
    pub settings: Arc<Settings>,
    /// Registry of submitted jobs, shared with the workers.
    pub jobs: Arc<JobList>,
    /// Queue feeding the workers.
    pub queue: Arc<JobQueue>,
}

/// Interval between retention sweeps over the job list.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Starts the geopull server: workers, retention sweeper, and HTTP API.
///
/// Returns once the HTTP server has stopped and every worker has drained.
///
/// # Errors
///
/// Returns an `std::io::Result` error if the HTTP server fails to bind or
/// encounters a runtime error.
pub async fn run_server(settings: Settings) -> std::io::Result<()> {
    geopull_source::register_drivers();

    let settings = Arc::new(settings);
    let jobs = Arc::new(JobList::new(RetentionPolicy {
        max_finished_jobs: settings.sync.max_finished_jobs,
        max_finished_age: chrono::Duration::seconds(
            i64::try_from(settings.sync.finished_job_max_age_seconds).unwrap_or(i64::MAX),
        ),
    }));
    let queue = Arc::new(JobQueue::new());

    let layers: Arc<BTreeMap<String, LayerConfig>> = Arc::new(
        settings
            .layers
            .iter()
            .map(|layer| (layer.name.clone(), layer.clone()))
            .collect(),
    );
    log::info!("Serving {} configured layer(s)", layers.len());

    let reconnect_wait = Duration::from_millis(settings.database.reconnect_wait_ms);
    let num_workers = settings.sync.num_workers.max(1);

    let mut workers = Vec::with_capacity(num_workers);
    for worker_id in 0..num_workers {
        let worker = Worker::new(
            worker_id,
            Arc::clone(&queue),
            Arc::clone(&layers),
            DbGateway::new(settings.database.connection_string.clone()),
            reconnect_wait,
        );
        workers.push(tokio::spawn(worker.run()));
    }

    {
        let jobs = Arc::clone(&jobs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVICTION_INTERVAL);
            loop {
                interval.tick().await;
                jobs.evict();
            }
        });
    }

    let state = web::Data::new(AppState {
        settings: Arc::clone(&settings),
        jobs: Arc::clone(&jobs),
        queue: Arc::clone(&queue),
    });

    log::info!("Starting server on {}", settings.http.listen);

    let server = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .service(
                web::scope("/api")
                    .route("/health", web::get().to(handlers::health))
                    .service(
                        web::scope("/v1")
                            .route("/layers", web::get().to(handlers::layers))
                            .route("/jobs", web::post().to(handlers::create_job))
                            .route("/jobs", web::get().to(handlers::list_jobs))
                            .route("/jobs/{id}", web::get().to(handlers::get_job)),
                    ),
            )
    })
    .disable_signals()
    .bind(settings.http.listen.as_str())?
    .run();

    let server_handle = server.handle();
    {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("Shutdown signal received, draining the job queue");
                    queue.shutdown();
                    server_handle.stop(true).await;
                }
                Err(e) => log::error!("Failed to listen for the shutdown signal: {e}"),
            }
        });
    }

    let result = server.await;

    // covers the server stopping without a signal
    queue.shutdown();

    for (worker_id, handle) in workers.into_iter().enumerate() {
        if let Err(e) = handle.await {
            log::error!("Worker {worker_id} terminated abnormally: {e}");
        }
    }
    log::info!("All workers stopped");

    result
}
