//! HTTP handler functions for the job API.

use std::sync::Arc;

use actix_web::{HttpResponse, web};
use geopull_jobs::{Job, JobRecord, QueueError};
use serde::Deserialize;

use crate::AppState;

/// `GET /api/health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /api/v1/layers`
///
/// Lists the configured layers available for pulling.
pub async fn layers(state: web::Data<AppState>) -> HttpResponse {
    let layers: Vec<serde_json::Value> = state
        .settings
        .layers
        .iter()
        .map(|layer| {
            serde_json::json!({
                "name": layer.name,
                "description": layer.description,
                "targetTableSchema": layer.target_table_schema,
                "targetTableName": layer.target_table_name,
            })
        })
        .collect();

    HttpResponse::Ok().json(layers)
}

/// Request body for job submission.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    /// Name of the configured layer to pull.
    pub layer: String,
    /// Optional OGR attribute filter applied to the source layer.
    #[serde(default)]
    pub filter: Option<String>,
}

/// `POST /api/v1/jobs`
///
/// Registers a new pull job and hands it to the workers. The job is
/// visible in the job list before the response is written.
pub async fn create_job(
    state: web::Data<AppState>,
    body: web::Json<CreateJobRequest>,
) -> HttpResponse {
    let request = body.into_inner();

    if state.settings.layer(&request.layer).is_none() {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": format!("Unknown layer: {}", request.layer),
        }));
    }

    let filter = request.filter.filter(|f| !f.trim().is_empty());
    let job = Arc::new(Job::new(request.layer, filter));

    if let Err(e) = state.jobs.insert(Arc::clone(&job)) {
        log::error!("Failed to register job: {e}");
        return HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "Failed to register job",
        }));
    }

    if let Err(QueueError::Closed) = state.queue.push(Arc::clone(&job)) {
        return HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "error": "The server is shutting down",
        }));
    }

    log::info!("Queued job {} for layer \"{}\"", job.id(), job.layer_name());

    HttpResponse::Created().json(serde_json::json!({ "id": job.id() }))
}

/// `GET /api/v1/jobs/{id}`
pub async fn get_job(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    state.jobs.get(&path).map_or_else(
        || {
            HttpResponse::NotFound().json(serde_json::json!({
                "error": "No such job",
            }))
        },
        |job| HttpResponse::Ok().json(job.record()),
    )
}

/// `GET /api/v1/jobs`
///
/// Lists all retained jobs, most recent first.
pub async fn list_jobs(state: web::Data<AppState>) -> HttpResponse {
    let mut records: Vec<JobRecord> = state.jobs.jobs().iter().map(|job| job.record()).collect();
    records.reverse();

    HttpResponse::Ok().json(records)
}
