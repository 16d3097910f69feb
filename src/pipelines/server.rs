//! HTTP front of the compute host. Each accepted request runs the whole
//! pipeline before the response is written.

use std::sync::Arc;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use log::{error, info, warn};
use tokio::net::TcpListener;
use crate::config::defs::{PipelineError, RunConfig, API_ROUTE};
use crate::config::manifest::{PipelineManifest, RunRequest};
use crate::pipelines::rna_seq::{build_pipeline, Pipeline, PipelineOutcome};
use crate::utils::dispatch::RunResponse;


pub struct ServerState {
    pub pipeline: Arc<Pipeline>,
    pub max_threads: usize,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(API_ROUTE, post(handle_run))
        .with_state(state)
}

async fn handle_run(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> (StatusCode, Json<RunResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Rejected run request: {}", rejection.body_text());
            return (StatusCode::BAD_REQUEST, Json(RunResponse::failed(rejection.body_text(), None, None)));
        }
    };

    let manifest = match PipelineManifest::from_request(&request, state.max_threads) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!("Rejected run {}: {}", request.file_name, e);
            return (StatusCode::BAD_REQUEST, Json(RunResponse::failed(e.to_string(), None, None)));
        }
    };
    info!("Accepted run {} ({} samples)", manifest.run_id, manifest.samples.len());

    // A panicking stage must not take the listener down with it
    let pipeline = state.pipeline.clone();
    let run_id = manifest.run_id.clone();
    let outcome = match tokio::spawn(async move { pipeline.run(manifest).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Run {} aborted: {}", run_id, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RunResponse::failed(format!("run aborted: {}", e), None, None)),
            );
        }
    };

    match outcome {
        PipelineOutcome::Completed { .. } => (
            StatusCode::OK,
            Json(RunResponse::completed(format!("run {} completed", run_id))),
        ),
        PipelineOutcome::Failed { stage, sample, reason, .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RunResponse::failed(reason, Some(stage), sample)),
        ),
    }
}


/// `serve` module entry point. Runs until the process is stopped.
pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let bind = config.args.bind.clone();
    let max_threads = config.threads;
    let pipeline = Arc::new(build_pipeline(config)?);
    let app = router(Arc::new(ServerState { pipeline, max_threads }));

    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|e| PipelineError::InvalidConfig(format!("cannot bind {}: {}", bind, e)))?;
    info!("Listening on {}{}", bind, API_ROUTE);
    axum::serve(listener, app)
        .await
        .map_err(|e| PipelineError::IOError(format!("server error: {}", e)))
}
