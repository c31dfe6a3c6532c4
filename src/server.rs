//! HTTP façade over the dispatcher.
//!
//! - `POST /run` takes a JSON [`TaskRequest`] and answers with the
//!   [`OperationResult`] JSON; the status code reflects the error kind.
//! - `GET /read?path=...` returns the bytes of a file under the root.
//!
//! Transport only: no operation logic lives here.

use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, OperationError};
use crate::operations::dispatcher::Dispatcher;
use crate::operations::{OperationResult, TaskRequest};
use crate::sandbox::Sandbox;

#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    sandbox: Arc<Sandbox>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, sandbox: Arc<Sandbox>) -> Self {
        Self {
            dispatcher,
            sandbox,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadParams {
    path: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(run_task))
        .route("/read", get(read_file))
        .with_state(state)
}

/// Serves `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Server stopped");
    Ok(())
}

fn status_for(result: &OperationResult) -> StatusCode {
    if result.is_success() {
        return StatusCode::OK;
    }
    match result.error {
        Some(ErrorKind::InvalidParameters | ErrorKind::UnsupportedOperation) => {
            StatusCode::BAD_REQUEST
        }
        Some(ErrorKind::OutOfBoundsPath) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn run_task(
    State(state): State<AppState>,
    body: Result<Json<TaskRequest>, JsonRejection>,
) -> (StatusCode, Json<OperationResult>) {
    let result = match body {
        Ok(Json(request)) => state.dispatcher.dispatch(&request).await,
        Err(rejection) => {
            warn!("Malformed task request: {rejection}");
            OperationResult::failure(&OperationError::InvalidParameters(format!(
                "malformed task request: {}",
                rejection.body_text()
            )))
        }
    };
    (status_for(&result), Json(result))
}

async fn read_file(State(state): State<AppState>, Query(params): Query<ReadParams>) -> Response {
    let path = match state.sandbox.confine(&params.path) {
        Ok(path) => path,
        Err(e) => {
            warn!("Read rejected: {e}");
            let status = match e {
                OperationError::OutOfBoundsPath { .. } => StatusCode::FORBIDDEN,
                _ => StatusCode::BAD_REQUEST,
            };
            return (status, e.to_string()).into_response();
        }
    };

    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return (StatusCode::NOT_FOUND, "not found").into_response(),
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            debug!("Read {} ({} bytes)", path.display(), bytes.len());
            (StatusCode::OK, bytes).into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
