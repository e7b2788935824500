//! HTTP control plane.
//!
//! | Method   | Path             | Action                                   |
//! |----------|------------------|------------------------------------------|
//! | `GET`    | `/`              | health check, lists operating bundles    |
//! | `GET`    | `/{slug}`        | bundle info                              |
//! | `POST`   | `/{slug}`        | deploy the zip archive in the body       |
//! | `POST`   | `/{slug}/calls`  | queue a call                             |
//! | `DELETE` | `/{slug}`        | delete, `?join=true` drains the queue    |
//!
//! Errors are returned as `{"error": "..."}`.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::bundle::BundleSource;
use crate::constants::MAX_BUNDLE_SIZE;
use crate::context::Orchestrator;
use crate::error::Error;
use crate::manager::BundleInfo;

/// An error rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::BundleNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidBundleName { .. } | Error::Archive(_) | Error::PathTraversal { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("API Error: {} - {}", self.status, self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CallBody {
    pub function: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub extras: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub join: bool,
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/", get(index))
        .route(
            "/{slug}",
            get(bundle_info).post(deploy).delete(delete_bundle),
        )
        .route("/{slug}/calls", post(enqueue_call))
        .layer(DefaultBodyLimit::max(MAX_BUNDLE_SIZE as usize))
        .with_state(orchestrator)
}

async fn index(State(orch): State<Arc<Orchestrator>>) -> Json<Value> {
    Json(json!({ "ok": true, "bundles": orch.manager().names() }))
}

async fn bundle_info(
    State(orch): State<Arc<Orchestrator>>,
    Path(slug): Path<String>,
) -> Result<Json<BundleInfo>, ApiError> {
    Ok(Json(orch.manager().bundle_info(&slug)?))
}

async fn deploy(
    State(orch): State<Arc<Orchestrator>>,
    Path(slug): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<BundleInfo>), ApiError> {
    if body.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "empty bundle archive"));
    }
    let info = orch
        .manager()
        .deploy(&slug, BundleSource::Bytes(body))
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn enqueue_call(
    State(orch): State<Arc<Orchestrator>>,
    Path(slug): Path<String>,
    Json(call): Json<CallBody>,
) -> Result<StatusCode, ApiError> {
    orch.manager()
        .call(&slug, &call.function, call.body, call.extras)?;
    Ok(StatusCode::ACCEPTED)
}

async fn delete_bundle(
    State(orch): State<Arc<Orchestrator>>,
    Path(slug): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<StatusCode, ApiError> {
    orch.manager().delete(&slug, params.join).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Serves the control plane until `shutdown` resolves.
pub async fn serve<F>(orchestrator: Arc<Orchestrator>, shutdown: F) -> crate::error::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = orchestrator.config().listen_addr.clone();
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Control plane listening");
    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
