//! HTTP API Server
//!
//! Exposes the replication dispatcher at `POST /_api/replication`, plus
//! health and state routes for operators.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response as HttpResponse},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::cluster::ServerRole;
use crate::config::ApiConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::replication::{Operation, OperationError, ReplicationHandler};
use crate::wal::Tick;

/// HTTP status for an error code
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Expired | ErrorCode::DataUnavailable => StatusCode::GONE,
        ErrorCode::LockConflict | ErrorCode::AlreadyExists => StatusCode::CONFLICT,
        ErrorCode::WrongServerRole => StatusCode::MISDIRECTED_REQUEST,
        ErrorCode::NotReplicationCapable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::MalformedInput => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for OperationError {
    fn into_response(self) -> HttpResponse {
        (status_for(self.code()), Json(self.body())).into_response()
    }
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    handler: Arc<ReplicationHandler>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, handler: Arc<ReplicationHandler>) -> Self {
        Self { config, handler }
    }

    /// Create the router
    pub fn router(handler: Arc<ReplicationHandler>, cors_enabled: bool) -> Router {
        let app = Router::new()
            .route("/_api/replication", post(handle_operation))
            .route("/_api/replication/state", get(handle_state))
            .route("/_api/health", get(handle_health))
            .with_state(handler)
            .layer(TraceLayer::new_for_http());

        if cors_enabled {
            app.layer(CorsLayer::permissive())
        } else {
            app
        }
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::router(Arc::clone(&self.handler), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub server_id: String,
    pub role: ServerRole,
    pub tick: Tick,
}

async fn handle_operation(
    State(handler): State<Arc<ReplicationHandler>>,
    request: std::result::Result<Json<Operation>, JsonRejection>,
) -> HttpResponse {
    let operation = match request {
        Ok(Json(operation)) => operation,
        Err(rejection) => {
            return OperationError::new("unknown", Error::malformed(rejection.body_text()))
                .into_response();
        }
    };

    match handler.handle(operation).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_state(State(handler): State<Arc<ReplicationHandler>>) -> HttpResponse {
    match handler.handle(Operation::GetState { database: None }).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_health(State(handler): State<Arc<ReplicationHandler>>) -> impl IntoResponse {
    let identity = handler.identity();
    Json(HealthResponse {
        healthy: handler.engine().ensure_serving().is_ok(),
        server_id: identity.id.clone(),
        role: identity.role,
        tick: handler.engine().last_tick(),
    })
}
