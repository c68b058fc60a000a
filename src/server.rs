// HTTP API for the gateway
//
// Routes:
// - POST /v1/nodes/{node}/vms/{vmid}/exec   run a command inside a VM
// - POST /v1/validate                       check a command without running it
// - GET  /v1/security                       rules in effect for a policy
// - GET  /metrics                           Prometheus scrape endpoint
// - GET  /health                            liveness
//
// Failures are answered with the JSON error report and a status derived from the
// error classification. Source chains stay in the logs.
//
// The /v1 routes run commands on guests. Without `[server].api_token` anyone who
// can reach the listener can use them, so the default bind is loopback.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, GatewayError};
use crate::exec::{ExecutionCoordinator, ExecutionRequest, ExecutionResult};
use crate::metrics::GatewayMetrics;
use crate::security::{SecurityInfo, SecurityPolicy};

/// Shared state behind every handler
pub struct AppState {
    pub coordinator: ExecutionCoordinator,
    pub metrics: GatewayMetrics,

    /// Cancelled on shutdown; in-flight executions stop waiting
    pub shutdown: CancellationToken,

    /// Bearer token required on /v1 routes
    pub api_token: Option<String>,
}

type SharedState = Arc<AppState>;

/// Error answered to HTTP clients
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

/// HTTP status for an error classification
pub fn status_for(kind: &ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Security { .. } => StatusCode::FORBIDDEN,
        ErrorKind::ResourceUnavailable { .. } => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        ErrorKind::Authentication
        | ErrorKind::Permission
        | ErrorKind::Transport
        | ErrorKind::Connection => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Tool => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0.kind);
        if status.is_server_error() {
            error!("{} failed: {}", self.0.operation, self.0);
        } else {
            warn!("{} rejected: {}", self.0.operation, self.0);
        }
        (status, Json(self.0.report())).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecBody {
    pub command: String,
}

#[derive(Debug, Serialize)]
pub struct ExecResponse {
    pub request_id: Uuid,
    #[serde(flatten)]
    pub result: ExecutionResult,
}

#[derive(Debug, Deserialize)]
pub struct ValidateBody {
    pub command: String,
    #[serde(default)]
    pub policy: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub policy: SecurityPolicy,
    pub sanitized: String,
}

#[derive(Debug, Deserialize)]
pub struct PolicyQuery {
    #[serde(default)]
    pub policy: Option<String>,
}

/// Build the API router
pub fn router(state: SharedState) -> Router {
    let api = Router::new()
        .route("/v1/nodes/{node}/vms/{vmid}/exec", post(execute))
        .route("/v1/validate", post(validate))
        .route("/v1/security", get(security))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_token));

    Router::new()
        .merge(api)
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled
pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let shutdown = state.shutdown.clone();
    if state.api_token.is_none() && !addr.ip().is_loopback() {
        warn!("Serving on {} without [server].api_token; /v1 routes are unauthenticated", addr);
    }
    let app = router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind gateway server on {}", addr))?;

    info!("Gateway API listening on {}", listener.local_addr().unwrap_or(addr));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Gateway server error")?;

    info!("Gateway API stopped");
    Ok(())
}

/// Reject /v1 requests without the configured bearer token
async fn require_api_token(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented == Some(expected) {
        return next.run(req).await;
    }

    warn!("Rejected {} {}: missing or invalid API token", req.method(), req.uri().path());
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({
            "error_type": ErrorKind::Authentication.error_type(),
            "message": "Missing or invalid API token",
        })),
    )
        .into_response()
}

/// Resolve an explicitly requested policy name
///
/// Unlike configuration, a request naming an unknown policy is rejected.
fn requested_policy(name: Option<&str>, fallback: SecurityPolicy) -> Result<SecurityPolicy, ApiError> {
    match name {
        None => Ok(fallback),
        Some(name) => name
            .parse()
            .map_err(|e: crate::security::UnknownPolicyError| {
                ApiError(GatewayError::invalid_input("policy", e.to_string()))
            }),
    }
}

async fn execute(
    State(state): State<SharedState>,
    Path((node, vmid)): Path<(String, String)>,
    Json(body): Json<ExecBody>,
) -> Result<Json<ExecResponse>, ApiError> {
    let request = ExecutionRequest::new(node, vmid, body.command)?;
    let cancel = state.shutdown.child_token();

    let result = state.coordinator.execute_request(&request, &cancel).await?;

    Ok(Json(ExecResponse {
        request_id: request.id,
        result,
    }))
}

async fn validate(
    State(state): State<SharedState>,
    Json(body): Json<ValidateBody>,
) -> Result<Json<ValidateResponse>, ApiError> {
    let default_validator = state.coordinator.validator();
    let policy = requested_policy(body.policy.as_deref(), default_validator.policy())?;
    let validator = default_validator.with_policy(policy);

    let validated = validator.validate(&body.command);
    state
        .metrics
        .record_validation(policy, validated.as_ref().err().map(|v| v.kind));

    let redact = state.coordinator.settings().redact_commands;
    let sanitized = validated.map_err(|v| ApiError(GatewayError::security(v, "validate_command", redact)))?;

    Ok(Json(ValidateResponse {
        valid: true,
        policy,
        sanitized,
    }))
}

async fn security(
    State(state): State<SharedState>,
    Query(query): Query<PolicyQuery>,
) -> Result<Json<SecurityInfo>, ApiError> {
    let default_validator = state.coordinator.validator();
    let policy = requested_policy(query.policy.as_deref(), default_validator.policy())?;
    Ok(Json(default_validator.with_policy(policy).security_info()))
}

async fn metrics_handler(State(state): State<SharedState>) -> Response {
    match state.metrics.gather() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
