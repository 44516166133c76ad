use crate::renew::{RenewService, RenewalOutcome};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shared state of the distribution endpoint.
#[derive(Clone)]
pub struct DistributionState {
    service: Arc<RenewService>,
    admin_token: Option<Arc<str>>,
    cancel: CancellationToken,
}

impl DistributionState {
    pub fn new(service: Arc<RenewService>, admin_token: Option<String>, cancel: CancellationToken) -> Self {
        Self {
            service,
            admin_token: admin_token.map(Arc::from),
            cancel,
        }
    }
}

/// Endpoints:
/// - GET  /cert    - the current bundle, 503 if there is none or it expired
/// - GET  /health  - liveness
/// - POST /renew   - run a renewal check now (only with an admin token configured)
pub fn router(state: DistributionState) -> Router {
    let mut router = Router::new()
        .route("/cert", get(get_certificate))
        .route("/health", get(health));
    if state.admin_token.is_some() {
        router = router.route("/renew", post(trigger_renewal));
    }
    router.with_state(state)
}

/// Serves `router(state)` on `listener` until `cancel` fires.
pub async fn serve(listener: TcpListener, state: DistributionState, cancel: CancellationToken) -> anyhow::Result<()> {
    if let Ok(address) = listener.local_addr() {
        info!("Distribution endpoint listening on http://{address}");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("Distribution endpoint stopped");
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn get_certificate(State(state): State<DistributionState>) -> Response {
    let domain = state.service.domain();
    match state.service.current_bundle().await {
        Ok(Some(bundle)) if bundle.is_expired(OffsetDateTime::now_utc()) => {
            warn!("Refusing to serve expired certificate for {domain} (expired {})", bundle.expires_at);
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("certificate for {domain} has expired"),
            )
        }
        Ok(Some(bundle)) => (StatusCode::OK, Json(bundle)).into_response(),
        Ok(None) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("no certificate for {domain} has been issued yet"),
        ),
        Err(e) => {
            error!("Reading certificate for {domain} failed: {e:#}");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "certificate store unavailable")
        }
    }
}

async fn health() -> Response {
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
    (StatusCode::OK, Json(json!({ "status": "ok", "timestamp": timestamp }))).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct RenewQuery {
    #[serde(default)]
    force: bool,
}

fn is_authorized(headers: &HeaderMap, admin_token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == admin_token)
}

async fn trigger_renewal(
    State(state): State<DistributionState>,
    headers: HeaderMap,
    Query(query): Query<RenewQuery>,
) -> Response {
    let Some(admin_token) = &state.admin_token else {
        return error_response(StatusCode::NOT_FOUND, "renewal trigger is disabled");
    };
    if !is_authorized(&headers, admin_token) {
        warn!("Rejected unauthorized renewal trigger");
        return error_response(StatusCode::UNAUTHORIZED, "missing or invalid bearer token");
    }

    info!("Renewal triggered over HTTP (force: {})", query.force);
    match state.service.check(query.force, &state.cancel).await {
        Ok(outcome) => {
            let status = match &outcome {
                RenewalOutcome::NotDue(_) | RenewalOutcome::Renewed(_) => StatusCode::OK,
                RenewalOutcome::AlreadyRunning => StatusCode::CONFLICT,
                RenewalOutcome::Failed(_) => StatusCode::BAD_GATEWAY,
            };
            (status, Json(outcome.report())).into_response()
        }
        Err(e) => {
            error!("Renewal check failed: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}
