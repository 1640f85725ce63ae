//! HTTP API gateway for Coachflow.
//!
//! Lets webhooks, the lesson player, and checkout feed events into the
//! engine, and lets operators enroll, tag, and trigger ticks by hand.
//!
//! Built on Axum.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use coachflow_config::GatewayConfig;
use coachflow_engine::AutomationEngine;
use coachflow_sender::signature::{self, SIGNATURE_HEADER};

/// Request bodies larger than this are rejected.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared secret for inbound signature checks; `None` disables them.
#[derive(Clone, Default)]
struct SignatureKey(Option<Arc<str>>);

/// Build the full router: `/health` plus the signed `/v1` API.
pub fn build_router(engine: Arc<AutomationEngine>, shared_secret: Option<String>) -> Router {
    let api_state = Arc::new(api_v1::ApiV1State { engine });
    let key = SignatureKey(shared_secret.filter(|s| !s.is_empty()).map(Arc::from));

    let v1 = api_v1::v1_router(api_state)
        .layer(middleware::from_fn_with_state(key, signature_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", v1)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server. Runs until the listener fails.
pub async fn start(
    config: &GatewayConfig,
    engine: Arc<AutomationEngine>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.host, config.port);
    let app = build_router(engine, config.shared_secret.clone());

    info!(
        addr = %addr,
        signed = config.shared_secret.is_some(),
        "Gateway starting"
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Reject `/v1` requests whose body doesn't match `X-Coachflow-Signature`.
async fn signature_middleware(
    State(key): State<SignatureKey>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(secret) = key.0 else {
        return Ok(next.run(req).await);
    };

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE)?;

    let provided = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !signature::verify(&secret, &bytes, provided) {
        warn!(path = %parts.uri.path(), "Rejected request with missing or invalid signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
