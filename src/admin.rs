//! Admin status surface: health probe and a JSON snapshot of the registry,
//! optionally behind basic auth.
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use eyre::Result;
use tokio::net::TcpListener;

use crate::{config::models::StatusConfig, core::RouteRegistry, metrics};

#[derive(Clone)]
struct AdminState {
    registry: Arc<RouteRegistry>,
    status: StatusConfig,
}

pub fn app(registry: Arc<RouteRegistry>, status: StatusConfig) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/routes", get(routes))
        .with_state(AdminState { registry, status })
}

pub async fn serve(listener: TcpListener, registry: Arc<RouteRegistry>, status: StatusConfig) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "admin endpoint listening");
    axum::serve(listener, app(registry, status)).await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn routes(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if !authorized(&state.status, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"trellis\"")],
            "401 Unauthorized\n",
        )
            .into_response();
    }

    metrics::record_registry_size(state.registry.num_uris(), state.registry.num_endpoints());
    Json(state.registry.to_json()).into_response()
}

fn authorized(status: &StatusConfig, headers: &HeaderMap) -> bool {
    if status.user.is_empty() {
        return true;
    }

    let expected = STANDARD.encode(format!("{}:{}", status.user, status.pass));
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .map(|credentials| credentials == expected)
        .unwrap_or(false)
}
