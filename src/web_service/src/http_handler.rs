//! `GET /health` liveness surface (§6). Reflects the proxy's admission-control toggle: 200 while
//! the server is accepting connections, 503 once it has flipped unhealthy (max connections
//! reached, or shutting down). Every other path is a 404.

use crate::http_server::HealthAppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

pub async fn health(State(state): State<HealthAppState>) -> impl IntoResponse {
    let snapshot = state.health.read().unwrap().clone();
    if snapshot.healthy {
        (StatusCode::OK, Json(HealthBody { status: "ok", reason: None }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthBody {
                status: "unhealthy",
                reason: snapshot.reason,
            }),
        )
    }
}

#[derive(Serialize)]
struct NotFoundBody {
    status: &'static str,
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundBody { status: "not found" }),
    )
}
