use crate::dtos::HealthResponse;
use crate::services::metrics;
use crate::startup::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

pub async fn health_check(State(state): State<AppState>) -> Response {
    let store = match state.store.health_check().await {
        Ok(()) => "ok",
        Err(_) => "down",
    };

    let status = if store == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if store == "ok" { "ok" } else { "degraded" }.to_string(),
            service: "cash-application-service".to_string(),
            store: store.to_string(),
            erp_systems: state.erp.systems(),
        }),
    )
        .into_response()
}

pub async fn metrics_endpoint() -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::get_metrics(),
    )
        .into_response()
}
