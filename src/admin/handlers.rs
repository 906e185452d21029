use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::observability::metrics::EngineMetricsSnapshot;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub interceptors: usize,
    pub active_ws_connections: usize,
}

#[derive(Serialize)]
pub struct InterceptorStatus {
    pub name: String,
    pub order: i32,
    pub request: bool,
    pub ws_request: bool,
    pub response: bool,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        interceptors: state.engine.registry().len(),
        active_ws_connections: state.engine.ws_connection_metrics().active_total(),
    })
}

pub async fn get_metrics(State(state): State<AdminState>) -> Json<EngineMetricsSnapshot> {
    Json(state.engine.metrics_snapshot())
}

pub async fn get_interceptors(State(state): State<AdminState>) -> Json<Vec<InterceptorStatus>> {
    let statuses = state
        .engine
        .registry()
        .interceptors()
        .iter()
        .map(|holder| InterceptorStatus {
            name: holder.name.clone(),
            order: holder.order,
            request: holder.interceptor.on_request().is_some(),
            ws_request: holder.interceptor.on_ws_request().is_some(),
            response: holder.interceptor.on_response().is_some(),
        })
        .collect();
    Json(statuses)
}
