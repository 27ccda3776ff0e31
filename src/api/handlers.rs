//! API endpoint handlers.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{error, info};

use super::{ApiError, ApiState};
use crate::alert::Alert;
use crate::filter::{new_filter, valid_id};
use crate::params::PluginParams;
use crate::transport::new_transport;

type ApiResult<T> = Result<T, ApiError>;

pub async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub async fn get_alerts(State(state): State<ApiState>) -> Json<Vec<Alert>> {
    Json(state.dispatcher.peek())
}

pub async fn post_alert(
    State(state): State<ApiState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(mut alert): Json<Alert>,
) -> ApiResult<StatusCode> {
    alert
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    if alert.has_default_date() {
        alert.date = Utc::now();
    }
    if alert.host.is_empty() {
        if let Some(ConnectInfo(addr)) = peer {
            alert.host = addr.ip().to_string();
        }
    }

    // Ingress sanitization: routing decisions belong to the pipeline.
    alert.routes.clear();
    alert.sub.clear();

    info!(from = %alert.from, title = %alert.title, "new alert");
    state.dispatcher.post(alert);
    Ok(StatusCode::OK)
}

pub async fn list_filters(State(state): State<ApiState>) -> Json<Vec<String>> {
    let ids = state
        .pipeline
        .filters()
        .iter()
        .map(|f| f.id().to_string())
        .collect();
    Json(ids)
}

fn checked_id(id: &str) -> ApiResult<()> {
    if valid_id(id) {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!("invalid id: {id}")))
    }
}

pub async fn show_filter(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PluginParams>> {
    checked_id(&id)?;
    let filter = state.pipeline.get_filter(&id).ok_or_else(ApiError::not_found)?;
    Ok(Json(filter.params()))
}

pub async fn update_filter(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(params): Json<PluginParams>,
) -> ApiResult<StatusCode> {
    checked_id(&id)?;

    let filter = new_filter(&params.kind, &id, &params.params).map_err(|e| {
        error!(filter = %id, error = %e, "failed to create a new filter");
        ApiError::internal(e.to_string())
    })?;

    state.pipeline.put_filter(filter);
    Ok(StatusCode::OK)
}

pub async fn delete_filter(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    checked_id(&id)?;
    state
        .pipeline
        .remove_filter(&id)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(StatusCode::OK)
}

pub async fn enable_filter(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    checked_id(&id)?;
    let filter = state.pipeline.get_filter(&id).ok_or_else(ApiError::not_found)?;
    filter.enable(true);
    Ok(StatusCode::OK)
}

pub async fn disable_filter(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    checked_id(&id)?;
    let filter = state.pipeline.get_filter(&id).ok_or_else(ApiError::not_found)?;
    filter.enable(false);
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct InactivateBody {
    pub until: DateTime<Utc>,
}

pub async fn inactivate_filter(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<InactivateBody>,
) -> ApiResult<StatusCode> {
    checked_id(&id)?;
    let filter = state.pipeline.get_filter(&id).ok_or_else(ApiError::not_found)?;
    filter.inactivate(body.until);
    Ok(StatusCode::OK)
}

pub async fn list_routes(State(state): State<ApiState>) -> Json<Vec<String>> {
    Json(state.pipeline.route_ids())
}

pub async fn show_route(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<PluginParams>>> {
    checked_id(&id)?;
    let route = state.pipeline.get_route(&id).ok_or_else(ApiError::not_found)?;
    Ok(Json(route.iter().map(|t| t.params()).collect()))
}

pub async fn update_route(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(params): Json<Vec<PluginParams>>,
) -> ApiResult<impl IntoResponse> {
    checked_id(&id)?;

    let mut transports = Vec::with_capacity(params.len());
    for p in &params {
        let t = new_transport(&p.kind, &p.params).map_err(|e| {
            error!(route = %id, error = %e, "failed to create a new transport");
            ApiError::internal(e.to_string())
        })?;
        transports.push(t);
    }

    state
        .pipeline
        .put_route(&id, transports)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(StatusCode::OK)
}
