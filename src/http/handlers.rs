use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use log::warn;
use serde_derive::Serialize;
use serde_json::{json, Value};

use crate::data_structures::{ClientRequest, SyncRequest, SyncSummary, UpdatePropertiesRequest};
use crate::http::error::AppError;
use crate::http::{SharedContext, SERVICE_NAME};
use crate::interfaces::interface::UsageRecord;
use crate::properties::{self, PropertyUpdateReport};
use crate::state::ClientSyncState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    pub database: String,
    pub equipment_domain: String,
    pub exchange_connected: bool,
    pub exchange_tenant_id: Option<String>,
    pub last_sync: Option<ClientSyncState>,
}

/// First `X-Forwarded-For` entry, else the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers.get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn check_rate_limit(ctx: &SharedContext, headers: &HeaderMap,
                          connect_info: Option<ConnectInfo<SocketAddr>>) -> Result<(), AppError> {
    let ip = client_ip(headers, connect_info.map(|ConnectInfo(addr)| addr));
    if ctx.rate_limiter.check(&ip).await {
        Ok(())
    } else {
        warn!("Rate limited {}", ip);
        Err(AppError::too_many_requests())
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
    }))
}

pub async fn sync_to_exchange(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<Json<SyncSummary>, AppError> {
    check_rate_limit(&ctx, &headers, connect_info).await?;
    let Json(request) = body?;
    let summary = ctx.run_sync(&request).await?;
    Ok(Json(summary))
}

pub async fn status(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<ClientRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, AppError> {
    check_rate_limit(&ctx, &headers, connect_info).await?;
    let Json(request) = body?;
    let tenant = ctx.credentials.resolve(&request).await?;
    let exchange_tenant_id = tenant.exchange_tenant_id.clone().filter(|t| !t.trim().is_empty());

    Ok(Json(StatusResponse {
        success: true,
        database: tenant.fleet.database.clone(),
        equipment_domain: tenant.equipment_domain.clone(),
        exchange_connected: exchange_tenant_id.is_some(),
        exchange_tenant_id,
        last_sync: ctx.state.load_state(&tenant.client_key),
    }))
}

pub async fn update_device_properties(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<UpdatePropertiesRequest>, JsonRejection>,
) -> Result<Json<PropertyUpdateReport>, AppError> {
    check_rate_limit(&ctx, &headers, connect_info).await?;
    let Json(request) = body?;
    let start = Instant::now();
    let tenant = ctx.credentials.resolve(&request.client).await?;

    let fleet = ctx.sync.fleet().connect(&tenant.fleet).await?;
    let result = properties::update_device_properties(fleet.as_ref(), &request.device, &request.properties).await;

    let mut record = UsageRecord::new(&tenant.client_key, "update-device-properties", result.is_ok(),
                                      start.elapsed().as_millis() as u64);
    if let Err(e) = &result {
        record.error = Some(e.to_string());
    }
    ctx.usage.record(record).await;
    Ok(Json(result?))
}
