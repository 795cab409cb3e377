use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stormio_domain::{new_uuid, AssetProvider, AssetRequest, RequestStatus};
use stormio_store::AssetFilter;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

// ── Assets ────────────────────────────────────────────────────────────────────

pub async fn create_asset(
    State(state): State<AppState>,
    Json(mut asset): Json<AssetRequest>,
) -> Result<(StatusCode, Json<AssetRequest>), ApiError> {
    asset.id = new_uuid();
    asset.received_on = chrono::Utc::now().to_rfc3339();
    asset.status = RequestStatus::New;
    asset.model_id = asset.model.id.clone();
    debug!(areq = %asset.id, res = %asset.resource_id, "asset request received");

    if !asset.provider.is_empty() {
        state
            .cache
            .get(&asset.provider)
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;

        if asset.attach_fip {
            match state.provisioner.check_fip_availability(&asset).await {
                Ok(count) if count > 0 => {
                    debug!(areq = %asset.id, count, "floating ips still available")
                }
                _ => {
                    debug!(areq = %asset.id, "no fip available, sending 412 to the caller");
                    return Err(ApiError::precondition_failed("No FIP available"));
                }
            }
        }
    }

    if asset.notify.url.is_empty() {
        return Err(ApiError::precondition_failed("No Notify callback URL present"));
    }
    if asset.agent_id.is_empty() {
        return Err(ApiError::precondition_failed("No agentId present in the request"));
    }
    if asset.host_name.is_empty() {
        asset.host_name = asset.model.name.clone();
    }
    if asset.provider.has_network_service() {
        if asset.model.networks.is_empty() {
            return Err(ApiError::precondition_failed("No Networks present in the request"));
        }
        for network in &asset.model.networks {
            if network.get("uuid").map_or(true, |uuid| uuid.is_empty()) {
                return Err(ApiError::precondition_failed("No Networks present in the request"));
            }
        }
    }

    state.store.create(&asset).await?;
    debug!(areq = %asset.id, "asset request created in the store, passing to the scheduler");
    state
        .provisioner
        .c_request
        .send(asset.clone())
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok((StatusCode::ACCEPTED, Json(asset)))
}

#[derive(Debug, Deserialize)]
pub struct AssetDestroy {
    pub id: String,
}

pub async fn destroy_asset(
    State(state): State<AppState>,
    Json(body): Json<AssetDestroy>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    debug!(areq = %body.id, "delete request received");
    let asset = state
        .store
        .find(&AssetFilter::ById(body.id.clone()))
        .await
        .map_err(|_| ApiError::not_found("Asset not found / already deleted"))?;

    state
        .provisioner
        .del_notification
        .send(asset)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": format!("Asset {} delete request accepted", body.id) })),
    ))
}

pub async fn retrieve_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AssetRequest>, ApiError> {
    let asset = state
        .store
        .find(&AssetFilter::ById(id.clone()))
        .await
        .map_err(|_| ApiError::not_found(format!("asset '{id}' not found")))?;
    Ok(Json(asset))
}

// ── Resource status ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ModuleProgress {
    #[serde(rename = "Installed")]
    installed: bool,
    #[serde(rename = "Configured")]
    configured: bool,
}

pub async fn resource_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let ar = state
        .store
        .find(&AssetFilter::ByResourceId(id))
        .await
        .map_err(|_| ApiError::not_found("Resource not found"))?;

    let mut module_status: HashMap<String, ModuleProgress> = HashMap::new();
    let mut mpercent = 0;
    let increment = if ar.modules.is_empty() { 0 } else { 30 / ar.modules.len() as i32 };
    for module in &ar.modules {
        module_status.insert(
            module.name.clone(),
            ModuleProgress { installed: module.installed, configured: module.configured },
        );
        if module.installed {
            mpercent += increment;
        }
        if module.configured {
            mpercent += increment;
        }
    }

    let percentage = match ar.status {
        RequestStatus::New => 0,
        RequestStatus::Build => 10,
        RequestStatus::ServerCreated
        | RequestStatus::RetryModuleInstall
        | RequestStatus::RetryModuleConfig
        | RequestStatus::Retry
        | RequestStatus::ServiceProvision => 40 + mpercent,
        RequestStatus::Fulfilled => 100,
        _ => 0,
    };

    Ok(Json(json!({
        "percentage": percentage,
        "status": ar.status,
        "moduleStatus": module_status,
    })))
}

// ── Asset provider ────────────────────────────────────────────────────────────

/// `Authorization` carries base64-encoded JSON credentials on the
/// assetprovider endpoints.
fn extract_asset_provider(headers: &HeaderMap) -> Result<AssetProvider, ApiError> {
    let encoded = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_gateway("missing Authorization header"))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ApiError::bad_gateway(format!("invalid Authorization header: {e}")))?;
    serde_json::from_slice(&decoded)
        .map_err(|e| ApiError::bad_gateway(format!("invalid asset provider: {e}")))
}

pub async fn list_images(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let provider = extract_asset_provider(&headers)?;
    let svc = state
        .cache
        .get(&provider)
        .await
        .map_err(|e| ApiError::bad_gateway(e.to_string()))?;
    let images = svc
        .list_image_names()
        .await
        .map_err(|e| ApiError::bad_gateway(e.to_string()))?;
    Ok(Json(json!(images)))
}

pub async fn list_flavors(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let provider = extract_asset_provider(&headers)?;
    let svc = state
        .cache
        .get(&provider)
        .await
        .map_err(|e| ApiError::bad_gateway(e.to_string()))?;
    let flavors = svc
        .list_flavor_names()
        .await
        .map_err(|e| ApiError::bad_gateway(e.to_string()))?;
    Ok(Json(json!(flavors)))
}

pub async fn upload_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let provider = extract_asset_provider(&headers)?;
    let svc = state
        .cache
        .get(&provider)
        .await
        .map_err(|e| ApiError::bad_gateway(e.to_string()))?;

    let meta_headers: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| name.as_str().to_lowercase().starts_with("x-image-meta"))
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

    debug!(bytes = body.len(), "uploading image, delegating to the provisioner");
    let detail = svc
        .upload_image(&meta_headers, body.to_vec())
        .await
        .map_err(|e| ApiError::internal(format!("unable to upload the image: {e}")))?;
    Ok(Json(json!(detail)))
}
