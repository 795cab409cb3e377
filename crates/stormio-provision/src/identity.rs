use serde::Deserialize;
use serde_json::json;
use stormio_domain::AssetProvider;
use tracing::debug;

use crate::error::ClientError;

/// Public endpoints resolved for one tenant, after applying any per-service
/// overrides from the [`AssetProvider`].
#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub compute: String,
    pub image: String,
    pub network: Option<String>,
}

/// Result of a successful userpass authentication.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub endpoints: ServiceEndpoints,
}

#[derive(Debug, Deserialize)]
struct TokensResponse {
    access: Access,
}

#[derive(Debug, Deserialize)]
struct Access {
    token: Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct Token {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    #[serde(rename = "publicURL", default)]
    public_url: String,
    #[serde(default)]
    region: String,
}

/// Authenticate with userpass credentials and resolve the public endpoints
/// for the services the controller drives.
pub async fn authenticate(
    http: &reqwest::Client,
    provider: &AssetProvider,
) -> Result<Session, ClientError> {
    let url = format!("{}/tokens", provider.endpoint_url.trim_end_matches('/'));
    let body = json!({
        "auth": {
            "passwordCredentials": {
                "username": provider.username,
                "password": provider.password,
            },
            "tenantName": provider.tenant,
        }
    });

    debug!(%url, tenant = %provider.tenant, "authenticating with the identity service");
    let resp = http.post(&url).json(&body).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::UnexpectedStatus { url, status: status.as_u16(), body });
    }
    let tokens: TokensResponse = resp.json().await?;

    let catalog_url = |service: &str| -> Option<String> {
        tokens
            .access
            .service_catalog
            .iter()
            .filter(|e| e.service_type == service)
            .flat_map(|e| e.endpoints.iter())
            .find(|ep| {
                provider.region_name.is_empty() || ep.region == provider.region_name
            })
            .map(|ep| ep.public_url.trim_end_matches('/').to_string())
    };

    let mut compute = catalog_url("compute");
    let mut image = catalog_url("image");
    let mut network = catalog_url("network");

    // Per-service overrides only apply as a coherent set: either the full
    // image/identity/compute triple, or a network/storage endpoint.
    let triple = !provider.image.is_empty()
        && !provider.identity.is_empty()
        && !provider.compute.is_empty();
    if triple || !provider.neutron.is_empty() || !provider.storage.is_empty() {
        if !provider.compute.is_empty() {
            compute = Some(provider.compute.trim_end_matches('/').to_string());
        }
        if !provider.image.is_empty() {
            image = Some(provider.image.trim_end_matches('/').to_string());
        }
        if !provider.neutron.is_empty() {
            network = Some(provider.neutron.trim_end_matches('/').to_string());
        }
    }

    let compute = compute.ok_or(ClientError::MissingService("compute"))?;
    // Plenty of small deployments expose images through the compute API only.
    let image = image.unwrap_or_else(|| compute.clone());

    Ok(Session {
        token: tokens.access.token.id,
        endpoints: ServiceEndpoints { compute, image, network },
    })
}
