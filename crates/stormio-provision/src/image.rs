use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ClientError;

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageDetail {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// The image-service operations the controller uses.
#[derive(Debug, Clone)]
pub struct ImageApi {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl ImageApi {
    pub fn new(http: reqwest::Client, base: String, token: String) -> Self {
        Self { http, base, token }
    }

    pub async fn list_images(&self) -> Result<Vec<Image>, ClientError> {
        #[derive(Deserialize)]
        struct Resp {
            images: Vec<Image>,
        }
        let url = format!("{}/images", self.base);
        let resp = self.http.get(&url).header("X-Auth-Token", &self.token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::UnexpectedStatus { url, status: status.as_u16(), body });
        }
        let parsed: Resp = resp.json().await?;
        Ok(parsed.images)
    }

    /// Upload a raw image, forwarding the caller's `x-image-meta-*` headers
    /// verbatim. I/O and transport failures are surfaced, never swallowed.
    pub async fn upload_image(
        &self,
        meta_headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<ImageDetail, ClientError> {
        let url = format!("{}/images", self.base);
        debug!(%url, bytes = body.len(), "uploading image");
        let mut req = self
            .http
            .post(&url)
            .header("X-Auth-Token", &self.token)
            .header("Content-Type", "application/octet-stream");
        for (name, value) in meta_headers {
            req = req.header(name, value);
        }
        let resp = req.body(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::UnexpectedStatus { url, status: status.as_u16(), body });
        }
        let v: Value = resp.json().await?;
        serde_json::from_value(v["image"].clone()).map_err(|e| ClientError::Other(e.to_string()))
    }
}
