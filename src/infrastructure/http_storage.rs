//! HTTP storage provider
//!
//! Talks to a chunked-upload HTTP endpoint: open a session, PUT chunks,
//! finalize. Chunk bodies carry a blake3 checksum header so the server can
//! reject corrupted transfers. Non-success responses are surfaced with
//! their status and any retry-after header so the classifier sees the full
//! signal.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    Client, Response,
    header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT},
};
use serde::Deserialize;
use url::Url;

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::repositories::{StorageProvider, UploadMeta, UploadResult, UploadSession};
use crate::infrastructure::config::StorageConfig;

pub struct HttpStorageProvider {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct InitializeResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct FinalizeResponse {
    remote_id: String,
    #[serde(default)]
    url: Option<String>,
}

impl HttpStorageProvider {
    pub fn new(config: &StorageConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_str(&config.user_agent)?);

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .default_headers(headers)
            .build()?;

        let base_url = Url::parse(&config.base_url)?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> DispatchResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| DispatchError::storage(format!("invalid storage endpoint {path}: {e}")))
    }

    /// Turn a non-success response into a storage error carrying status and
    /// retry-after.
    async fn error_from_response(response: Response) -> DispatchError {
        let status = response.status().as_u16();
        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            format!("storage request failed with status {status}")
        } else {
            format!("storage request failed with status {status}: {body}")
        };
        DispatchError::Storage {
            status: Some(status),
            message,
            retry_after_secs,
        }
    }
}

#[async_trait]
impl StorageProvider for HttpStorageProvider {
    async fn initialize_upload(&self, meta: UploadMeta) -> DispatchResult<UploadSession> {
        let url = self.endpoint("uploads")?;
        let filename = meta.filename.clone();
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({
                "filename": meta.filename,
                "mime_type": meta.mime_type,
                "file_size": meta.file_size,
                "metadata": meta.metadata,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let init: InitializeResponse = response.json().await?;
        tracing::debug!(session_id = %init.session_id, %filename, "upload session opened");
        Ok(UploadSession {
            session_id: init.session_id,
            filename,
        })
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        chunk: &[u8],
        index: u32,
        total: u32,
    ) -> DispatchResult<()> {
        let url = self.endpoint(&format!(
            "uploads/{}/chunks/{index}",
            session.session_id
        ))?;
        let checksum = blake3::hash(chunk).to_hex().to_string();

        let response = self
            .client
            .put(url)
            .header("x-chunk-total", total)
            .header("x-chunk-checksum", checksum)
            .body(chunk.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(())
    }

    async fn finalize_upload(&self, session: &UploadSession) -> DispatchResult<UploadResult> {
        let url = self.endpoint(&format!("uploads/{}/finalize", session.session_id))?;
        let response = self.client.post(url).send().await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let raw: serde_json::Value = response.json().await?;
        let parsed: FinalizeResponse = serde_json::from_value(raw.clone())
            .map_err(|e| DispatchError::storage(format!("malformed finalize response: {e}")))?;

        Ok(UploadResult {
            remote_id: parsed.remote_id,
            url: parsed.url,
            raw,
        })
    }
}
