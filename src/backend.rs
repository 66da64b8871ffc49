//! Backend endpoints consumed by the session.
//!
//! [`Backend`] is the seam between the engine and the network. [`HttpBackend`]
//! is the reqwest implementation; tests substitute scripted backends.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::wire::{parse_history, History, RollbackResponse, SendRequest, StopResponse};

/// Raw body of a streaming response.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Start a conversation turn; the response body is the patch stream.
    async fn start_conversation(&self, request: &SendRequest) -> Result<ByteStream>;

    /// Resume the stream of a message left incomplete.
    async fn continue_incomplete(&self, message_id: &str) -> Result<ByteStream>;

    async fn stop(&self) -> Result<StopResponse>;

    async fn rollback_to(&self, message_id: &str) -> Result<RollbackResponse>;

    /// Ordered history plus the id of the incomplete message, if any.
    async fn fetch_history(&self) -> Result<History>;
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    config: Config,
}

impl HttpBackend {
    pub fn new(config: &Config) -> Result<Self> {
        // No client-wide timeout: it would also cut long-lived streams.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build http client: {e}")))?;
        Ok(HttpBackend {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config: config.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn open_stream(&self, request: RequestBuilder, url: String) -> Result<ByteStream> {
        let response = request
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| SyncError::transport(&url, e))?;
        let response = check_status(response, &url).await?;
        info!(url = %url, "stream opened");
        let stream_url = url.clone();
        Ok(response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| SyncError::transport(&stream_url, e)))
            .boxed())
    }

    async fn call_json<T: DeserializeOwned>(&self, request: RequestBuilder, url: String) -> Result<T> {
        let response = request
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|e| SyncError::transport(&url, e))?;
        let response = check_status(response, &url).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| SyncError::transport(&url, e))?;
        debug!(url = %url, bytes = body.len(), "response received");
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn start_conversation(&self, request: &SendRequest) -> Result<ByteStream> {
        let url = self.url("/agents/messages");
        self.open_stream(self.client.post(&url).json(request), url).await
    }

    async fn continue_incomplete(&self, message_id: &str) -> Result<ByteStream> {
        let url = self.url(&format!("/agents/messages/continue/{message_id}"));
        self.open_stream(self.client.get(&url), url).await
    }

    async fn stop(&self) -> Result<StopResponse> {
        let url = self.url("/agents/messages/stop");
        self.call_json(self.client.post(&url), url).await
    }

    async fn rollback_to(&self, message_id: &str) -> Result<RollbackResponse> {
        let url = self.url(&format!("/agents/messages/rollback-to/{message_id}"));
        let response: RollbackResponse = self.call_json(self.client.post(&url), url.clone()).await?;
        if !response.success {
            return Err(SyncError::Backend {
                status: 200,
                url,
                detail: response.message,
            });
        }
        Ok(response)
    }

    async fn fetch_history(&self) -> Result<History> {
        let url = self.url("/projects/current/full-data");
        let response = self
            .client
            .get(&url)
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|e| SyncError::transport(&url, e))?;
        let response = check_status(response, &url).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| SyncError::transport(&url, e))?;
        parse_history(&body).map_err(|detail| SyncError::Backend {
            status: 200,
            url,
            detail,
        })
    }
}

/// Turn a non-2xx response into [`SyncError::Backend`], preferring the
/// server's `detail` field when the body is JSON.
async fn check_status(response: Response, url: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or(text);
    Err(SyncError::Backend {
        status: status.as_u16(),
        url: url.to_string(),
        detail,
    })
}
