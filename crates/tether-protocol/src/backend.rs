//! Job backend: status probe, resumable stream open, abort

use crate::{
    error::{Error, Result},
    types::{AbortAck, AbortRequest, JobStatus},
};
use async_trait::async_trait;
use futures::StreamExt;
use std::pin::Pin;
use tokio_stream::Stream;

/// Raw byte chunks of an open event stream
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Calls the conversation controller makes against the generation backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Ask whether a generation job is running for the conversation
    async fn status(&self, conversation_id: &str) -> Result<JobStatus>;

    /// Open the job's event stream starting at `from_index`
    async fn open_stream(&self, conversation_id: &str, from_index: u64) -> Result<ByteStream>;

    /// Ask the backend to stop the running job
    async fn abort(&self, conversation_id: &str, request: AbortRequest) -> Result<AbortAck>;
}

/// HTTP implementation of [`Backend`]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpBackend {
    /// Create a backend client for the given base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::InvalidConfig(format!(
                "base URL must be http(s): {}",
                base_url
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: None,
        })
    }

    /// Send a bearer token with every request
    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    fn url(&self, conversation_id: &str, path: &str) -> String {
        format!("{}/conversations/{}/{}", self.base_url, conversation_id, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound);
        }
        let message = response.text().await.unwrap_or_default();
        Err(Error::status(status.as_u16(), message))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn status(&self, conversation_id: &str) -> Result<JobStatus> {
        let url = self.url(conversation_id, "status");
        tracing::debug!("Status probe: {}", url);

        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = match Self::check(response).await {
            Ok(r) => r,
            // No job record at all means nothing is streaming
            Err(Error::NotFound) => return Ok(JobStatus::default()),
            Err(e) => return Err(e),
        };
        Ok(response.json().await?)
    }

    async fn open_stream(&self, conversation_id: &str, from_index: u64) -> Result<ByteStream> {
        let url = self.url(conversation_id, "stream");
        tracing::debug!("Opening stream: {} from_index={}", url, from_index);

        let request = self
            .client
            .get(&url)
            .query(&[("from_index", from_index)])
            .header("accept", "text/event-stream");
        let response = Self::check(self.authorize(request).send().await?).await?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| Error::Transport(e.to_string())));
        Ok(Box::pin(bytes))
    }

    async fn abort(&self, conversation_id: &str, request: AbortRequest) -> Result<AbortAck> {
        let url = self.url(conversation_id, "abort");
        tracing::debug!("Abort: {} skip_sync={}", url, request.skip_sync);

        let response = self
            .authorize(self.client.post(&url).json(&request))
            .send()
            .await?;
        let response = Self::check(response).await?;
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(AbortAck {
                ok: true,
                message: None,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}
