//! fal.ai queue backend
//!
//! Implements "subscribe" semantics over the fal queue REST API: submit the job, poll its
//! status until it completes, then fetch the result payload.

use super::{DecompositionBackend, DecompositionRequest};
use crate::config::{BackendKind, RemoteConfig};
use crate::error::{LayerFlowError, Result};
use crate::services::ImageCodec;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};

/// Submission receipt returned by the queue
#[derive(Debug, Deserialize)]
struct QueueSubmission {
    request_id: String,
    #[serde(default)]
    status_url: Option<String>,
    #[serde(default)]
    response_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueStatus {
    status: String,
}

/// Remote decomposition through the fal.ai hosted model
#[derive(Debug, Clone)]
pub struct FalBackend {
    client: Client,
    config: RemoteConfig,
}

impl FalBackend {
    /// Create a backend for the given remote settings
    ///
    /// No request timeout is set; the client defaults apply.
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("layerflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LayerFlowError::network_error("Failed to create HTTP client", &e))?;

        Ok(Self { client, config })
    }

    /// Arguments sent to the hosted model
    #[must_use]
    pub fn build_arguments(image_data_uri: &str, num_layers: u32) -> Value {
        json!({
            "image_url": image_data_uri,
            "num_layers": num_layers,
            "output_format": "png",
            "acceleration": "high",
        })
    }

    /// Layer URLs from a result payload
    ///
    /// Accepts the payload either wrapped in a `data` key or bare. Entries that are not
    /// objects with a non-empty string `url` are skipped; order is preserved.
    #[must_use]
    pub fn extract_image_urls(payload: &Value) -> Vec<String> {
        let data = payload.get("data").unwrap_or(payload);

        data.get("images")
            .and_then(Value::as_array)
            .map(|images| {
                images
                    .iter()
                    .filter_map(|image| image.as_object()?.get("url")?.as_str())
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Submit a job and block until its result payload is available
    ///
    /// # Errors
    /// - `Auth` when no key is configured or the queue rejects it
    /// - `Network` for transport failures
    /// - `Backend` for non-success responses, failed jobs and malformed payloads
    pub async fn subscribe(&self, arguments: &Value) -> Result<Value> {
        let model_url = format!(
            "{}/{}",
            self.config.queue_url.trim_end_matches('/'),
            self.config.model_id.trim_matches('/')
        );

        let submission: QueueSubmission = parse_json(
            self.send(self.client.post(&model_url).json(arguments)).await?,
        )
        .await?;
        log::info!(
            "Submitted fal job {} to {}",
            submission.request_id,
            self.config.model_id
        );

        let request_url = format!("{model_url}/requests/{}", submission.request_id);
        let status_url = submission
            .status_url
            .unwrap_or_else(|| format!("{request_url}/status"));
        let response_url = submission.response_url.unwrap_or(request_url);

        loop {
            let status: QueueStatus =
                parse_json(self.send(self.client.get(&status_url)).await?).await?;

            match status.status.as_str() {
                "COMPLETED" => break,
                "IN_QUEUE" | "IN_PROGRESS" => {
                    log::debug!("fal job {} is {}", submission.request_id, status.status);
                    tokio::time::sleep(self.config.poll_interval).await;
                },
                other => {
                    return Err(LayerFlowError::backend(format!(
                        "fal job {} ended with status {other}",
                        submission.request_id
                    )));
                },
            }
        }

        parse_json(self.send(self.client.get(&response_url)).await?).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| LayerFlowError::auth("FAL_KEY is not set"))?;

        let response = request
            .header(reqwest::header::AUTHORIZATION, format!("Key {key}"))
            .send()
            .await
            .map_err(|e| LayerFlowError::network_error("fal request failed", &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(LayerFlowError::remote_status(status.as_u16(), body.trim()))
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let url = response.url().to_string();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| LayerFlowError::network_error("Failed to read fal response", &e))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| LayerFlowError::backend(format!("malformed payload from {url}: {e}")))
}

#[async_trait]
impl DecompositionBackend for FalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn decompose(&self, request: DecompositionRequest) -> Result<Vec<String>> {
        let image_data_uri = ImageCodec::bytes_to_data_uri(&request.image, &request.media_type);
        let arguments = Self::build_arguments(&image_data_uri, request.num_layers);

        let payload = self.subscribe(&arguments).await?;
        let urls = Self::extract_image_urls(&payload);
        log::info!("fal returned {} layer(s)", urls.len());
        Ok(urls)
    }
}
