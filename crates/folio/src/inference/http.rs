//! JSON-over-HTTP inference client.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{InferenceClient, InferenceError, InferenceRequest, InferenceResponse};
use crate::sanitize;

/// Posts [`InferenceRequest`]s as JSON to a single endpoint.
///
/// A timeout surfaces as [`InferenceError::Timeout`], which callers treat as
/// an ordinary per-item failure.
pub struct HttpInferenceClient {
    client: reqwest::Client,
    endpoint: String,
    model: Option<String>,
    api_key: Option<SecretString>,
    timeout_secs: u64,
}

impl HttpInferenceClient {
    pub fn new(
        endpoint: &str,
        model: Option<String>,
        api_key: Option<SecretString>,
        timeout_secs: u64,
    ) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("folio/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            model,
            api_key,
            timeout_secs,
        })
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn infer(&self, mut request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        tracing::debug!(
            task = %request.task,
            endpoint = %sanitize::redact_url(&self.endpoint),
            "inference request"
        );

        if let Some(model) = &self.model {
            request.params.entry("model".to_string()).or_insert_with(|| model.clone());
        }

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout(self.timeout_secs)
            } else {
                InferenceError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        response
            .json::<InferenceResponse>()
            .await
            .map_err(|e| InferenceError::MalformedResponse(e.to_string()))
    }
}
