//! External inference collaborator.
//!
//! OCR, translation, summarization and vision-based spread classification
//! all go through the single [`InferenceClient::infer`] call shape.

pub mod http;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::governor::CostGovernor;

pub use http::HttpInferenceClient;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Inference request failed: {0}")]
    Transport(String),

    #[error("Inference request timed out after {0}s")]
    Timeout(u64),

    #[error("Inference endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed inference response: {0}")]
    MalformedResponse(String),

    #[error("Spend limit reached (spent ${spent:.4} of ${ceiling:.4})")]
    BudgetExhausted { spent: f64, ceiling: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceTask {
    Ocr,
    Translate,
    Summarize,
    ClassifySpread,
}

impl fmt::Display for InferenceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceTask::Ocr => write!(f, "ocr"),
            InferenceTask::Translate => write!(f, "translate"),
            InferenceTask::Summarize => write!(f, "summarize"),
            InferenceTask::ClassifySpread => write!(f, "classify_spread"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InferenceInput {
    /// Image reference, either a URL or a `data:` URI.
    ImageUrl(String),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub task: InferenceTask,
    pub input: InferenceInput,
    /// Output of the previous page, for tasks that benefit from continuity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl InferenceRequest {
    pub fn new(task: InferenceTask, input: InferenceInput) -> Self {
        Self {
            task,
            input,
            context: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    #[serde(default)]
    pub text: String,
    /// Label for classification tasks (`"spread"` or `"single"`).
    #[serde(default)]
    pub classification: Option<String>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub model: String,
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError>;
}

/// Charges a governor before every call to the wrapped client and settles
/// the charge with the response's reported cost. A failed call keeps its
/// estimate.
///
/// Used for bring-your-own-key sessions, where each contributor gets a
/// governor of their own.
pub struct GovernedInference {
    inner: Arc<dyn InferenceClient>,
    governor: Arc<CostGovernor>,
    estimated_cost: f64,
}

impl GovernedInference {
    pub fn new(
        inner: Arc<dyn InferenceClient>,
        governor: Arc<CostGovernor>,
        estimated_cost: f64,
    ) -> Self {
        Self {
            inner,
            governor,
            estimated_cost,
        }
    }

    pub fn governor(&self) -> &Arc<CostGovernor> {
        &self.governor
    }
}

#[async_trait]
impl InferenceClient for GovernedInference {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let charge = self.governor.charge(self.estimated_cost);
        if !charge.allowed {
            return Err(InferenceError::BudgetExhausted {
                spent: charge.spent,
                ceiling: self.governor.ceiling(),
            });
        }
        let response = self.inner.infer(request).await?;
        self.governor.settle(self.estimated_cost, response.cost_usd);
        Ok(response)
    }
}
