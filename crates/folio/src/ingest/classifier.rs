//! Spread/single decision for a decoded scan.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::DynamicImage;

use crate::analysis::{Confidence, SplitAnalysis, SplitDetector};
use crate::inference::{InferenceClient, InferenceInput, InferenceRequest, InferenceTask};

/// One decoded image plus the bytes it came from.
#[derive(Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub name: &'a str,
    pub image: &'a DynamicImage,
    pub bytes: &'a [u8],
    pub content_type: &'a str,
}

/// Decides whether an image is a two-page spread.
///
/// Implementations never fail: when a remote opinion is unavailable they
/// fall back to the local detector.
#[async_trait]
pub trait SpreadClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Estimated spend per call, charged to the governor by batch callers.
    fn estimated_cost(&self) -> f64 {
        0.0
    }

    async fn classify(&self, input: ClassifyInput<'_>) -> SplitAnalysis;
}

/// Runs the split detector in-process. Free.
pub struct DetectorClassifier {
    detector: Arc<SplitDetector>,
}

impl DetectorClassifier {
    pub fn new(detector: Arc<SplitDetector>) -> Self {
        Self { detector }
    }
}

#[async_trait]
impl SpreadClassifier for DetectorClassifier {
    fn name(&self) -> &'static str {
        "detector"
    }

    async fn classify(&self, input: ClassifyInput<'_>) -> SplitAnalysis {
        self.detector.classify(input.image)
    }
}

/// Asks the inference service whether the image is a spread. The cut
/// position always comes from the local detector.
pub struct VisionClassifier {
    client: Arc<dyn InferenceClient>,
    detector: Arc<SplitDetector>,
    estimated_cost: f64,
}

impl VisionClassifier {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        detector: Arc<SplitDetector>,
        estimated_cost: f64,
    ) -> Self {
        Self {
            client,
            detector,
            estimated_cost,
        }
    }
}

pub fn data_uri(content_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", content_type, STANDARD.encode(bytes))
}

/// Overrides the local verdict with the remote one. Agreement keeps at
/// least medium confidence; disagreement drops to low for human review.
fn merge_verdict(local: SplitAnalysis, remote_is_spread: bool) -> SplitAnalysis {
    let confidence = if local.is_spread == remote_is_spread {
        local.confidence.max(Confidence::Medium)
    } else {
        Confidence::Low
    };
    SplitAnalysis {
        is_spread: remote_is_spread,
        confidence,
        ..local
    }
}

#[async_trait]
impl SpreadClassifier for VisionClassifier {
    fn name(&self) -> &'static str {
        "vision"
    }

    fn estimated_cost(&self) -> f64 {
        self.estimated_cost
    }

    async fn classify(&self, input: ClassifyInput<'_>) -> SplitAnalysis {
        let local = self.detector.classify(input.image);
        let request = InferenceRequest::new(
            InferenceTask::ClassifySpread,
            InferenceInput::ImageUrl(data_uri(input.content_type, input.bytes)),
        );

        match self.client.infer(request).await {
            Ok(response) => match response.classification.as_deref() {
                Some("spread") => merge_verdict(local, true),
                Some("single") => merge_verdict(local, false),
                other => {
                    tracing::warn!(image = input.name, label = ?other, "unrecognized spread label");
                    local
                }
            },
            Err(e) => {
                tracing::warn!(image = input.name, error = %e, "vision classification failed, using detector");
                local
            }
        }
    }
}
