//! Synthetic scans and a scripted inference service.

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use tokio_util::sync::CancellationToken;

use folio::inference::{
    InferenceClient, InferenceError, InferenceInput, InferenceRequest, InferenceResponse,
    InferenceTask,
};

/// White two-page spread with a cosine-shaped gutter of `depth` at `at`
/// (fraction of the width).
pub fn spread_image(width: u32, height: u32, depth: f32, at: f32) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, _| {
        let offset = x as f32 / width as f32 - at;
        let dip = if offset.abs() < 0.1 {
            0.5 * (1.0 + (std::f32::consts::PI * offset / 0.1).cos())
        } else {
            0.0
        };
        Luma([(220.0 * (1.0 - depth * dip)) as u8])
    }))
}

/// Flat portrait page.
pub fn single_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([200])))
}

pub fn png_bytes(image: &DynamicImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .expect("encode png");
    buf.into_inner()
}

/// Remote-looking page URLs. OCR passes these straight to the inference
/// service, which makes per-page scripting easy.
pub fn remote_page_url(n: usize) -> String {
    format!("https://scans.example.org/codex/{:04}.jpg", n)
}

/// Inference double that answers every task and records what it saw.
pub struct ScriptedInference {
    calls: AtomicUsize,
    seen: Mutex<Vec<(InferenceTask, String)>>,
    /// Inputs containing any of these substrings fail.
    failing: Mutex<Vec<String>>,
    failures_enabled: AtomicBool,
    /// Label returned for spread classification.
    spread_label: Mutex<String>,
    cost_per_call: f64,
    /// Cancelled once `cancel_after` calls have been answered.
    cancel: Mutex<Option<(usize, CancellationToken)>>,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            failing: Mutex::new(Vec::new()),
            failures_enabled: AtomicBool::new(true),
            spread_label: Mutex::new("spread".to_string()),
            cost_per_call: 0.001,
            cancel: Mutex::new(None),
        }
    }

    pub fn fail_on(&self, needles: &[&str]) {
        *self.failing.lock().unwrap() = needles.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_failures_enabled(&self, enabled: bool) {
        self.failures_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_spread_label(&self, label: &str) {
        *self.spread_label.lock().unwrap() = label.to_string();
    }

    pub fn cancel_after(&self, calls: usize, token: CancellationToken) {
        *self.cancel.lock().unwrap() = Some((calls, token));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<(InferenceTask, String)> {
        self.seen.lock().unwrap().clone()
    }

    /// Inputs seen for one task, in call order.
    pub fn inputs_for(&self, task: InferenceTask) -> Vec<String> {
        self.seen()
            .into_iter()
            .filter(|(t, _)| *t == task)
            .map(|(_, input)| input)
            .collect()
    }

    pub fn tasks(&self) -> Vec<InferenceTask> {
        self.seen().into_iter().map(|(t, _)| t).collect()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let input = match &request.input {
            InferenceInput::ImageUrl(url) => url.clone(),
            InferenceInput::Text(text) => text.clone(),
        };
        self.seen.lock().unwrap().push((request.task, input.clone()));
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some((after, token)) = self.cancel.lock().unwrap().as_ref() {
            if n >= *after {
                token.cancel();
            }
        }

        if self.failures_enabled.load(Ordering::SeqCst)
            && self
                .failing
                .lock()
                .unwrap()
                .iter()
                .any(|needle| input.contains(needle.as_str()))
        {
            return Err(InferenceError::Status {
                status: 503,
                body: "model overloaded".to_string(),
            });
        }

        let short: String = input.chars().rev().take(8).collect::<Vec<_>>().into_iter().rev().collect();
        let response = match request.task {
            InferenceTask::ClassifySpread => InferenceResponse {
                classification: Some(self.spread_label.lock().unwrap().clone()),
                ..Default::default()
            },
            task => InferenceResponse {
                text: format!("{}({})", task, short),
                ..Default::default()
            },
        };
        Ok(InferenceResponse {
            cost_usd: self.cost_per_call,
            tokens: 42,
            model: "scripted-1".to_string(),
            ..response
        })
    }
}
