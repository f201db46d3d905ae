use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use super::state::{PipelineStatus, StepName, StepStatus};

/// Events emitted while a pipeline is driven. Page text is never included.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StepStarted {
        book_id: String,
        step: StepName,
        total: u32,
    },
    Chunk {
        book_id: String,
        step: StepName,
        processed: u32,
        failed: u32,
        total: u32,
    },
    StepFinished {
        book_id: String,
        step: StepName,
        status: StepStatus,
    },
    BudgetExhausted {
        book_id: String,
        spent: f64,
        ceiling: f64,
    },
    Stopped {
        book_id: String,
        status: PipelineStatus,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Fans events out to any number of subscribers over a broadcast channel.
///
/// Sending with no subscribers is not an error; events are simply dropped.
pub struct BroadcastProgress {
    sender: Arc<broadcast::Sender<ProgressEvent>>,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}
