//! Non-blocking safety checks
//!
//! Each check runs on its own task, bounded by the classifier timeout, and
//! reports back through a queue the session controller drains. Outcomes
//! carry the session epoch they were requested in so results that arrive
//! after a skip can be dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::classifier::{ClassifierError, FrameVerdict, SafetyClassifier, TextVerdict};
use crate::metrics::{self, SAFETY_CHECKS_FAILED, SAFETY_FLAGS};

/// Source of sampled video frames
pub trait FrameSampler: Send + Sync {
    /// Current frame as an encoded image, `None` while no video is flowing
    fn sample_frame(&mut self) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyOutcome {
    Text {
        epoch: u64,
        message_id: String,
        verdict: TextVerdict,
    },
    Frame {
        epoch: u64,
        verdict: FrameVerdict,
    },
    IceBreakers {
        epoch: u64,
        suggestions: Vec<String>,
    },
}

impl SafetyOutcome {
    pub fn epoch(&self) -> u64 {
        match self {
            SafetyOutcome::Text { epoch, .. }
            | SafetyOutcome::Frame { epoch, .. }
            | SafetyOutcome::IceBreakers { epoch, .. } => *epoch,
        }
    }
}

/// Run `call` within `limit`; failures and timeouts yield `None`
async fn bounded<T>(
    limit: Duration,
    call: &'static str,
    fut: impl Future<Output = Result<T, ClassifierError>>,
) -> Option<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            metrics::record_counter(SAFETY_CHECKS_FAILED, 1);
            debug!(call, error = %e, "classifier call failed, using default");
            None
        }
        Err(_) => {
            metrics::record_counter(SAFETY_CHECKS_FAILED, 1);
            debug!(call, ?limit, "classifier call timed out, using default");
            None
        }
    }
}

#[derive(Clone)]
pub struct SafetyScheduler {
    classifier: Arc<dyn SafetyClassifier>,
    timeout: Duration,
    outcomes: mpsc::Sender<SafetyOutcome>,
}

impl SafetyScheduler {
    /// Create a scheduler and the queue its outcomes arrive on
    pub fn new(
        classifier: Arc<dyn SafetyClassifier>,
        timeout: Duration,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<SafetyOutcome>) {
        let (outcomes, rx) = mpsc::channel(buffer);
        (
            Self {
                classifier,
                timeout,
                outcomes,
            },
            rx,
        )
    }

    async fn deliver(&self, outcome: SafetyOutcome) {
        // The controller may be gone by the time a slow check lands
        let _ = self.outcomes.send(outcome).await;
    }

    pub fn check_text(&self, epoch: u64, message_id: String, text: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let verdict = bounded(this.timeout, "scan_text", this.classifier.scan_text(&text))
                .await
                .unwrap_or_default();
            if !verdict.is_safe {
                metrics::record_counter(SAFETY_FLAGS, 1);
                warn!(message_id = %message_id, reason = ?verdict.reason, "outgoing message flagged");
            }
            this.deliver(SafetyOutcome::Text {
                epoch,
                message_id,
                verdict,
            })
            .await;
        });
    }

    pub fn check_frame(&self, epoch: u64, image: Vec<u8>) {
        let this = self.clone();
        tokio::spawn(async move {
            let verdict = bounded(this.timeout, "scan_frame", this.classifier.scan_frame(&image))
                .await
                .unwrap_or_default();
            if verdict.blur_required {
                metrics::record_counter(SAFETY_FLAGS, 1);
                warn!("video frame flagged");
            }
            this.deliver(SafetyOutcome::Frame { epoch, verdict }).await;
        });
    }

    pub fn fetch_ice_breakers(&self, epoch: u64, interests: Vec<String>) {
        let this = self.clone();
        tokio::spawn(async move {
            let suggestions = bounded(
                this.timeout,
                "suggest_ice_breakers",
                this.classifier.suggest_ice_breakers(&interests),
            )
            .await
            .unwrap_or_default();
            this.deliver(SafetyOutcome::IceBreakers { epoch, suggestions })
                .await;
        });
    }
}
