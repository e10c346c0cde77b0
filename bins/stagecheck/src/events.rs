//! Event Pipeline
//!
//! Ordered, bounded, single-producer/single-consumer channel from the
//! orchestrator to the renderer. A full buffer suspends the producer;
//! events are never dropped, merged or reordered.

use tokio::sync::mpsc;
use tracing::warn;

/// Adjudication state of a test or stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassState {
    /// Not adjudicated (local checks, or submission still pending)
    #[default]
    Unknown,
    Passed,
    Failed,
}

impl PassState {
    pub fn from_verdict(passed: bool) -> Self {
        if passed {
            PassState::Passed
        } else {
            PassState::Failed
        }
    }

    pub fn is_known(self) -> bool {
        self != PassState::Unknown
    }
}

/// Why a test produced no captured output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    SetupFailed,
    RunnerFailed,
    AdjudicationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResolution {
    pub stage_index: usize,
    pub test_index: usize,
    pub state: PassState,
    /// Input as displayed: stdin, or the first HTTP request line
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub failure_reason: Option<String>,
    pub error: Option<ErrorClass>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    StageStart { number: u32, name: String },
    TestStart { name: String, input: String },
    TestResolved(TestResolution),
    StageResolved { stage_index: usize, state: PassState },
}

/// Producing half. Deliberately not `Clone`: the orchestrator is the only writer.
pub struct EventSender {
    tx: mpsc::Sender<ProgressEvent>,
}

pub struct EventReceiver {
    rx: mpsc::Receiver<ProgressEvent>,
}

/// Create a pipeline buffering at most `capacity` undelivered events
pub fn event_pipeline(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, EventReceiver { rx })
}

impl EventSender {
    /// Deliver `event`, waiting while the buffer is full.
    ///
    /// A vanished renderer does not stop the run; the event is logged and lost.
    pub async fn emit(&self, event: ProgressEvent) {
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event).await {
            warn!(?event, "Renderer is gone, event discarded");
        }
    }
}

impl EventReceiver {
    /// Next event, or `None` once the sender is dropped and the buffer drained
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stage_start(number: u32) -> ProgressEvent {
        ProgressEvent::StageStart {
            number,
            name: format!("stage {}", number),
        }
    }

    #[tokio::test]
    async fn test_delivery_preserves_order_and_drains_after_close() {
        let (tx, mut rx) = event_pipeline(4);
        for n in 1..=3 {
            tx.emit(stage_start(n)).await;
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event);
        }
        assert_eq!(seen, vec![stage_start(1), stage_start(2), stage_start(3)]);
    }

    #[tokio::test]
    async fn test_full_buffer_blocks_the_producer() {
        let (tx, mut rx) = event_pipeline(1);
        tx.emit(stage_start(1)).await;

        // Second emit cannot complete until the consumer reads.
        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.emit(stage_start(2))).await;
        assert!(blocked.is_err());

        assert_eq!(rx.recv().await, Some(stage_start(1)));
        tokio::time::timeout(Duration::from_secs(1), tx.emit(stage_start(3)))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(stage_start(3)));
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped_does_not_panic() {
        let (tx, rx) = event_pipeline(2);
        drop(rx);
        tx.emit(stage_start(1)).await;
    }

    #[test]
    fn test_pass_state_from_verdict() {
        assert_eq!(PassState::from_verdict(true), PassState::Passed);
        assert_eq!(PassState::from_verdict(false), PassState::Failed);
        assert!(!PassState::default().is_known());
    }
}
