use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::engine::state::{Notice, OtaEvent, Stage};
use crate::error::{OtaError, Result};
use crate::util::progress_percent;

/// Grace period before the console reloads after new web assets land.
pub const RELOAD_DELAY: Duration = Duration::from_millis(2000);
pub const UNKNOWN_ERROR: &str = "Unknown error occurred";

/// What the transport reports while a binary is uploading.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { sent: u64, total: Option<u64> },
    Response { ok: bool, status_text: String },
    TransportError(TransportFailure),
}

/// Connection-level failure details, best first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportFailure {
    /// Structured message from an error body, if the device sent one.
    pub message: Option<String>,
    /// Message from the HTTP stack.
    pub transport: Option<String>,
}

impl TransportFailure {
    pub fn from_transport(detail: impl Into<String>) -> Self {
        Self {
            message: None,
            transport: Some(detail.into()),
        }
    }

    pub fn describe(&self) -> String {
        [&self.message, &self.transport]
            .into_iter()
            .flatten()
            .map(|text| text.trim())
            .find(|text| !text.is_empty())
            .unwrap_or(UNKNOWN_ERROR)
            .to_owned()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    InProgress { percent: u8 },
    Succeeded,
    Failed(String),
}

/// Follows one stage's upload and publishes its progress.
pub struct TransferTracker {
    stage: Stage,
    state: TransferState,
    progress: Option<u8>,
    updates: mpsc::UnboundedSender<OtaEvent>,
}

impl TransferTracker {
    pub fn new(stage: Stage, updates: mpsc::UnboundedSender<OtaEvent>) -> Self {
        Self {
            stage,
            state: TransferState::Idle,
            progress: None,
            updates,
        }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Percent shown to the user; `None` whenever no transfer is running.
    pub fn progress(&self) -> Option<u8> {
        self.progress
    }

    /// Claim the stage for a new transfer.
    ///
    /// # Errors
    /// Returns `TransferInProgress` while an earlier transfer has not finished.
    pub fn begin(&mut self) -> Result<()> {
        if matches!(self.state, TransferState::InProgress { .. }) {
            return Err(OtaError::TransferInProgress(self.stage));
        }
        self.state = TransferState::InProgress { percent: 0 };
        self.progress = None;
        info!("transfer: {} started", self.stage);
        Ok(())
    }

    /// Consume transport events until the transfer ends. Call [`begin`] first.
    ///
    /// [`begin`]: TransferTracker::begin
    pub async fn track(&mut self, mut events: mpsc::UnboundedReceiver<TransferEvent>) -> Result<()> {
        let outcome = loop {
            match events.recv().await {
                Some(TransferEvent::Progress { sent, total }) => self.on_progress(sent, total),
                Some(TransferEvent::Response { ok: true, .. }) => break Ok(()),
                Some(TransferEvent::Response { ok: false, status_text }) => {
                    let status_text = status_text.trim();
                    let reason = if status_text.is_empty() {
                        UNKNOWN_ERROR.to_owned()
                    } else {
                        status_text.to_owned()
                    };
                    break Err(OtaError::TransferRejected(reason));
                }
                Some(TransferEvent::TransportError(failure)) => {
                    break Err(OtaError::TransferTransport(failure.describe()));
                }
                None => {
                    break Err(OtaError::TransferTransport(
                        "connection closed before the device responded".into(),
                    ));
                }
            }
        };
        self.finish(outcome)
    }

    fn on_progress(&mut self, sent: u64, total: Option<u64>) {
        let Some(percent) = progress_percent(sent, total) else {
            debug!("transfer: {} progress without a known total", self.stage);
            return;
        };
        let floor = match self.state {
            TransferState::InProgress { percent } => percent,
            _ => 0,
        };
        let percent = percent.max(floor);
        self.state = TransferState::InProgress { percent };
        self.progress = Some(percent);
        debug!("transfer: {} {}%", self.stage, percent);
        let _ = self.updates.send(OtaEvent::Progress {
            stage: self.stage,
            percent: Some(percent),
        });
    }

    fn finish(&mut self, outcome: Result<()>) -> Result<()> {
        self.progress = None;
        let _ = self.updates.send(OtaEvent::Progress {
            stage: self.stage,
            percent: None,
        });

        match &outcome {
            Ok(()) => {
                self.state = TransferState::Succeeded;
                info!("transfer: {} succeeded", self.stage);
                let message = match self.stage {
                    Stage::Firmware => "Firmware updated",
                    Stage::WebAssets => "Website updated",
                };
                let _ = self
                    .updates
                    .send(OtaEvent::Notice(Notice::success(message, "Success!")));
                if self.stage == Stage::WebAssets {
                    self.schedule_reload();
                }
            }
            Err(err) => {
                let reason = err.to_string();
                error!("transfer: {} failed: {}", self.stage, reason);
                self.state = TransferState::Failed(reason.clone());
                let _ = self.updates.send(OtaEvent::Notice(Notice::error(reason)));
            }
        }
        outcome
    }

    fn schedule_reload(&self) {
        let _ = self.updates.send(OtaEvent::ReloadScheduled {
            after: RELOAD_DELAY,
        });
        let updates = self.updates.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RELOAD_DELAY).await;
            let _ = updates.send(OtaEvent::Reload);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(events: Vec<TransferEvent>) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(event).unwrap();
        }
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OtaEvent>) -> Vec<OtaEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn percents(events: &[OtaEvent]) -> Vec<Option<u8>> {
        events
            .iter()
            .filter_map(|event| match event {
                OtaEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    fn ok_response() -> TransferEvent {
        TransferEvent::Response {
            ok: true,
            status_text: "OK".into(),
        }
    }

    #[tokio::test]
    async fn publishes_rounded_progress_then_resets_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = TransferTracker::new(Stage::Firmware, tx);
        tracker.begin().unwrap();
        let events = feed(vec![
            TransferEvent::Progress { sent: 1, total: Some(3) },
            TransferEvent::Progress { sent: 2, total: Some(3) },
            TransferEvent::Progress { sent: 3, total: Some(3) },
            ok_response(),
        ]);

        tracker.track(events).await.unwrap();

        let seen = drain(&mut rx);
        assert_eq!(percents(&seen), vec![Some(33), Some(67), Some(100), None]);
        assert_eq!(tracker.state(), &TransferState::Succeeded);
        assert_eq!(tracker.progress(), None);
        assert!(seen.contains(&OtaEvent::Notice(Notice::success(
            "Firmware updated",
            "Success!"
        ))));
        assert!(!seen.contains(&OtaEvent::ReloadScheduled { after: RELOAD_DELAY }));
    }

    #[tokio::test]
    async fn progress_never_goes_backwards_or_past_100() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = TransferTracker::new(Stage::Firmware, tx);
        tracker.begin().unwrap();
        let events = feed(vec![
            TransferEvent::Progress { sent: 50, total: Some(100) },
            TransferEvent::Progress { sent: 40, total: Some(100) },
            TransferEvent::Progress { sent: 250, total: Some(100) },
            ok_response(),
        ]);

        tracker.track(events).await.unwrap();

        let seen = percents(&drain(&mut rx));
        assert_eq!(seen, vec![Some(50), Some(50), Some(100), None]);
    }

    #[tokio::test]
    async fn unknown_total_leaves_state_untouched() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = TransferTracker::new(Stage::Firmware, tx);
        tracker.begin().unwrap();
        tracker.on_progress(10, None);
        assert_eq!(tracker.state(), &TransferState::InProgress { percent: 0 });
        assert_eq!(tracker.progress(), None);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn rejected_response_fails_with_status_text() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = TransferTracker::new(Stage::Firmware, tx);
        tracker.begin().unwrap();
        let events = feed(vec![
            TransferEvent::Progress { sent: 10, total: Some(10) },
            TransferEvent::Response {
                ok: false,
                status_text: "Internal Server Error".into(),
            },
        ]);

        let err = tracker.track(events).await.unwrap_err();

        assert_eq!(err, OtaError::TransferRejected("Internal Server Error".into()));
        assert_eq!(
            tracker.state(),
            &TransferState::Failed("Internal Server Error".into())
        );
        let seen = drain(&mut rx);
        assert_eq!(percents(&seen), vec![Some(100), None]);
        assert!(seen.contains(&OtaEvent::Notice(Notice::error("Internal Server Error"))));
    }

    #[tokio::test]
    async fn transport_failure_prefers_structured_message() {
        let failure = TransportFailure {
            message: Some("partition too small".into()),
            transport: Some("connection reset".into()),
        };
        assert_eq!(failure.describe(), "partition too small");
        assert_eq!(
            TransportFailure::from_transport("connection reset").describe(),
            "connection reset"
        );
        assert_eq!(TransportFailure::default().describe(), UNKNOWN_ERROR);
        let blank = TransportFailure {
            message: Some("  ".into()),
            transport: None,
        };
        assert_eq!(blank.describe(), UNKNOWN_ERROR);

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tracker = TransferTracker::new(Stage::WebAssets, tx);
        tracker.begin().unwrap();
        let err = tracker
            .track(feed(vec![TransferEvent::TransportError(failure)]))
            .await
            .unwrap_err();
        assert_eq!(err, OtaError::TransferTransport("partition too small".into()));
    }

    #[tokio::test]
    async fn closed_stream_counts_as_transport_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tracker = TransferTracker::new(Stage::Firmware, tx);
        tracker.begin().unwrap();
        let err = tracker.track(feed(Vec::new())).await.unwrap_err();
        assert!(matches!(err, OtaError::TransferTransport(_)));
        assert!(matches!(tracker.state(), TransferState::Failed(_)));
    }

    #[tokio::test]
    async fn second_begin_is_rejected_until_terminal() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tracker = TransferTracker::new(Stage::Firmware, tx);
        tracker.begin().unwrap();
        assert_eq!(
            tracker.begin(),
            Err(OtaError::TransferInProgress(Stage::Firmware))
        );
        tracker.track(feed(vec![ok_response()])).await.unwrap();
        assert!(tracker.begin().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn web_asset_success_reloads_after_grace_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = TransferTracker::new(Stage::WebAssets, tx);
        let start = tokio::time::Instant::now();
        tracker.begin().unwrap();
        tracker.track(feed(vec![ok_response()])).await.unwrap();

        let seen = drain(&mut rx);
        assert!(seen.contains(&OtaEvent::ReloadScheduled { after: RELOAD_DELAY }));
        assert!(!seen.contains(&OtaEvent::Reload));

        assert_eq!(rx.recv().await, Some(OtaEvent::Reload));
        let waited = start.elapsed();
        assert!(waited >= RELOAD_DELAY);
        assert!(waited < RELOAD_DELAY + Duration::from_millis(10));
        assert!(drain(&mut rx).is_empty());
    }
}
