//! Read-only view of the engine's progress, for health checks.

use supabazarr_remote::models::RunStatus;
use supabazarr_source::Kind;
use time::OffsetDateTime;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run has started yet.
    Idle,
    Started,
    Extracting(Kind),
    Reconciling(Kind),
    /// Writing the run summary.
    Finalizing,
    Done(RunStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub state: RunState,
    pub last_success_at: Option<OffsetDateTime>,
    pub last_status: Option<RunStatus>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self { state: RunState::Idle, last_success_at: None, last_status: None }
    }
}

/// Cheap to clone; every clone sees the latest state.
#[derive(Debug, Clone)]
pub struct StatusReader(watch::Receiver<StatusSnapshot>);

impl StatusReader {
    pub fn snapshot(&self) -> StatusSnapshot {
        self.0.borrow().clone()
    }

    /// Wait for the next state change. Returns `false` once the engine is gone.
    pub async fn changed(&mut self) -> bool {
        self.0.changed().await.is_ok()
    }
}

#[derive(Debug)]
pub(crate) struct StatusWriter(watch::Sender<StatusSnapshot>);

impl StatusWriter {
    pub fn new() -> Self {
        Self(watch::Sender::new(StatusSnapshot::default()))
    }

    pub fn reader(&self) -> StatusReader {
        StatusReader(self.0.subscribe())
    }

    pub fn set(&self, state: RunState) {
        self.0.send_modify(|snapshot| snapshot.state = state);
    }

    /// `finished_at` becomes the last success unless the run failed.
    pub fn finish(&self, status: RunStatus, finished_at: OffsetDateTime) {
        self.0.send_modify(|snapshot| {
            snapshot.state = RunState::Done(status);
            snapshot.last_status = Some(status);
            if status != RunStatus::Failed {
                snapshot.last_success_at = Some(finished_at);
            }
        });
    }
}
