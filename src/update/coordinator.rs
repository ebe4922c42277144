//! Update coordinator with statum state machine
//!
//! Tracks one remote-update session at a time with compile-time checked
//! transitions. While a session is in progress (or has completed and the device is
//! waiting to restart) the control loop suspends command processing.
//!
//! # State Machine
//!
//! ```text
//! Idle ──begin──► InProgress ──end──► Completed ──► (restart)
//!  ▲                  │
//!  └──── reset ◄── Failed ◄──error
//! ```

use chrono::{DateTime, Local};
use statum::{machine, state};
use tracing::{debug, info, warn};

use crate::controller::event::{UpdateErrorKind, UpdateTarget};

/// States for update session lifecycle using statum
#[state]
#[derive(Debug, Clone)]
pub enum UpdatePhase {
    Idle,
    InProgress,
    Failed,
    Completed,
}

#[machine]
pub struct UpdateSession<S: UpdatePhase> {
    target: Option<UpdateTarget>,
    started_at: Option<DateTime<Local>>,
    last_percent: Option<u8>,
}

impl UpdateSession<Idle> {
    pub fn idle() -> Self {
        Self::new(None, None, None)
    }

    pub fn begin(mut self, target: UpdateTarget) -> UpdateSession<InProgress> {
        info!("Start updating {}", target);
        self.target = Some(target);
        self.started_at = Some(Local::now());
        self.last_percent = None;
        self.transition()
    }
}

impl UpdateSession<InProgress> {
    /// Records progress and returns the whole percentage when it changed.
    pub fn progress(&mut self, done: u64, total: u64) -> Option<u8> {
        let percent = percent(done, total)?;
        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(percent)
    }

    pub fn finish(self) -> UpdateSession<Completed> {
        match self.started_at {
            Some(started) => {
                let elapsed = Local::now().signed_duration_since(started);
                info!(
                    "Update of {} finished after {} ms",
                    self.target_name(),
                    elapsed.num_milliseconds()
                );
            }
            None => info!("Update of {} finished", self.target_name()),
        }
        self.transition()
    }

    pub fn fail(self, kind: UpdateErrorKind) -> UpdateSession<Failed> {
        warn!("Update of {} failed: {}", self.target_name(), kind);
        self.transition()
    }

    fn target_name(&self) -> String {
        self.target
            .map(|target| target.to_string())
            .unwrap_or_else(|| "unknown target".to_string())
    }
}

impl UpdateSession<Completed> {
    pub fn target(&self) -> Option<UpdateTarget> {
        self.target
    }
}

impl UpdateSession<Failed> {
    pub fn reset(mut self) -> UpdateSession<Idle> {
        self.target = None;
        self.started_at = None;
        self.last_percent = None;
        self.transition()
    }
}

pub(crate) fn percent(done: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let pct = (u128::from(done) * 100 / u128::from(total)).min(100);
    Some(pct as u8)
}

/// Externally visible update state. `Failed` is transient: it is only reported
/// by [`UpdateCoordinator::on_error`], the coordinator itself is back in `Idle`
/// by then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    InProgress,
    Failed,
    Completed,
}

enum Slot {
    Idle(UpdateSession<Idle>),
    InProgress(UpdateSession<InProgress>),
    Completed(UpdateSession<Completed>),
}

/// Runtime holder for the typed session. Failures pass through `Failed` and land
/// back in `Idle` within the same call.
pub struct UpdateCoordinator {
    slot: Slot,
}

impl Default for UpdateCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateCoordinator {
    pub fn new() -> Self {
        Self {
            slot: Slot::Idle(UpdateSession::idle()),
        }
    }

    pub fn state(&self) -> UpdateState {
        match self.slot {
            Slot::Idle(_) => UpdateState::Idle,
            Slot::InProgress(_) => UpdateState::InProgress,
            Slot::Completed(_) => UpdateState::Completed,
        }
    }

    /// Commands are suspended from `begin` until the device restarts.
    pub fn blocks_commands(&self) -> bool {
        !matches!(self.slot, Slot::Idle(_))
    }

    /// Image kind of the completed update that is waiting for the restart.
    pub fn completed_target(&self) -> Option<UpdateTarget> {
        match &self.slot {
            Slot::Completed(session) => session.target(),
            _ => None,
        }
    }

    /// Returns `true` when a new session started.
    pub fn on_begin(&mut self, target: UpdateTarget) -> bool {
        match self.take() {
            Slot::Idle(session) => {
                self.slot = Slot::InProgress(session.begin(target));
                true
            }
            other => {
                warn!("Update begin for {} ignored, an update is already running", target);
                self.slot = other;
                false
            }
        }
    }

    pub fn on_progress(&mut self, done: u64, total: u64) {
        match &mut self.slot {
            Slot::InProgress(session) => {
                if let Some(pct) = session.progress(done, total) {
                    info!("Progress: {}%", pct);
                }
            }
            _ => debug!("Update progress outside of a session ignored"),
        }
    }

    /// Returns `true` when the running session completed and a restart is due.
    pub fn on_end(&mut self) -> bool {
        match self.take() {
            Slot::InProgress(session) => {
                self.slot = Slot::Completed(session.finish());
                true
            }
            other => {
                warn!("Update end without a running update ignored");
                self.slot = other;
                false
            }
        }
    }

    /// Returns the state the failure passed through: `Failed` for a running
    /// session, otherwise the unchanged current state.
    pub fn on_error(&mut self, kind: UpdateErrorKind) -> UpdateState {
        match self.take() {
            Slot::InProgress(session) => {
                self.slot = Slot::Idle(session.fail(kind).reset());
                info!("Update aborted, resuming normal operation");
                UpdateState::Failed
            }
            other => {
                warn!("Update error outside of a session: {}", kind);
                self.slot = other;
                self.state()
            }
        }
    }

    fn take(&mut self) -> Slot {
        std::mem::replace(&mut self.slot, Slot::Idle(UpdateSession::idle()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_then_end_completes() {
        let mut coordinator = UpdateCoordinator::new();
        assert_eq!(coordinator.state(), UpdateState::Idle);
        assert!(!coordinator.blocks_commands());

        assert!(coordinator.on_begin(UpdateTarget::Firmware));
        assert_eq!(coordinator.state(), UpdateState::InProgress);
        assert!(coordinator.blocks_commands());

        coordinator.on_progress(50, 100);
        assert_eq!(coordinator.state(), UpdateState::InProgress);

        assert_eq!(coordinator.completed_target(), None);
        assert!(coordinator.on_end());
        assert_eq!(coordinator.state(), UpdateState::Completed);
        assert!(coordinator.blocks_commands());
        assert_eq!(coordinator.completed_target(), Some(UpdateTarget::Firmware));
    }

    #[test]
    fn error_passes_through_failed_back_to_idle() {
        let mut coordinator = UpdateCoordinator::new();
        coordinator.on_begin(UpdateTarget::Filesystem);

        assert_eq!(coordinator.on_error(UpdateErrorKind::Receive), UpdateState::Failed);
        assert_eq!(coordinator.state(), UpdateState::Idle);
        assert!(!coordinator.blocks_commands());

        // A fresh session can start afterwards.
        assert!(coordinator.on_begin(UpdateTarget::Firmware));
    }

    #[test]
    fn error_while_idle_changes_nothing() {
        let mut coordinator = UpdateCoordinator::new();
        assert_eq!(coordinator.on_error(UpdateErrorKind::Auth), UpdateState::Idle);
        assert_eq!(coordinator.state(), UpdateState::Idle);
    }

    #[test]
    fn end_without_begin_is_ignored() {
        let mut coordinator = UpdateCoordinator::new();
        assert!(!coordinator.on_end());
        assert_eq!(coordinator.state(), UpdateState::Idle);
    }

    #[test]
    fn second_begin_is_ignored() {
        let mut coordinator = UpdateCoordinator::new();
        assert!(coordinator.on_begin(UpdateTarget::Firmware));
        assert!(!coordinator.on_begin(UpdateTarget::Filesystem));
        assert_eq!(coordinator.state(), UpdateState::InProgress);
    }

    #[test]
    fn progress_reports_only_changes() {
        let mut session = UpdateSession::idle().begin(UpdateTarget::Firmware);
        assert_eq!(session.progress(10, 1000), Some(1));
        assert_eq!(session.progress(15, 1000), None);
        assert_eq!(session.progress(1000, 1000), Some(100));
        assert_eq!(session.progress(5, 0), None);
    }

    #[test]
    fn percent_handles_small_and_oversized_totals() {
        assert_eq!(percent(1, 3), Some(33));
        assert_eq!(percent(7, 5), Some(100));
        assert_eq!(percent(u64::MAX, u64::MAX), Some(100));
    }
}
