//! Remote firmware updates.
//!
//! [`coordinator`] is the part of the core: the update state machine the control
//! loop consults before acting on commands. [`receiver`] is the platform side that
//! actually accepts an image and reports its lifecycle as notifications.

pub mod coordinator;
pub mod receiver;

pub use coordinator::{UpdateCoordinator, UpdateState};
pub use receiver::OtaReceiver;

use crate::controller::event::EventSender;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum UpdateAgentError {
    #[error("No update password configured, refusing remote updates")]
    NoPassword,

    #[error("Failed to listen for updates on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Source of update lifecycle notifications.
#[allow(async_fn_in_trait)]
pub trait UpdateAgent {
    /// Starts accepting updates. Begin/progress/end/error arrive later as events.
    async fn ready(&mut self, notify: EventSender) -> Result<(), UpdateAgentError>;
}

/// Agent for builds that never accept remote updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUpdates;

impl UpdateAgent for NoUpdates {
    async fn ready(&mut self, _notify: EventSender) -> Result<(), UpdateAgentError> {
        info!("Remote updates disabled");
        Ok(())
    }
}
