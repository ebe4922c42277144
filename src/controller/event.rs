//! Notifications delivered to the control loop.
//!
//! Every component that learns something asynchronously (link supervisor, MQTT
//! session pump, update receiver, timers) reports it as an [`Event`] on one shared
//! queue. The control loop drains that queue one event at a time, which gives the
//! arrival-order guarantee without any locking.

use std::fmt;
use tokio::sync::mpsc;

pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;

/// Identifies one broker session. Every `connect()` starts a new one.
pub type SessionId = u64;

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Link(LinkEvent),
    /// Traffic of the given session. Events of an abandoned session may still be
    /// queued and must be checked against the transport's current session.
    Channel(SessionId, ChannelEvent),
    Update(UpdateEvent),
    /// The reconnect delay after a dropped session has elapsed.
    ReconnectDue,
    /// A deliberate restart's grace period has elapsed.
    RestartDue(RestartReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Lost,
    Restored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected { session_present: bool },
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
    /// Broker acknowledged a QoS 1 or QoS 2 publish.
    Published { pkid: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEvent {
    Begin { target: UpdateTarget },
    Progress { done: u64, total: u64 },
    End,
    Error(UpdateErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTarget {
    Firmware,
    Filesystem,
}

impl fmt::Display for UpdateTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UpdateTarget::Firmware => write!(f, "firmware"),
            UpdateTarget::Filesystem => write!(f, "filesystem"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateErrorKind {
    Auth,
    Begin,
    Connect,
    Receive,
    End,
}

impl fmt::Display for UpdateErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            UpdateErrorKind::Auth => "Auth Failed",
            UpdateErrorKind::Begin => "Begin Failed",
            UpdateErrorKind::Connect => "Connect Failed",
            UpdateErrorKind::Receive => "Receive Failed",
            UpdateErrorKind::End => "End Failed",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// The link never came up within the retry budget.
    LinkExhausted { attempts: u32 },
    /// An update was received completely and must be booted into.
    UpdateCompleted,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RestartReason::LinkExhausted { attempts } => {
                write!(f, "link connection failed after {} attempts", attempts)
            }
            RestartReason::UpdateCompleted => write!(f, "update completed"),
        }
    }
}
