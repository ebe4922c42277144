//! Link layer drivers.
//!
//! The platform (wpa_supplicant, NetworkManager, systemd-networkd) performs the
//! actual association; the driver here only observes the interface through sysfs,
//! waits for it to come up and reports when it goes away.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::controller::event::{Event, EventSender, LinkEvent};

const SYSFS_NET: &str = "/sys/class/net";
const STATE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Failed to read state of {interface}: {source}")]
    Io {
        interface: String,
        source: std::io::Error,
    },

    #[error("{interface} did not come up, last state: {state}")]
    NotUp { interface: String, state: String },

    #[error("Link still down after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// What the device knows about itself once the link is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub interface: String,
    pub hardware_address: Option<String>,
}

impl fmt::Display for LinkInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.hardware_address {
            Some(mac) => write!(f, "{} ({})", self.interface, mac),
            None => write!(f, "{}", self.interface),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait LinkDriver {
    /// One bounded association attempt.
    async fn associate(&mut self) -> Result<LinkInfo, LinkError>;

    /// Starts watching an established link. Loss and recovery are reported as
    /// [`LinkEvent`] notifications.
    fn supervise(&mut self, notify: EventSender);
}

/// Watches `/sys/class/net/<interface>/operstate`.
#[derive(Debug, Clone)]
pub struct SysfsLink {
    root: PathBuf,
    interface: String,
    ssid: Option<String>,
    attempt_timeout: Duration,
    poll_interval: Duration,
}

impl SysfsLink {
    pub fn new(config: &LinkConfig) -> Self {
        Self::with_root(SYSFS_NET, config)
    }

    pub fn with_root(root: impl Into<PathBuf>, config: &LinkConfig) -> Self {
        Self {
            root: root.into(),
            interface: config.interface.clone(),
            ssid: config.ssid.clone(),
            attempt_timeout: config.attempt_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    async fn read_attr(&self, attr: &str) -> Result<String, LinkError> {
        let path = self.root.join(&self.interface).join(attr);
        tokio::fs::read_to_string(&path)
            .await
            .map(|value| value.trim().to_string())
            .map_err(|source| LinkError::Io {
                interface: self.interface.clone(),
                source,
            })
    }
}

impl LinkDriver for SysfsLink {
    async fn associate(&mut self) -> Result<LinkInfo, LinkError> {
        match &self.ssid {
            Some(ssid) => info!("Waiting for {} to join {}", self.interface, ssid),
            None => info!("Waiting for {} to come up", self.interface),
        }

        let deadline = Instant::now() + self.attempt_timeout;
        loop {
            let state = self.read_attr("operstate").await?;
            if is_up(&state) {
                let hardware_address = self.read_attr("address").await.ok();
                return Ok(LinkInfo {
                    interface: self.interface.clone(),
                    hardware_address,
                });
            }

            if Instant::now() >= deadline {
                return Err(LinkError::NotUp {
                    interface: self.interface.clone(),
                    state,
                });
            }
            sleep(STATE_POLL).await;
        }
    }

    fn supervise(&mut self, notify: EventSender) {
        let link = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(link.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut up = true;

            loop {
                ticker.tick().await;
                let now_up = match link.read_attr("operstate").await {
                    Ok(state) => is_up(&state),
                    Err(e) => {
                        debug!("{}", e);
                        false
                    }
                };
                if now_up == up {
                    continue;
                }
                up = now_up;

                let event = if up { LinkEvent::Restored } else { LinkEvent::Lost };
                if notify.send(Event::Link(event)).await.is_err() {
                    break;
                }
            }
            warn!("Link supervision of {} stopped", link.interface);
        });
    }
}

fn is_up(state: &str) -> bool {
    state == "up"
}
