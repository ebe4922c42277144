use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use super::link::{LinkDriver, LinkError, LinkInfo};
use crate::config::LinkConfig;
use crate::controller::event::EventSender;

/// Owns the link layer and its connect policy: a bounded number of attempts, then
/// give up. Giving up is fatal for the caller; there is no endless retry mode.
pub struct SessionManager<D> {
    driver: D,
    attempts: u32,
    retry_delay: Duration,
}

impl<D: LinkDriver> SessionManager<D> {
    pub fn new(driver: D, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            driver,
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(driver: D, config: &LinkConfig) -> Self {
        Self::new(driver, config.attempts, config.retry_delay())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Blocks until the link is up or the retry budget is spent.
    pub async fn connect(&mut self) -> Result<LinkInfo, LinkError> {
        for attempt in 1..=self.attempts {
            match self.driver.associate().await {
                Ok(info) => {
                    match hostname().await {
                        Some(host) => info!("Link up: {}, hostname {}", info, host),
                        None => info!("Link up: {}", info),
                    }
                    return Ok(info);
                }
                Err(e) => {
                    warn!(
                        "Link connection attempt {}/{} failed: {}",
                        attempt, self.attempts, e
                    );
                    if attempt < self.attempts {
                        sleep(self.retry_delay).await;
                    }
                }
            }
        }

        error!("Link connection failed after {} attempts", self.attempts);
        Err(LinkError::Exhausted {
            attempts: self.attempts,
        })
    }

    pub fn supervise(&mut self, notify: EventSender) {
        self.driver.supervise(notify);
    }
}

async fn hostname() -> Option<String> {
    let name = tokio::fs::read_to_string("/proc/sys/kernel/hostname").await.ok()?;
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyLink {
        failures_left: u32,
        calls: u32,
    }

    impl LinkDriver for FlakyLink {
        async fn associate(&mut self) -> Result<LinkInfo, LinkError> {
            self.calls += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(LinkError::NotUp {
                    interface: "wlan0".into(),
                    state: "dormant".into(),
                });
            }
            Ok(LinkInfo {
                interface: "wlan0".into(),
                hardware_address: None,
            })
        }

        fn supervise(&mut self, _notify: EventSender) {}
    }

    #[tokio::test]
    async fn retries_until_link_comes_up() {
        let link = FlakyLink {
            failures_left: 2,
            calls: 0,
        };
        let mut manager = SessionManager::new(link, 3, Duration::from_millis(1));

        let info = manager.connect().await.unwrap();
        assert_eq!(info.interface, "wlan0");
        assert_eq!(manager.driver.calls, 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let link = FlakyLink {
            failures_left: u32::MAX,
            calls: 0,
        };
        let mut manager = SessionManager::new(link, 2, Duration::from_millis(1));

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, LinkError::Exhausted { attempts: 2 }));
        assert_eq!(manager.driver.calls, 2);
    }

    #[test]
    fn zero_budget_still_tries_once() {
        let link = FlakyLink {
            failures_left: 0,
            calls: 0,
        };
        let manager = SessionManager::new(link, 0, Duration::ZERO);
        assert_eq!(manager.attempts(), 1);
    }
}
