use crate::level::LightLevel;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// Durable storage for the single light level value.
#[derive(Debug)]
pub struct SetpointStore {
    path: PathBuf,
    available: bool,
}

impl SetpointStore {
    /// Creates an uninitialized store. Nothing touches the medium until [`SetpointStore::init`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            available: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Prepares the medium. Unavailability is reported here, once, and never again.
    pub async fn init(&mut self) -> bool {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        self.available = match tokio::fs::create_dir_all(&parent).await {
            Ok(()) => match tokio::fs::metadata(&parent).await {
                Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => true,
                Ok(_) => {
                    warn!(
                        "Setpoint storage {} is not writable, running in-memory only",
                        parent.display()
                    );
                    false
                }
                Err(e) => {
                    warn!(
                        "Setpoint storage {} unavailable ({}), running in-memory only",
                        parent.display(),
                        e
                    );
                    false
                }
            },
            Err(e) => {
                warn!(
                    "Setpoint storage {} unavailable ({}), running in-memory only",
                    parent.display(),
                    e
                );
                false
            }
        };

        if self.available {
            info!("Setpoint storage opened at {}", self.path.display());
        }
        self.available
    }

    /// Returns the stored level, or the default when nothing usable is stored.
    ///
    /// A missing or unreadable record is replaced by the default before returning,
    /// so the first boot leaves an initialized store behind.
    pub async fn load(&self) -> LightLevel {
        if !self.available {
            return LightLevel::default();
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => match parse_record(&content) {
                Some(level) => {
                    info!("Read light level {} from storage", level);
                    level
                }
                None => {
                    warn!(
                        "Stored light level {:?} is unreadable, resetting to default",
                        content.trim()
                    );
                    self.initialize_default().await
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No stored light level yet, initializing storage");
                self.initialize_default().await
            }
            Err(e) => {
                error!("Failed to read stored light level: {}", e);
                LightLevel::default()
            }
        }
    }

    /// Durably replaces the stored level. No-op when the medium is unavailable.
    pub async fn save(&self, level: LightLevel) {
        if !self.available {
            return;
        }

        match self.write_record(level).await {
            Ok(()) => debug!("Saved light level {} to storage", level),
            Err(e) => error!("Failed to save light level {}: {}", level, e),
        }
    }

    async fn initialize_default(&self) -> LightLevel {
        let level = LightLevel::default();
        self.save(level).await;
        level
    }

    async fn write_record(&self, level: LightLevel) -> std::io::Result<()> {
        let tmp = self.path.with_extension("tmp");

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(format!("{}\n", level).as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await
    }
}

fn parse_record(content: &str) -> Option<LightLevel> {
    content.trim().parse::<i64>().ok().map(LightLevel::clamped)
}
