//! TCP update receiver.
//!
//! A minimal image upload endpoint standing in for the platform's update
//! mechanism. One session at a time:
//!
//! ```text
//! client: UPDATE <firmware|filesystem> <size> <password>\n
//! client: <size bytes of image>
//! server: OK\n | ERR <reason>\n
//! ```
//!
//! The image is written to a staging file beside its install path and renamed
//! over it once complete. Firmware replaces the boot image, filesystem images
//! have their own location. Lifecycle callbacks reach the control loop as [`UpdateEvent`]s.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::percent;
use super::{UpdateAgent, UpdateAgentError};
use crate::config::UpdateConfig;
use crate::controller::event::{Event, EventSender, UpdateErrorKind, UpdateEvent, UpdateTarget};

const CHUNK: usize = 4096;
const MAX_HEADER: u64 = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    target: UpdateTarget,
    size: u64,
    password: String,
}

fn parse_header(line: &str) -> Option<Header> {
    let mut parts = line
        .trim_end_matches(|c: char| c == '\r' || c == '\n')
        .splitn(4, ' ');
    if parts.next()? != "UPDATE" {
        return None;
    }
    let target = match parts.next()? {
        "firmware" => UpdateTarget::Firmware,
        "filesystem" => UpdateTarget::Filesystem,
        _ => return None,
    };
    let size = parts.next()?.parse::<u64>().ok().filter(|size| *size > 0)?;
    let password = parts.next().unwrap_or_default().to_string();

    Some(Header {
        target,
        size,
        password,
    })
}

fn same_secret(given: &str, expected: &str) -> bool {
    given.len() == expected.len()
        && given
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[derive(Debug, Clone)]
struct Session {
    password: String,
    firmware_path: Option<PathBuf>,
    filesystem_path: PathBuf,
    max_image_bytes: u64,
    header_timeout: Duration,
    receive_timeout: Duration,
}

impl Session {
    async fn serve(&self, stream: TcpStream, notify: &EventSender) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let reply = match self.receive(&mut reader, notify).await {
            Ok(()) => "OK\n".to_string(),
            Err(kind) => {
                let _ = notify.send(Event::Update(UpdateEvent::Error(kind))).await;
                format!("ERR {}\n", kind)
            }
        };

        if let Err(e) = writer.write_all(reply.as_bytes()).await {
            debug!("Failed to answer update client: {}", e);
        }
        // Consume whatever the client still sends so closing does not reset the
        // connection before the reply is read.
        let _ = timeout(
            self.header_timeout,
            tokio::io::copy(&mut reader, &mut tokio::io::sink()),
        )
        .await;
    }

    async fn receive<R>(&self, reader: &mut R, notify: &EventSender) -> Result<(), UpdateErrorKind>
    where
        R: AsyncBufReadExt + Unpin,
    {
        let mut line = String::new();
        let mut limited = reader.take(MAX_HEADER);
        match timeout(self.header_timeout, limited.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => {}
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => return Err(UpdateErrorKind::Connect),
        }
        let reader = limited.into_inner();

        let header = parse_header(&line).ok_or(UpdateErrorKind::Begin)?;
        if !same_secret(&header.password, &self.password) {
            return Err(UpdateErrorKind::Auth);
        }
        if header.size > self.max_image_bytes {
            warn!(
                "Update image of {} bytes exceeds the limit of {} bytes",
                header.size, self.max_image_bytes
            );
            return Err(UpdateErrorKind::Begin);
        }

        let install = self.install_path(header.target).ok_or_else(|| {
            warn!("No install location for {} images", header.target);
            UpdateErrorKind::Begin
        })?;
        let staging = staging_path(&install);

        let installed = self
            .install(reader, &header, &staging, &install, notify)
            .await;
        if installed.is_err() {
            let _ = tokio::fs::remove_file(&staging).await;
        }
        installed
    }

    async fn install<R>(
        &self,
        reader: &mut R,
        header: &Header,
        staging: &Path,
        install: &Path,
        notify: &EventSender,
    ) -> Result<(), UpdateErrorKind>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(parent) = install.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|_| UpdateErrorKind::Begin)?;
        }
        // A leftover staging file would keep its old permissions.
        let _ = tokio::fs::remove_file(staging).await;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(image_mode(header.target))
            .open(staging)
            .await
            .map_err(|_| UpdateErrorKind::Begin)?;

        let _ = notify
            .send(Event::Update(UpdateEvent::Begin {
                target: header.target,
            }))
            .await;

        let total = header.size;
        let mut done = 0u64;
        let mut last_percent = None;
        let mut buf = vec![0u8; CHUNK];

        while done < total {
            let want = (total - done).min(CHUNK as u64) as usize;
            let n = match timeout(self.receive_timeout, reader.read(&mut buf[..want])).await {
                Ok(Ok(0)) => {
                    warn!("Update stream ended after {} of {} bytes", done, total);
                    return Err(UpdateErrorKind::Receive);
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!("Update read failed after {} of {} bytes: {}", done, total, e);
                    return Err(UpdateErrorKind::Receive);
                }
                Err(_) => {
                    warn!("Update stalled after {} of {} bytes", done, total);
                    return Err(UpdateErrorKind::Receive);
                }
            };
            file.write_all(&buf[..n])
                .await
                .map_err(|_| UpdateErrorKind::Receive)?;
            done += n as u64;

            let pct = percent(done, total);
            if last_percent != pct {
                last_percent = pct;
                let _ = notify
                    .send(Event::Update(UpdateEvent::Progress { done, total }))
                    .await;
            }
        }

        file.sync_all().await.map_err(|_| UpdateErrorKind::End)?;
        drop(file);
        tokio::fs::rename(staging, install)
            .await
            .map_err(|_| UpdateErrorKind::End)?;
        info!("Installed {} image at {}", header.target, install.display());

        let _ = notify.send(Event::Update(UpdateEvent::End)).await;
        Ok(())
    }

    fn install_path(&self, target: UpdateTarget) -> Option<PathBuf> {
        match target {
            UpdateTarget::Firmware => self.firmware_path.clone(),
            UpdateTarget::Filesystem => Some(self.filesystem_path.clone()),
        }
    }
}

/// Images are staged next to their install path so the final rename never
/// crosses filesystems.
fn staging_path(install: &Path) -> PathBuf {
    let mut name = install
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".staging");
    install.with_file_name(name)
}

fn image_mode(target: UpdateTarget) -> u32 {
    match target {
        UpdateTarget::Firmware => 0o755,
        UpdateTarget::Filesystem => 0o644,
    }
}

/// [`UpdateAgent`] listening for image uploads over TCP.
pub struct OtaReceiver {
    config: UpdateConfig,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
}

impl OtaReceiver {
    pub fn new(config: &UpdateConfig, shutdown: CancellationToken) -> Self {
        Self {
            config: config.clone(),
            shutdown,
            local_addr: None,
        }
    }

    /// Address actually bound, available after [`UpdateAgent::ready`] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl UpdateAgent for OtaReceiver {
    async fn ready(&mut self, notify: EventSender) -> Result<(), UpdateAgentError> {
        if !self.config.enabled {
            info!("Remote updates disabled");
            return Ok(());
        }
        if self.config.password.is_empty() {
            return Err(UpdateAgentError::NoPassword);
        }

        let addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| UpdateAgentError::Bind {
                addr: addr.clone(),
                source,
            })?;
        self.local_addr = listener.local_addr().ok();
        info!("Update receiver ready on {}", addr);

        let session = Session {
            password: self.config.password.clone(),
            firmware_path: self.config.firmware_image(),
            filesystem_path: self.config.filesystem_path.clone(),
            max_image_bytes: self.config.max_image_bytes,
            header_timeout: self.config.header_timeout(),
            receive_timeout: self.config.receive_timeout(),
        };
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        info!("Update connection from {}", peer);
                        session.serve(stream, &notify).await;
                    }
                    Err(e) => {
                        warn!("Failed to accept update connection: {}", e);
                        if notify
                            .send(Event::Update(UpdateEvent::Error(UpdateErrorKind::Connect)))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            debug!("Update receiver stopped");
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::event::{event_channel, EventReceiver};

    const PASSWORD: &str = "s3cret";

    fn config(dir: &tempfile::TempDir) -> UpdateConfig {
        UpdateConfig {
            enabled: true,
            bind: "127.0.0.1".into(),
            port: 0,
            password: PASSWORD.into(),
            firmware_path: Some(dir.path().join("firmware")),
            filesystem_path: dir.path().join("filesystem"),
            max_image_bytes: 1024 * 1024,
            restart_grace_ms: 0,
            header_timeout_ms: 1_000,
            receive_timeout_ms: 1_000,
        }
    }

    async fn start(dir: &tempfile::TempDir) -> (OtaReceiver, EventReceiver, CancellationToken) {
        start_with(config(dir)).await
    }

    async fn start_with(config: UpdateConfig) -> (OtaReceiver, EventReceiver, CancellationToken) {
        let (notify, events) = event_channel(256);
        let shutdown = CancellationToken::new();
        let mut receiver = OtaReceiver::new(&config, shutdown.clone());
        receiver.ready(notify).await.unwrap();
        (receiver, events, shutdown)
    }

    async fn upload(addr: SocketAddr, header: &str, body: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(header.as_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        reply
    }

    async fn drain(events: &mut EventReceiver) -> Vec<UpdateEvent> {
        let mut seen = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), events.recv()).await
        {
            if let Event::Update(update) = event {
                seen.push(update);
            }
        }
        seen
    }

    #[test]
    fn parses_header() {
        let header = parse_header("UPDATE firmware 1024 pass word\n").unwrap();
        assert_eq!(header.target, UpdateTarget::Firmware);
        assert_eq!(header.size, 1024);
        assert_eq!(header.password, "pass word");

        assert!(parse_header("UPDATE firmware 0 pw\n").is_none());
        assert!(parse_header("UPDATE kernel 10 pw\n").is_none());
        assert!(parse_header("PUT firmware 10 pw\n").is_none());
        assert!(parse_header("UPDATE filesystem ten pw\n").is_none());
    }

    #[test]
    fn compares_secrets_exactly() {
        assert!(same_secret("abc", "abc"));
        assert!(!same_secret("abd", "abc"));
        assert!(!same_secret("ab", "abc"));
    }

    #[tokio::test]
    async fn complete_upload_is_installed() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, mut events, shutdown) = start(&dir).await;
        let image = vec![0xAB; 10_000];

        let reply = upload(
            receiver.local_addr().unwrap(),
            &format!("UPDATE firmware {} {}\n", image.len(), PASSWORD),
            &image,
        )
        .await;
        assert_eq!(reply, "OK\n");

        let seen = drain(&mut events).await;
        assert_eq!(
            seen.first(),
            Some(&UpdateEvent::Begin {
                target: UpdateTarget::Firmware
            })
        );
        assert_eq!(seen.last(), Some(&UpdateEvent::End));
        assert!(seen
            .iter()
            .any(|e| matches!(e, UpdateEvent::Progress { done: 10_000, total: 10_000 })));

        let installed = tokio::fs::read(dir.path().join("firmware")).await.unwrap();
        assert_eq!(installed, image);
        assert!(!dir.path().join("firmware.staging").exists());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn wrong_password_fails_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, mut events, shutdown) = start(&dir).await;

        let reply = upload(
            receiver.local_addr().unwrap(),
            "UPDATE firmware 4 nope\n",
            b"abcd",
        )
        .await;
        assert_eq!(reply, "ERR Auth Failed\n");
        assert_eq!(
            drain(&mut events).await,
            vec![UpdateEvent::Error(UpdateErrorKind::Auth)]
        );
        assert!(!dir.path().join("firmware").exists());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn truncated_image_fails_receive() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, mut events, shutdown) = start(&dir).await;

        let reply = upload(
            receiver.local_addr().unwrap(),
            &format!("UPDATE filesystem 100 {}\n", PASSWORD),
            &[1u8; 40],
        )
        .await;
        assert_eq!(reply, "ERR Receive Failed\n");

        let seen = drain(&mut events).await;
        assert_eq!(
            seen.first(),
            Some(&UpdateEvent::Begin {
                target: UpdateTarget::Filesystem
            })
        );
        assert_eq!(
            seen.last(),
            Some(&UpdateEvent::Error(UpdateErrorKind::Receive))
        );
        assert!(!dir.path().join("filesystem.staging").exists());
        assert!(!dir.path().join("filesystem").exists());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn installed_firmware_is_executable_and_booted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let (receiver, _events, shutdown) = start(&dir).await;
        let image = b"#!/bin/sh\nexit 0\n".to_vec();

        let reply = upload(
            receiver.local_addr().unwrap(),
            &format!("UPDATE firmware {} {}\n", image.len(), PASSWORD),
            &image,
        )
        .await;
        assert_eq!(reply, "OK\n");

        let firmware = dir.path().join("firmware");
        let mode = std::fs::metadata(&firmware).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0, "firmware mode {:o}", mode);
        assert_eq!(
            crate::restart::boot_program(config(&dir).firmware_image().as_deref()),
            Some(firmware)
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn filesystem_image_does_not_touch_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, _events, shutdown) = start(&dir).await;

        let reply = upload(
            receiver.local_addr().unwrap(),
            &format!("UPDATE filesystem 3 {}\n", PASSWORD),
            b"fs!",
        )
        .await;
        assert_eq!(reply, "OK\n");

        assert_eq!(std::fs::read(dir.path().join("filesystem")).unwrap(), b"fs!");
        assert!(!dir.path().join("firmware").exists());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn stalled_upload_fails_receive() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.receive_timeout_ms = 200;
        config.header_timeout_ms = 200;
        let (receiver, mut events, shutdown) = start_with(config).await;

        let mut stream = TcpStream::connect(receiver.local_addr().unwrap())
            .await
            .unwrap();
        stream
            .write_all(format!("UPDATE firmware 1000 {}\n", PASSWORD).as_bytes())
            .await
            .unwrap();
        stream.write_all(&[7u8; 10]).await.unwrap();

        // The socket stays open; the receiver must give up on its own.
        let mut reply = String::new();
        let mut reader = BufReader::new(&mut stream);
        tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, "ERR Receive Failed\n");

        let seen = drain(&mut events).await;
        assert_eq!(
            seen.last(),
            Some(&UpdateEvent::Error(UpdateErrorKind::Receive))
        );
        assert!(!dir.path().join("firmware.staging").exists());
        assert!(!dir.path().join("firmware").exists());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn oversized_image_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, mut events, shutdown) = start(&dir).await;

        let reply = upload(
            receiver.local_addr().unwrap(),
            &format!("UPDATE firmware {} {}\n", u64::MAX, PASSWORD),
            b"",
        )
        .await;
        assert_eq!(reply, "ERR Begin Failed\n");
        assert_eq!(
            drain(&mut events).await,
            vec![UpdateEvent::Error(UpdateErrorKind::Begin)]
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn malformed_header_fails_begin() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, mut events, shutdown) = start(&dir).await;

        let reply = upload(receiver.local_addr().unwrap(), "HELLO\n", b"").await;
        assert_eq!(reply, "ERR Begin Failed\n");
        assert_eq!(
            drain(&mut events).await,
            vec![UpdateEvent::Error(UpdateErrorKind::Begin)]
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn missing_password_refuses_to_start() {
        let config = UpdateConfig {
            password: String::new(),
            port: 0,
            bind: "127.0.0.1".into(),
            ..UpdateConfig::default()
        };
        let (notify, _events) = event_channel(4);
        let mut receiver = OtaReceiver::new(&config, CancellationToken::new());

        assert!(matches!(
            receiver.ready(notify).await,
            Err(UpdateAgentError::NoPassword)
        ));
    }
}
