//! WirelessPort - provisioning transport over the wireless bridge
//!
//! ## Responsibilities
//!
//! - Decode characteristic writes into commands and enqueue them
//! - Chunked notifications back to the central (200 byte chunks,
//!   50 ms apart, pacing slow centrals)
//! - Production link to the wireless daemon over a unix socket with
//!   reconnect backoff
//!
//! The write callback runs outside the control loop and never blocks:
//! it decodes, try_sends into the bounded queue and drops on overflow.

use crate::command_router::{Command, CommandOrigin, InboundCommand};
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};

/// Notification chunk size in bytes
const CHUNK_SIZE: usize = 200;

/// Pause between notification chunks (milliseconds)
const CHUNK_GAP_MS: u64 = 50;

/// Outbound half of the wireless transport
#[async_trait::async_trait]
pub trait WirelessLink: Send + Sync {
    /// Push one notification chunk to the central
    async fn notify(&self, chunk: &[u8]) -> Result<()>;
}

/// WirelessPort - command intake and notification fan-out
pub struct WirelessPort {
    link: Arc<dyn WirelessLink>,
    tx: mpsc::Sender<InboundCommand>,
}

impl WirelessPort {
    pub fn new(link: Arc<dyn WirelessLink>, tx: mpsc::Sender<InboundCommand>) -> Self {
        Self { link, tx }
    }

    /// Characteristic write callback. Decodes and enqueues without ever
    /// waiting; a full queue drops the command and logs it.
    pub fn handle_write(&self, payload: &[u8]) {
        let raw = String::from_utf8_lossy(payload);
        let command = Command::decode(&raw);

        match self
            .tx
            .try_send(InboundCommand::new(command, CommandOrigin::Wireless))
        {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(
                    kind = dropped.command.kind.name(),
                    "Command queue full, wireless command dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("Command queue closed, wireless command dropped");
            }
        }
    }

    /// Notify the central with a payload, chunked and paced
    pub async fn notify_payload(&self, payload: &str) -> Result<()> {
        let bytes = payload.as_bytes();
        let mut chunks = bytes.chunks(CHUNK_SIZE).peekable();

        while let Some(chunk) = chunks.next() {
            self.link.notify(chunk).await?;
            if chunks.peek().is_some() {
                tokio::time::sleep(Duration::from_millis(CHUNK_GAP_MS)).await;
            }
        }

        Ok(())
    }
}

/// Production link: a unix socket to the wireless bridge daemon.
/// Inbound writes arrive newline-delimited; notifies go out raw.
pub struct UnixSocketLink {
    writer: Mutex<Option<tokio::net::unix::OwnedWriteHalf>>,
}

impl UnixSocketLink {
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(None),
        }
    }

    async fn attach(&self, writer: tokio::net::unix::OwnedWriteHalf) {
        *self.writer.lock().await = Some(writer);
    }

    async fn detach(&self) {
        *self.writer.lock().await = None;
    }
}

impl Default for UnixSocketLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl WirelessLink for UnixSocketLink {
    async fn notify(&self, chunk: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => {
                w.write_all(chunk).await?;
                w.flush().await?;
                Ok(())
            }
            None => Err(Error::Network("wireless bridge not connected".to_string())),
        }
    }
}

/// Keep the bridge socket alive: connect, pump inbound lines into the
/// port, reconnect with backoff when the daemon goes away.
pub fn spawn_bridge(
    socket_path: PathBuf,
    link: Arc<UnixSocketLink>,
    port: Arc<WirelessPort>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            match UnixStream::connect(&socket_path).await {
                Ok(stream) => {
                    attempt = 0;
                    tracing::info!(path = %socket_path.display(), "Wireless bridge connected");

                    let (read_half, write_half) = stream.into_split();
                    link.attach(write_half).await;

                    let mut lines = BufReader::new(read_half).lines();
                    loop {
                        match lines.next_line().await {
                            Ok(Some(line)) => port.handle_write(line.as_bytes()),
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(error = %e, "Wireless bridge read failed");
                                break;
                            }
                        }
                    }

                    link.detach().await;
                    tracing::warn!("Wireless bridge disconnected");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Wireless bridge connect failed");
                }
            }

            let backoff = Duration::from_millis(500 * 2u64.pow(attempt.min(6)));
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(backoff).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_router::CommandKind;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingLink {
        chunks: AsyncMutex<Vec<Vec<u8>>>,
    }

    impl RecordingLink {
        fn new() -> Self {
            Self {
                chunks: AsyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl WirelessLink for RecordingLink {
        async fn notify(&self, chunk: &[u8]) -> Result<()> {
            self.chunks.lock().await.push(chunk.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_enqueues_decoded_command() {
        let (tx, mut rx) = mpsc::channel(4);
        let port = WirelessPort::new(Arc::new(RecordingLink::new()), tx);

        port.handle_write(br#"{"type": "led_on"}"#);
        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.command.kind, CommandKind::LedOn);
        assert_eq!(inbound.origin, CommandOrigin::Wireless);
    }

    #[tokio::test]
    async fn test_write_accepts_legacy_bare_string() {
        let (tx, mut rx) = mpsc::channel(4);
        let port = WirelessPort::new(Arc::new(RecordingLink::new()), tx);

        port.handle_write(b"start_stream");
        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.command.kind, CommandKind::StartStream);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let port = WirelessPort::new(Arc::new(RecordingLink::new()), tx);

        port.handle_write(br#"{"type": "led_on"}"#);
        port.handle_write(br#"{"type": "led_off"}"#);

        // Only the first fits; the second was dropped, not queued
        let first = rx.recv().await.unwrap();
        assert_eq!(first.command.kind, CommandKind::LedOn);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_chunks_and_paces() {
        let (tx, _rx) = mpsc::channel(1);
        let link = Arc::new(RecordingLink::new());
        let port = WirelessPort::new(link.clone(), tx);

        let payload = "x".repeat(450);
        port.notify_payload(&payload).await.unwrap();

        let chunks = link.chunks.lock().await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 200);
        assert_eq!(chunks[1].len(), 200);
        assert_eq!(chunks[2].len(), 50);
    }

    #[tokio::test]
    async fn test_short_payload_is_one_chunk() {
        let (tx, _rx) = mpsc::channel(1);
        let link = Arc::new(RecordingLink::new());
        let port = WirelessPort::new(link.clone(), tx);

        port.notify_payload("{\"ok\":true}").await.unwrap();
        assert_eq!(link.chunks.lock().await.len(), 1);
    }
}
