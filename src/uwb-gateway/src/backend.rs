// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

use uwb_core::controller::{ExponentialBackoff, RetryPolicy};
use uwb_protocol::{encode_event, parse_event, BackendEvent, Hello, OutboundEvent, ProtocolError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IO_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_JSON_LINE_BYTES: usize = 64 * 1024;

/// Best-effort event sink towards the backend.
pub trait BackendChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Queue `event` for delivery. Never blocks; returns `false` when the
    /// channel is down or its queue is full.
    fn emit(&self, event: OutboundEvent) -> bool;
}

/// Sender half of the TCP backend link, shared with sessions and the arbiter.
pub struct TcpBackend {
    connected: AtomicBool,
    outbound_tx: mpsc::Sender<OutboundEvent>,
}

impl TcpBackend {
    pub fn new(buffer: usize) -> (Arc<Self>, mpsc::Receiver<OutboundEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        let backend = Arc::new(Self {
            connected: AtomicBool::new(false),
            outbound_tx,
        });
        (backend, outbound_rx)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

impl BackendChannel for TcpBackend {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn emit(&self, event: OutboundEvent) -> bool {
        if !self.is_connected() {
            debug!("Backend offline, dropping {}", event.name());
            return false;
        }
        match self.outbound_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Backend queue full, dropping {}", event.name());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

pub struct BackendLinkConfig {
    pub addr: String,
    pub gateway_id: String,
    pub token: Option<String>,
    pub reconnect: ExponentialBackoff,
    pub slow_retry: Duration,
}

/// Delay before the next connect after `failures` consecutive failures:
/// the bounded backoff first, then the slow interval forever.
fn reconnect_delay(policy: &ExponentialBackoff, slow_retry: Duration, failures: u32) -> Duration {
    if failures < policy.max_attempts() {
        policy.delay(failures)
    } else {
        slow_retry
    }
}

/// Maintain the backend connection until shutdown.
///
/// Inbound events are pushed to `inbound_tx`; outbound events queued through
/// `backend` are written while connected and discarded on disconnect.
pub async fn run_backend_link(
    config: BackendLinkConfig,
    backend: Arc<TcpBackend>,
    mut outbound_rx: mpsc::Receiver<OutboundEvent>,
    inbound_tx: mpsc::Sender<BackendEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            info!("Backend link shutting down");
            return;
        }

        info!("Backend: connecting to {}", config.addr);
        match time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&config.addr)).await {
            Ok(Ok(stream)) => {
                failures = 0;
                let result = handle_connection(
                    &config,
                    &backend,
                    stream,
                    &mut outbound_rx,
                    &inbound_tx,
                    &mut shutdown_rx,
                )
                .await;
                backend.set_connected(false);
                let mut dropped = 0usize;
                while outbound_rx.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    debug!("Discarded {} undelivered backend events", dropped);
                }
                match result {
                    Ok(()) => info!("Backend connection closed"),
                    Err(e) => warn!("Backend connection dropped: {}", e),
                }
            }
            Ok(Err(e)) => {
                warn!("Backend connect failed: {}", e);
            }
            Err(_) => {
                warn!("Backend connect timed out after {:?}", CONNECT_TIMEOUT);
            }
        }

        let delay = reconnect_delay(&config.reconnect, config.slow_retry, failures);
        failures = failures.saturating_add(1);
        debug!("Backend reconnect in {:?}", delay);
        tokio::select! {
            _ = time::sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                match changed {
                    Ok(()) if *shutdown_rx.borrow() => {
                        info!("Backend link shutting down");
                        return;
                    }
                    Ok(()) => {}
                    Err(_) => return,
                }
            }
        }
    }
}

async fn handle_connection(
    config: &BackendLinkConfig,
    backend: &TcpBackend,
    stream: TcpStream,
    outbound_rx: &mut mpsc::Receiver<OutboundEvent>,
    inbound_tx: &mpsc::Sender<BackendEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();

    let hello = OutboundEvent::Hello(Hello {
        gateway_id: config.gateway_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        token: config.token.clone(),
    });
    write_event(&mut writer, &hello).await?;
    backend.set_connected(true);
    info!("Backend connected to {}", config.addr);

    let mut reader_task = tokio::spawn(read_inbound(BufReader::new(reader), inbound_tx.clone()));

    let result = loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                match changed {
                    Ok(()) if *shutdown_rx.borrow() => break Ok(()),
                    Ok(()) => {}
                    Err(_) => break Ok(()),
                }
            }
            joined = &mut reader_task => {
                break match joined {
                    Ok(result) => result,
                    Err(e) => Err(io::Error::other(e)),
                };
            }
            event = outbound_rx.recv() => {
                let Some(event) = event else {
                    break Ok(());
                };
                if let Err(e) = write_event(&mut writer, &event).await {
                    break Err(e);
                }
            }
        }
    };

    reader_task.abort();
    let _ = writer.shutdown().await;
    result
}

async fn write_event(writer: &mut OwnedWriteHalf, event: &OutboundEvent) -> io::Result<()> {
    let mut line = encode_event(event)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    time::timeout(IO_TIMEOUT, async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend write timed out"))??;
    debug!("Backend <- {}", event.name());
    Ok(())
}

async fn read_inbound(
    mut reader: BufReader<OwnedReadHalf>,
    inbound_tx: mpsc::Sender<BackendEvent>,
) -> io::Result<()> {
    while let Some(line) = read_limited_line(&mut reader, MAX_JSON_LINE_BYTES).await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_event(trimmed) {
            Ok(event) => {
                if inbound_tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
            Err(ProtocolError::UnknownEvent(name)) => {
                debug!("Ignoring backend event '{}'", name);
            }
            Err(e) => {
                warn!("Invalid backend event: {}", e);
            }
        }
    }
    Ok(())
}

async fn read_limited_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> io::Result<Option<String>> {
    let mut line = Vec::with_capacity(256);
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return utf8_line(line).map(Some);
        }

        let (chunk_len, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        if line.len() + chunk_len > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds maximum size of {max_bytes} bytes"),
            ));
        }
        line.extend_from_slice(&available[..chunk_len]);
        reader.consume(chunk_len);
        if complete {
            return utf8_line(line).map(Some);
        }
    }
}

fn utf8_line(line: Vec<u8>) -> io::Result<String> {
    String::from_utf8(line).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line is not valid UTF-8: {e}"),
        )
    })
}
