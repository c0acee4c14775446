//! Console tunnel
//!
//! Relays raw display-protocol bytes between a framed client channel and
//! the hypervisor's local console socket.

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const RELAY_BUFFER: usize = 64 * 1024;

/// A message on the client-facing channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

/// Byte counts of a finished tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub to_console: u64,
    pub to_client: u64,
}

/// Fires once no matter how many sides ask
pub struct ShutdownSignal {
    fired: AtomicBool,
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            token: CancellationToken::new(),
        }
    }

    /// Returns true only for the call that actually initiated shutdown
    pub fn trigger(&self, reason: &str) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            trace!("Tunnel shutdown already requested ({})", reason);
            return false;
        }
        debug!("Tunnel shutting down: {}", reason);
        self.token.cancel();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub async fn fired(&self) {
        self.token.cancelled().await
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Bidirectional console relay
pub struct ConsoleTunnel;

impl ConsoleTunnel {
    /// Run both relay directions until either side closes, then close both
    /// ends exactly once.
    pub async fn bridge<L, S, K, E>(local: L, mut inbound: S, outbound: K) -> anyhow::Result<TunnelStats>
    where
        L: AsyncRead + AsyncWrite + Send + Unpin,
        S: Stream<Item = Result<Frame, E>> + Send + Unpin,
        K: Sink<Frame> + Send + Unpin,
        K::Error: Display,
        E: Display + Send,
    {
        let (mut local_read, mut local_write) = tokio::io::split(local);
        // Pong replies and console data share the client channel
        let outbound = Mutex::new(outbound);
        let signal = ShutdownSignal::new();

        let client_to_console = async {
            let mut sent = 0u64;
            loop {
                let next = tokio::select! {
                    _ = signal.fired() => break,
                    next = inbound.next() => next,
                };
                match next {
                    Some(Ok(Frame::Binary(data))) => {
                        trace!("Client->console: {} bytes", data.len());
                        if let Err(e) = local_write.write_all(&data).await {
                            debug!("Console write failed: {}", e);
                            break;
                        }
                        sent += data.len() as u64;
                    }
                    Some(Ok(Frame::Text(text))) => {
                        // Some clients send the protocol handshake as text
                        if let Err(e) = local_write.write_all(text.as_bytes()).await {
                            debug!("Console write failed: {}", e);
                            break;
                        }
                        sent += text.len() as u64;
                    }
                    Some(Ok(Frame::Ping(payload))) => {
                        if let Err(e) = outbound.lock().await.send(Frame::Pong(payload)).await {
                            debug!("Pong failed: {}", e);
                            break;
                        }
                    }
                    Some(Ok(Frame::Pong(_))) => {}
                    Some(Ok(Frame::Close)) | None => {
                        debug!("Client closed console channel");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Client channel error: {}", e);
                        break;
                    }
                }
            }
            signal.trigger("client side finished");
            sent
        };

        let console_to_client = async {
            let mut buffer = vec![0u8; RELAY_BUFFER];
            let mut received = 0u64;
            loop {
                let read = tokio::select! {
                    _ = signal.fired() => break,
                    read = local_read.read(&mut buffer) => read,
                };
                match read {
                    Ok(0) => {
                        debug!("Console socket closed");
                        break;
                    }
                    Ok(n) => {
                        trace!("Console->client: {} bytes", n);
                        let frame = Frame::Binary(Bytes::copy_from_slice(&buffer[..n]));
                        if let Err(e) = outbound.lock().await.send(frame).await {
                            debug!("Client send failed: {}", e);
                            break;
                        }
                        received += n as u64;
                    }
                    Err(e) => {
                        debug!("Console read failed: {}", e);
                        break;
                    }
                }
            }
            signal.trigger("console side finished");
            received
        };

        let (to_console, to_client) = tokio::join!(client_to_console, console_to_client);

        if let Err(e) = local_write.shutdown().await {
            trace!("Console shutdown: {}", e);
        }
        if let Err(e) = outbound.into_inner().close().await {
            trace!("Client channel close: {}", e);
        }

        debug!(
            "Console tunnel ended ({} bytes to console, {} bytes to client)",
            to_console, to_client
        );
        Ok(TunnelStats {
            to_console,
            to_client,
        })
    }
}
