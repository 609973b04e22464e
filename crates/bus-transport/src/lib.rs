use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use kaco_protocol::{decode, CodecError, QueryFrame, ResponseFrame};
use types::{DeviceAddress, FailureKind};

mod serial;

pub use serial::{BusStream, Parity, SerialConfig, SerialConnector, StopBits, SUPPORTED_BAUD_RATES};

const READ_CHUNK: usize = 128;
const FRAME_START: u8 = b'\n';
const FRAME_END: u8 = b'\r';

/// Timing options for the shared bus.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Minimum silence since the last received byte before transmitting.
    pub min_quiet: Duration,
    /// First delay before reopening a link that failed to open.
    pub reconnect_backoff: Duration,
    /// Upper bound for the reopen delay.
    pub reconnect_max_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_quiet: Duration::from_millis(50),
            reconnect_backoff: Duration::from_secs(1),
            reconnect_max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no reply within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("bus error: {0}")]
    Bus(#[from] io::Error),
    #[error("bus offline, next reconnect attempt in {retry_in_ms}ms")]
    Offline { retry_in_ms: u64 },
    #[error("serial port {0} is already owned by another transport")]
    PortInUse(String),
    #[error("invalid serial configuration: {0}")]
    InvalidSerialConfig(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("expected reply from {expected}, got reply from {actual}")]
    UnexpectedAddress {
        expected: DeviceAddress,
        actual: DeviceAddress,
    },
}

impl TransportError {
    /// True when the link itself is unusable, as opposed to a single bad reply.
    pub fn is_bus_error(&self) -> bool {
        self.failure_kind() == FailureKind::BusError
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            TransportError::Timeout { .. } => FailureKind::Timeout,
            TransportError::Bus(_)
            | TransportError::Offline { .. }
            | TransportError::PortInUse(_)
            | TransportError::InvalidSerialConfig(_) => FailureKind::BusError,
            TransportError::Codec(CodecError::ChecksumMismatch { .. }) => {
                FailureKind::ChecksumMismatch
            }
            TransportError::Codec(CodecError::FrameTooShort) => FailureKind::FrameTooShort,
            TransportError::Codec(CodecError::UnknownCommand(_)) => FailureKind::UnknownCommand,
            TransportError::Codec(CodecError::Malformed(_)) => FailureKind::Malformed,
            TransportError::Codec(CodecError::Encoding(_)) => FailureKind::Encoding,
            TransportError::UnexpectedAddress { .. } => FailureKind::UnexpectedResponse,
        }
    }
}

/// Request/reply access to the bus. Implementations serve one request at a
/// time.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn request(
        &self,
        query: &QueryFrame,
        timeout: Duration,
    ) -> Result<ResponseFrame, TransportError>;
}

#[async_trait]
impl<B: Bus + ?Sized> Bus for Arc<B> {
    async fn request(
        &self,
        query: &QueryFrame,
        timeout: Duration,
    ) -> Result<ResponseFrame, TransportError> {
        (**self).request(query, timeout).await
    }
}

/// Opens the byte stream a [`BusTransport`] talks over.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: BusStream;

    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Human readable link name for logs.
    fn describe(&self) -> String;
}

struct Link<S> {
    stream: Option<S>,
    last_rx: Option<Instant>,
    reconnect_failures: u32,
    retry_at: Option<Instant>,
}

/// Exclusive owner of the RS485 link.
pub struct BusTransport<C: Connector> {
    connector: C,
    config: TransportConfig,
    link: Mutex<Link<C::Stream>>,
}

impl BusTransport<SerialConnector> {
    /// Claims and wraps a serial port. The port itself is opened lazily on
    /// the first request.
    pub fn open(serial: SerialConfig, config: TransportConfig) -> Result<Self, TransportError> {
        Ok(Self::new(SerialConnector::new(serial)?, config))
    }
}

impl<C: Connector> BusTransport<C> {
    pub fn new(connector: C, config: TransportConfig) -> Self {
        Self {
            connector,
            config,
            link: Mutex::new(Link {
                stream: None,
                last_rx: None,
                reconnect_failures: 0,
                retry_at: None,
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.stream.is_some()
    }

    /// Drops the link; the next request reopens it.
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if link.stream.take().is_some() {
            info!(link = %self.connector.describe(), "bus disconnected");
        }
    }

    async fn ensure_connected(&self, link: &mut Link<C::Stream>) -> Result<(), TransportError> {
        if link.stream.is_some() {
            return Ok(());
        }

        let now = Instant::now();
        if let Some(retry_at) = link.retry_at {
            if now < retry_at {
                return Err(TransportError::Offline {
                    retry_in_ms: (retry_at - now).as_millis() as u64,
                });
            }
        }

        match self.connector.connect().await {
            Ok(stream) => {
                info!(
                    link = %self.connector.describe(),
                    failed_attempts = link.reconnect_failures,
                    "bus connected"
                );
                link.stream = Some(stream);
                link.last_rx = None;
                link.reconnect_failures = 0;
                link.retry_at = None;
                Ok(())
            }
            Err(err) => {
                let delay = reconnect_delay(
                    self.config.reconnect_backoff,
                    link.reconnect_failures,
                    self.config.reconnect_max_backoff,
                );
                link.reconnect_failures = link.reconnect_failures.saturating_add(1);
                link.retry_at = Some(now + delay);
                warn!(
                    link = %self.connector.describe(),
                    error = %err,
                    failed_attempts = link.reconnect_failures,
                    retry_in_ms = delay.as_millis(),
                    "bus connect failed"
                );
                Err(TransportError::Bus(err))
            }
        }
    }

    async fn exchange(
        &self,
        link: &mut Link<C::Stream>,
        query: &[u8],
        expected: DeviceAddress,
        timeout: Duration,
    ) -> Result<ResponseFrame, TransportError> {
        let Link {
            stream, last_rx, ..
        } = link;
        let Some(stream) = stream.as_mut() else {
            return Err(TransportError::Bus(io::Error::new(
                io::ErrorKind::NotConnected,
                "bus not connected",
            )));
        };

        stream.clear_input()?;
        if let Some(last) = *last_rx {
            let quiet = last.elapsed();
            if quiet < self.config.min_quiet {
                sleep(self.config.min_quiet - quiet).await;
            }
        }

        stream.write_all(query).await?;
        stream.flush().await?;
        debug!(address = %expected, bytes = query.len(), "query sent");

        let deadline = Instant::now() + timeout;
        let mut buf = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        let mut scanned = 0usize;

        loop {
            let read = match timeout_at(deadline, stream.read(&mut chunk)).await {
                Ok(result) => result?,
                Err(_) if buf.is_empty() => {
                    return Err(TransportError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
                Err(_) => {
                    debug!(address = %expected, received = buf.len(), "reply incomplete at deadline");
                    return Err(TransportError::Codec(CodecError::FrameTooShort));
                }
            };
            if read == 0 {
                return Err(TransportError::Bus(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "serial link closed",
                )));
            }
            *last_rx = Some(Instant::now());
            buf.extend_from_slice(&chunk[..read]);

            // Skip echoes and line noise in front of the start marker.
            if buf.first() != Some(&FRAME_START) {
                match buf.iter().position(|byte| *byte == FRAME_START) {
                    Some(start) => {
                        debug!(address = %expected, skipped = start, "discarding bytes before reply");
                        buf.drain(..start);
                    }
                    None => {
                        buf.clear();
                    }
                }
                scanned = 0;
            }

            // A `\r` may be a legacy checksum byte; only a decodable prefix
            // ends the reply.
            while let Some(offset) = buf[scanned..].iter().position(|byte| *byte == FRAME_END) {
                let end = scanned + offset + 1;
                scanned = end;
                match decode(&buf[..end]) {
                    Ok(frame) => {
                        if end < buf.len() {
                            debug!(address = %expected, trailing = buf.len() - end, "bytes after reply ignored");
                        }
                        if frame.address != expected {
                            return Err(TransportError::UnexpectedAddress {
                                expected,
                                actual: frame.address,
                            });
                        }
                        debug!(address = %expected, command = ?frame.command, "reply received");
                        return Ok(frame);
                    }
                    Err(CodecError::FrameTooShort) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
}

#[async_trait]
impl<C: Connector> Bus for BusTransport<C> {
    async fn request(
        &self,
        query: &QueryFrame,
        timeout: Duration,
    ) -> Result<ResponseFrame, TransportError> {
        let bytes = query.encode()?;
        let mut link = self.link.lock().await;
        self.ensure_connected(&mut link).await?;

        let result = self
            .exchange(&mut link, &bytes, query.address, timeout)
            .await;
        if let Err(err) = &result {
            if err.is_bus_error() {
                warn!(
                    link = %self.connector.describe(),
                    address = %query.address,
                    error = %err,
                    "bus failed, dropping link"
                );
                link.stream = None;
            }
        }
        result
    }
}

fn reconnect_delay(base: Duration, failures: u32, max: Duration) -> Duration {
    let shift = failures.min(31);
    let factor = 1u32 << shift;
    let candidate = base.saturating_mul(factor);
    if candidate > max {
        max.max(base)
    } else {
        candidate
    }
}
