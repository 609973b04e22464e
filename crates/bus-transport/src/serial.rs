use std::collections::BTreeSet;
use std::io;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::debug;

use crate::{Connector, TransportError};

/// Baud rates KACO inverters can be configured for.
pub const SUPPORTED_BAUD_RATES: &[u32] = &[1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

static CLAIMED_PORTS: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl SerialConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.path.trim().is_empty() {
            return Err(TransportError::InvalidSerialConfig(
                "serial port path must not be empty".to_string(),
            ));
        }
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(TransportError::InvalidSerialConfig(format!(
                "unsupported baud rate {}",
                self.baud_rate
            )));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(TransportError::InvalidSerialConfig(format!(
                "data bits must be 5..=8, got {}",
                self.data_bits
            )));
        }
        Ok(())
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }
}

/// Byte stream carrying bus traffic.
pub trait BusStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drops bytes that arrived before the next query goes out.
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BusStream for SerialStream {
    fn clear_input(&mut self) -> io::Result<()> {
        SerialPort::clear(self, tokio_serial::ClearBuffer::Input).map_err(io::Error::from)
    }
}

impl BusStream for DuplexStream {}

/// Process-wide ownership of a serial device path, released on drop.
#[derive(Debug)]
struct PortClaim {
    path: String,
}

impl PortClaim {
    fn acquire(path: &str) -> Result<Self, TransportError> {
        let mut claimed = CLAIMED_PORTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(path.to_string()) {
            return Err(TransportError::PortInUse(path.to_string()));
        }
        debug!(port = %path, "serial port claimed");
        Ok(Self {
            path: path.to_string(),
        })
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        CLAIMED_PORTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

/// Opens a native serial port. At most one connector per device path can
/// exist in the process.
#[derive(Debug)]
pub struct SerialConnector {
    config: SerialConfig,
    _claim: PortClaim,
}

impl SerialConnector {
    pub fn new(config: SerialConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let claim = PortClaim::acquire(&config.path)?;
        Ok(Self {
            config,
            _claim: claim,
        })
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for SerialConnector {
    type Stream = SerialStream;

    async fn connect(&self) -> io::Result<SerialStream> {
        let parity = match self.config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let stop_bits = match self.config.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        };

        tokio_serial::new(&self.config.path, self.config.baud_rate)
            .data_bits(self.config.data_bits())
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .map_err(io::Error::from)
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.config.path, self.config.baud_rate)
    }
}
