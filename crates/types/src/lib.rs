use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bus address of a single inverter.
///
/// KACO frames carry the address as two ASCII decimal digits, so the usable
/// range is 1..=99 even though RS485 itself would allow more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DeviceAddress(u8);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("device address {0} out of range 1..=99")]
pub struct AddressError(pub u8);

impl DeviceAddress {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 99;

    pub fn new(value: u8) -> Result<Self, AddressError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(AddressError(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for DeviceAddress {
    type Error = AddressError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceAddress> for u8 {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Suffix of the cos φ field in generic-protocol frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CosPhiKind {
    Capacitive,
    Inductive,
    Ohmic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CosPhi {
    pub value: f64,
    pub kind: CosPhiKind,
}

/// One DC generator input or MPP tracker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DcInput {
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
}

/// One AC grid phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcPhase {
    pub voltage_v: f64,
    pub current_a: f64,
}

/// Readings of one inverter in physical units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub status: u16,
    pub inverter_type: String,
    pub dc_inputs: Vec<DcInput>,
    pub ac_phases: Vec<AcPhase>,
    pub dc_power_w: f64,
    pub ac_power_w: f64,
    pub temperature_c: f64,
    pub daily_yield_wh: f64,
    pub total_yield_kwh: Option<f64>,
    pub cos_phi: Option<CosPhi>,
}

impl Telemetry {
    /// Power fed into the grid.
    pub fn power_w(&self) -> f64 {
        self.ac_power_w
    }

    /// Mean grid voltage across the reported phases.
    pub fn voltage_v(&self) -> f64 {
        if self.ac_phases.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.ac_phases.iter().map(|phase| phase.voltage_v).sum();
        sum / self.ac_phases.len() as f64
    }

    /// Total grid current across the reported phases.
    pub fn current_a(&self) -> f64 {
        self.ac_phases.iter().map(|phase| phase.current_a).sum()
    }

    pub fn energy_today_wh(&self) -> f64 {
        self.daily_yield_wh
    }
}

/// Why the last poll of a device failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    Timeout,
    BusError,
    ChecksumMismatch,
    FrameTooShort,
    UnknownCommand,
    Malformed,
    UnexpectedResponse,
    Encoding,
    /// The inverter reported a serial number other than the configured one.
    SerialMismatch,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "Timeout",
            FailureKind::BusError => "BusError",
            FailureKind::ChecksumMismatch => "ChecksumMismatch",
            FailureKind::FrameTooShort => "FrameTooShort",
            FailureKind::UnknownCommand => "UnknownCommand",
            FailureKind::Malformed => "Malformed",
            FailureKind::UnexpectedResponse => "UnexpectedResponse",
            FailureKind::Encoding => "Encoding",
            FailureKind::SerialMismatch => "SerialMismatch",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known state of one inverter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub telemetry: Option<Telemetry>,
    pub last_update_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub live: bool,
    pub last_error: Option<FailureKind>,
    pub serial_number: Option<String>,
    pub model: Option<String>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            telemetry: None,
            last_update_ms: None,
            consecutive_failures: 0,
            live: true,
            last_error: None,
            serial_number: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub address: DeviceAddress,
    #[serde(flatten)]
    pub state: DeviceState,
}

/// Immutable view of every registered device at the end of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sequence: u64,
    pub taken_at_ms: u64,
    pub devices: Vec<DeviceReport>,
}

impl Snapshot {
    pub fn device(&self, address: DeviceAddress) -> Option<&DeviceReport> {
        self.devices.iter().find(|report| report.address == address)
    }

    pub fn offline(&self) -> impl Iterator<Item = &DeviceReport> {
        self.devices.iter().filter(|report| !report.state.live)
    }
}

pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
