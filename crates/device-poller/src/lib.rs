//! Per-inverter polling state. Poll outcomes are counted through the
//! `metrics` facade and exported only when the host installs a recorder.

use std::time::{Duration, Instant};

use metrics::counter;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use bus_transport::{Bus, TransportError};
use kaco_protocol::{resolve_model_name, Command, QueryFrame, ResponseBody};
use types::{unix_ms, DeviceAddress, DeviceReport, DeviceState, FailureKind, Telemetry};

/// Most requests one poll can issue: the readings query followed by the
/// three unit queries on the poll that detects a 000xi inverter.
pub const MAX_REQUESTS_PER_POLL: u32 = 4;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Consecutive failures after which a device is reported offline.
    pub offline_threshold: u32,
    pub request_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            offline_threshold: 3,
            request_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Querying,
    Succeeded,
    Failed,
}

/// Which dialect the inverter answered the readings query in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    Unknown,
    /// Fixed-width `0` replies (00, 02 and XP series).
    Legacy,
    /// `4` reply; readings come from units 1..3 (000xi series).
    ThreeUnit,
    /// Variable-width `n` replies with CRC.
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Success,
    /// Readings were stored, then the bus failed on the serial number query.
    SuccessThenBusError,
    Failed(FailureKind),
}

impl PollOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, PollOutcome::Success | PollOutcome::SuccessThenBusError)
    }

    /// The bus itself failed; later devices in the cycle cannot be reached.
    pub fn is_bus_error(self) -> bool {
        matches!(
            self,
            PollOutcome::Failed(FailureKind::BusError) | PollOutcome::SuccessThenBusError
        )
    }
}

enum SerialCheck {
    Done,
    Mismatch(String),
    BusLost,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("expected reply to {expected:?}, got {actual:?}")]
    UnexpectedReply { expected: Command, actual: Command },
}

impl PollError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PollError::Transport(err) => err.failure_kind(),
            PollError::UnexpectedReply { .. } => FailureKind::UnexpectedResponse,
        }
    }
}

/// Owns the state of one inverter and polls it on request.
pub struct DevicePoller {
    address: DeviceAddress,
    config: PollerConfig,
    state: DeviceState,
    poll_state: PollerState,
    variant: ProtocolVariant,
    expected_serial: Option<String>,
    serial_requested: bool,
}

impl DevicePoller {
    pub fn new(address: DeviceAddress, config: PollerConfig) -> Self {
        Self {
            address,
            config,
            state: DeviceState::default(),
            poll_state: PollerState::Idle,
            variant: ProtocolVariant::Unknown,
            expected_serial: None,
            serial_requested: false,
        }
    }

    /// Rejects readings from a generic-protocol inverter whose serial number
    /// differs from `serial`.
    pub fn with_expected_serial(mut self, serial: impl Into<String>) -> Self {
        self.expected_serial = Some(serial.into());
        self
    }

    pub fn expected_serial(&self) -> Option<&str> {
        self.expected_serial.as_deref()
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn poll_state(&self) -> PollerState {
        self.poll_state
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    pub fn report(&self) -> DeviceReport {
        DeviceReport {
            address: self.address,
            state: self.state.clone(),
        }
    }

    /// Sends one readings query (three for 000xi inverters) and folds the
    /// result into the device state. Never retries.
    pub async fn poll_once<B: Bus + ?Sized>(&mut self, bus: &B) -> PollOutcome {
        self.transition(PollerState::Querying);
        let started = Instant::now();

        let result = match self.variant {
            ProtocolVariant::ThreeUnit => self.read_units(bus).await,
            _ => self.read_readings(bus).await,
        };

        let outcome = match result {
            Ok(telemetry) => {
                let check = if self.variant == ProtocolVariant::Generic && !self.serial_requested {
                    self.query_serial_number(bus).await
                } else {
                    SerialCheck::Done
                };

                match check {
                    SerialCheck::Mismatch(actual) => {
                        self.record_failure(FailureKind::SerialMismatch);
                        error!(
                            address = %self.address,
                            expected = self.expected_serial.as_deref().unwrap_or_default(),
                            actual = %actual,
                            consecutive_failures = self.state.consecutive_failures,
                            "serial number mismatch, readings discarded"
                        );
                        PollOutcome::Failed(FailureKind::SerialMismatch)
                    }
                    SerialCheck::BusLost => {
                        self.record_success(telemetry);
                        PollOutcome::SuccessThenBusError
                    }
                    SerialCheck::Done => {
                        self.record_success(telemetry);
                        debug!(
                            address = %self.address,
                            variant = ?self.variant,
                            elapsed_ms = started.elapsed().as_millis(),
                            "poll succeeded"
                        );
                        PollOutcome::Success
                    }
                }
            }
            Err(err) => {
                let kind = err.failure_kind();
                self.record_failure(kind);
                if kind == FailureKind::Encoding {
                    error!(address = %self.address, error = %err, "query could not be encoded");
                } else {
                    warn!(
                        address = %self.address,
                        error = %err,
                        consecutive_failures = self.state.consecutive_failures,
                        "poll failed"
                    );
                }
                PollOutcome::Failed(kind)
            }
        };

        self.transition(PollerState::Idle);
        outcome
    }

    /// Counts a `BusError` for a device skipped because the bus failed
    /// earlier in the cycle. Liveness follows the same threshold as a failed
    /// poll.
    pub fn note_bus_error(&mut self) {
        counter!("kaco_polls_skipped_total", "address" => self.address.to_string()).increment(1);
        self.count_failure(FailureKind::BusError);
        debug!(
            address = %self.address,
            consecutive_failures = self.state.consecutive_failures,
            live = self.state.live,
            "poll skipped, bus down"
        );
    }

    async fn read_readings<B: Bus + ?Sized>(&mut self, bus: &B) -> Result<Telemetry, PollError> {
        let query = QueryFrame::new(self.address, Command::Readings);
        let reply = bus.request(&query, self.config.request_timeout).await?;

        match reply.body {
            ResponseBody::Readings { layout, telemetry } if reply.command == Command::Readings => {
                if self.variant != ProtocolVariant::Legacy {
                    debug!(address = %self.address, layout = ?layout, "legacy layout");
                }
                self.settle_variant(ProtocolVariant::Legacy);
                Ok(telemetry)
            }
            ResponseBody::Generic(telemetry) => {
                self.settle_variant(ProtocolVariant::Generic);
                Ok(telemetry)
            }
            ResponseBody::UnitsFollow => {
                self.settle_variant(ProtocolVariant::ThreeUnit);
                self.read_units(bus).await
            }
            _ => Err(PollError::UnexpectedReply {
                expected: Command::Readings,
                actual: reply.command,
            }),
        }
    }

    async fn read_units<B: Bus + ?Sized>(&mut self, bus: &B) -> Result<Telemetry, PollError> {
        let mut units = Vec::with_capacity(Command::UNIT_COUNT as usize);
        for index in 1..=Command::UNIT_COUNT {
            let command = Command::Unit(index);
            let reply = bus
                .request(
                    &QueryFrame::new(self.address, command),
                    self.config.request_timeout,
                )
                .await?;
            match reply.body {
                ResponseBody::Readings { telemetry, .. } if reply.command == command => {
                    units.push(telemetry);
                }
                _ => {
                    return Err(PollError::UnexpectedReply {
                        expected: command,
                        actual: reply.command,
                    })
                }
            }
        }
        Ok(merge_units(units))
    }

    /// Asks once for the serial number. A mismatch or a bus failure leaves
    /// the question open for the next poll; any other failure means the
    /// inverter does not support the query.
    async fn query_serial_number<B: Bus + ?Sized>(&mut self, bus: &B) -> SerialCheck {
        let query = QueryFrame::new(self.address, Command::SerialNumber);
        match bus.request(&query, self.config.request_timeout).await {
            Ok(reply) => match reply.body {
                ResponseBody::SerialNumber(serial) => {
                    if let Some(expected) = &self.expected_serial {
                        if *expected != serial {
                            return SerialCheck::Mismatch(serial);
                        }
                    }
                    info!(address = %self.address, serial_number = %serial, "serial number read");
                    self.serial_requested = true;
                    self.state.serial_number = Some(serial);
                    SerialCheck::Done
                }
                _ => {
                    warn!(
                        address = %self.address,
                        command = ?reply.command,
                        "unexpected reply to serial number query"
                    );
                    self.serial_requested = true;
                    SerialCheck::Done
                }
            },
            Err(err) if err.is_bus_error() => {
                warn!(address = %self.address, error = %err, "bus failed during serial number query");
                SerialCheck::BusLost
            }
            Err(err) => {
                warn!(address = %self.address, error = %err, "serial number query failed");
                self.serial_requested = true;
                SerialCheck::Done
            }
        }
    }

    fn settle_variant(&mut self, variant: ProtocolVariant) {
        if self.variant != variant {
            info!(
                address = %self.address,
                from = ?self.variant,
                to = ?variant,
                "protocol variant detected"
            );
            self.variant = variant;
            if variant != ProtocolVariant::Generic && self.expected_serial.is_some() {
                warn!(
                    address = %self.address,
                    variant = ?variant,
                    "inverter has no serial number query, expected serial not checked"
                );
            }
        }
    }

    fn record_success(&mut self, telemetry: Telemetry) {
        self.transition(PollerState::Succeeded);
        counter!("kaco_polls_total", "address" => self.address.to_string(), "outcome" => "success")
            .increment(1);

        let type_changed = self
            .state
            .telemetry
            .as_ref()
            .map(|previous| previous.inverter_type != telemetry.inverter_type)
            .unwrap_or(true);
        if type_changed {
            self.state.model = resolve_model_name(&telemetry.inverter_type).map(str::to_string);
        }

        self.state.telemetry = Some(telemetry);
        self.state.last_update_ms = Some(unix_ms());
        self.state.consecutive_failures = 0;
        self.state.live = true;
        self.state.last_error = None;
    }

    fn record_failure(&mut self, kind: FailureKind) {
        self.transition(PollerState::Failed);
        counter!("kaco_polls_total", "address" => self.address.to_string(), "outcome" => kind.as_str())
            .increment(1);
        self.count_failure(kind);
    }

    fn count_failure(&mut self, kind: FailureKind) {
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        self.state.last_error = Some(kind);
        if self.state.consecutive_failures >= self.config.offline_threshold {
            self.state.live = false;
        }
    }

    fn transition(&mut self, next: PollerState) {
        debug!(address = %self.address, from = ?self.poll_state, to = ?next, "poller state");
        self.poll_state = next;
    }
}

/// Folds the three unit replies of a 000xi inverter into one reading. The
/// status of unit 1 is reported.
fn merge_units(units: Vec<Telemetry>) -> Telemetry {
    let mut merged = Telemetry::default();
    for (index, unit) in units.into_iter().enumerate() {
        if index == 0 {
            merged.status = unit.status;
            let mut chars = unit.inverter_type.chars();
            chars.next_back();
            merged.inverter_type = format!("3x{}", chars.as_str());
            merged.temperature_c = unit.temperature_c;
        }
        merged.dc_inputs.extend(unit.dc_inputs);
        merged.ac_phases.extend(unit.ac_phases);
        merged.dc_power_w += unit.dc_power_w;
        merged.ac_power_w += unit.ac_power_w;
        merged.temperature_c = merged.temperature_c.max(unit.temperature_c);
        merged.daily_yield_wh += unit.daily_yield_wh;
    }
    merged
}
