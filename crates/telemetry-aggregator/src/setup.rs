use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::info;

use bus_transport::{BusTransport, SerialConfig, SerialConnector, TransportConfig};
use device_poller::{PollerConfig, MAX_REQUESTS_PER_POLL};
use types::DeviceAddress;

use crate::{Aggregator, AggregatorConfig, AggregatorError};

/// Everything needed to bring up polling on one serial port.
#[derive(Debug, Clone)]
pub struct SetupOptions {
    pub serial: SerialConfig,
    pub transport: TransportConfig,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub offline_threshold: u32,
    pub addresses: Vec<u8>,
    /// Serial numbers keyed by device address; a device reporting another
    /// serial number has its readings rejected.
    pub expected_serials: BTreeMap<u8, String>,
}

impl Default for SetupOptions {
    fn default() -> Self {
        let poller = PollerConfig::default();
        Self {
            serial: SerialConfig::default(),
            transport: TransportConfig::default(),
            poll_interval: AggregatorConfig::default().poll_interval,
            request_timeout: poller.request_timeout,
            offline_threshold: poller.offline_threshold,
            addresses: Vec::new(),
            expected_serials: BTreeMap::new(),
        }
    }
}

impl SetupOptions {
    /// Checks the options without touching the serial port and returns the
    /// parsed device addresses.
    pub fn validate(&self) -> Result<Vec<DeviceAddress>, AggregatorError> {
        self.serial
            .validate()
            .map_err(|err| invalid(err.to_string()))?;
        if self.poll_interval.is_zero() {
            return Err(invalid("poll interval must be greater than zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("request timeout must be greater than zero"));
        }
        if self.offline_threshold == 0 {
            return Err(invalid("offline threshold must be greater than zero"));
        }
        if self.addresses.is_empty() {
            return Err(invalid("at least one device address is required"));
        }

        let mut seen = BTreeSet::new();
        let mut addresses = Vec::with_capacity(self.addresses.len());
        for raw in &self.addresses {
            let address = DeviceAddress::new(*raw).map_err(|err| invalid(err.to_string()))?;
            if !seen.insert(address) {
                return Err(invalid(format!("device address {address} listed twice")));
            }
            addresses.push(address);
        }

        for (raw, serial) in &self.expected_serials {
            if !self.addresses.contains(raw) {
                return Err(invalid(format!(
                    "serial number given for unlisted device address {raw}"
                )));
            }
            if serial.is_empty() || serial.chars().any(char::is_whitespace) {
                return Err(invalid(format!(
                    "serial number for device address {raw} must be non-empty without spaces"
                )));
            }
        }

        let worst_case = self.worst_case_cycle();
        if worst_case >= self.poll_interval {
            return Err(invalid(format!(
                "{} devices x {} requests x ({}ms timeout + {}ms quiet time) = {}ms does not fit in a {}ms poll interval",
                addresses.len(),
                MAX_REQUESTS_PER_POLL,
                self.request_timeout.as_millis(),
                self.transport.min_quiet.as_millis(),
                worst_case.as_millis(),
                self.poll_interval.as_millis()
            )));
        }

        Ok(addresses)
    }

    /// Longest possible cycle: every device issues its largest number of
    /// requests and each one waits out the quiet time and the full timeout.
    pub fn worst_case_cycle(&self) -> Duration {
        self.request_timeout
            .saturating_add(self.transport.min_quiet)
            .saturating_mul(MAX_REQUESTS_PER_POLL)
            .saturating_mul(self.addresses.len() as u32)
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            poll_interval: self.poll_interval,
            poller: PollerConfig {
                offline_threshold: self.offline_threshold,
                request_timeout: self.request_timeout,
            },
        }
    }
}

impl Aggregator<BusTransport<SerialConnector>> {
    /// Validates `options`, claims the serial port and registers every
    /// address.
    pub fn configure(options: SetupOptions) -> Result<Self, AggregatorError> {
        let addresses = options.validate()?;
        let bus = BusTransport::open(options.serial.clone(), options.transport.clone())?;
        let aggregator = Aggregator::new(bus, options.aggregator_config());
        for address in addresses {
            match options.expected_serials.get(&address.get()) {
                Some(serial) => aggregator.add_device_with_serial(address, serial.clone())?,
                None => aggregator.add_device(address)?,
            }
        }
        info!(
            port = %options.serial.path,
            baud_rate = options.serial.baud_rate,
            devices = options.addresses.len(),
            worst_case_cycle_ms = options.worst_case_cycle().as_millis(),
            "aggregator configured"
        );
        Ok(aggregator)
    }
}

fn invalid(message: impl Into<String>) -> AggregatorError {
    AggregatorError::InvalidConfiguration(message.into())
}
