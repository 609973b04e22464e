use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use bus_transport::{Parity, SerialConfig, StopBits, TransportConfig};
use telemetry_aggregator::SetupOptions;

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub serial: SerialConfig,
    pub transport: TransportConfig,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub offline_threshold: u32,
    pub addresses: Vec<u8>,
    pub expected_serials: BTreeMap<u8, String>,
    /// Serves Prometheus metrics on this address when set.
    pub metrics_listen: Option<SocketAddr>,
}

impl CollectorConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config)?;
        }

        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport.reconnect_backoff.is_zero() {
            anyhow::bail!("poller.reconnect_backoff_ms must be >= 1");
        }
        if self.transport.reconnect_max_backoff < self.transport.reconnect_backoff {
            anyhow::bail!("poller.reconnect_max_backoff_ms must be >= poller.reconnect_backoff_ms");
        }
        self.setup_options().validate()?;
        Ok(())
    }

    pub fn setup_options(&self) -> SetupOptions {
        SetupOptions {
            serial: self.serial.clone(),
            transport: self.transport.clone(),
            poll_interval: self.poll_interval,
            request_timeout: self.request_timeout,
            offline_threshold: self.offline_threshold,
            addresses: self.addresses.clone(),
            expected_serials: self.expected_serials.clone(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        let setup = SetupOptions::default();
        Self {
            serial: setup.serial,
            transport: setup.transport,
            poll_interval: setup.poll_interval,
            request_timeout: setup.request_timeout,
            offline_threshold: setup.offline_threshold,
            addresses: setup.addresses,
            expected_serials: setup.expected_serials,
            metrics_listen: None,
        }
    }
}

fn apply_env_overrides(config: &mut CollectorConfig) -> Result<()> {
    if let Ok(value) = env::var("KACO_PORT") {
        config.serial.path = value;
    }

    if let Some(baud_rate) = parse_env_u32("KACO_BAUD_RATE") {
        config.serial.baud_rate = baud_rate;
    }

    if let Ok(value) = env::var("KACO_ADDRESSES") {
        config.addresses = parse_addresses(&value).context("parse KACO_ADDRESSES")?;
        let addresses = &config.addresses;
        config
            .expected_serials
            .retain(|address, _| addresses.contains(address));
    }

    if let Some(interval_ms) = parse_env_u64("KACO_POLL_INTERVAL_MS") {
        config.poll_interval = Duration::from_millis(interval_ms);
    }

    if let Some(timeout_ms) = parse_env_u64("KACO_REQUEST_TIMEOUT_MS") {
        config.request_timeout = Duration::from_millis(timeout_ms);
    }

    config.offline_threshold =
        parse_env_u32("KACO_OFFLINE_THRESHOLD").unwrap_or(config.offline_threshold);

    if let Some(quiet_ms) = parse_env_u64("KACO_MIN_QUIET_MS") {
        config.transport.min_quiet = Duration::from_millis(quiet_ms);
    }

    if let Ok(value) = env::var("KACO_METRICS_LISTEN") {
        config.metrics_listen = Some(parse_listen(&value).context("parse KACO_METRICS_LISTEN")?);
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    serial: Option<FileSerialConfig>,
    poller: Option<FilePollerConfig>,
    devices: Option<Vec<FileDeviceConfig>>,
    metrics: Option<FileMetricsConfig>,
}

#[derive(Debug, Deserialize)]
struct FileSerialConfig {
    port: Option<String>,
    baud_rate: Option<u32>,
    data_bits: Option<u8>,
    parity: Option<String>,
    stop_bits: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct FilePollerConfig {
    poll_interval_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    offline_threshold: Option<u32>,
    min_quiet_ms: Option<u64>,
    reconnect_backoff_ms: Option<u64>,
    reconnect_max_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileDeviceConfig {
    address: u8,
    serial_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileMetricsConfig {
    listen: Option<String>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("KACO_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut CollectorConfig, file: FileConfig) -> Result<()> {
    if let Some(serial) = file.serial {
        if let Some(port) = serial.port {
            config.serial.path = port;
        }
        if let Some(baud_rate) = serial.baud_rate {
            config.serial.baud_rate = baud_rate;
        }
        if let Some(data_bits) = serial.data_bits {
            config.serial.data_bits = data_bits;
        }
        if let Some(parity) = serial.parity {
            config.serial.parity = parse_parity(&parity)?;
        }
        if let Some(stop_bits) = serial.stop_bits {
            config.serial.stop_bits = match stop_bits {
                1 => StopBits::One,
                2 => StopBits::Two,
                other => anyhow::bail!("serial.stop_bits must be 1 or 2, got {other}"),
            };
        }
    }

    if let Some(poller) = file.poller {
        if let Some(interval_ms) = poller.poll_interval_ms {
            config.poll_interval = Duration::from_millis(interval_ms);
        }
        if let Some(timeout_ms) = poller.request_timeout_ms {
            config.request_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(threshold) = poller.offline_threshold {
            config.offline_threshold = threshold;
        }
        if let Some(quiet_ms) = poller.min_quiet_ms {
            config.transport.min_quiet = Duration::from_millis(quiet_ms);
        }
        if let Some(backoff) = poller.reconnect_backoff_ms {
            config.transport.reconnect_backoff = Duration::from_millis(backoff);
        }
        if let Some(max_backoff) = poller.reconnect_max_backoff_ms {
            config.transport.reconnect_max_backoff = Duration::from_millis(max_backoff);
        }
    }

    if let Some(devices) = file.devices {
        config.addresses = devices.iter().map(|device| device.address).collect();
        config.expected_serials = devices
            .into_iter()
            .filter_map(|device| Some((device.address, device.serial_number?)))
            .collect();
    }

    if let Some(listen) = file.metrics.and_then(|metrics| metrics.listen) {
        config.metrics_listen = Some(parse_listen(&listen).context("parse metrics.listen")?);
    }

    Ok(())
}

fn parse_env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_addresses(value: &str) -> Result<Vec<u8>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<u8>()
                .with_context(|| format!("invalid device address '{entry}'"))
        })
        .collect()
}

fn parse_listen(value: &str) -> Result<SocketAddr> {
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid listen address '{value}'"))
}

fn parse_parity(value: &str) -> Result<Parity> {
    match value.to_ascii_lowercase().as_str() {
        "none" | "n" => Ok(Parity::None),
        "odd" | "o" => Ok(Parity::Odd),
        "even" | "e" => Ok(Parity::Even),
        other => anyhow::bail!("serial.parity must be none, odd or even, got '{other}'"),
    }
}
