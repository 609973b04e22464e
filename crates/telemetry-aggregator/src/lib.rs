//! Polls every registered inverter once per tick over the shared bus and
//! publishes the result as an immutable [`Snapshot`].
//!
//! Cycle durations and poll outcomes are recorded through the `metrics`
//! facade; they are only exported once the host installs a recorder.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use metrics::histogram;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use bus_transport::{Bus, TransportError};
use device_poller::{DevicePoller, PollerConfig};
use types::{unix_ms, DeviceAddress, FailureKind, Snapshot};

mod setup;

pub use setup::SetupOptions;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub poll_interval: Duration,
    pub poller: PollerConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            poller: PollerConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("device {0} is already registered")]
    DuplicateAddress(DeviceAddress),
    #[error("device {0} is not registered")]
    UnknownAddress(DeviceAddress),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Edge-triggered change of a device's liveness between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivenessEvent {
    pub address: DeviceAddress,
    pub live: bool,
    pub last_error: Option<FailureKind>,
    pub sequence: u64,
}

pub struct Aggregator<B: Bus> {
    bus: B,
    config: AggregatorConfig,
    /// Registered addresses with their expected serial number, if any.
    registered: Mutex<BTreeMap<DeviceAddress, Option<String>>>,
    pollers: tokio::sync::Mutex<BTreeMap<DeviceAddress, DevicePoller>>,
    cycle_running: AtomicBool,
    sequence: AtomicU64,
    snapshots: watch::Sender<Arc<Snapshot>>,
    events: broadcast::Sender<LivenessEvent>,
}

/// Clears the cycle flag even when a cycle future is dropped mid-way.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<B: Bus> Aggregator<B> {
    pub fn new(bus: B, config: AggregatorConfig) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(Snapshot::default()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            bus,
            config,
            registered: Mutex::new(BTreeMap::new()),
            pollers: tokio::sync::Mutex::new(BTreeMap::new()),
            cycle_running: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            snapshots,
            events,
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Registers a device; it is polled from the next cycle on.
    pub fn add_device(&self, address: DeviceAddress) -> Result<(), AggregatorError> {
        self.register(address, None)
    }

    /// Registers a device whose readings are only accepted while it reports
    /// `serial` as its serial number.
    pub fn add_device_with_serial(
        &self,
        address: DeviceAddress,
        serial: impl Into<String>,
    ) -> Result<(), AggregatorError> {
        self.register(address, Some(serial.into()))
    }

    fn register(
        &self,
        address: DeviceAddress,
        expected_serial: Option<String>,
    ) -> Result<(), AggregatorError> {
        let mut registered = self.registered();
        if registered.contains_key(&address) {
            return Err(AggregatorError::DuplicateAddress(address));
        }
        info!(
            address = %address,
            expected_serial = expected_serial.as_deref().unwrap_or("-"),
            devices = registered.len() + 1,
            "device registered"
        );
        registered.insert(address, expected_serial);
        Ok(())
    }

    pub fn remove_device(&self, address: DeviceAddress) -> Result<(), AggregatorError> {
        let mut registered = self.registered();
        if registered.remove(&address).is_none() {
            return Err(AggregatorError::UnknownAddress(address));
        }
        info!(address = %address, devices = registered.len(), "device removed");
        Ok(())
    }

    pub fn devices(&self) -> Vec<DeviceAddress> {
        self.registered().keys().copied().collect()
    }

    pub fn expected_serial(&self, address: DeviceAddress) -> Option<String> {
        self.registered().get(&address).cloned().flatten()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LivenessEvent> {
        self.events.subscribe()
    }

    pub fn latest(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    /// Runs one cycle per tick until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            devices = self.registered().len(),
            "aggregator started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle(Some(&shutdown)).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("aggregator shutdown requested");
    }

    /// Polls every registered device once. Returns `None` when another cycle
    /// is still running.
    pub async fn run_cycle(&self) -> Option<Arc<Snapshot>> {
        self.cycle(None).await
    }

    async fn cycle(&self, shutdown: Option<&watch::Receiver<bool>>) -> Option<Arc<Snapshot>> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("cycle skipped, previous cycle still running");
            return None;
        }
        let _guard = CycleGuard(&self.cycle_running);

        let started = Instant::now();
        let mut pollers = self.pollers.lock().await;
        self.reconcile(&mut pollers);

        let mut bus_failed = false;
        let mut interrupted = false;
        for poller in pollers.values_mut() {
            if bus_failed {
                poller.note_bus_error();
                continue;
            }
            if shutdown.map(|rx| *rx.borrow()).unwrap_or(false) {
                interrupted = true;
                break;
            }
            let outcome = poller.poll_once(&self.bus).await;
            if outcome.is_bus_error() {
                warn!(
                    address = %poller.address(),
                    "bus failed, skipping remaining devices this cycle"
                );
                bus_failed = true;
            }
        }

        let devices = pollers.values().map(DevicePoller::report).collect::<Vec<_>>();
        drop(pollers);

        let snapshot = Arc::new(Snapshot {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            taken_at_ms: unix_ms(),
            devices,
        });
        let previous = self.snapshots.send_replace(snapshot.clone());
        self.emit_transitions(&previous, &snapshot);

        let elapsed = started.elapsed();
        histogram!("kaco_cycle_duration_seconds").record(elapsed.as_secs_f64());
        if elapsed > self.config.poll_interval {
            warn!(
                elapsed_ms = elapsed.as_millis(),
                poll_interval_ms = self.config.poll_interval.as_millis(),
                "cycle overran the poll interval"
            );
        }
        info!(
            sequence = snapshot.sequence,
            devices = snapshot.devices.len(),
            offline = snapshot.offline().count(),
            bus_failed,
            interrupted,
            elapsed_ms = elapsed.as_millis(),
            "cycle complete"
        );

        Some(snapshot)
    }

    fn reconcile(&self, pollers: &mut BTreeMap<DeviceAddress, DevicePoller>) {
        let registered = self.registered().clone();
        pollers.retain(|address, poller| {
            registered
                .get(address)
                .is_some_and(|expected| expected.as_deref() == poller.expected_serial())
        });
        for (address, expected_serial) in registered {
            pollers.entry(address).or_insert_with(|| {
                let poller = DevicePoller::new(address, self.config.poller.clone());
                match expected_serial {
                    Some(serial) => poller.with_expected_serial(serial),
                    None => poller,
                }
            });
        }
    }

    fn emit_transitions(&self, previous: &Snapshot, current: &Snapshot) {
        for report in &current.devices {
            let was_live = previous
                .device(report.address)
                .map(|before| before.state.live)
                .unwrap_or(true);
            if was_live == report.state.live {
                continue;
            }

            if report.state.live {
                info!(address = %report.address, "device online");
            } else {
                info!(
                    address = %report.address,
                    last_error = ?report.state.last_error,
                    failures = report.state.consecutive_failures,
                    "device offline"
                );
            }
            let _ = self.events.send(LivenessEvent {
                address: report.address,
                live: report.state.live,
                last_error: report.state.last_error,
                sequence: current.sequence,
            });
        }
    }

    fn registered(&self) -> std::sync::MutexGuard<'_, BTreeMap<DeviceAddress, Option<String>>> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
