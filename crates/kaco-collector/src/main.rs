use std::env;
use std::io::{self, Write};
use std::sync::Arc;
#[cfg(target_os = "linux")]
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{broadcast, watch};
#[cfg(target_os = "linux")]
use tokio::time::sleep;
use tracing::{info, warn};

use bus_transport::{BusTransport, SerialConnector};
use kaco_collector::{event_line, snapshot_line, CollectorConfig};
use telemetry_aggregator::{Aggregator, LivenessEvent};
use types::Snapshot;

type SerialAggregator = Aggregator<BusTransport<SerialConnector>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = parse_config_arg();
    let config = CollectorConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;

    if let Some(listen) = config.metrics_listen {
        PrometheusBuilder::new()
            .with_http_listener(listen)
            .install()
            .context("metrics exporter setup failed")?;
        info!(%listen, "metrics exporter listening");
    }

    let aggregator: Arc<SerialAggregator> = Arc::new(
        Aggregator::configure(config.setup_options()).context("aggregator setup failed")?,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let snapshot_handle = tokio::spawn(snapshot_task(aggregator.subscribe(), shutdown_rx.clone()));
    let event_handle = tokio::spawn(event_task(
        aggregator.subscribe_events(),
        shutdown_rx.clone(),
    ));
    let runner_handle = {
        let aggregator = aggregator.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { aggregator.run(shutdown).await })
    };

    notify_ready();
    let watchdog_handle = start_watchdog(aggregator.clone(), shutdown_rx.clone());

    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Err(err) = runner_handle.await {
        warn!(error = %err, "aggregator task join failed");
    }
    let _ = snapshot_handle.await;
    let _ = event_handle.await;
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

async fn snapshot_task(
    mut snapshots: watch::Receiver<Arc<Snapshot>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                match snapshot_line(&snapshot) {
                    Ok(line) => write_line(&line),
                    Err(err) => warn!(sequence = snapshot.sequence, error = %err, "snapshot serialization failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("snapshot output shutdown requested");
                    break;
                }
            }
        }
    }
}

async fn event_task(
    mut events: broadcast::Receiver<LivenessEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = events.recv() => {
                match received {
                    Ok(event) => match event_line(&event) {
                        Ok(line) => write_line(&line),
                        Err(err) => warn!(address = %event.address, error = %err, "event serialization failed"),
                    },
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "liveness events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn write_line(line: &str) {
    let mut stdout = io::stdout().lock();
    if let Err(err) = writeln!(stdout, "{line}").and_then(|_| stdout.flush()) {
        warn!(error = %err, "stdout write failed");
    }
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

/// Pings the systemd watchdog while cycles keep completing.
#[cfg(target_os = "linux")]
fn start_watchdog(
    aggregator: Arc<SerialAggregator>,
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    let stale_after = aggregator.config().poll_interval.saturating_mul(3);
    Some(tokio::spawn(async move {
        let started = std::time::Instant::now();
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    let latest = aggregator.latest();
                    let age = if latest.sequence == 0 {
                        started.elapsed()
                    } else {
                        Duration::from_millis(types::unix_ms().saturating_sub(latest.taken_at_ms))
                    };
                    if age > stale_after {
                        warn!(age_ms = age.as_millis(), "no completed cycle recently, skipping watchdog ping");
                        continue;
                    }
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(
    _aggregator: Arc<SerialAggregator>,
    _shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
