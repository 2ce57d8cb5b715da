// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

mod arbiter;
mod backend;
#[cfg(feature = "bluetooth")]
mod ble;
mod config;
mod dispatch;
mod forwarder;
mod registry;
mod session;
mod state;
mod store;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use uwb_app::{init_logging, ConfigFile};
use uwb_core::{DeviceRole, DiscoveredDevice, DynResult, RadioLink, TelemetryThrottle};

use arbiter::{ArbiterConfig, CommandArbiter};
use backend::{run_backend_link, BackendChannel, BackendLinkConfig, TcpBackend};
use config::GatewayConfig;
use dispatch::run_dispatch_loop;
use forwarder::run_telemetry_forwarder;
use registry::SessionRegistry;
use session::{SessionContext, SessionTiming};
use state::GatewayState;
use store::RegistryStore;

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - UWB module gateway");
const INBOUND_CHANNEL_BUFFER: usize = 64;
const TASK_STOP_GRACE: Duration = Duration::from_millis(400);

#[derive(Debug, Parser)]
#[command(
    author = env!("CARGO_PKG_AUTHORS"),
    version = env!("CARGO_PKG_VERSION"),
    about = PKG_DESCRIPTION,
)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// Module registry file (overrides [registry].path)
    #[arg(short = 'r', long = "registry", value_name = "FILE")]
    registry: Option<PathBuf>,
    /// Backend address as host:port (overrides [backend].addr)
    #[arg(short = 'b', long = "backend", value_name = "ADDR")]
    backend: Option<String>,
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,
    /// Scan for nearby modules, print them and exit
    #[arg(long = "scan")]
    scan: bool,
}

fn apply_cli_overrides(cfg: &mut GatewayConfig, cli: &Cli) {
    if let Some(path) = &cli.registry {
        cfg.registry.path = path.clone();
    }
    if let Some(addr) = &cli.backend {
        cfg.backend.addr = addr.clone();
    }
    if let Some(level) = &cli.log_level {
        cfg.general.log_level = Some(level.clone());
    }
}

#[cfg(feature = "bluetooth")]
async fn open_radio_link() -> DynResult<Arc<dyn RadioLink>> {
    let link = ble::BleLink::new().await?;
    Ok(Arc::new(link))
}

#[cfg(not(feature = "bluetooth"))]
async fn open_radio_link() -> DynResult<Arc<dyn RadioLink>> {
    Err("built without Bluetooth support; rebuild with --features bluetooth".into())
}

async fn discover_modules(
    link: &dyn RadioLink,
    cfg: &GatewayConfig,
) -> DynResult<Vec<DiscoveredDevice>> {
    let found = link
        .discover(Duration::from_secs(cfg.radio.scan_secs))
        .await?;
    Ok(found
        .into_iter()
        .filter(|d| d.matches_prefix(&cfg.radio.name_prefixes))
        .collect())
}

#[tokio::main]
async fn main() -> DynResult<()> {
    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", GatewayConfig::example_toml());
        return Ok(());
    }

    let (mut cfg, config_path) = GatewayConfig::load(cli.config.as_deref())?;
    apply_cli_overrides(&mut cfg, &cli);
    cfg.validate()
        .map_err(|e| format!("Invalid gateway configuration: {}", e))?;

    init_logging(cfg.general.log_level.as_deref());

    if let Some(ref path) = config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let link = open_radio_link().await?;

    if cli.scan {
        let found = discover_modules(link.as_ref(), &cfg).await?;
        for device in &found {
            println!(
                "{}  {}",
                device.address,
                device.name.as_deref().unwrap_or("-")
            );
        }
        println!("{} module(s) found", found.len());
        return Ok(());
    }

    let store = Arc::new(RegistryStore::new(&cfg.registry.path));
    let records = store
        .load()
        .await
        .map_err(|e| format!("Cannot load module registry: {}", e))?;
    info!(
        "Starting {} ({} modules, backend {})",
        env!("CARGO_PKG_NAME"),
        records.len(),
        cfg.backend.addr
    );

    let mut task_handles: Vec<JoinHandle<()>> = Vec::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(GatewayState::new());

    let (tcp_backend, outbound_rx) = TcpBackend::new(cfg.backend.outbound_buffer);
    let backend: Arc<dyn BackendChannel> = tcp_backend.clone();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_BUFFER);
    task_handles.push(tokio::spawn(run_backend_link(
        BackendLinkConfig {
            addr: cfg.backend.addr.clone(),
            gateway_id: cfg.general.gateway_id.clone(),
            token: cfg.backend.token.clone(),
            reconnect: cfg.backend.reconnect_policy(),
            slow_retry: cfg.backend.slow_retry(),
        },
        tcp_backend,
        outbound_rx,
        inbound_tx,
        shutdown_rx.clone(),
    )));

    let (frames_tx, frames_rx) = mpsc::channel(cfg.telemetry.queue_size);
    task_handles.push(tokio::spawn(run_telemetry_forwarder(
        frames_rx,
        TelemetryThrottle::new(
            cfg.telemetry.admission_filter(),
            Duration::from_millis(cfg.telemetry.interval_ms),
        ),
        state.clone(),
        backend.clone(),
        shutdown_rx.clone(),
    )));

    let ctx = SessionContext {
        link: link.clone(),
        backend: backend.clone(),
        frames_tx,
        timing: Arc::new(SessionTiming {
            connect: cfg.session.connect_policy(),
            backoff: Duration::from_millis(cfg.session.backoff_ms),
            hold_interval: Duration::from_millis(cfg.session.hold_interval_ms),
            anchor_read_gap: Duration::from_millis(cfg.session.anchor_read_gap_ms),
            notification_buffer: cfg.session.notification_buffer,
        }),
    };
    let registry = Arc::new(SessionRegistry::new(
        ctx,
        Duration::from_millis(cfg.session.stop_timeout_ms),
    ));
    for record in &records {
        registry.register(&record.address, record.role);
    }

    if cfg.radio.scan_on_start {
        match discover_modules(link.as_ref(), &cfg).await {
            Ok(found) => {
                for device in &found {
                    info!(
                        "[{}] discovered ({})",
                        device.address,
                        device.name.as_deref().unwrap_or("-")
                    );
                }
                for record in &records {
                    if !found.iter().any(|d| d.address == record.address) {
                        warn!("[{}] registered {} not seen in scan", record.address, record.role);
                    }
                }
            }
            Err(e) => warn!("Startup scan failed: {}", e),
        }
    }

    for record in &records {
        if record.role == DeviceRole::Anchor && !cfg.radio.start_anchors {
            continue;
        }
        if let Err(e) = registry.start(&record.address, record.role).await {
            warn!("[{}] session not started: {}", record.address, e);
        }
    }

    let arbiter = CommandArbiter::new(
        registry.clone(),
        link.clone(),
        store.clone(),
        backend.clone(),
        ArbiterConfig {
            write: cfg.commands.write_policy(),
            settle: Duration::from_millis(cfg.commands.settle_ms),
            queue_size: cfg.commands.queue_size,
        },
    );
    task_handles.push(tokio::spawn(run_dispatch_loop(
        inbound_rx,
        state,
        arbiter.clone(),
        shutdown_rx.clone(),
    )));

    signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down");
    let _ = shutdown_tx.send(true);
    // Commands first, so no write reconnects a device after its session is gone.
    arbiter
        .shutdown(Duration::from_millis(cfg.session.stop_timeout_ms))
        .await;
    registry.shutdown().await;
    tokio::time::sleep(TASK_STOP_GRACE).await;

    for handle in &task_handles {
        if !handle.is_finished() {
            handle.abort();
        }
    }
    for handle in task_handles {
        let _ = handle.await;
    }
    Ok(())
}
