//! memory-bottle-daemon: Controller for a two-item memory bottle
//!
//! The bottle captures one audio clip and one color reading, then uploads
//! both to a host when poured. This daemon provides:
//! - Seven-state controller driven by a fixed-rate sensor tick
//! - Durable presence record of the captured items
//! - Non-blocking transfer to an HTTP relay (or a simulated one)
//! - IPC server and optional stdin console for driving the sensors
//!
//! Sensors are simulated; IPC clients and the console set their levels.

mod capture;
mod config;
mod device;
mod events;
mod ipc;
mod lifecycle;
mod memory;
mod sensors;
mod state;
mod transfer;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::capture::SimulatedCapture;
use crate::config::Config;
use crate::device::Device;
use crate::events::DeviceEvent;
use crate::ipc::Server;
use crate::lifecycle::ShutdownSignal;
use crate::memory::MemoryStore;
use crate::sensors::SensorBoard;
use crate::state::Controller;
use crate::transfer::{HttpRelay, SimulatedRelay, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "memory-bottle-daemon starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, ?config.storage_dir, "configuration loaded");

    // Register signal handlers before anything long-running starts
    let mut shutdown = ShutdownSignal::new().context("failed to register signal handlers")?;

    // Controller -> IPC subscribers and the event log
    let (event_tx, _event_rx) = broadcast::channel::<DeviceEvent>(64);

    let store = MemoryStore::open(&config.storage_dir)?;
    let controller = Controller::new(
        config.controller.clone(),
        store,
        SimulatedCapture::new(config.controller.sample_rate),
        event_tx.clone(),
    );

    let transport: Arc<dyn Transport> = match &config.relay_url {
        Some(url) => {
            let relay = HttpRelay::new(url)?;
            info!(url = relay.upload_url(), "using HTTP relay");
            Arc::new(relay)
        }
        None if config.simulate_transfer_failure => {
            warn!("simulated relay will fail every transfer");
            Arc::new(SimulatedRelay::failing(config.simulated_latency))
        }
        None => {
            info!("no relay configured, using simulated relay");
            Arc::new(SimulatedRelay::new(config.simulated_latency))
        }
    };

    let (device, handle) = Device::new(
        controller,
        SensorBoard::new(),
        transport,
        config.tick_interval,
    );

    // Create IPC server with event subscription
    let server = Server::new(&config.socket_path, handle.clone(), event_tx.clone())?;

    let mut log_rx = event_tx.subscribe();
    let console_enabled = config.console;

    info!("daemon initialized, entering main loop");

    // Main event loop
    tokio::select! {
        _ = device.run() => {
            info!("device loop exited");
        }

        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        result = async {
            if console_enabled {
                device::console::run(handle).await
            } else {
                std::future::pending().await
            }
        } => {
            match result {
                Ok(()) => info!("console closed"),
                Err(e) => error!(?e, "console error"),
            }
        }

        // Event log
        _ = async {
            loop {
                match log_rx.recv().await {
                    Ok(event) => debug!(%event, "device event"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "event log receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {
            info!("event log exited");
        }

        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    server.shutdown().await;

    info!("memory-bottle-daemon stopped");

    Ok(())
}
