//! Kiosk gateway - vending kiosk hardware control plane
//!
//! Accepts coins and bills, tracks payment sessions, dispenses exact
//! change and pulses dispensing slots with infra-red delivery
//! confirmation.
//!
//! Module structure:
//! - `domain/` - Core payment and dispense types
//! - `io/` - Hardware interfaces (serial mux, device link, acceptors)
//! - `services/` - Business logic (Session, Hopper, Dispatch, Confirm)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use kiosk_gateway::domain::types::{BillAcceptor, CoinAcceptor};
use kiosk_gateway::infra::{CoinMode, Config, LinkMode, Metrics};
use kiosk_gateway::io::coin_pulse::{CoinPulseDecoder, PulseDecoderConfig};
use kiosk_gateway::io::mux_board::LoggingMuxBoard;
use kiosk_gateway::io::{
    create_ui_channel, start_control_listener, BillLineParser, ChannelMuxController,
    CoinStreamAdapter, DeviceEndpoint, DeviceLinkClient, DeviceTarget, SerialMuxRegistry,
    SessionEgress, UiMessage,
};
use kiosk_gateway::services::{
    CoinHopperController, DispenseConfirmationMonitor, PaymentSession, SlotDispenseCoordinator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Kiosk gateway - vending kiosk hardware control plane
#[derive(Parser, Debug)]
#[command(name = "kiosk-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("kiosk-gateway starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    let actuator_mode = match config.actuator().mode {
        LinkMode::Tcp => "tcp",
        LinkMode::Serial => "serial",
    };
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        actuator_mode = %actuator_mode,
        actuator_host = %config.actuator().host,
        shared_link = %config.shared_link().device,
        slots = %config.slot_table().len(),
        confirm_mode = %config.confirm().mode.as_str(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());
    let (ui_sender, mut ui_rx) = create_ui_channel(1000, metrics.clone());

    // One registry owns every shared physical serial line
    let registry = SerialMuxRegistry::new(shutdown_rx.clone());
    let shared_link = registry.open(&config.shared_link().device, config.shared_link().baud);

    // Device link client shared by the actuator and hopper endpoints
    let client = Arc::new(DeviceLinkClient::new(
        Duration::from_millis(config.actuator().retry_backoff_ms),
        metrics.clone(),
    ));
    let actuator = DeviceEndpoint::new(
        client.clone(),
        DeviceTarget::from_link(
            &config.actuator().mode,
            &config.actuator().host,
            config.actuator().port,
            &config.actuator().serial_device,
            config.actuator().baud,
        ),
        Duration::from_millis(config.actuator().timeout_ms),
        config.actuator().retries,
    );
    let hopper_endpoint = DeviceEndpoint::new(
        client,
        DeviceTarget::from_link(
            &config.hopper().mode,
            &config.hopper().host,
            config.hopper().port,
            &config.hopper().serial_device,
            config.hopper().baud,
        ),
        Duration::from_millis(config.hopper().timeout_ms),
        config.hopper().retries,
    );
    let hopper =
        Arc::new(CoinHopperController::new(hopper_endpoint, config.hopper(), metrics.clone()));

    // Coin acceptor backend, chosen at construction
    let mut _pulse_edge_tx: Option<mpsc::Sender<kiosk_gateway::io::coin_pulse::Edge>> = None;
    let coins: Arc<dyn CoinAcceptor> = match config.coin().mode {
        CoinMode::Protocol => CoinStreamAdapter::dedicated(
            &registry,
            config.coin(),
            metrics.clone(),
            shutdown_rx.clone(),
        ),
        CoinMode::Shared => CoinStreamAdapter::shared(
            shared_link.clone(),
            config.coin(),
            metrics.clone(),
            shutdown_rx.clone(),
        ),
        CoinMode::Pulse => {
            let (edge_tx, edge_rx) = mpsc::channel(256);
            let decoder = CoinPulseDecoder::spawn(
                PulseDecoderConfig::from(config.coin()),
                edge_rx,
                metrics.clone(),
                shutdown_rx.clone(),
            );
            // The GPIO edge poller is board wiring; deployments attach it
            // via io::coin_pulse::spawn_edge_poller with their pin type
            warn!(pin = %config.coin().gpio_pin, "coin_pulse_edge_source_not_attached");
            _pulse_edge_tx = Some(edge_tx);
            decoder
        }
    };

    // Bill acceptor backend
    let bills: Arc<dyn BillAcceptor> = if config.bill().use_shared_link {
        BillLineParser::shared(
            shared_link.clone(),
            config.bill(),
            metrics.clone(),
            shutdown_rx.clone(),
        )
    } else {
        BillLineParser::dedicated(config.bill(), metrics.clone(), shutdown_rx.clone())
    };

    // Multiplexer board for slots 49-64; platform wiring is injected,
    // the logging stand-in keeps headless hosts alive
    info!(
        select_pins = ?config.mux().select_pins,
        signal_pin = %config.mux().signal_pin,
        "mux_board_configured"
    );
    let mux = Arc::new(ChannelMuxController::new(
        Box::new(LoggingMuxBoard),
        Duration::from_millis(config.mux().settle_ms),
    ));

    // Dispense confirmation monitor on the shared link's IR sensors
    let monitor = DispenseConfirmationMonitor::new(
        shared_link.clone(),
        config.confirm().clone(),
        metrics.clone(),
        Some(ui_sender.clone()),
    );
    monitor.set_callbacks(
        Arc::new(|slot: u8, item: &str, elapsed_ms: u64| {
            info!(slot = %slot, item = %item, elapsed_ms = %elapsed_ms, "dispense_delivery");
        }),
        Arc::new(|slot: u8, item: &str| {
            warn!(slot = %slot, item = %item, "dispense_delivery_timeout");
        }),
    );
    let monitor_shutdown = shutdown_rx.clone();
    let monitor_task = monitor.clone();
    tokio::spawn(async move {
        monitor_task.run(monitor_shutdown).await;
    });

    // Payment session over the chosen acceptor backends
    let egress = Arc::new(SessionEgress::new(config.egress_file(), config.site_id()));
    let session = Arc::new(PaymentSession::new(
        coins,
        bills,
        hopper,
        egress,
        metrics.clone(),
        Some(ui_sender.clone()),
    ));

    let coordinator = Arc::new(SlotDispenseCoordinator::new(
        Arc::new(config.slot_table()),
        actuator,
        mux,
        Some(monitor.clone()),
        config.actuator().pulse_ms,
        config.confirm().default_timeout_secs,
        metrics.clone(),
        Some(ui_sender),
    ));

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = kiosk_gateway::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Periodic metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Control listener for the UI process
    if config.control().enabled {
        let control_port = config.control().port;
        let control_session = session.clone();
        let control_coordinator = coordinator.clone();
        let control_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_control_listener(
                control_port,
                control_session,
                control_coordinator,
                control_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Control listener error");
            }
        });
    }

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Drain UI messages until shutdown; the screens live out of process,
    // here they land in the log
    let mut shutdown = shutdown_rx;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            message = ui_rx.recv() => {
                match message {
                    Some(UiMessage::PaymentUpdate(p)) => {
                        info!(collected = %p.collected, required = %p.required, "ui_payment_update");
                    }
                    Some(UiMessage::ChangeStatus(p)) => {
                        info!(text = %p.text, "ui_change_status");
                    }
                    Some(UiMessage::Dispense(p)) => {
                        info!(slot = %p.slot, item = %p.item, status = %p.status, "ui_dispense");
                    }
                    Some(UiMessage::Sensor(p)) => {
                        debug!(index = %p.index, blocked = %p.blocked, "ui_sensor");
                    }
                    None => break,
                }
            }
        }
    }

    info!("kiosk-gateway shutdown complete");
    Ok(())
}
