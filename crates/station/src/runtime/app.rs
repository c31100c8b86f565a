use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use station_core::hal::{HalError, InputPins, OutputPins};
use station_core::hal_sim::{FixtureTiming, SimulatedFixture, SimulatedPins, SimulatedTorqueController};
use station_core::runner::{CycleRunner, RunEnd, RunObserver};
use station_core::torque::{share_torque, SharedTorque};
use station_core::{
    start_watcher, ConfigError, HardwareError, HardwareState, SensorTable, StationConfig, TimeBase,
};
use station_io::bridge::{Bridge, BridgeConfig, BridgeContext, BridgeEvent, BridgeEventSink};
use station_io::hal_modbus::ModbusPins;
use station_io::metrics::HARDWARE_READY;
use station_io::monitor::{
    DriverEvent, DriverMonitor, EventLog, EventSink, DEFAULT_POLL_INTERVAL, EVENT_LOG_CAPACITY,
};
use station_io::torque_modbus::{ModbusTorqueController, TorqueDriverConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O backend: {0}")]
    Hal(#[from] HalError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("audit log {path}: {source}")]
    Audit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bridge bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
}

fn spawn_error(what: &'static str) -> impl FnOnce(std::io::Error) -> AppError {
    move |source| AppError::Spawn { what, source }
}

pub fn run_from_args() -> ExitCode {
    let config = RuntimeConfig::from_env();
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Station failed");
            ExitCode::FAILURE
        }
    }
}

/// Relay and sensor backend chosen at startup.
struct IoBackend {
    outputs: Box<dyn OutputPins>,
    inputs: Arc<dyn InputPins>,
    fixture: Option<Arc<SimulatedFixture>>,
}

fn open_io(config: &RuntimeConfig, station: &StationConfig) -> Result<IoBackend, AppError> {
    if config.simulated_io() {
        let pins = SimulatedPins::new();
        let fixture =
            SimulatedFixture::spawn(Arc::clone(&pins), station, FixtureTiming::default())?;
        info!("Using simulated fixture");
        return Ok(IoBackend {
            outputs: Box::new(Arc::clone(&pins)),
            inputs: pins,
            fixture: Some(Arc::new(fixture)),
        });
    }
    let addr = config.modbus_io.as_deref().unwrap_or_default();
    info!(addr = %addr, "Connecting to Modbus I/O module");
    let pins = ModbusPins::connect(addr, config.modbus_io_unit)?;
    Ok(IoBackend {
        outputs: Box::new(pins.outputs()),
        inputs: pins,
        fixture: None,
    })
}

fn open_torque(config: &RuntimeConfig) -> Option<SharedTorque> {
    if let Some(addr) = &config.torque_addr {
        let driver_config = TorqueDriverConfig {
            addr: addr.clone(),
            unit: config.torque_unit,
            ..TorqueDriverConfig::default()
        };
        return match ModbusTorqueController::connect(driver_config) {
            Ok(driver) => {
                info!(addr = %addr, unit = config.torque_unit, "Torque controller configured");
                Some(share_torque(driver))
            }
            Err(e) => {
                warn!(error = %e, addr = %addr, "Torque controller unavailable; continuing without it");
                None
            }
        };
    }
    if config.sim {
        info!("Using simulated torque controller");
        return Some(share_torque(SimulatedTorqueController::new()));
    }
    None
}

fn init_audit_logger(
    audit_path: Option<&PathBuf>,
    timebase: TimeBase,
) -> Result<Option<Arc<AuditLogger>>, AppError> {
    let Some(path) = audit_path else {
        return Ok(None);
    };
    let logger = AuditLogger::new(path, timebase).map_err(|source| AppError::Audit {
        path: path.clone(),
        source,
    })?;
    info!(path = %path.display(), "Audit logging enabled");
    Ok(Some(Arc::new(logger)))
}

fn audit(logger: &Option<Arc<AuditLogger>>, event: AuditEventType, details: impl serde::Serialize) {
    if let Some(logger) = logger {
        if let Err(e) = logger.record(event, details) {
            warn!(error = %e, "Failed to write audit entry");
        }
    }
}

fn bridge_audit_type(event: &BridgeEvent) -> AuditEventType {
    match event {
        BridgeEvent::ClientConnected { .. } => AuditEventType::ClientConnected,
        BridgeEvent::ClientDisconnected => AuditEventType::ClientDisconnected,
        BridgeEvent::CycleStart { .. } => AuditEventType::CycleStart,
        BridgeEvent::CycleStop { .. } => AuditEventType::CycleStop,
        BridgeEvent::ManualRelay { .. } => AuditEventType::ManualRelay,
        BridgeEvent::BusyRejected { .. } => AuditEventType::BusyRejected,
        BridgeEvent::TorqueRestart { .. } => AuditEventType::TorqueRestart,
    }
}

/// SIGINT/SIGTERM raise `stop` and wake the main thread.
fn install_signal_handler(stop: &Arc<AtomicBool>) -> Result<(), AppError> {
    let stop = Arc::clone(stop);
    let main_thread = thread::current();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
        main_thread.unpark();
    })?;
    Ok(())
}

/// Parks until `stop` is raised or the optional run time elapses.
fn wait_for_shutdown(stop: &AtomicBool, run_for: Option<Duration>) -> &'static str {
    let deadline = run_for.map(|d| Instant::now() + d);
    loop {
        if stop.load(Ordering::SeqCst) {
            return "signal";
        }
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return "run_seconds";
                }
                thread::park_timeout(deadline - now);
            }
            None => thread::park(),
        }
    }
}

fn spawn_pedal_tapper(
    fixture: Arc<SimulatedFixture>,
    period: Duration,
    stop: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("sim-pedal".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(period);
                fixture.press_pedal();
                thread::sleep(Duration::from_millis(80));
                fixture.release_pedal();
            }
        })
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    // Initialize metrics
    telemetry::init();
    let metrics_enabled = config.metrics_addr.is_some();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let station = match &config.config_path {
        Some(path) => {
            info!(path = %path.display(), "Loading station layout");
            StationConfig::from_json_file(path)?
        }
        None => {
            let station = StationConfig::default();
            station.validate()?;
            station
        }
    };

    let timebase = TimeBase::new();
    let audit_logger = init_audit_logger(config.audit_path.as_ref(), timebase)?;

    audit(
        &audit_logger,
        AuditEventType::SystemStart,
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "simulated_io": config.simulated_io(),
            "bridge_enabled": config.bridge_enabled,
            "metrics_enabled": metrics_enabled,
        }),
    );

    let stop = Arc::new(AtomicBool::new(false));
    install_signal_handler(&stop)?;

    let io = open_io(&config, &station)?;
    let sensors = Arc::new(SensorTable::from_config(&station, timebase));
    let watcher = start_watcher(io.inputs, Arc::clone(&sensors), &station.sensing);
    let hw = HardwareState::new(io.outputs, &station, Arc::clone(&sensors), timebase)?
        .into_shared();
    HARDWARE_READY.set(1.0);

    let on_end: RunObserver = {
        let audit_logger = audit_logger.clone();
        Arc::new(move |end: &RunEnd| {
            match end {
                RunEnd::Stopped => info!("Cycle ended after stop"),
                RunEnd::Aborted(reason) => error!(reason = %reason, "Cycle aborted"),
            }
            audit(&audit_logger, AuditEventType::CycleEnded, end);
        })
    };
    let runner = Arc::new(
        CycleRunner::new(hw, Arc::clone(&sensors), station.cycle.clone()).with_observer(on_end),
    );

    info!(
        relays = station.relays.len(),
        sensors = station.sensors.len(),
        interlocks = station.interlocks.len(),
        watch_mode = watcher.mode().as_str(),
        "Station hardware ready"
    );

    let recent = Arc::new(EventLog::new(EVENT_LOG_CAPACITY, timebase));
    let torque = open_torque(&config);
    let mut monitor = match &torque {
        Some(t) => {
            let audit_logger = audit_logger.clone();
            let recent = Arc::clone(&recent);
            let sink: EventSink = Arc::new(move |event: &DriverEvent| {
                recent.push("driver", event.kind(), event);
                audit(&audit_logger, AuditEventType::DriverEvent, event);
            });
            Some(
                DriverMonitor::spawn(Arc::clone(t), DEFAULT_POLL_INTERVAL, sink)
                    .map_err(spawn_error("driver monitor"))?,
            )
        }
        None => None,
    };

    let bridge_handle = if config.bridge_enabled {
        let bridge_config = BridgeConfig {
            bind_addr: config.bind_addr.clone(),
            ..BridgeConfig::default()
        };
        let bridge = Bridge::bind(bridge_config).map_err(|source| AppError::Bind {
            addr: config.bind_addr.clone(),
            source,
        })?;
        let events: BridgeEventSink = {
            let audit_logger = audit_logger.clone();
            Arc::new(move |event: &BridgeEvent| {
                audit(&audit_logger, bridge_audit_type(event), event);
            })
        };
        let ctx = BridgeContext {
            runner: Arc::clone(&runner),
            watch_mode: watcher.mode(),
            torque: torque.clone(),
            timebase,
            events: Some(events),
            recent: Arc::clone(&recent),
        };
        let stop_bridge = Arc::clone(&stop);
        info!(addr = %config.bind_addr, "Starting bridge");
        Some(
            thread::Builder::new()
                .name("bridge".to_string())
                .spawn(move || bridge.run(ctx, stop_bridge))
                .map_err(spawn_error("bridge"))?,
        )
    } else {
        info!("Bridge disabled");
        None
    };

    let telemetry_handle =
        telemetry::start_metrics_updater(Arc::clone(&runner), Arc::clone(&stop))
            .map_err(spawn_error("telemetry"))?;

    let pedal_handle = match (&io.fixture, config.sim_pedal_ms) {
        (Some(fixture), Some(ms)) => Some(
            spawn_pedal_tapper(
                Arc::clone(fixture),
                Duration::from_millis(ms),
                Arc::clone(&stop),
            )
            .map_err(spawn_error("pedal"))?,
        ),
        _ => None,
    };

    if config.autostart {
        match runner.start() {
            Ok(status) => audit(
                &audit_logger,
                AuditEventType::CycleStart,
                serde_json::json!({ "status": status.as_str(), "source": "autostart" }),
            ),
            Err(e) => error!(error = %e, "Autostart failed"),
        }
    }

    info!("Station running");

    if let Some(seconds) = config.run_seconds {
        info!(seconds, "Running for limited duration");
    }
    let reason = wait_for_shutdown(&stop, config.run_seconds.map(Duration::from_secs));
    info!(reason, "Shutting down");

    stop.store(true, Ordering::SeqCst);
    runner.shutdown();
    if let Some(monitor) = monitor.as_mut() {
        monitor.stop();
    }
    for handle in [bridge_handle, Some(telemetry_handle), pedal_handle]
        .into_iter()
        .flatten()
    {
        let _ = handle.join();
    }
    watcher.shutdown();
    HARDWARE_READY.set(0.0);

    let snapshot = runner.snapshot();
    info!(
        runs_started = snapshot.runs_started,
        loops_completed = snapshot.counters.loops_completed,
        torque_recoveries = snapshot.counters.torque_recoveries,
        feed_retries = snapshot.counters.feed_retries,
        relay_writes = snapshot.hardware.relay_writes,
        "Run complete"
    );
    audit(
        &audit_logger,
        AuditEventType::SystemShutdown,
        serde_json::json!({
            "reason": reason,
            "runs_started": snapshot.runs_started,
            "counters": snapshot.counters,
            "hardware": snapshot.hardware,
        }),
    );
    Ok(())
}
