//! Prometheus metrics for the fastening station.
//!
//! Cycle counters are mirrored from the runner snapshot by the telemetry
//! thread; relay, bridge and driver metrics are updated where they happen.

use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
}

fn gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::new(name, help).unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
}

// ============================================================================
// Cycle Metrics
// ============================================================================

pub static LOOPS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "station_loops_completed_total",
        "Fastening loops completed through unclamp",
    )
});

pub static TORQUE_RECOVERIES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "station_torque_recoveries_total",
        "Fasten steps that ended in torque-timeout recovery",
    )
});

pub static FEED_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "station_feed_retries_total",
        "Feeder pulses repeated because no screw transit was seen",
    )
});

pub static WAIT_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "station_wait_timeouts_total",
        "Sensor waits that ran out of time",
    )
});

/// Cycle running state (1 = running, 0 = idle)
pub static CYCLE_RUNNING: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "station_cycle_running",
        "Cycle running state (1=running, 0=idle)",
    )
});

// ============================================================================
// Hardware Metrics
// ============================================================================

pub static RELAY_WRITES: LazyLock<IntCounter> =
    LazyLock::new(|| counter("station_relay_writes_total", "Relay writes issued"));

pub static INTERLOCK_PREEMPTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "station_interlock_preemptions_total",
        "Relays forced off because their interlocked partner was energised",
    )
});

/// Hardware ready state (1 = initialised, 0 = not yet)
pub static HARDWARE_READY: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "station_hardware_ready",
        "Hardware initialised and relays driven to a known state",
    )
});

/// Debounced sensor level per channel (1 = closed)
pub static SENSOR_CLOSED: LazyLock<GaugeVec> = LazyLock::new(|| {
    let vec = GaugeVec::new(
        Opts::new("station_sensor_closed", "Debounced sensor level (1=closed)"),
        &["sensor"],
    )
    .unwrap();
    REGISTRY.register(Box::new(vec.clone())).unwrap();
    vec
});

/// Cached relay state per channel (1 = on)
pub static RELAY_ON: LazyLock<GaugeVec> = LazyLock::new(|| {
    let vec = GaugeVec::new(
        Opts::new("station_relay_on", "Cached relay state (1=on)"),
        &["relay"],
    )
    .unwrap();
    REGISTRY.register(Box::new(vec.clone())).unwrap();
    vec
});

// ============================================================================
// Bridge and Driver Metrics
// ============================================================================

/// Bridge client connection status (1 = connected, 0 = disconnected)
pub static BRIDGE_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "station_bridge_connected",
        "Bridge client connection status (1=connected, 0=disconnected)",
    )
});

pub static BUSY_REJECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "station_busy_rejections_total",
        "Manual relay commands refused while a cycle was running",
    )
});

pub static DRIVER_EVENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let vec = IntCounterVec::new(
        Opts::new(
            "station_driver_events_total",
            "Torque controller events by kind",
        ),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(vec.clone())).unwrap();
    vec
});

/// Advances a mirrored counter up to `target`; never goes backwards.
pub fn advance_to(counter: &IntCounter, target: u64) {
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => {
                    let mut buffer = Vec::new();
                    match TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::from_data(buffer);
                            if let Ok(header) = tiny_http::Header::from_bytes(
                                &b"Content-Type"[..],
                                &b"text/plain; version=0.0.4"[..],
                            ) {
                                response = response.with_header(header);
                            }
                            response
                        }
                        Err(e) => {
                            tracing::warn!("Failed to encode metrics: {}", e);
                            Response::from_string("Internal Server Error").with_status_code(500)
                        }
                    }
                }
                "/health" => Response::from_string("OK"),
                "/ready" => {
                    if HARDWARE_READY.get() > 0.0 {
                        Response::from_string("Ready")
                    } else {
                        Response::from_string("Not Ready").with_status_code(503)
                    }
                }
                _ => Response::from_string("Not Found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = LOOPS_COMPLETED.get();
    let _ = TORQUE_RECOVERIES.get();
    let _ = FEED_RETRIES.get();
    let _ = WAIT_TIMEOUTS.get();
    let _ = CYCLE_RUNNING.get();
    let _ = RELAY_WRITES.get();
    let _ = INTERLOCK_PREEMPTIONS.get();
    let _ = HARDWARE_READY.get();
    let _ = BRIDGE_CONNECTED.get();
    let _ = BUSY_REJECTIONS.get();
    LazyLock::force(&SENSOR_CLOSED);
    LazyLock::force(&RELAY_ON);
    LazyLock::force(&DRIVER_EVENTS);
}
