use station_core::runner::{CycleRunner, StationSnapshot};
use station_io::metrics::{
    advance_to, init_metrics, serve_metrics, CYCLE_RUNNING, FEED_RETRIES, INTERLOCK_PREEMPTIONS,
    LOOPS_COMPLETED, RELAY_ON, RELAY_WRITES, SENSOR_CLOSED, TORQUE_RECOVERIES, WAIT_TIMEOUTS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

fn flag(on: bool) -> f64 {
    if on {
        1.0
    } else {
        0.0
    }
}

/// Copies one runner snapshot into the Prometheus registry.
pub fn publish_snapshot(snapshot: &StationSnapshot) {
    CYCLE_RUNNING.set(flag(snapshot.cycle_running));
    advance_to(&LOOPS_COMPLETED, snapshot.counters.loops_completed);
    advance_to(&TORQUE_RECOVERIES, snapshot.counters.torque_recoveries);
    advance_to(&FEED_RETRIES, snapshot.counters.feed_retries);
    advance_to(&WAIT_TIMEOUTS, snapshot.counters.wait_timeouts);
    advance_to(&RELAY_WRITES, snapshot.hardware.relay_writes);
    advance_to(&INTERLOCK_PREEMPTIONS, snapshot.hardware.interlock_preemptions);
    for (name, on) in &snapshot.relays {
        RELAY_ON.with_label_values(&[name.as_str()]).set(flag(*on));
    }
    for (name, closed) in &snapshot.sensors {
        SENSOR_CLOSED
            .with_label_values(&[name.as_str()])
            .set(flag(*closed));
    }
}

pub fn start_metrics_updater(
    runner: Arc<CycleRunner>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("telemetry".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                publish_snapshot(&runner.snapshot());
                thread::sleep(Duration::from_millis(200));
            }
        })
}
