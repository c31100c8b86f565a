//! Background watcher that turns torque controller snapshots into events.

use crate::metrics::DRIVER_EVENTS;
use serde::Serialize;
use station_core::torque::{lock_torque, DriverStatus, SharedTorque};
use station_core::TimeBase;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

/// Free-run is considered started at or above this speed.
pub const SPEED_ON_RPM: u16 = 80;
/// Free-run is considered stopped at or below this speed.
pub const SPEED_OFF_RPM: u16 = 40;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverEvent {
    FreeRunStarted {
        speed_rpm: u16,
    },
    FreeRunStopped {
        speed_rpm: u16,
    },
    TighteningDone {
        result: u16,
        verdict: &'static str,
        torque_mnm: u16,
        angle_decideg: u16,
    },
    FaultRaised {
        code: u16,
    },
    FaultCleared,
    MonitorError {
        message: String,
    },
}

impl DriverEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FreeRunStarted { .. } => "free_run_started",
            Self::FreeRunStopped { .. } => "free_run_stopped",
            Self::TighteningDone { .. } => "tightening_done",
            Self::FaultRaised { .. } => "fault_raised",
            Self::FaultCleared => "fault_cleared",
            Self::MonitorError { .. } => "monitor_error",
        }
    }
}

/// Edge detector over consecutive snapshots.
#[derive(Debug, Default)]
pub struct EventDetector {
    prev_speed: u16,
    prev_result: Option<u16>,
    prev_fault: u16,
    failing: bool,
}

impl EventDetector {
    pub fn observe(&mut self, status: &DriverStatus) -> Vec<DriverEvent> {
        let mut events = Vec::new();
        self.failing = false;

        let speed = status.speed_rpm;
        if speed >= SPEED_ON_RPM && self.prev_speed < SPEED_ON_RPM {
            events.push(DriverEvent::FreeRunStarted { speed_rpm: speed });
        }
        if speed <= SPEED_OFF_RPM && self.prev_speed > SPEED_OFF_RPM {
            events.push(DriverEvent::FreeRunStopped { speed_rpm: speed });
        }

        // The first snapshot only seeds the last result.
        let result = status.last.result;
        if self.prev_result.is_some_and(|prev| prev != result) {
            events.push(DriverEvent::TighteningDone {
                result,
                verdict: status.last.verdict(),
                torque_mnm: status.last.torque_mnm,
                angle_decideg: status.last.angle_decideg,
            });
        }

        if status.fault != self.prev_fault {
            events.push(if status.fault != 0 {
                DriverEvent::FaultRaised { code: status.fault }
            } else {
                DriverEvent::FaultCleared
            });
        }

        self.prev_speed = speed;
        self.prev_result = Some(result);
        self.prev_fault = status.fault;
        events
    }

    /// Reports a failed poll once per outage.
    pub fn poll_failed(&mut self, message: String) -> Option<DriverEvent> {
        if self.failing {
            return None;
        }
        self.failing = true;
        Some(DriverEvent::MonitorError { message })
    }
}

pub type EventSink = Arc<dyn Fn(&DriverEvent) + Send + Sync>;

/// Entries kept by the recent-events log.
pub const EVENT_LOG_CAPACITY: usize = 200;
/// Entries returned when a query names no limit.
pub const DEFAULT_EVENT_QUERY: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct LoggedEvent {
    pub unix_us: u64,
    /// `driver` or `operator`.
    pub source: &'static str,
    pub kind: String,
    pub details: serde_json::Value,
}

/// Bounded history of driver and operator events, newest first.
pub struct EventLog {
    capacity: usize,
    timebase: TimeBase,
    entries: Mutex<VecDeque<LoggedEvent>>,
}

impl EventLog {
    pub fn new(capacity: usize, timebase: TimeBase) -> Self {
        Self {
            capacity,
            timebase,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, source: &'static str, kind: &str, details: impl Serialize) {
        let details = serde_json::to_value(details).unwrap_or(serde_json::Value::Null);
        let entry = LoggedEvent {
            unix_us: self.timebase.unix_us(),
            source,
            kind: kind.to_string(),
            details,
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_front(entry);
        entries.truncate(self.capacity);
    }

    /// Up to `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<LoggedEvent> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct DriverMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DriverMonitor {
    pub fn spawn(
        torque: SharedTorque,
        interval: Duration,
        sink: EventSink,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("driver-monitor".to_string())
            .spawn(move || {
                let mut detector = EventDetector::default();
                while !stop_flag.load(Ordering::Relaxed) {
                    let polled = lock_torque(&torque).status();
                    let events = match polled {
                        Ok(status) => detector.observe(&status),
                        Err(e) => detector.poll_failed(e.to_string()).into_iter().collect(),
                    };
                    for event in &events {
                        publish(event, &sink);
                    }
                    thread::sleep(interval);
                }
            })?;
        info!(interval_ms = interval.as_millis() as u64, "Driver monitor started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DriverMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn publish(event: &DriverEvent, sink: &EventSink) {
    match event {
        DriverEvent::MonitorError { message } => warn!(error = %message, "Driver monitor error"),
        other => info!(kind = other.kind(), event = ?other, "Driver event"),
    }
    DRIVER_EVENTS.with_label_values(&[event.kind()]).inc();
    sink(event);
}
