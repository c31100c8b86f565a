//! Audit logging for operator and cycle events.
//!
//! Every action that changes what the station does, and every driver event,
//! is appended to a JSONL file so a shift's history can be replayed later.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use station_core::TimeBase;

/// Types of events that are logged in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Process startup
    SystemStart,
    /// Process shutdown
    SystemShutdown,
    /// Cycle start requested
    CycleStart,
    /// Cycle stop requested
    CycleStop,
    /// Sequencer finished on its own or after a stop
    CycleEnded,
    /// Manual relay command
    ManualRelay,
    /// Command refused while the cycle was running
    BusyRejected,
    /// Event reported by the torque controller monitor
    DriverEvent,
    /// Torque controller soft restart requested
    TorqueRestart,
    ClientConnected,
    ClientDisconnected,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic timestamp in microseconds
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Thread-safe audit logger that writes to a JSONL file
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
    timebase: TimeBase,
}

impl AuditLogger {
    /// Opens `path` in append mode, creating parent directories.
    pub fn new(path: &Path, timebase: TimeBase) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
            timebase,
        })
    }

    pub fn log(&self, entry: AuditEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    /// Stamps and logs an event with the logger's clock.
    pub fn record(
        &self,
        event_type: AuditEventType,
        details: impl Serialize,
    ) -> std::io::Result<()> {
        let details = serde_json::to_value(details)?;
        self.log(AuditEntry {
            timestamp_us: self.timebase.now_us(),
            unix_us: self.timebase.unix_us(),
            event_type,
            details,
        })
    }
}
