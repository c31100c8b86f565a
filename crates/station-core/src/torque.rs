//! Capability interface for the external torque controller.
//!
//! The station only needs setpoints, task blocks, a status snapshot and a soft
//! restart; the register map lives with the concrete driver.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TorqueError {
    #[error("torque controller transport failure: {0}")]
    Transport(String),

    #[error("task parameter base not configured")]
    TaskBaseNotConfigured,

    #[error("torque controller unavailable: {0}")]
    Unavailable(String),
}

/// Global tightening setpoints as stored by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GlobalSetpoints {
    /// 1 = torque, 0 = angle.
    pub method: u16,
    pub torque_mnm: u16,
    pub speed_rpm: u16,
}

/// Partial update of [`GlobalSetpoints`]; `None` fields are left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SetpointUpdate {
    pub method: Option<u16>,
    pub torque_mnm: Option<u16>,
    pub speed_rpm: Option<u16>,
}

/// One task parameter block. `None` means "not read" or "leave as is".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskParams {
    pub method: Option<u16>,
    pub torque_mnm: Option<u16>,
    pub angle: Option<u32>,
    pub time_ms: Option<u16>,
    pub speed_rpm: Option<u16>,
}

impl TaskParams {
    /// Register-sized fields in block order. The angle spans two words.
    pub fn fields(&self) -> Vec<(&'static str, u16)> {
        let mut out = Vec::new();
        if let Some(v) = self.method {
            out.push(("method", v));
        }
        if let Some(v) = self.torque_mnm {
            out.push(("torque", v));
        }
        if let Some(v) = self.angle {
            out.push(("angle_lo", (v & 0xFFFF) as u16));
            out.push(("angle_hi", (v >> 16) as u16));
        }
        if let Some(v) = self.time_ms {
            out.push(("time_ms", v));
        }
        if let Some(v) = self.speed_rpm {
            out.push(("speed", v));
        }
        out
    }

    /// Overlays every field set in `other`.
    pub fn merge(&mut self, other: &TaskParams) {
        self.method = other.method.or(self.method);
        self.torque_mnm = other.torque_mnm.or(self.torque_mnm);
        self.angle = other.angle.or(self.angle);
        self.time_ms = other.time_ms.or(self.time_ms);
        self.speed_rpm = other.speed_rpm.or(self.speed_rpm);
    }
}

/// Per-field outcome of a task block write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldWrite {
    pub field: &'static str,
    pub addr: u16,
    pub error: Option<String>,
}

/// Last tightening result block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TighteningResult {
    pub torque_mnm: u16,
    pub angle_decideg: u16,
    pub time_ms: u32,
    pub result: u16,
}

impl TighteningResult {
    pub fn verdict(&self) -> &'static str {
        match self.result {
            0 => "OK",
            1 => "FLOAT",
            2 => "STRIP",
            3 => "NG",
            _ => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriverStatus {
    pub mode: u16,
    pub fault: u16,
    pub di: u16,
    #[serde(rename = "do")]
    pub do_bits: u16,
    pub speed_rpm: u16,
    pub aux: u16,
    pub task_current: u16,
    pub last: TighteningResult,
}

impl DriverStatus {
    pub fn mode_text(&self) -> &'static str {
        match self.mode {
            0 => "I/O",
            1 => "RS485/232",
            3 => "CAN",
            4 => "ECAT",
            _ => "unknown",
        }
    }
}

pub trait TorqueController: Send {
    fn read_globals(&mut self) -> Result<GlobalSetpoints, TorqueError>;

    fn write_globals(&mut self, update: &SetpointUpdate) -> Result<(), TorqueError>;

    fn read_task(&mut self, task: u16) -> Result<TaskParams, TorqueError>;

    /// Writes the fields set in `params`, reporting each one separately.
    fn write_task(&mut self, task: u16, params: &TaskParams)
        -> Result<Vec<FieldWrite>, TorqueError>;

    fn status(&mut self) -> Result<DriverStatus, TorqueError>;

    /// Clears the fault, forces protocol mode and reopens the transport.
    fn soft_restart(&mut self) -> Result<DriverStatus, TorqueError>;
}

/// One controller shared by the command bridge and the event monitor.
pub type SharedTorque = Arc<Mutex<Box<dyn TorqueController>>>;

pub fn share_torque(controller: impl TorqueController + 'static) -> SharedTorque {
    Arc::new(Mutex::new(Box::new(controller)))
}

pub fn lock_torque(torque: &SharedTorque) -> MutexGuard<'_, Box<dyn TorqueController>> {
    torque.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn angle_spans_two_words() {
        let params = TaskParams {
            angle: Some(0x0001_2345),
            ..TaskParams::default()
        };
        assert_eq!(
            params.fields(),
            vec![("angle_lo", 0x2345), ("angle_hi", 0x0001)]
        );
    }

    #[test]
    fn merge_keeps_unset_fields() {
        let mut stored = TaskParams {
            method: Some(1),
            speed_rpm: Some(300),
            ..TaskParams::default()
        };
        stored.merge(&TaskParams {
            speed_rpm: Some(450),
            ..TaskParams::default()
        });
        assert_eq!(stored.method, Some(1));
        assert_eq!(stored.speed_rpm, Some(450));
    }
}
