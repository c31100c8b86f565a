//! Pin-level hardware abstraction.
//!
//! Levels are electrical (`true` = HIGH). Logical meaning is applied one layer
//! up by [`crate::hardware::HardwareState`] and the sensor watchers.

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HalError {
    #[error("pin {pin}: transport failure: {message}")]
    Transport { pin: u16, message: String },

    #[error("pin {pin}: edge notification not supported")]
    EdgeUnsupported { pin: u16 },

    #[error("I/O backend unavailable: {0}")]
    Connect(String),
}

/// Invoked with the pin number on every electrical transition.
pub type EdgeCallback = Arc<dyn Fn(u16) + Send + Sync>;

/// Relay coil outputs. Owned exclusively by the hardware state.
pub trait OutputPins: Send {
    fn write(&mut self, pin: u16, high: bool) -> Result<(), HalError>;
}

/// Sensor inputs. Shared with watcher threads, so sampling takes `&self`.
pub trait InputPins: Send + Sync {
    fn sample(&self, pin: u16) -> Result<bool, HalError>;

    /// Registers an edge callback. Backends without interrupt support return
    /// [`HalError::EdgeUnsupported`], which sends the watcher to polling.
    fn subscribe(&self, pin: u16, callback: EdgeCallback) -> Result<(), HalError>;

    fn unsubscribe(&self, pin: u16);
}
