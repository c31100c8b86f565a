//! Remote relay/input module over Modbus TCP.
//!
//! Relays map to coils and sensors to discrete inputs at the configured pin
//! numbers. The module has no interrupt line, so edge registration is refused
//! and the sensor watcher polls.

use station_core::hal::{EdgeCallback, HalError, InputPins, OutputPins};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Runtime;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{info, warn};

pub struct ModbusPins {
    runtime: Runtime,
    ctx: Mutex<Context>,
    addr: SocketAddr,
}

impl ModbusPins {
    pub fn connect(addr: &str, unit: u8) -> Result<Arc<Self>, HalError> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| HalError::Connect(format!("invalid address {addr}: {e}")))?;
        let runtime = Runtime::new()
            .map_err(|e| HalError::Connect(format!("failed to create runtime: {e}")))?;
        let ctx = runtime
            .block_on(tcp::connect_slave(addr, Slave(unit)))
            .map_err(|e| HalError::Connect(format!("{addr}: {e}")))?;
        info!(%addr, unit, "Connected to Modbus I/O module");
        Ok(Arc::new(Self {
            runtime,
            ctx: Mutex::new(ctx),
            addr,
        }))
    }

    fn ctx(&self) -> MutexGuard<'_, Context> {
        self.ctx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Relay side of the module, sharing this connection.
    pub fn outputs(self: &Arc<Self>) -> ModbusOutputs {
        ModbusOutputs(Arc::clone(self))
    }
}

/// Coil writer handed to `HardwareState`; the inputs stay with the watcher.
pub struct ModbusOutputs(pub Arc<ModbusPins>);

fn transport(pin: u16, err: std::io::Error) -> HalError {
    HalError::Transport {
        pin,
        message: err.to_string(),
    }
}

impl OutputPins for ModbusOutputs {
    fn write(&mut self, pin: u16, high: bool) -> Result<(), HalError> {
        let pins = &self.0;
        let mut ctx = pins.ctx();
        pins.runtime
            .block_on(ctx.write_single_coil(pin, high))
            .map_err(|e| {
                warn!(pin, error = %e, "Modbus coil write failed");
                transport(pin, e)
            })
    }
}

impl InputPins for ModbusPins {
    fn sample(&self, pin: u16) -> Result<bool, HalError> {
        let mut ctx = self.ctx();
        let bits = self
            .runtime
            .block_on(ctx.read_discrete_inputs(pin, 1))
            .map_err(|e| transport(pin, e))?;
        bits.first().copied().ok_or_else(|| HalError::Transport {
            pin,
            message: "empty discrete input response".to_string(),
        })
    }

    fn subscribe(&self, pin: u16, _callback: EdgeCallback) -> Result<(), HalError> {
        Err(HalError::EdgeUnsupported { pin })
    }

    fn unsubscribe(&self, _pin: u16) {}
}
