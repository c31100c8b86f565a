pub mod bridge;
pub mod hal_modbus;
pub mod metrics;
pub mod monitor;
pub mod protocol;
pub mod torque_modbus;

pub use bridge::{Bridge, BridgeConfig, BridgeContext, BridgeEvent, BridgeEventSink};
pub use hal_modbus::{ModbusOutputs, ModbusPins};
pub use metrics::{init_metrics, serve_metrics};
pub use monitor::{DriverEvent, DriverMonitor, EventDetector, EventLog};
pub use protocol::{ErrorCode, ProtocolVersion, RelayAction, Request};
pub use torque_modbus::{ModbusTorqueController, TorqueDriverConfig};
