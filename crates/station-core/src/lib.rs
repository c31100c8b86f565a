pub mod config;
pub mod hal;
#[cfg(feature = "simulation")]
pub mod hal_sim;
pub mod hardware;
pub mod interlock;
mod interlock_proptest;
pub mod runner;
pub mod sequencer;
#[cfg(test)]
mod test_support;
pub mod timebase;
pub mod torque;
pub mod wait;
pub mod watcher;

pub use config::{ConfigError, CycleConfig, StationConfig};
pub use hal::{HalError, InputPins, OutputPins};
pub use hardware::{lock_hardware, HardwareError, HardwareState, SharedHardware};
pub use interlock::InterlockPolicy;
pub use runner::{
    CommandError, CycleRunner, RelayCommand, RunEnd, RunObserver, RunStatus, StationSnapshot,
};
pub use sequencer::{CycleCounters, CycleError, CycleOutcome, CycleStep};
pub use timebase::TimeBase;
pub use torque::{lock_torque, share_torque, SharedTorque, TorqueController, TorqueError};
pub use wait::{CancelToken, WaitResult, Waits};
pub use watcher::{start_watcher, SensorTable, SensorWatcher, WatchMode};
