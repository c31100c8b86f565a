//! Station layout and cycle tuning.
//!
//! Defaults describe the reference fixture wiring; a JSON file with the same
//! shape can override any part of it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown {kind} channel '{name}'")]
    UnknownChannel { kind: &'static str, name: String },

    #[error("duplicate {kind} channel '{name}'")]
    DuplicateChannel { kind: &'static str, name: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySpec {
    pub name: String,
    pub pin: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub name: String,
    pub pin: u16,
    /// Inputs use pull-ups, so a closed contact reads LOW.
    #[serde(default = "default_true")]
    pub active_low: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl SensorSpec {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensingConfig {
    pub poll_interval_ms: u64,
    /// Skip the edge capability check.
    pub force_polling: bool,
}

impl Default for SensingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5,
            force_polling: false,
        }
    }
}

impl SensingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Channel names the sequencer drives and watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleRoles {
    pub feeder: String,
    pub cyl_up: String,
    pub cyl_down: String,
    pub tool_down: String,
    pub torque_mode: String,
    pub cyl_top: String,
    pub cyl_bottom: String,
    pub tool_top: String,
    pub tool_bottom: String,
    pub transit: String,
    pub torque_ok: String,
    pub start_pedal: String,
}

impl Default for CycleRoles {
    fn default() -> Self {
        Self {
            feeder: "feeder".to_string(),
            cyl_up: "cyl_up".to_string(),
            cyl_down: "cyl_down".to_string(),
            tool_down: "tool_down".to_string(),
            torque_mode: "torque_mode".to_string(),
            cyl_top: "cyl_top".to_string(),
            cyl_bottom: "cyl_bottom".to_string(),
            tool_top: "tool_top".to_string(),
            tool_bottom: "tool_bottom".to_string(),
            transit: "screw_transit".to_string(),
            torque_ok: "torque_ok".to_string(),
            start_pedal: "start_pedal".to_string(),
        }
    }
}

impl CycleRoles {
    pub fn relay_names(&self) -> [&str; 5] {
        [
            &self.feeder,
            &self.cyl_up,
            &self.cyl_down,
            &self.tool_down,
            &self.torque_mode,
        ]
    }

    pub fn sensor_names(&self) -> [&str; 7] {
        [
            &self.cyl_top,
            &self.cyl_bottom,
            &self.tool_top,
            &self.tool_bottom,
            &self.transit,
            &self.torque_ok,
            &self.start_pedal,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub roles: CycleRoles,
    /// Budget for every actuator wait (`None` waits forever).
    pub step_timeout_ms: Option<u64>,
    pub feed_pulse_ms: u64,
    /// How long after a feeder pulse the transit sensor may report the screw.
    pub transit_window_ms: u64,
    /// Failed feeds tolerated before aborting; `None` retries forever.
    pub feed_retry_limit: Option<u32>,
    pub poll_tick_ms: u64,
    pub stop_join_timeout_ms: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            roles: CycleRoles::default(),
            step_timeout_ms: Some(5_000),
            feed_pulse_ms: 700,
            transit_window_ms: 1_000,
            feed_retry_limit: Some(3),
            poll_tick_ms: 10,
            stop_join_timeout_ms: 2_000,
        }
    }
}

impl CycleConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }

    pub fn feed_pulse(&self) -> Duration {
        Duration::from_millis(self.feed_pulse_ms)
    }

    pub fn transit_window(&self) -> Duration {
        Duration::from_millis(self.transit_window_ms)
    }

    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms)
    }

    pub fn stop_join_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_join_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Relay boards that energize on a LOW output.
    pub relay_active_low: bool,
    pub relays: Vec<RelaySpec>,
    pub sensors: Vec<SensorSpec>,
    /// Relay pairs that must never be ON together.
    pub interlocks: Vec<(String, String)>,
    pub sensing: SensingConfig,
    pub cycle: CycleConfig,
}

impl Default for StationConfig {
    fn default() -> Self {
        let relay = |name: &str, pin| RelaySpec {
            name: name.to_string(),
            pin,
        };
        let sensor = |name: &str, pin, debounce_ms| SensorSpec {
            name: name.to_string(),
            pin,
            active_low: true,
            debounce_ms,
        };
        Self {
            relay_active_low: true,
            relays: vec![
                relay("feeder", 5),
                relay("cyl_up", 6),
                relay("cyl_down", 13),
                relay("tool_down", 19),
                relay("driver_free_run", 26),
                relay("torque_mode", 16),
                relay("task_select", 20),
                relay("spare", 21),
            ],
            sensors: vec![
                sensor("cyl_top", 17, 20),
                sensor("cyl_bottom", 27, 20),
                sensor("tool_top", 22, 20),
                sensor("tool_bottom", 23, 20),
                // The transit pulse is short; a long window would swallow it.
                sensor("screw_transit", 12, 5),
                sensor("torque_ok", 25, 20),
                sensor("start_pedal", 18, 20),
            ],
            interlocks: vec![("cyl_up".to_string(), "cyl_down".to_string())],
            sensing: SensingConfig::default(),
            cycle: CycleConfig::default(),
        }
    }
}

impl StationConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn relay(&self, name: &str) -> Option<&RelaySpec> {
        self.relays.iter().find(|r| r.name == name)
    }

    pub fn sensor(&self, name: &str) -> Option<&SensorSpec> {
        self.sensors.iter().find(|s| s.name == name)
    }

    /// Checks that every name the station refers to resolves to exactly one channel.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for relay in &self.relays {
            if !seen.insert(relay.name.as_str()) {
                return Err(ConfigError::DuplicateChannel {
                    kind: "relay",
                    name: relay.name.clone(),
                });
            }
        }
        seen.clear();
        for sensor in &self.sensors {
            if !seen.insert(sensor.name.as_str()) {
                return Err(ConfigError::DuplicateChannel {
                    kind: "sensor",
                    name: sensor.name.clone(),
                });
            }
        }

        let known_relay = |name: &str| -> Result<(), ConfigError> {
            match self.relay(name) {
                Some(_) => Ok(()),
                None => Err(ConfigError::UnknownChannel {
                    kind: "relay",
                    name: name.to_string(),
                }),
            }
        };
        for (a, b) in &self.interlocks {
            known_relay(a)?;
            known_relay(b)?;
            if a == b {
                return Err(ConfigError::Invalid(format!(
                    "interlock pairs '{a}' with itself"
                )));
            }
        }
        for name in self.cycle.roles.relay_names() {
            known_relay(name)?;
        }
        for name in self.cycle.roles.sensor_names() {
            if self.sensor(name).is_none() {
                return Err(ConfigError::UnknownChannel {
                    kind: "sensor",
                    name: name.to_string(),
                });
            }
        }

        if self.sensing.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sensing.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.cycle.poll_tick_ms == 0 {
            return Err(ConfigError::Invalid(
                "cycle.poll_tick_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    20
}
