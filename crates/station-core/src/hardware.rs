use crate::config::StationConfig;
use crate::hal::{HalError, OutputPins};
use crate::interlock::InterlockPolicy;
use crate::timebase::TimeBase;
use crate::watcher::SensorTable;
use log::{debug, error, info};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("transport failure on '{channel}': {source}")]
    Transport {
        channel: String,
        #[source]
        source: HalError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    /// Electrical level that puts the channel in the given logical state.
    pub fn level(self, on: bool) -> bool {
        match self {
            Self::ActiveHigh => on,
            Self::ActiveLow => !on,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayChannel {
    pub name: String,
    pub pin: u16,
    pub polarity: Polarity,
    pub on: bool,
    /// Monotonic stamp of the last successful write.
    pub last_write_us: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HardwareStats {
    pub relay_writes: u64,
    pub interlock_preemptions: u64,
    pub write_failures: u64,
}

/// Owner of every relay output, the interlock policy and the published sensor
/// table. Shared behind one mutex by the sequencer and the manual command path.
pub struct HardwareState {
    outputs: Box<dyn OutputPins>,
    relays: Vec<RelayChannel>,
    relay_index: HashMap<String, usize>,
    interlocks: InterlockPolicy,
    sensors: Arc<SensorTable>,
    timebase: TimeBase,
    stats: HardwareStats,
}

pub type SharedHardware = Arc<Mutex<HardwareState>>;

/// Locks the shared hardware, recovering from poisoning so relays can always
/// be switched off.
pub fn lock_hardware(hw: &SharedHardware) -> MutexGuard<'_, HardwareState> {
    hw.lock().unwrap_or_else(PoisonError::into_inner)
}

/// ON for `duration`, then OFF. The lock is not held while the relay is on.
pub fn pulse_relay(hw: &SharedHardware, name: &str, duration: Duration) -> Result<(), HardwareError> {
    lock_hardware(hw).set_relay(name, true)?;
    thread::sleep(duration);
    lock_hardware(hw).set_relay(name, false)
}

impl HardwareState {
    /// Builds the channel maps and drives every relay OFF.
    pub fn new(
        outputs: Box<dyn OutputPins>,
        config: &StationConfig,
        sensors: Arc<SensorTable>,
        timebase: TimeBase,
    ) -> Result<Self, HardwareError> {
        let polarity = if config.relay_active_low {
            Polarity::ActiveLow
        } else {
            Polarity::ActiveHigh
        };
        let relays: Vec<RelayChannel> = config
            .relays
            .iter()
            .map(|spec| RelayChannel {
                name: spec.name.clone(),
                pin: spec.pin,
                polarity,
                on: false,
                last_write_us: None,
            })
            .collect();
        let relay_index: HashMap<String, usize> = relays
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();
        let interlocks = InterlockPolicy::new(
            config.interlocks.iter().map(|(a, b)| (a.as_str(), b.as_str())),
            |name| relay_index.contains_key(name),
        )?;

        let mut state = Self {
            outputs,
            relays,
            relay_index,
            interlocks,
            sensors,
            timebase,
            stats: HardwareStats::default(),
        };
        for idx in 0..state.relays.len() {
            state.write_at(idx, false)?;
        }
        info!("IO init done, {} relays OFF", state.relays.len());
        Ok(state)
    }

    pub fn into_shared(self) -> SharedHardware {
        Arc::new(Mutex::new(self))
    }

    fn index(&self, name: &str) -> Result<usize, HardwareError> {
        self.relay_index
            .get(name)
            .copied()
            .ok_or_else(|| HardwareError::UnknownChannel(name.to_string()))
    }

    fn write_at(&mut self, idx: usize, on: bool) -> Result<(), HardwareError> {
        let relay = &self.relays[idx];
        let level = relay.polarity.level(on);
        if let Err(source) = self.outputs.write(relay.pin, level) {
            self.stats.write_failures += 1;
            return Err(HardwareError::Transport {
                channel: relay.name.clone(),
                source,
            });
        }
        let stamp = self.timebase.now_us();
        let relay = &mut self.relays[idx];
        relay.on = on;
        relay.last_write_us = Some(stamp);
        self.stats.relay_writes += 1;
        debug!(
            "{} -> {} (pin {}, t={}us)",
            relay.name,
            if on { "ON" } else { "OFF" },
            relay.pin,
            stamp
        );
        Ok(())
    }

    /// Switches a relay, first dropping any interlocked partner that is ON.
    pub fn set_relay(&mut self, name: &str, on: bool) -> Result<(), HardwareError> {
        let idx = self.index(name)?;
        if on {
            let partners: Vec<String> = self
                .interlocks
                .partners(name)
                .map(str::to_string)
                .collect();
            for partner in partners {
                let p = self.index(&partner)?;
                if self.relays[p].on {
                    self.write_at(p, false)?;
                    self.stats.interlock_preemptions += 1;
                    info!("Interlock: OFF {} before ON {}", partner, name);
                }
            }
        }
        self.write_at(idx, on)
    }

    pub fn relay(&self, name: &str) -> Result<bool, HardwareError> {
        Ok(self.relays[self.index(name)?].on)
    }

    /// Debounced logical sensor value (`true` = closed/actuated).
    pub fn read_sensor(&self, name: &str) -> Result<bool, HardwareError> {
        self.sensors
            .state(name)
            .ok_or_else(|| HardwareError::UnknownChannel(name.to_string()))
    }

    /// Drives every relay OFF, attempting all of them before reporting the
    /// first failure.
    pub fn all_off(&mut self) -> Result<(), HardwareError> {
        let mut first_err = None;
        for idx in 0..self.relays.len() {
            if let Err(e) = self.write_at(idx, false) {
                error!("failed to switch off {}: {}", self.relays[idx].name, e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn relays(&self) -> &[RelayChannel] {
        &self.relays
    }

    pub fn relay_states(&self) -> BTreeMap<String, bool> {
        self.relays.iter().map(|r| (r.name.clone(), r.on)).collect()
    }

    pub fn sensor_states(&self) -> BTreeMap<String, bool> {
        self.sensors.snapshot()
    }

    pub fn sensors(&self) -> &Arc<SensorTable> {
        &self.sensors
    }

    pub fn interlocks(&self) -> &InterlockPolicy {
        &self.interlocks
    }

    pub fn stats(&self) -> HardwareStats {
        self.stats
    }

    pub fn timebase(&self) -> TimeBase {
        self.timebase
    }
}

impl Drop for HardwareState {
    fn drop(&mut self) {
        if let Err(e) = self.all_off() {
            error!("relays not confirmed OFF at shutdown: {}", e);
        }
    }
}
