use crate::config::StationConfig;
use crate::hal::InputPins;
use crate::hal_sim::{FixtureTiming, SimulatedFixture, SimulatedPins};
use crate::hardware::{lock_hardware, HardwareState, SharedHardware};
use crate::timebase::TimeBase;
use crate::watcher::{start_watcher, SensorTable, SensorWatcher};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Fast timings so a full loop finishes in well under a second.
pub fn fast_config() -> StationConfig {
    let mut config = StationConfig::default();
    config.cycle.step_timeout_ms = Some(1000);
    config.cycle.feed_pulse_ms = 30;
    config.cycle.transit_window_ms = 200;
    config.cycle.poll_tick_ms = 5;
    config
}

/// Simulated station: pins, fixture mechanics, watcher and hardware.
pub struct Rig {
    pub fixture: SimulatedFixture,
    pub watcher: Box<dyn SensorWatcher>,
    pub sensors: Arc<SensorTable>,
    pub hw: SharedHardware,
    pub pins: Arc<SimulatedPins>,
    pub config: StationConfig,
}

impl Rig {
    pub fn new(config: StationConfig) -> Self {
        let pins = SimulatedPins::new();
        let fixture = SimulatedFixture::spawn(Arc::clone(&pins), &config, FixtureTiming::default())
            .unwrap();
        let timebase = TimeBase::new();
        let sensors = Arc::new(SensorTable::from_config(&config, timebase));
        let inputs: Arc<dyn InputPins> = Arc::clone(&pins) as Arc<dyn InputPins>;
        let watcher = start_watcher(inputs, Arc::clone(&sensors), &config.sensing);
        let hw = HardwareState::new(
            Box::new(Arc::clone(&pins)),
            &config,
            Arc::clone(&sensors),
            timebase,
        )
        .unwrap()
        .into_shared();
        Self {
            fixture,
            watcher,
            sensors,
            hw,
            pins,
            config,
        }
    }

    /// Presses and releases the pedal long enough to clear the debounce window.
    pub fn tap_pedal(&self) {
        self.fixture.press_pedal();
        thread::sleep(Duration::from_millis(60));
        self.fixture.release_pedal();
        thread::sleep(Duration::from_millis(60));
    }

    pub fn relay(&self, name: &str) -> bool {
        lock_hardware(&self.hw).relay(name).unwrap()
    }

    pub fn any_relay_on(&self) -> bool {
        lock_hardware(&self.hw)
            .relay_states()
            .values()
            .any(|on| *on)
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.watcher.shutdown();
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}
