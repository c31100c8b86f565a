use crate::config::{ConfigError, StationConfig};
use crate::hal::{EdgeCallback, HalError, InputPins, OutputPins};
use crate::torque::{
    DriverStatus, FieldWrite, GlobalSetpoints, SetpointUpdate, TaskParams, TighteningResult,
    TorqueController, TorqueError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory pin bank. Unwritten inputs float HIGH (pull-up).
pub struct SimulatedPins {
    outputs: Mutex<HashMap<u16, bool>>,
    inputs: Mutex<HashMap<u16, bool>>,
    callbacks: Mutex<HashMap<u16, EdgeCallback>>,
    edge_capable: bool,
    fail_writes: AtomicBool,
}

impl SimulatedPins {
    /// A bank that supports edge notification.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    /// A bank whose edge registration always fails, forcing polling.
    pub fn polling_only() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    fn build(edge_capable: bool) -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
            inputs: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            edge_capable,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Drives an input pin, firing its edge callback on a change.
    pub fn set_input(&self, pin: u16, high: bool) {
        let previous = lock(&self.inputs).insert(pin, high).unwrap_or(true);
        if previous != high {
            let callback = lock(&self.callbacks).get(&pin).cloned();
            if let Some(cb) = callback {
                cb(pin);
            }
        }
    }

    /// Last electrical level written to an output pin.
    pub fn output(&self, pin: u16) -> Option<bool> {
        lock(&self.outputs).get(&pin).copied()
    }

    /// Makes every subsequent output write fail with a transport error.
    pub fn inject_write_failures(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

impl OutputPins for Arc<SimulatedPins> {
    fn write(&mut self, pin: u16, high: bool) -> Result<(), HalError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(HalError::Transport {
                pin,
                message: "injected write failure".to_string(),
            });
        }
        lock(&self.outputs).insert(pin, high);
        Ok(())
    }
}

impl InputPins for SimulatedPins {
    fn sample(&self, pin: u16) -> Result<bool, HalError> {
        Ok(lock(&self.inputs).get(&pin).copied().unwrap_or(true))
    }

    fn subscribe(&self, pin: u16, callback: EdgeCallback) -> Result<(), HalError> {
        if !self.edge_capable {
            return Err(HalError::EdgeUnsupported { pin });
        }
        lock(&self.callbacks).insert(pin, callback);
        Ok(())
    }

    fn unsubscribe(&self, pin: u16) {
        lock(&self.callbacks).remove(&pin);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixtureTiming {
    /// Time for a cylinder or the tool to reach an end stop.
    pub travel: Duration,
    /// Delay from feeder activation to the screw passing the transit sensor.
    pub transit_delay: Duration,
    /// How long the transit sensor stays closed.
    pub transit_pulse: Duration,
}

impl Default for FixtureTiming {
    fn default() -> Self {
        Self {
            travel: Duration::from_millis(10),
            transit_delay: Duration::from_millis(10),
            transit_pulse: Duration::from_millis(40),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Travel {
    AtTop,
    AtBottom,
    Rising(Instant),
    Falling(Instant),
}

impl Travel {
    fn settle(self, now: Instant) -> Self {
        match self {
            Self::Rising(at) if at <= now => Self::AtTop,
            Self::Falling(at) if at <= now => Self::AtBottom,
            other => other,
        }
    }

    fn rise(self, now: Instant, travel: Duration) -> Self {
        match self {
            Self::AtTop | Self::Rising(_) => self,
            _ => Self::Rising(now + travel),
        }
    }

    fn fall(self, now: Instant, travel: Duration) -> Self {
        match self {
            Self::AtBottom | Self::Falling(_) => self,
            _ => Self::Falling(now + travel),
        }
    }
}

struct Wiring {
    relay_active_low: bool,
    feeder: u16,
    cyl_up: u16,
    cyl_down: u16,
    tool_down: u16,
    torque_mode: u16,
    cyl_top: (u16, bool),
    cyl_bottom: (u16, bool),
    tool_top: (u16, bool),
    tool_bottom: (u16, bool),
    transit: (u16, bool),
    torque_ok: (u16, bool),
    start_pedal: (u16, bool),
}

impl Wiring {
    fn resolve(config: &StationConfig) -> Result<Self, ConfigError> {
        let roles = &config.cycle.roles;
        let relay = |name: &str| {
            config
                .relay(name)
                .map(|r| r.pin)
                .ok_or_else(|| ConfigError::UnknownChannel {
                    kind: "relay",
                    name: name.to_string(),
                })
        };
        let sensor = |name: &str| {
            config
                .sensor(name)
                .map(|s| (s.pin, s.active_low))
                .ok_or_else(|| ConfigError::UnknownChannel {
                    kind: "sensor",
                    name: name.to_string(),
                })
        };
        Ok(Self {
            relay_active_low: config.relay_active_low,
            feeder: relay(&roles.feeder)?,
            cyl_up: relay(&roles.cyl_up)?,
            cyl_down: relay(&roles.cyl_down)?,
            tool_down: relay(&roles.tool_down)?,
            torque_mode: relay(&roles.torque_mode)?,
            cyl_top: sensor(&roles.cyl_top)?,
            cyl_bottom: sensor(&roles.cyl_bottom)?,
            tool_top: sensor(&roles.tool_top)?,
            tool_bottom: sensor(&roles.tool_bottom)?,
            transit: sensor(&roles.transit)?,
            torque_ok: sensor(&roles.torque_ok)?,
            start_pedal: sensor(&roles.start_pedal)?,
        })
    }

    fn relay_on(&self, pins: &SimulatedPins, pin: u16) -> bool {
        pins.output(pin)
            .map(|high| high != self.relay_active_low)
            .unwrap_or(false)
    }

    fn drive(pins: &SimulatedPins, (pin, active_low): (u16, bool), closed: bool) {
        pins.set_input(pin, closed != active_low);
    }
}

struct FixtureControls {
    pedal: AtomicBool,
    torque_ack: AtomicBool,
    failed_feeds: AtomicU32,
    cylinder_jammed: AtomicBool,
    stop: AtomicBool,
}

/// Simulated fixture mechanics: answers relay commands with the limit switch
/// changes a real station would produce.
pub struct SimulatedFixture {
    controls: Arc<FixtureControls>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedFixture {
    pub fn spawn(
        pins: Arc<SimulatedPins>,
        config: &StationConfig,
        timing: FixtureTiming,
    ) -> Result<Self, ConfigError> {
        let wiring = Wiring::resolve(config)?;
        let controls = Arc::new(FixtureControls {
            pedal: AtomicBool::new(false),
            torque_ack: AtomicBool::new(true),
            failed_feeds: AtomicU32::new(0),
            cylinder_jammed: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        // Settle inputs before any watcher seeds from them.
        Wiring::drive(&pins, wiring.cyl_top, true);
        Wiring::drive(&pins, wiring.cyl_bottom, false);
        Wiring::drive(&pins, wiring.tool_top, true);
        Wiring::drive(&pins, wiring.tool_bottom, false);
        Wiring::drive(&pins, wiring.transit, false);
        Wiring::drive(&pins, wiring.torque_ok, false);
        Wiring::drive(&pins, wiring.start_pedal, false);

        let worker = {
            let controls = Arc::clone(&controls);
            thread::Builder::new()
                .name("sim-fixture".to_string())
                .spawn(move || run_fixture(&pins, &wiring, &controls, timing))
                .map_err(|e| ConfigError::Invalid(format!("failed to spawn fixture: {e}")))?
        };

        Ok(Self {
            controls,
            worker: Some(worker),
        })
    }

    pub fn press_pedal(&self) {
        self.controls.pedal.store(true, Ordering::Relaxed);
    }

    pub fn release_pedal(&self) {
        self.controls.pedal.store(false, Ordering::Relaxed);
    }

    /// Whether the tool reports torque-ok when it bottoms out in torque mode.
    pub fn set_torque_ack(&self, ack: bool) {
        self.controls.torque_ack.store(ack, Ordering::Relaxed);
    }

    /// The next `count` feeder pulses deliver no screw.
    pub fn fail_next_feeds(&self, count: u32) {
        self.controls.failed_feeds.store(count, Ordering::Relaxed);
    }

    /// A jammed clamp cylinder never leaves the top stop.
    pub fn jam_cylinder(&self, jammed: bool) {
        self.controls.cylinder_jammed.store(jammed, Ordering::Relaxed);
    }

    pub fn stop(&mut self) {
        self.controls.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimulatedFixture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_fixture(
    pins: &SimulatedPins,
    wiring: &Wiring,
    controls: &FixtureControls,
    timing: FixtureTiming,
) {
    let mut cylinder = Travel::AtTop;
    let mut tool = Travel::AtTop;
    let mut feeder_was_on = false;
    let mut transit: Option<(Instant, Instant)> = None;

    while !controls.stop.load(Ordering::Relaxed) {
        let now = Instant::now();

        if wiring.relay_on(pins, wiring.cyl_up) {
            cylinder = cylinder.rise(now, timing.travel);
        } else if wiring.relay_on(pins, wiring.cyl_down)
            && !controls.cylinder_jammed.load(Ordering::Relaxed)
        {
            cylinder = cylinder.fall(now, timing.travel);
        }
        cylinder = cylinder.settle(now);

        // Spring return: the tool rises whenever its valve is released.
        tool = if wiring.relay_on(pins, wiring.tool_down) {
            tool.fall(now, timing.travel)
        } else {
            tool.rise(now, timing.travel)
        };
        tool = tool.settle(now);

        let feeder_on = wiring.relay_on(pins, wiring.feeder);
        if feeder_on && !feeder_was_on {
            let skip = controls
                .failed_feeds
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
            if !skip {
                let start = now + timing.transit_delay;
                transit = Some((start, start + timing.transit_pulse));
            }
        }
        feeder_was_on = feeder_on;
        let transit_closed = matches!(transit, Some((from, to)) if now >= from && now < to);
        if matches!(transit, Some((_, to)) if now >= to) {
            transit = None;
        }

        let torque_ok = tool == Travel::AtBottom
            && wiring.relay_on(pins, wiring.torque_mode)
            && controls.torque_ack.load(Ordering::Relaxed);

        Wiring::drive(pins, wiring.cyl_top, cylinder == Travel::AtTop);
        Wiring::drive(pins, wiring.cyl_bottom, cylinder == Travel::AtBottom);
        Wiring::drive(pins, wiring.tool_top, tool == Travel::AtTop);
        Wiring::drive(pins, wiring.tool_bottom, tool == Travel::AtBottom);
        Wiring::drive(pins, wiring.transit, transit_closed);
        Wiring::drive(pins, wiring.torque_ok, torque_ok);
        Wiring::drive(
            pins,
            wiring.start_pedal,
            controls.pedal.load(Ordering::Relaxed),
        );

        thread::sleep(Duration::from_millis(1));
    }
}

/// Torque controller stand-in that keeps its registers in memory.
#[derive(Debug, Default)]
pub struct SimulatedTorqueController {
    globals: GlobalSetpoints,
    tasks: HashMap<u16, TaskParams>,
    status: DriverStatus,
    restarts: u32,
}

impl SimulatedTorqueController {
    pub fn new() -> Self {
        Self {
            status: DriverStatus {
                mode: 1,
                ..DriverStatus::default()
            },
            ..Self::default()
        }
    }

    /// Replaces the status the next snapshot will report.
    pub fn set_status(&mut self, status: DriverStatus) {
        self.status = status;
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Records a finished tightening in the last-result block.
    pub fn finish_tightening(&mut self, result: TighteningResult) {
        self.status.last = result;
    }
}

impl TorqueController for SimulatedTorqueController {
    fn read_globals(&mut self) -> Result<GlobalSetpoints, TorqueError> {
        Ok(self.globals)
    }

    fn write_globals(&mut self, update: &SetpointUpdate) -> Result<(), TorqueError> {
        if let Some(method) = update.method {
            self.globals.method = method;
        }
        if let Some(torque) = update.torque_mnm {
            self.globals.torque_mnm = torque;
        }
        if let Some(speed) = update.speed_rpm {
            self.globals.speed_rpm = speed;
        }
        Ok(())
    }

    fn read_task(&mut self, task: u16) -> Result<TaskParams, TorqueError> {
        Ok(self.tasks.get(&task).cloned().unwrap_or_default())
    }

    fn write_task(&mut self, task: u16, params: &TaskParams) -> Result<Vec<FieldWrite>, TorqueError> {
        let entry = self.tasks.entry(task).or_default();
        entry.merge(params);
        Ok(params
            .fields()
            .into_iter()
            .map(|(field, _)| FieldWrite {
                field,
                addr: task,
                error: None,
            })
            .collect())
    }

    fn status(&mut self) -> Result<DriverStatus, TorqueError> {
        Ok(self.status.clone())
    }

    fn soft_restart(&mut self) -> Result<DriverStatus, TorqueError> {
        self.restarts += 1;
        self.status.fault = 0;
        self.status.mode = 1;
        Ok(self.status.clone())
    }
}
