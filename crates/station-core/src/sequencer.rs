//! The fastening cycle: homing, then an operator-paced loop of clamp, feed,
//! fasten and unclamp until stopped or aborted.

use crate::config::{CycleConfig, CycleRoles};
use crate::hardware::{lock_hardware, HardwareError, SharedHardware};
use crate::wait::{CancelToken, WaitResult, Waits};
use crate::watcher::SensorTable;
use log::{error, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CycleStep {
    Idle = 0,
    Homing,
    ProbeDown,
    ProbeUp,
    AwaitFirstPress,
    Clamp,
    AwaitSecondPress,
    Feed,
    Fasten,
    Recover,
    RetractTool,
    Unclamp,
}

impl CycleStep {
    const ALL: [CycleStep; 12] = [
        Self::Idle,
        Self::Homing,
        Self::ProbeDown,
        Self::ProbeUp,
        Self::AwaitFirstPress,
        Self::Clamp,
        Self::AwaitSecondPress,
        Self::Feed,
        Self::Fasten,
        Self::Recover,
        Self::RetractTool,
        Self::Unclamp,
    ];

    pub fn from_u8(raw: u8) -> Self {
        Self::ALL.get(raw as usize).copied().unwrap_or(Self::Idle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Homing => "homing",
            Self::ProbeDown => "probe_down",
            Self::ProbeUp => "probe_up",
            Self::AwaitFirstPress => "await_first_press",
            Self::Clamp => "clamp",
            Self::AwaitSecondPress => "await_second_press",
            Self::Feed => "feed",
            Self::Fasten => "fasten",
            Self::Recover => "recover",
            Self::RetractTool => "retract_tool",
            Self::Unclamp => "unclamp",
        }
    }
}

impl fmt::Display for CycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("{step}: timed out waiting for {sensor} to {}", level_word(.want))]
    WaitTimeout {
        step: CycleStep,
        sensor: String,
        want: bool,
    },

    #[error("no screw passed the transit sensor after {attempts} feed attempts")]
    FeedRetriesExhausted { attempts: u32 },

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

fn level_word(closed: &bool) -> &'static str {
    if *closed {
        "CLOSE"
    } else {
        "OPEN"
    }
}

/// How a sequencer run ended. A run never completes on its own.
#[derive(Debug)]
pub enum CycleOutcome {
    Stopped,
    Aborted(CycleError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleCounters {
    pub loops_completed: u64,
    pub torque_recoveries: u64,
    pub feed_retries: u64,
    pub wait_timeouts: u64,
}

/// Current step and counters, readable from any thread while a run is active.
#[derive(Debug, Default)]
pub struct CycleProgress {
    step: AtomicU8,
    loops_completed: AtomicU64,
    torque_recoveries: AtomicU64,
    feed_retries: AtomicU64,
    wait_timeouts: AtomicU64,
}

impl CycleProgress {
    pub fn step(&self) -> CycleStep {
        CycleStep::from_u8(self.step.load(Ordering::Acquire))
    }

    fn enter(&self, step: CycleStep) {
        self.step.store(step as u8, Ordering::Release);
    }

    pub fn counters(&self) -> CycleCounters {
        CycleCounters {
            loops_completed: self.loops_completed.load(Ordering::Relaxed),
            torque_recoveries: self.torque_recoveries.load(Ordering::Relaxed),
            feed_retries: self.feed_retries.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
        }
    }
}

enum Exit {
    Stop,
    Abort(CycleError),
}

impl From<HardwareError> for Exit {
    fn from(e: HardwareError) -> Self {
        Exit::Abort(CycleError::Hardware(e))
    }
}

type Flow<T = ()> = Result<T, Exit>;

pub struct CycleSequencer {
    hw: SharedHardware,
    waits: Waits,
    config: CycleConfig,
    progress: Arc<CycleProgress>,
}

impl CycleSequencer {
    pub fn new(
        hw: SharedHardware,
        sensors: Arc<SensorTable>,
        config: CycleConfig,
        cancel: CancelToken,
        progress: Arc<CycleProgress>,
    ) -> Self {
        let waits = Waits::new(sensors, cancel, config.poll_tick());
        Self {
            hw,
            waits,
            config,
            progress,
        }
    }

    /// Runs until cancelled or aborted. Every exit leaves all relays OFF.
    pub fn run(&self) -> CycleOutcome {
        info!("Cycle started");
        let exit = match self.home() {
            Ok(()) => self.main_loop(),
            Err(exit) => exit,
        };

        if let Err(e) = lock_hardware(&self.hw).all_off() {
            error!("Failed to force relays OFF after cycle: {}", e);
        }
        self.progress.enter(CycleStep::Idle);

        match exit {
            Exit::Stop => {
                info!("Cycle stopped");
                CycleOutcome::Stopped
            }
            Exit::Abort(e) => {
                error!("Cycle aborted: {}", e);
                CycleOutcome::Aborted(e)
            }
        }
    }

    fn roles(&self) -> &CycleRoles {
        &self.config.roles
    }

    fn set(&self, relay: &str, on: bool) -> Flow {
        lock_hardware(&self.hw).set_relay(relay, on)?;
        Ok(())
    }

    /// `Ok(true)` on success, `Ok(false)` on timeout, `Stop` on cancellation.
    fn reach(&self, sensor: &str, want: bool) -> Flow<bool> {
        match self
            .waits
            .wait_for_state(sensor, want, self.config.step_timeout())?
        {
            WaitResult::Success => Ok(true),
            WaitResult::Cancelled => Err(Exit::Stop),
            WaitResult::Timeout => {
                self.progress.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{}: TIMEOUT, {} did not reach {}",
                    self.progress.step(),
                    sensor,
                    level_word(&want)
                );
                Ok(false)
            }
        }
    }

    fn timeout(&self, sensor: &str, want: bool) -> Exit {
        Exit::Abort(CycleError::WaitTimeout {
            step: self.progress.step(),
            sensor: sensor.to_string(),
            want,
        })
    }

    /// Waits for a fresh pedal press with no deadline.
    fn await_press(&self) -> Flow {
        let pedal = &self.roles().start_pedal;
        match self.waits.wait_for_new_edge(pedal, None)? {
            WaitResult::Success => Ok(()),
            WaitResult::Timeout | WaitResult::Cancelled => Err(Exit::Stop),
        }
    }

    /// ON, cancellable sleep, OFF. The lock is released during the sleep.
    fn pulse(&self, relay: &str, duration: Duration) -> Flow {
        self.set(relay, true)?;
        let slept = self.waits.sleep(duration);
        self.set(relay, false)?;
        match slept {
            WaitResult::Cancelled => Err(Exit::Stop),
            _ => Ok(()),
        }
    }

    fn home(&self) -> Flow {
        let roles = self.roles();

        self.progress.enter(CycleStep::Homing);
        let at_top = lock_hardware(&self.hw).read_sensor(&roles.cyl_top)?;
        if !at_top {
            self.set(&roles.cyl_up, true)?;
            let reached = self.reach(&roles.cyl_top, true);
            self.set(&roles.cyl_up, false)?;
            if !reached? {
                return Err(self.timeout(&roles.cyl_top, true));
            }
        }

        self.progress.enter(CycleStep::ProbeDown);
        self.set(&roles.tool_down, true)?;
        if !self.reach(&roles.tool_bottom, true)? {
            self.set(&roles.tool_down, false)?;
            return Err(self.timeout(&roles.tool_bottom, true));
        }

        self.progress.enter(CycleStep::ProbeUp);
        self.set(&roles.tool_down, false)?;
        if !self.reach(&roles.tool_top, true)? {
            return Err(self.timeout(&roles.tool_top, true));
        }

        info!("Homing complete");
        Ok(())
    }

    fn main_loop(&self) -> Exit {
        loop {
            if let Err(exit) = self.one_loop() {
                return exit;
            }
        }
    }

    fn one_loop(&self) -> Flow {
        let roles = self.roles();

        self.progress.enter(CycleStep::AwaitFirstPress);
        self.await_press()?;

        // The clamp stays held down until the unclamp step.
        self.progress.enter(CycleStep::Clamp);
        self.set(&roles.cyl_down, true)?;
        if !self.reach(&roles.cyl_bottom, true)? {
            self.set(&roles.cyl_down, false)?;
            return Err(Exit::Stop);
        }

        self.progress.enter(CycleStep::AwaitSecondPress);
        self.await_press()?;

        self.progress.enter(CycleStep::Feed);
        self.feed()?;

        self.progress.enter(CycleStep::Fasten);
        self.set(&roles.torque_mode, true)?;
        self.set(&roles.tool_down, true)?;
        if !self.reach(&roles.torque_ok, true)? {
            return self.recover();
        }

        self.progress.enter(CycleStep::RetractTool);
        self.set(&roles.tool_down, false)?;
        self.set(&roles.torque_mode, false)?;
        if !self.reach(&roles.tool_top, true)? {
            return Err(self.timeout(&roles.tool_top, true));
        }

        self.progress.enter(CycleStep::Unclamp);
        self.set(&roles.cyl_down, false)?;
        self.set(&roles.cyl_up, true)?;
        let reached = self.reach(&roles.cyl_top, true);
        self.set(&roles.cyl_up, false)?;
        if !reached? {
            return Err(self.timeout(&roles.cyl_top, true));
        }

        let done = self.progress.loops_completed.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Loop {} complete", done);
        Ok(())
    }

    fn feed(&self) -> Flow {
        let roles = self.roles();
        let mut failures = 0u32;
        loop {
            let watch = self.waits.arm_pulse(&roles.transit)?;
            self.pulse(&roles.feeder, self.config.feed_pulse())?;
            match self
                .waits
                .wait_for_armed_pulse(&watch, self.config.transit_window())
            {
                WaitResult::Success => return Ok(()),
                WaitResult::Cancelled => return Err(Exit::Stop),
                WaitResult::Timeout => {
                    failures += 1;
                    self.progress.feed_retries.fetch_add(1, Ordering::Relaxed);
                    warn!("Feed attempt {}: no screw seen on {}", failures, roles.transit);
                    if self
                        .config
                        .feed_retry_limit
                        .is_some_and(|limit| failures > limit)
                    {
                        return Err(Exit::Abort(CycleError::FeedRetriesExhausted {
                            attempts: failures,
                        }));
                    }
                }
            }
        }
    }

    /// No torque-ok: back the station out and return to the first press
    /// without counting the loop. Timeouts here are tolerated.
    fn recover(&self) -> Flow {
        let roles = self.roles();
        self.progress.enter(CycleStep::Recover);
        self.progress
            .torque_recoveries
            .fetch_add(1, Ordering::Relaxed);
        warn!("No torque OK, recovering");

        // The clamp hold is released explicitly; interlock pairing is optional.
        self.set(&roles.cyl_down, false)?;
        self.set(&roles.cyl_up, true)?;
        let raised = self.reach(&roles.cyl_top, true);
        self.set(&roles.cyl_up, false)?;
        raised?;

        self.set(&roles.tool_down, false)?;
        let retracted = self.reach(&roles.tool_top, true);
        self.set(&roles.torque_mode, false)?;
        retracted?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StationConfig;
    use crate::test_support::{eventually, fast_config, Rig};
    use std::thread::{self, JoinHandle};

    fn launch(rig: &Rig, config: &StationConfig) -> (CancelToken, Arc<CycleProgress>, JoinHandle<CycleOutcome>) {
        let cancel = CancelToken::new();
        let progress = Arc::new(CycleProgress::default());
        let sequencer = CycleSequencer::new(
            Arc::clone(&rig.hw),
            Arc::clone(&rig.sensors),
            config.cycle.clone(),
            cancel.clone(),
            Arc::clone(&progress),
        );
        let handle = thread::spawn(move || sequencer.run());
        (cancel, progress, handle)
    }

    fn at_step(progress: &CycleProgress, step: CycleStep) -> bool {
        eventually(Duration::from_secs(3), || progress.step() == step)
    }

    #[test]
    fn step_round_trips_through_u8() {
        for step in CycleStep::ALL {
            assert_eq!(CycleStep::from_u8(step as u8), step);
        }
        assert_eq!(CycleStep::from_u8(200), CycleStep::Idle);
    }

    #[test]
    fn happy_path_completes_one_loop() {
        let config = fast_config();
        let rig = Rig::new(config.clone());
        let (cancel, progress, handle) = launch(&rig, &config);

        assert!(at_step(&progress, CycleStep::AwaitFirstPress));
        rig.tap_pedal();
        assert!(at_step(&progress, CycleStep::AwaitSecondPress));
        assert!(rig.relay("cyl_down"));
        rig.tap_pedal();

        assert!(eventually(Duration::from_secs(3), || {
            progress.counters().loops_completed == 1
        }));
        assert!(at_step(&progress, CycleStep::AwaitFirstPress));
        for relay in ["cyl_down", "cyl_up", "tool_down", "torque_mode"] {
            assert!(!rig.relay(relay), "{relay} left ON");
        }
        assert_eq!(progress.counters().torque_recoveries, 0);

        cancel.cancel();
        assert!(matches!(handle.join().unwrap(), CycleOutcome::Stopped));
        assert!(!rig.any_relay_on());
        assert_eq!(progress.step(), CycleStep::Idle);
    }

    #[test]
    fn missing_torque_ok_recovers_without_abort() {
        let mut config = fast_config();
        config.cycle.step_timeout_ms = Some(200);
        let rig = Rig::new(config.clone());
        rig.fixture.set_torque_ack(false);
        let (cancel, progress, handle) = launch(&rig, &config);

        assert!(at_step(&progress, CycleStep::AwaitFirstPress));
        rig.tap_pedal();
        assert!(at_step(&progress, CycleStep::AwaitSecondPress));
        rig.tap_pedal();

        assert!(eventually(Duration::from_secs(3), || {
            progress.counters().torque_recoveries == 1
        }));
        assert!(at_step(&progress, CycleStep::AwaitFirstPress));
        assert_eq!(progress.counters().loops_completed, 0);
        assert!(!rig.relay("cyl_down"));
        assert!(!rig.relay("torque_mode"));
        assert!(!handle.is_finished());

        cancel.cancel();
        assert!(matches!(handle.join().unwrap(), CycleOutcome::Stopped));
    }

    #[test]
    fn exhausted_feed_retries_abort_with_relays_off() {
        let mut config = fast_config();
        config.cycle.feed_retry_limit = Some(2);
        config.cycle.transit_window_ms = 50;
        let rig = Rig::new(config.clone());
        rig.fixture.fail_next_feeds(10);
        let (_cancel, progress, handle) = launch(&rig, &config);

        assert!(at_step(&progress, CycleStep::AwaitFirstPress));
        rig.tap_pedal();
        assert!(at_step(&progress, CycleStep::AwaitSecondPress));
        rig.tap_pedal();

        let outcome = handle.join().unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Aborted(CycleError::FeedRetriesExhausted { attempts: 3 })
        ));
        assert_eq!(progress.counters().feed_retries, 3);
        assert!(!rig.any_relay_on());
    }

    #[test]
    fn clamp_is_released_without_interlock_pairing() {
        let mut config = fast_config();
        config.cycle.step_timeout_ms = Some(200);
        config.interlocks.clear();
        config.validate().unwrap();
        let rig = Rig::new(config.clone());
        let (cancel, progress, handle) = launch(&rig, &config);

        assert!(at_step(&progress, CycleStep::AwaitFirstPress));
        rig.tap_pedal();
        assert!(at_step(&progress, CycleStep::AwaitSecondPress));
        rig.tap_pedal();
        assert!(eventually(Duration::from_secs(3), || {
            progress.counters().loops_completed == 1
        }));
        assert!(at_step(&progress, CycleStep::AwaitFirstPress));
        assert!(!rig.relay("cyl_down"), "clamp held after unclamp");
        assert!(!rig.relay("cyl_up"));

        // Same for the recovery path.
        rig.fixture.set_torque_ack(false);
        rig.tap_pedal();
        assert!(at_step(&progress, CycleStep::AwaitSecondPress));
        rig.tap_pedal();
        assert!(eventually(Duration::from_secs(3), || {
            progress.counters().torque_recoveries == 1
        }));
        assert!(at_step(&progress, CycleStep::AwaitFirstPress));
        assert!(!rig.relay("cyl_down"), "clamp held after recovery");

        cancel.cancel();
        assert!(matches!(handle.join().unwrap(), CycleOutcome::Stopped));
    }

    #[test]
    fn unlimited_feed_retries_keep_trying() {
        let mut config = fast_config();
        config.cycle.feed_retry_limit = None;
        config.cycle.transit_window_ms = 50;
        let rig = Rig::new(config.clone());
        rig.fixture.fail_next_feeds(5);
        let (cancel, progress, handle) = launch(&rig, &config);

        assert!(at_step(&progress, CycleStep::AwaitFirstPress));
        rig.tap_pedal();
        assert!(at_step(&progress, CycleStep::AwaitSecondPress));
        rig.tap_pedal();

        assert!(eventually(Duration::from_secs(3), || {
            progress.counters().loops_completed == 1
        }));
        assert_eq!(progress.counters().feed_retries, 5);
        assert!(!handle.is_finished());

        cancel.cancel();
        assert!(matches!(handle.join().unwrap(), CycleOutcome::Stopped));
    }

    #[test]
    fn clamp_timeout_stops_with_clamp_released() {
        let mut config = fast_config();
        config.cycle.step_timeout_ms = Some(100);
        let rig = Rig::new(config.clone());
        rig.fixture.jam_cylinder(true);
        let (_cancel, progress, handle) = launch(&rig, &config);

        assert!(at_step(&progress, CycleStep::AwaitFirstPress));
        rig.tap_pedal();

        assert!(matches!(handle.join().unwrap(), CycleOutcome::Stopped));
        assert_eq!(progress.counters().wait_timeouts, 1);
        assert!(!rig.relay("cyl_down"));
        assert!(!rig.any_relay_on());
    }

    #[test]
    fn homing_timeout_aborts() {
        let mut config = fast_config();
        config.cycle.step_timeout_ms = Some(100);
        let mut rig = Rig::new(config.clone());
        // Freeze the mechanics with the cylinder away from its top stop.
        rig.fixture.stop();
        let pin = config.sensor("cyl_top").unwrap().pin;
        rig.pins.set_input(pin, true);
        assert!(eventually(Duration::from_secs(1), || {
            rig.sensors.state("cyl_top") == Some(false)
        }));

        let (_cancel, _progress, handle) = launch(&rig, &config);
        match handle.join().unwrap() {
            CycleOutcome::Aborted(CycleError::WaitTimeout { step, sensor, want }) => {
                assert_eq!(step, CycleStep::Homing);
                assert_eq!(sensor, "cyl_top");
                assert!(want);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!rig.any_relay_on());
    }
}
