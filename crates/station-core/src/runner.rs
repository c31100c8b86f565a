//! Background execution of the cycle sequencer and the manual relay path.

use crate::config::CycleConfig;
use crate::hardware::{
    lock_hardware, pulse_relay, HardwareError, HardwareStats, SharedHardware,
};
use crate::sequencer::{CycleCounters, CycleOutcome, CycleProgress, CycleSequencer, CycleStep};
use crate::wait::CancelToken;
use crate::watcher::SensorTable;
use log::{error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RunStatus {
    Idle = 0,
    Running,
    Stopping,
    Stopped,
}

impl RunStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    On,
    Off,
    Pulse(Duration),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("cycle is running")]
    Busy,

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("failed to launch cycle thread: {0}")]
    Launch(#[from] std::io::Error),
}

/// How the most recent run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum RunEnd {
    Stopped,
    Aborted(String),
}

impl From<&CycleOutcome> for RunEnd {
    fn from(outcome: &CycleOutcome) -> Self {
        match outcome {
            CycleOutcome::Stopped => RunEnd::Stopped,
            CycleOutcome::Aborted(e) => RunEnd::Aborted(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StationSnapshot {
    pub timestamp_us: u64,
    pub status: RunStatus,
    pub cycle_running: bool,
    pub step: CycleStep,
    pub runs_started: u64,
    pub counters: CycleCounters,
    pub last_outcome: Option<RunEnd>,
    pub relays: BTreeMap<String, bool>,
    /// Monotonic stamp of each relay's last successful write.
    pub relay_writes_us: BTreeMap<String, u64>,
    pub sensors: BTreeMap<String, bool>,
    /// Monotonic stamp of each sensor's last debounced change.
    pub sensor_changes_us: BTreeMap<String, u64>,
    pub hardware: HardwareStats,
}

/// Called from the cycle thread once the sequencer has returned.
pub type RunObserver = Arc<dyn Fn(&RunEnd) + Send + Sync>;

struct ActiveRun {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CycleRunner {
    hw: SharedHardware,
    sensors: Arc<SensorTable>,
    config: CycleConfig,
    status: Arc<AtomicU8>,
    progress: Arc<CycleProgress>,
    last_outcome: Arc<Mutex<Option<RunEnd>>>,
    runs_started: AtomicU64,
    active: Mutex<Option<ActiveRun>>,
    observer: Option<RunObserver>,
}

impl CycleRunner {
    pub fn new(hw: SharedHardware, sensors: Arc<SensorTable>, config: CycleConfig) -> Self {
        Self {
            hw,
            sensors,
            config,
            status: Arc::new(AtomicU8::new(RunStatus::Idle as u8)),
            progress: Arc::new(CycleProgress::default()),
            last_outcome: Arc::new(Mutex::new(None)),
            runs_started: AtomicU64::new(0),
            active: Mutex::new(None),
            observer: None,
        }
    }

    /// Registers a callback for every run end, natural or stopped.
    pub fn with_observer(mut self, observer: RunObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn progress(&self) -> &Arc<CycleProgress> {
        &self.progress
    }

    pub fn last_outcome(&self) -> Option<RunEnd> {
        lock(&self.last_outcome).clone()
    }

    pub fn hardware(&self) -> &SharedHardware {
        &self.hw
    }

    /// Launches the sequencer. Idempotent while a run is active.
    pub fn start(&self) -> Result<RunStatus, CommandError> {
        let mut active = lock(&self.active);
        let current = self.status();
        if current.is_active() {
            return Ok(current);
        }
        if let Some(run) = active.take() {
            if !run.handle.is_finished() {
                warn!("Previous cycle thread has not exited yet; start refused");
                *active = Some(run);
                return Ok(current);
            }
            if run.handle.join().is_err() {
                error!("Previous cycle thread panicked");
            }
        }

        let cancel = CancelToken::new();
        let sequencer = CycleSequencer::new(
            Arc::clone(&self.hw),
            Arc::clone(&self.sensors),
            self.config.clone(),
            cancel.clone(),
            Arc::clone(&self.progress),
        );
        let status = Arc::clone(&self.status);
        let last_outcome = Arc::clone(&self.last_outcome);
        let observer = self.observer.clone();

        status.store(RunStatus::Running as u8, Ordering::Release);
        let spawned = thread::Builder::new()
            .name("cycle".to_string())
            .spawn(move || {
                let outcome = RunEnd::from(&sequencer.run());
                *lock(&last_outcome) = Some(outcome.clone());
                // A concurrent stop owns the final transition.
                let _ = status.compare_exchange(
                    RunStatus::Running as u8,
                    RunStatus::Idle as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                if let Some(observer) = observer {
                    observer(&outcome);
                }
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.status.store(RunStatus::Idle as u8, Ordering::Release);
                return Err(e.into());
            }
        };

        self.runs_started.fetch_add(1, Ordering::Relaxed);
        *active = Some(ActiveRun { cancel, handle });
        info!("Cycle runner started");
        Ok(RunStatus::Running)
    }

    /// Cancels the active run, waits for it (bounded) and forces all relays
    /// OFF. A no-op when nothing is running.
    pub fn stop(&self) -> RunStatus {
        let mut active = lock(&self.active);
        let Some(run) = active.take() else {
            return self.status();
        };
        if !self.status().is_active() && run.handle.is_finished() {
            let _ = run.handle.join();
            return self.status();
        }

        self.status
            .store(RunStatus::Stopping as u8, Ordering::Release);
        run.cancel.cancel();

        let deadline = Instant::now() + self.config.stop_join_timeout();
        while !run.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        if run.handle.is_finished() {
            if run.handle.join().is_err() {
                error!("Cycle thread panicked");
            }
        } else {
            warn!(
                "Cycle thread did not exit within {} ms",
                self.config.stop_join_timeout().as_millis()
            );
            *active = Some(run);
        }

        if let Err(e) = lock_hardware(&self.hw).all_off() {
            error!("Failed to force relays OFF on stop: {}", e);
        }
        self.status
            .store(RunStatus::Stopped as u8, Ordering::Release);
        info!("Cycle runner stopped");
        RunStatus::Stopped
    }

    /// Manual single-relay command, rejected while a cycle owns the outputs.
    pub fn set_relay(&self, name: &str, command: RelayCommand) -> Result<(), CommandError> {
        let active = lock(&self.active);
        let lingering = active.as_ref().is_some_and(|run| !run.handle.is_finished());
        if self.status().is_active() || lingering {
            return Err(CommandError::Busy);
        }
        // `active` stays locked so no cycle can start mid-pulse.
        match command {
            RelayCommand::On => lock_hardware(&self.hw).set_relay(name, true)?,
            RelayCommand::Off => lock_hardware(&self.hw).set_relay(name, false)?,
            RelayCommand::Pulse(duration) => pulse_relay(&self.hw, name, duration)?,
        }
        Ok(())
    }

    pub fn snapshot(&self) -> StationSnapshot {
        let status = self.status();
        let hw = lock_hardware(&self.hw);
        StationSnapshot {
            timestamp_us: hw.timebase().now_us(),
            status,
            cycle_running: status == RunStatus::Running,
            step: self.progress.step(),
            runs_started: self.runs_started.load(Ordering::Relaxed),
            counters: self.progress.counters(),
            last_outcome: self.last_outcome(),
            relays: hw.relay_states(),
            relay_writes_us: hw
                .relays()
                .iter()
                .filter_map(|r| r.last_write_us.map(|t| (r.name.clone(), t)))
                .collect(),
            sensors: hw.sensor_states(),
            sensor_changes_us: hw.sensors().change_stamps(),
            hardware: hw.stats(),
        }
    }

    /// Stops any run and leaves every relay OFF.
    pub fn shutdown(&self) {
        self.stop();
        if let Err(e) = lock_hardware(&self.hw).all_off() {
            error!("Failed to force relays OFF at shutdown: {}", e);
        }
    }
}

impl Drop for CycleRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{eventually, fast_config, Rig};

    fn runner(rig: &Rig) -> CycleRunner {
        CycleRunner::new(
            Arc::clone(&rig.hw),
            Arc::clone(&rig.sensors),
            rig.config.cycle.clone(),
        )
    }

    fn reaches(runner: &CycleRunner, step: CycleStep) -> bool {
        eventually(Duration::from_secs(3), || runner.progress().step() == step)
    }

    #[test]
    fn stop_on_idle_is_a_noop() {
        let rig = Rig::new(fast_config());
        let runner = runner(&rig);
        assert_eq!(runner.stop(), RunStatus::Idle);
        assert_eq!(runner.status(), RunStatus::Idle);
        assert_eq!(runner.last_outcome(), None);
    }

    #[test]
    fn second_start_returns_existing_run() {
        let rig = Rig::new(fast_config());
        let runner = runner(&rig);
        assert_eq!(runner.start().unwrap(), RunStatus::Running);
        assert_eq!(runner.start().unwrap(), RunStatus::Running);
        assert_eq!(runner.snapshot().runs_started, 1);
        runner.stop();
    }

    #[test]
    fn stop_unwinds_unbounded_wait_within_two_ticks() {
        let mut config = fast_config();
        config.cycle.poll_tick_ms = 50;
        let rig = Rig::new(config);
        let runner = runner(&rig);
        runner.start().unwrap();
        assert!(reaches(&runner, CycleStep::AwaitFirstPress));

        let started = Instant::now();
        assert_eq!(runner.stop(), RunStatus::Stopped);
        let took = started.elapsed();

        // Two ticks plus scheduling slack.
        assert!(took < Duration::from_millis(2 * 50 + 20), "stop took {took:?}");
        assert_eq!(runner.status(), RunStatus::Stopped);
        assert_eq!(runner.last_outcome(), Some(RunEnd::Stopped));
        assert!(!rig.any_relay_on());
    }

    #[test]
    fn stop_mid_clamp_releases_held_relay() {
        let rig = Rig::new(fast_config());
        let runner = runner(&rig);
        runner.start().unwrap();
        assert!(reaches(&runner, CycleStep::AwaitFirstPress));
        rig.tap_pedal();
        assert!(reaches(&runner, CycleStep::AwaitSecondPress));
        assert!(rig.relay("cyl_down"));

        runner.stop();
        assert!(!rig.any_relay_on());
    }

    #[test]
    fn manual_relay_is_busy_while_running() {
        let rig = Rig::new(fast_config());
        let runner = runner(&rig);
        runner.start().unwrap();
        assert!(matches!(
            runner.set_relay("feeder", RelayCommand::On),
            Err(CommandError::Busy)
        ));
        runner.stop();

        runner.set_relay("feeder", RelayCommand::On).unwrap();
        assert!(rig.relay("feeder"));
        runner
            .set_relay("feeder", RelayCommand::Pulse(Duration::from_millis(5)))
            .unwrap();
        assert!(!rig.relay("feeder"));
        assert!(matches!(
            runner.set_relay("nope", RelayCommand::Off),
            Err(CommandError::Hardware(HardwareError::UnknownChannel(_)))
        ));
    }

    #[test]
    fn manual_pulse_does_not_block_snapshots() {
        let rig = Rig::new(fast_config());
        let runner = Arc::new(runner(&rig));
        let pulsing = {
            let runner = Arc::clone(&runner);
            thread::spawn(move || {
                runner.set_relay("feeder", RelayCommand::Pulse(Duration::from_millis(400)))
            })
        };
        assert!(eventually(Duration::from_secs(1), || rig.relay("feeder")));

        let started = Instant::now();
        let snapshot = runner.snapshot();
        let took = started.elapsed();
        assert!(took < Duration::from_millis(100), "snapshot took {took:?}");
        assert_eq!(snapshot.relays.get("feeder"), Some(&true));

        pulsing.join().unwrap().unwrap();
        assert!(!rig.relay("feeder"));
    }

    #[test]
    fn abort_returns_to_idle_and_keeps_outcome() {
        let mut config = fast_config();
        config.cycle.step_timeout_ms = Some(50);
        let mut rig = Rig::new(config.clone());
        rig.fixture.stop();
        let pin = config.sensor("tool_bottom").unwrap().pin;
        // Tool bottom never closes: probe-down times out.
        rig.pins.set_input(pin, true);

        let runner = runner(&rig);
        runner.start().unwrap();
        assert!(eventually(Duration::from_secs(2), || {
            runner.status() == RunStatus::Idle
        }));
        match runner.last_outcome() {
            Some(RunEnd::Aborted(reason)) => assert!(reason.contains("tool_bottom"), "{reason}"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!rig.any_relay_on());
        assert_eq!(runner.stop(), RunStatus::Idle);

        let snapshot = runner.snapshot();
        assert!(!snapshot.cycle_running);
        assert_eq!(snapshot.step, CycleStep::Idle);
    }

    #[test]
    fn observer_sees_stopped_run() {
        let rig = Rig::new(fast_config());
        let ends: Arc<Mutex<Vec<RunEnd>>> = Arc::default();
        let sink = Arc::clone(&ends);
        let runner = runner(&rig).with_observer(Arc::new(move |end: &RunEnd| {
            sink.lock().unwrap().push(end.clone())
        }));
        runner.start().unwrap();
        assert!(reaches(&runner, CycleStep::AwaitFirstPress));
        runner.stop();
        assert!(eventually(Duration::from_secs(1), || {
            ends.lock().unwrap().as_slice() == [RunEnd::Stopped]
        }));
    }
}
