//! Blocking, cancellable waits over the published sensor table.

use crate::hardware::HardwareError;
use crate::watcher::{SensorChannel, SensorTable};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Cooperative stop request shared between the runner and the sequencer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Closure counter snapshot taken by [`Waits::arm_pulse`].
pub struct PulseWatch<'a> {
    channel: &'a SensorChannel,
    baseline: u64,
}

impl PulseWatch<'_> {
    fn seen(&self) -> bool {
        self.channel.is_closed() || self.channel.closures() != self.baseline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Success,
    Timeout,
    Cancelled,
}

pub struct Waits {
    sensors: Arc<SensorTable>,
    cancel: CancelToken,
    tick: Duration,
}

impl Waits {
    pub fn new(sensors: Arc<SensorTable>, cancel: CancelToken, tick: Duration) -> Self {
        Self {
            sensors,
            cancel,
            tick,
        }
    }

    fn channel(&self, name: &str) -> Result<&SensorChannel, HardwareError> {
        self.sensors
            .channel(name)
            .ok_or_else(|| HardwareError::UnknownChannel(name.to_string()))
    }

    /// Polls `done` every tick until it holds, the deadline passes or the run
    /// is cancelled. Cancellation wins over a same-tick success.
    fn poll_until(&self, timeout: Option<Duration>, mut done: impl FnMut() -> bool) -> WaitResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.cancel.is_cancelled() {
                return WaitResult::Cancelled;
            }
            if done() {
                return WaitResult::Success;
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitResult::Timeout;
                    }
                    self.tick.min(deadline - now)
                }
                None => self.tick,
            };
            thread::sleep(pause);
        }
    }

    /// Waits until `sensor` reads `want`.
    pub fn wait_for_state(
        &self,
        sensor: &str,
        want: bool,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, HardwareError> {
        let channel = self.channel(sensor)?;
        Ok(self.poll_until(timeout, || channel.is_closed() == want))
    }

    /// Waits for a fresh OPEN -> CLOSE activation. A contact that is still
    /// closed from an earlier press must open first; each phase gets its own
    /// `timeout` budget.
    pub fn wait_for_new_edge(
        &self,
        sensor: &str,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, HardwareError> {
        let channel = self.channel(sensor)?;
        match self.poll_until(timeout, || !channel.is_closed()) {
            WaitResult::Success => {}
            other => return Ok(other),
        }
        Ok(self.poll_until(timeout, || channel.is_closed()))
    }

    /// Records the closure count of `sensor` so that a pulse starting before
    /// the wait itself is still counted.
    pub fn arm_pulse(&self, sensor: &str) -> Result<PulseWatch<'_>, HardwareError> {
        let channel = self.channel(sensor)?;
        Ok(PulseWatch {
            channel,
            baseline: channel.closures(),
        })
    }

    /// Succeeds if `sensor` is seen CLOSE at least once within `window`,
    /// including a pulse that opened again between two ticks.
    pub fn wait_for_pulse(&self, sensor: &str, window: Duration) -> Result<WaitResult, HardwareError> {
        let watch = self.arm_pulse(sensor)?;
        Ok(self.wait_for_armed_pulse(&watch, window))
    }

    /// Like [`Waits::wait_for_pulse`], counting closures since `watch` was armed.
    pub fn wait_for_armed_pulse(&self, watch: &PulseWatch<'_>, window: Duration) -> WaitResult {
        self.poll_until(Some(window), || watch.seen())
    }

    /// Sleeps for `duration` unless cancelled first.
    pub fn sleep(&self, duration: Duration) -> WaitResult {
        let elapsed = self.poll_until(Some(duration), || false);
        match elapsed {
            WaitResult::Timeout => WaitResult::Success,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StationConfig;
    use crate::timebase::TimeBase;

    const TICK: Duration = Duration::from_millis(10);

    fn table() -> Arc<SensorTable> {
        Arc::new(SensorTable::from_config(
            &StationConfig::default(),
            TimeBase::new(),
        ))
    }

    #[test]
    fn state_wait_times_out_on_deadline() {
        let waits = Waits::new(table(), CancelToken::new(), TICK);
        let start = Instant::now();
        let res = waits
            .wait_for_state("torque_ok", true, Some(Duration::from_millis(200)))
            .unwrap();
        let elapsed = start.elapsed();
        assert_eq!(res, WaitResult::Timeout);
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(250), "{elapsed:?}");
    }

    #[test]
    fn state_wait_succeeds_immediately_when_satisfied() {
        let sensors = table();
        sensors.publish("cyl_top", true);
        let waits = Waits::new(sensors, CancelToken::new(), TICK);
        let res = waits
            .wait_for_state("cyl_top", true, Some(Duration::ZERO))
            .unwrap();
        assert_eq!(res, WaitResult::Success);
    }

    #[test]
    fn unknown_sensor_is_an_error() {
        let waits = Waits::new(table(), CancelToken::new(), TICK);
        assert!(matches!(
            waits.wait_for_state("ghost", true, None),
            Err(HardwareError::UnknownChannel(_))
        ));
    }

    #[test]
    fn new_edge_requires_release_then_press() {
        let sensors = table();
        sensors.publish("start_pedal", true);
        let waits = Waits::new(Arc::clone(&sensors), CancelToken::new(), TICK);

        let driver = {
            let sensors = Arc::clone(&sensors);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                sensors.publish("start_pedal", false);
                thread::sleep(Duration::from_millis(50));
                sensors.publish("start_pedal", true);
            })
        };

        let start = Instant::now();
        let res = waits
            .wait_for_new_edge("start_pedal", Some(Duration::from_secs(1)))
            .unwrap();
        let elapsed = start.elapsed();
        driver.join().unwrap();

        assert_eq!(res, WaitResult::Success);
        assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");
    }

    #[test]
    fn stale_press_alone_times_out() {
        let sensors = table();
        sensors.publish("start_pedal", true);
        let waits = Waits::new(sensors, CancelToken::new(), TICK);
        let res = waits
            .wait_for_new_edge("start_pedal", Some(Duration::from_millis(60)))
            .unwrap();
        assert_eq!(res, WaitResult::Timeout);
    }

    #[test]
    fn pulse_between_ticks_is_seen() {
        let sensors = table();
        let waits = Waits::new(Arc::clone(&sensors), CancelToken::new(), Duration::from_millis(50));
        let driver = {
            let sensors = Arc::clone(&sensors);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                sensors.publish("screw_transit", true);
                sensors.publish("screw_transit", false);
            })
        };
        let res = waits
            .wait_for_pulse("screw_transit", Duration::from_millis(300))
            .unwrap();
        driver.join().unwrap();
        assert_eq!(res, WaitResult::Success);
    }

    #[test]
    fn armed_watch_counts_earlier_pulse() {
        let sensors = table();
        let waits = Waits::new(Arc::clone(&sensors), CancelToken::new(), TICK);
        let watch = waits.arm_pulse("screw_transit").unwrap();
        sensors.publish("screw_transit", true);
        sensors.publish("screw_transit", false);
        assert_eq!(
            waits.wait_for_armed_pulse(&watch, Duration::ZERO),
            WaitResult::Success
        );
    }

    #[test]
    fn missing_pulse_reports_timeout() {
        let waits = Waits::new(table(), CancelToken::new(), TICK);
        let res = waits
            .wait_for_pulse("screw_transit", Duration::from_millis(50))
            .unwrap();
        assert_eq!(res, WaitResult::Timeout);
    }

    #[test]
    fn unbounded_wait_observes_cancel_within_a_tick() {
        let cancel = CancelToken::new();
        let waits = Waits::new(table(), cancel.clone(), TICK);
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            let at = Instant::now();
            cancel.cancel();
            at
        });
        let res = waits.wait_for_new_edge("start_pedal", None).unwrap();
        let returned = Instant::now();
        let cancelled_at = canceller.join().unwrap();
        assert_eq!(res, WaitResult::Cancelled);
        assert!(returned.duration_since(cancelled_at) <= TICK * 3);
    }

    #[test]
    fn sleep_is_cancellable() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let waits = Waits::new(table(), cancel, TICK);
        assert_eq!(waits.sleep(Duration::from_secs(5)), WaitResult::Cancelled);

        let waits = Waits::new(table(), CancelToken::new(), TICK);
        assert_eq!(waits.sleep(Duration::from_millis(20)), WaitResult::Success);
    }
}
