//! Debounced sensor state.
//!
//! Watchers sample raw pins and publish into a [`SensorTable`] of atomics.
//! Readers never take a lock and never wait on a watcher thread.

use crate::config::{SensingConfig, StationConfig};
use crate::hal::{EdgeCallback, HalError, InputPins};
use crate::timebase::TimeBase;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One debounced input.
#[derive(Debug)]
pub struct SensorChannel {
    pub name: String,
    pub pin: u16,
    pub active_low: bool,
    pub debounce: Duration,
    closed: AtomicBool,
    last_change_us: AtomicU64,
    closures: AtomicU64,
}

impl SensorChannel {
    /// Logical reading for an electrical level (`true` = closed/actuated).
    pub fn logical(&self, high: bool) -> bool {
        high != self.active_low
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn last_change_us(&self) -> u64 {
        self.last_change_us.load(Ordering::Acquire)
    }

    /// Number of published OPEN -> CLOSE transitions.
    pub fn closures(&self) -> u64 {
        self.closures.load(Ordering::Acquire)
    }
}

/// Published sensor state shared by watchers (writers) and everyone else.
#[derive(Debug)]
pub struct SensorTable {
    channels: Vec<SensorChannel>,
    index: HashMap<String, usize>,
    timebase: TimeBase,
}

impl SensorTable {
    pub fn from_config(config: &StationConfig, timebase: TimeBase) -> Self {
        let channels: Vec<SensorChannel> = config
            .sensors
            .iter()
            .map(|spec| SensorChannel {
                name: spec.name.clone(),
                pin: spec.pin,
                active_low: spec.active_low,
                debounce: spec.debounce(),
                closed: AtomicBool::new(false),
                last_change_us: AtomicU64::new(0),
                closures: AtomicU64::new(0),
            })
            .collect();
        let index = channels
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        Self {
            channels,
            index,
            timebase,
        }
    }

    pub fn channels(&self) -> &[SensorChannel] {
        &self.channels
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn channel(&self, name: &str) -> Option<&SensorChannel> {
        self.index_of(name).map(|i| &self.channels[i])
    }

    pub fn state(&self, name: &str) -> Option<bool> {
        self.channel(name).map(SensorChannel::is_closed)
    }

    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        self.channels
            .iter()
            .map(|c| (c.name.clone(), c.is_closed()))
            .collect()
    }

    /// Monotonic stamp of each channel's last published change.
    pub fn change_stamps(&self) -> BTreeMap<String, u64> {
        self.channels
            .iter()
            .map(|c| (c.name.clone(), c.last_change_us()))
            .collect()
    }

    /// Publishes a debounced value. Returns `false` for an unknown name.
    pub fn publish(&self, name: &str, closed: bool) -> bool {
        match self.index_of(name) {
            Some(idx) => {
                self.publish_at(idx, closed);
                true
            }
            None => false,
        }
    }

    fn publish_at(&self, idx: usize, closed: bool) {
        let channel = &self.channels[idx];
        if channel.closed.swap(closed, Ordering::AcqRel) == closed {
            return;
        }
        channel
            .last_change_us
            .store(self.timebase.now_us(), Ordering::Release);
        if closed {
            channel.closures.fetch_add(1, Ordering::AcqRel);
        }
        info!(
            "SENSOR {}: {}",
            channel.name,
            if closed { "CLOSE" } else { "OPEN" }
        );
    }

    /// Seeds every channel from a raw sample, without debouncing.
    fn seed(&self, inputs: &dyn InputPins) {
        for (idx, channel) in self.channels.iter().enumerate() {
            match inputs.sample(channel.pin) {
                Ok(high) => {
                    let closed = channel.logical(high);
                    channel.closed.store(closed, Ordering::Release);
                    channel
                        .last_change_us
                        .store(self.timebase.now_us(), Ordering::Release);
                }
                Err(e) => warn!("initial sample of {} failed: {}", self.channels[idx].name, e),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Edge,
    Polling,
}

impl WatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edge => "edge",
            Self::Polling => "polling",
        }
    }
}

pub trait SensorWatcher: Send + Sync {
    fn mode(&self) -> WatchMode;

    fn table(&self) -> &Arc<SensorTable>;

    /// Stops background work. Idempotent.
    fn shutdown(&self);
}

/// Tries edge support on every channel and falls back to polling if any
/// registration fails.
pub fn start_watcher(
    inputs: Arc<dyn InputPins>,
    table: Arc<SensorTable>,
    sensing: &SensingConfig,
) -> Box<dyn SensorWatcher> {
    if !sensing.force_polling {
        match EdgeWatcher::try_start(Arc::clone(&inputs), Arc::clone(&table)) {
            Ok(watcher) => {
                info!("Sensor watcher running in edge mode");
                return Box::new(watcher);
            }
            Err(e) => {
                warn!("Edge detect failed ({}); switching to polling", e);
            }
        }
    }

    table.seed(inputs.as_ref());
    info!(
        "Sensor watcher polling every {} ms",
        sensing.poll_interval().as_millis()
    );
    Box::new(PollingWatcher::spawn(inputs, table, sensing.poll_interval()))
}

enum EdgeMsg {
    Transition(usize),
    Shutdown,
}

/// Interrupt-driven watcher with a per-channel debounce timer.
pub struct EdgeWatcher {
    table: Arc<SensorTable>,
    inputs: Arc<dyn InputPins>,
    tx: Sender<EdgeMsg>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EdgeWatcher {
    pub fn try_start(inputs: Arc<dyn InputPins>, table: Arc<SensorTable>) -> Result<Self, HalError> {
        let (tx, rx) = mpsc::channel();
        let mut subscribed = Vec::new();
        for (idx, channel) in table.channels().iter().enumerate() {
            let tx = tx.clone();
            let callback: EdgeCallback = Arc::new(move |_pin| {
                let _ = tx.send(EdgeMsg::Transition(idx));
            });
            if let Err(e) = inputs.subscribe(channel.pin, callback) {
                for pin in subscribed {
                    inputs.unsubscribe(pin);
                }
                return Err(e);
            }
            subscribed.push(channel.pin);
        }

        // Seeded only once every callback is live; a transition in between
        // is queued and re-sampled by the worker.
        table.seed(inputs.as_ref());

        let worker = {
            let table = Arc::clone(&table);
            let inputs = Arc::clone(&inputs);
            thread::Builder::new()
                .name("sensor-edge".to_string())
                .spawn(move || run_edge_worker(&table, inputs.as_ref(), rx))
                .map_err(|e| HalError::Transport {
                    pin: 0,
                    message: format!("failed to spawn edge worker: {e}"),
                })?
        };

        Ok(Self {
            table,
            inputs,
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }
}

fn run_edge_worker(table: &SensorTable, inputs: &dyn InputPins, rx: mpsc::Receiver<EdgeMsg>) {
    // Candidate level and the instant it becomes publishable.
    let mut pending: Vec<Option<(bool, Instant)>> = vec![None; table.channels().len()];

    loop {
        let next_deadline = pending.iter().flatten().map(|(_, at)| *at).min();
        let msg = match next_deadline {
            Some(at) => rx.recv_timeout(at.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match msg {
            Ok(EdgeMsg::Transition(idx)) => {
                let channel = &table.channels()[idx];
                match inputs.sample(channel.pin) {
                    Ok(high) => {
                        let level = channel.logical(high);
                        pending[idx] = if level == channel.is_closed() {
                            None
                        } else {
                            Some((level, Instant::now() + channel.debounce))
                        };
                    }
                    Err(e) => {
                        warn!("edge resample of {} failed: {}", channel.name, e);
                        pending[idx] = None;
                    }
                }
            }
            Ok(EdgeMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        for (idx, slot) in pending.iter_mut().enumerate() {
            let Some((level, at)) = *slot else {
                continue;
            };
            if at > now {
                continue;
            }
            let channel = &table.channels()[idx];
            *slot = match inputs.sample(channel.pin) {
                Ok(high) if channel.logical(high) == level => {
                    table.publish_at(idx, level);
                    None
                }
                Ok(high) => {
                    let current = channel.logical(high);
                    debug!("{} bounced back before debounce expired", channel.name);
                    (current != channel.is_closed()).then(|| (current, now + channel.debounce))
                }
                Err(e) => {
                    warn!("edge settle sample of {} failed: {}", channel.name, e);
                    None
                }
            };
        }
    }
}

impl SensorWatcher for EdgeWatcher {
    fn mode(&self) -> WatchMode {
        WatchMode::Edge
    }

    fn table(&self) -> &Arc<SensorTable> {
        &self.table
    }

    fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            for channel in self.table.channels() {
                self.inputs.unsubscribe(channel.pin);
            }
            let _ = self.tx.send(EdgeMsg::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for EdgeWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Consecutive-sample debouncer for one polled channel.
#[derive(Debug, Clone)]
pub struct PollDebouncer {
    required: u32,
    published: bool,
    streak: u32,
}

impl PollDebouncer {
    pub fn new(initial: bool, debounce: Duration, interval: Duration) -> Self {
        Self {
            required: Self::required_samples(debounce, interval),
            published: initial,
            streak: 0,
        }
    }

    /// `ceil(debounce / interval)`, at least one.
    pub fn required_samples(debounce: Duration, interval: Duration) -> u32 {
        let interval = interval.as_micros().max(1);
        let samples = debounce.as_micros().div_ceil(interval);
        samples.clamp(1, u32::MAX as u128) as u32
    }

    pub fn required(&self) -> u32 {
        self.required
    }

    pub fn published(&self) -> bool {
        self.published
    }

    /// A failed read breaks the run of consecutive samples.
    pub fn sample_failed(&mut self) {
        self.streak = 0;
    }

    /// Feeds one sample; returns the new value when it is published.
    pub fn observe(&mut self, level: bool) -> Option<bool> {
        if level == self.published {
            self.streak = 0;
            return None;
        }
        self.streak += 1;
        if self.streak >= self.required {
            self.published = level;
            self.streak = 0;
            Some(level)
        } else {
            None
        }
    }
}

/// Fixed-interval sampling watcher.
pub struct PollingWatcher {
    table: Arc<SensorTable>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PollingWatcher {
    pub fn spawn(inputs: Arc<dyn InputPins>, table: Arc<SensorTable>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let table = Arc::clone(&table);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("sensor-poll".to_string())
                .spawn(move || run_poll_loop(&table, inputs.as_ref(), interval, &stop))
        };
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("failed to spawn sensor poll thread: {}", e);
                None
            }
        };
        Self {
            table,
            stop,
            worker: Mutex::new(worker),
        }
    }
}

fn run_poll_loop(table: &SensorTable, inputs: &dyn InputPins, interval: Duration, stop: &AtomicBool) {
    let mut debouncers: Vec<PollDebouncer> = table
        .channels()
        .iter()
        .map(|c| PollDebouncer::new(c.is_closed(), c.debounce, interval))
        .collect();

    let mut failing = vec![false; debouncers.len()];

    while !stop.load(Ordering::Relaxed) {
        for (idx, channel) in table.channels().iter().enumerate() {
            match inputs.sample(channel.pin) {
                Ok(high) => {
                    if std::mem::take(&mut failing[idx]) {
                        info!("poll sample of {} recovered", channel.name);
                    }
                    if let Some(level) = debouncers[idx].observe(channel.logical(high)) {
                        table.publish_at(idx, level);
                    }
                }
                Err(e) => {
                    debouncers[idx].sample_failed();
                    if !std::mem::replace(&mut failing[idx], true) {
                        warn!("poll sample of {} failed: {}", channel.name, e);
                    }
                }
            }
        }
        thread::sleep(interval);
    }
}

impl SensorWatcher for PollingWatcher {
    fn mode(&self) -> WatchMode {
        WatchMode::Polling
    }

    fn table(&self) -> &Arc<SensorTable> {
        &self.table
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
