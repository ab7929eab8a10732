//! In-process simulated DAQ device
//!
//! The device advances in logical ticks. Every tick, each running timed
//! handle clocks exactly one frame: output handles first emit a frame from
//! their device buffer, then input handles sample their channel signals into
//! a FIFO. Handles that borrow a clock are only clocked while their source is.
//!
//! Counter handles with a pulse configured are clocked like outputs and emit
//! their terminal level each tick.
//!
//! Notifications collected during a tick are delivered after the device lock
//! is released, so callbacks may call back into the driver.
//!
//! [`SimClock`] paces [`SimulatedDriver::advance`] in real time; tests usually
//! call `advance` directly for deterministic runs.

use crate::driver::{
    ChannelSpec, ClockRoute, DriverAdapter, DriverError, DriverHandle, Notification, NotifyFlow,
    NotifyKind, PulseSpec, ThresholdCallback, TriggerEdge,
};
use crate::stream::buffer::SampleBuffer;
use crate::stream::channels::{ChannelKind, Direction};
use crate::stream::clock::AcquisitionMode;
use crate::stream::frame::SampleFrame;
use crate::stream::shutdown::ShutdownSignal;
use ringbuf::traits::{Consumer, Observer, Producer, RingBuffer};
use ringbuf::HeapRb;
use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Frames of emitted output kept per handle
pub const DEFAULT_HISTORY_FRAMES: usize = 4096;

/// Nominal rate used to evaluate signals on handles without a sample clock
const UNTIMED_RATE_HZ: f64 = 1000.0;

/// Signal on input channels that were never given one: 1 V at 10 Hz
static DEFAULT_SIGNAL: SimSignal = SimSignal::Sine {
    frequency_hz: 10.0,
    amplitude: 1.0,
};

/// Signal fed into a simulated input channel
#[derive(Debug, Clone, PartialEq)]
pub enum SimSignal {
    /// `amplitude * sin(2 pi f t)` at the handle's clock rate
    Sine { frequency_hz: f64, amplitude: f64 },
    /// `step * n` for the n-th clocked sample
    Ramp { step: f64 },
    Constant(f64),
    /// Last value emitted on the named output channel
    Loopback(String),
}

impl SimSignal {
    fn sample(&self, n: u64, rate_hz: f64, outputs: &HashMap<String, f64>) -> f64 {
        match self {
            Self::Sine {
                frequency_hz,
                amplitude,
            } => amplitude * (2.0 * PI * frequency_hz * n as f64 / rate_hz).sin(),
            Self::Ramp { step } => step * n as f64,
            Self::Constant(value) => *value,
            Self::Loopback(channel) => outputs.get(channel).copied().unwrap_or(0.0),
        }
    }
}

/// Driver call recorded in the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Opened(DriverHandle),
    /// `start` on a handle that began clocking immediately
    Started { handle: DriverHandle, tick: u64 },
    /// `start` on a handle that now waits for its trigger
    Armed(DriverHandle),
    /// A waiting handle saw its trigger edge
    Triggered { handle: DriverHandle, tick: u64 },
    Stopped(DriverHandle),
    Closed(DriverHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    WaitingForTrigger,
    Running,
    Done,
}

/// Pulse timing converted to device ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PulseTicks {
    delay: u64,
    high: u64,
    low: u64,
    pulses: u64,
}

impl PulseTicks {
    fn from_spec(spec: &PulseSpec, rate_hz: f64) -> Self {
        let ticks = |secs: f64| (secs * rate_hz).round() as u64;
        Self {
            delay: ticks(spec.initial_delay),
            high: ticks(spec.high_time).max(1),
            low: ticks(spec.low_time).max(1),
            pulses: spec.pulses,
        }
    }

    fn total(&self) -> u64 {
        self.delay + self.pulses * (self.high + self.low)
    }

    /// Terminal level on the n-th tick after start
    fn level_at(&self, n: u64) -> bool {
        let Some(into) = n.checked_sub(self.delay) else {
            return false;
        };
        let period = self.high + self.low;
        into / period < self.pulses && into % period < self.high
    }
}

struct CallbackSlot {
    enabled: bool,
    callback: Option<ThresholdCallback>,
}

/// Device-side state of one opened channel set
struct SimHandle {
    spec: ChannelSpec,
    rate_hz: f64,
    samples_per_channel: u64,
    mode: AcquisitionMode,
    route: ClockRoute,
    trigger: TriggerEdge,
    /// Clocked by the device rather than on demand
    timed: bool,
    buffer_frames: usize,
    regeneration: bool,
    phase: Phase,
    start_tick: Option<u64>,
    clocked: u64,
    since_notify: usize,
    /// Notification interval; zero when no callback is registered
    notify_every: usize,
    input_fifo: Option<HeapRb<SampleFrame>>,
    output_buffer: Option<SampleBuffer>,
    history: HeapRb<SampleFrame>,
    emitted: u64,
    pulse: Option<PulseTicks>,
    /// Fault raised on the next clocked tick
    injected_fault: Option<DriverError>,
    slot: Arc<Mutex<CallbackSlot>>,
}

impl SimHandle {
    fn reset_device_buffer(&mut self) {
        let frames = self.buffer_frames.max(1);
        match self.spec.direction {
            Direction::Input => {
                self.input_fifo = Some(HeapRb::new(frames));
                self.output_buffer = None;
            }
            Direction::Output => {
                self.output_buffer = SampleBuffer::new(frames, self.regeneration).ok();
                self.input_fifo = None;
            }
        }
    }
}

struct SimState {
    tick: u64,
    next_handle: u64,
    handles: HashMap<DriverHandle, SimHandle>,
    /// Channel name -> owning handle
    reservations: HashMap<String, DriverHandle>,
    signals: HashMap<String, SimSignal>,
    /// Last value emitted per output channel
    outputs: HashMap<String, f64>,
    journal: Vec<SimEvent>,
    fail_next_start: Option<DriverError>,
    history_frames: usize,
}

type PendingNotification = (DriverHandle, Arc<Mutex<CallbackSlot>>, Notification);

/// Simulated device implementing [`DriverAdapter`]
pub struct SimulatedDriver {
    device: String,
    state: Mutex<SimState>,
    /// Serializes `advance` so notifications for a handle never overlap
    advance_lock: Mutex<()>,
}

impl SimulatedDriver {
    pub fn new(device: &str) -> Self {
        Self::with_history(device, DEFAULT_HISTORY_FRAMES)
    }

    /// Keep `history_frames` emitted frames per output handle
    pub fn with_history(device: &str, history_frames: usize) -> Self {
        Self {
            device: device.to_string(),
            state: Mutex::new(SimState {
                tick: 0,
                next_handle: 1,
                handles: HashMap::new(),
                reservations: HashMap::new(),
                signals: HashMap::new(),
                outputs: HashMap::new(),
                journal: Vec::new(),
                fail_next_start: None,
                history_frames: history_frames.max(1),
            }),
            advance_lock: Mutex::new(()),
        }
    }

    /// Device name, for diagnostics
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Feed `signal` into the input channel `channel`
    pub fn set_channel_signal(&self, channel: &str, signal: SimSignal) {
        self.lock().signals.insert(channel.to_string(), signal);
    }

    /// Make the next `start` call fail with `err`
    pub fn fail_next_start(&self, err: DriverError) {
        self.lock().fail_next_start = Some(err);
    }

    /// Fault `handle` with `err` on its next clocked tick
    pub fn inject_fault(&self, handle: DriverHandle, err: DriverError) {
        if let Some(h) = self.lock().handles.get_mut(&handle) {
            h.injected_fault = Some(err);
        }
    }

    /// Reserve a channel as if another process held it
    pub fn reserve_channel(&self, channel: &str) {
        self.lock()
            .reservations
            .insert(channel.to_string(), DriverHandle(0));
    }

    /// Current device tick
    pub fn tick(&self) -> u64 {
        self.lock().tick
    }

    /// Recorded driver calls, oldest first
    pub fn journal(&self) -> Vec<SimEvent> {
        self.lock().journal.clone()
    }

    /// Most recent frames emitted by an output handle, oldest first
    pub fn emitted(&self, handle: DriverHandle) -> Vec<SampleFrame> {
        self.lock()
            .handles
            .get(&handle)
            .map(|h| h.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Frames emitted by an output handle since it started
    pub fn emitted_count(&self, handle: DriverHandle) -> u64 {
        self.lock()
            .handles
            .get(&handle)
            .map(|h| h.emitted)
            .unwrap_or(0)
    }

    /// Frames clocked by a handle since it started
    pub fn clocked(&self, handle: DriverHandle) -> u64 {
        self.lock()
            .handles
            .get(&handle)
            .map(|h| h.clocked)
            .unwrap_or(0)
    }

    /// Whether a handle is clocking (as opposed to idle or waiting)
    pub fn is_running(&self, handle: DriverHandle) -> bool {
        self.lock()
            .handles
            .get(&handle)
            .map(|h| h.phase == Phase::Running)
            .unwrap_or(false)
    }

    /// Number of open handles
    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }

    /// Rate a handle was configured with
    pub fn rate_of(&self, handle: DriverHandle) -> Option<f64> {
        self.lock().handles.get(&handle).map(|h| h.rate_hz)
    }

    /// Clock `ticks` device ticks, delivering notifications between ticks
    pub fn advance(&self, ticks: u64) {
        let _serial = self.advance_lock.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..ticks {
            let pending = self.step();
            self.deliver(pending);
        }
    }

    /// Run one tick under the state lock
    fn step(&self) -> Vec<PendingNotification> {
        let mut state = self.lock();
        let tick = state.tick;
        let clocked = clocked_handles(&state.handles);
        let mut pending = Vec::new();

        // Outputs first so loopback inputs see this tick's values
        let mut order: Vec<DriverHandle> = clocked.iter().copied().collect();
        order.sort_by_key(|h| {
            let is_input = state.handles[h].spec.direction == Direction::Input;
            (is_input, *h)
        });

        for id in order {
            let SimState {
                handles,
                signals,
                outputs,
                ..
            } = &mut *state;
            let Some(handle) = handles.get_mut(&id) else {
                continue;
            };

            let fault = match (handle.pulse, handle.spec.direction) {
                _ if handle.injected_fault.is_some() => handle.injected_fault.take(),
                (Some(pulse), _) => {
                    let level = pulse.level_at(handle.clocked);
                    record_output(handle, outputs, SampleFrame::Digital(vec![level]));
                    None
                }
                (None, Direction::Output) => emit_output(handle, outputs),
                (None, Direction::Input) => sample_input(handle, signals, outputs),
            };
            if let Some(err) = fault {
                handle.phase = Phase::Done;
                tracing::warn!(device = %self.device, handle = %id, "Simulated fault: {}", err);
                pending.push((
                    id,
                    Arc::clone(&handle.slot),
                    Notification {
                        transferred: handle.since_notify,
                        total: handle.clocked,
                        kind: NotifyKind::Fault(err),
                    },
                ));
                continue;
            }

            handle.clocked += 1;
            handle.since_notify += 1;

            let every = handle.notify_every;
            if every > 0 && handle.since_notify >= every {
                pending.push((
                    id,
                    Arc::clone(&handle.slot),
                    Notification {
                        transferred: handle.since_notify,
                        total: handle.clocked,
                        kind: NotifyKind::Threshold,
                    },
                ));
                handle.since_notify = 0;
            }

            if handle.mode == AcquisitionMode::Finite
                && handle.clocked >= handle.samples_per_channel
            {
                handle.phase = Phase::Done;
                pending.push((
                    id,
                    Arc::clone(&handle.slot),
                    Notification {
                        transferred: handle.since_notify,
                        total: handle.clocked,
                        kind: NotifyKind::Complete,
                    },
                ));
                handle.since_notify = 0;
            }
        }

        state.tick = tick + 1;
        pending
    }

    /// Fire collected notifications outside the state lock
    fn deliver(&self, pending: Vec<PendingNotification>) {
        for (handle, slot, note) in pending {
            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            if !slot.enabled {
                continue;
            }
            let Some(callback) = slot.callback.as_mut() else {
                continue;
            };
            if callback(&note) == NotifyFlow::Halt {
                slot.enabled = false;
                drop(slot);
                let mut state = self.lock();
                if let Some(h) = state.handles.get_mut(&handle) {
                    if h.phase == Phase::Running {
                        h.phase = Phase::Done;
                    }
                }
                tracing::debug!(device = %self.device, %handle, "Callback halted handle");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handles clocked on this tick
fn clocked_handles(handles: &HashMap<DriverHandle, SimHandle>) -> HashSet<DriverHandle> {
    fn is_clocked(handles: &HashMap<DriverHandle, SimHandle>, id: DriverHandle, hops: usize) -> bool {
        let Some(h) = handles.get(&id) else {
            return false;
        };
        if !h.timed || h.phase != Phase::Running || hops > handles.len() {
            return false;
        }
        match h.route {
            ClockRoute::Internal => true,
            ClockRoute::Borrowed(source) => is_clocked(handles, source, hops + 1),
        }
    }

    handles
        .keys()
        .copied()
        .filter(|id| is_clocked(handles, *id, 0))
        .collect()
}

/// Emit one frame from an output handle's device buffer
fn emit_output(handle: &mut SimHandle, outputs: &mut HashMap<String, f64>) -> Option<DriverError> {
    let buffer = handle.output_buffer.as_mut()?;
    let frame = match buffer.read(1) {
        Ok(mut frames) => frames.pop()?,
        Err(_) => {
            return Some(DriverError::Underflow {
                requested: 1,
                available: buffer.peek_fill_level(),
            })
        }
    };
    record_output(handle, outputs, frame);
    None
}

fn record_output(handle: &mut SimHandle, outputs: &mut HashMap<String, f64>, frame: SampleFrame) {
    for (idx, name) in handle.spec.channels.names().iter().enumerate() {
        if let Some(value) = frame.value(idx) {
            outputs.insert(name.clone(), value);
        }
    }
    handle.history.push_overwrite(frame);
    handle.emitted += 1;
}

/// Sample one frame into an input handle's FIFO
fn sample_input(
    handle: &mut SimHandle,
    signals: &HashMap<String, SimSignal>,
    outputs: &HashMap<String, f64>,
) -> Option<DriverError> {
    let frame = synthesize(handle, handle.clocked, signals, outputs);
    let fifo = handle.input_fifo.as_mut()?;
    if fifo.try_push(frame).is_err() {
        return Some(DriverError::Overrun {
            pending: 1,
            capacity: handle.buffer_frames,
        });
    }
    None
}

fn synthesize(
    handle: &SimHandle,
    n: u64,
    signals: &HashMap<String, SimSignal>,
    outputs: &HashMap<String, f64>,
) -> SampleFrame {
    let rate_hz = if handle.timed && handle.rate_hz > 0.0 {
        handle.rate_hz
    } else {
        UNTIMED_RATE_HZ
    };
    let values: Vec<f64> = handle
        .spec
        .channels
        .names()
        .iter()
        .map(|name| {
            signals
                .get(name)
                .unwrap_or(&DEFAULT_SIGNAL)
                .sample(n, rate_hz, outputs)
        })
        .collect();
    match handle.spec.channels.kind() {
        ChannelKind::Analog => SampleFrame::Analog(values),
        ChannelKind::Digital | ChannelKind::Counter => {
            SampleFrame::Digital(values.iter().map(|v| *v != 0.0).collect())
        }
    }
}

impl DriverAdapter for SimulatedDriver {
    fn open(&self, spec: &ChannelSpec) -> Result<DriverHandle, DriverError> {
        let mut state = self.lock();
        if let Some(name) = spec
            .channels
            .names()
            .iter()
            .find(|n| state.reservations.contains_key(n.as_str()))
        {
            return Err(DriverError::Busy(format!(
                "{} is reserved by another task",
                name
            )));
        }

        let id = DriverHandle(state.next_handle);
        state.next_handle += 1;
        for name in spec.channels.names() {
            state.reservations.insert(name.clone(), id);
        }
        let history = HeapRb::new(state.history_frames);
        state.handles.insert(
            id,
            SimHandle {
                spec: spec.clone(),
                rate_hz: 0.0,
                samples_per_channel: 0,
                mode: AcquisitionMode::Continuous,
                route: ClockRoute::Internal,
                trigger: TriggerEdge::Immediate,
                timed: false,
                buffer_frames: 0,
                regeneration: false,
                phase: Phase::Idle,
                start_tick: None,
                clocked: 0,
                since_notify: 0,
                notify_every: 0,
                input_fifo: None,
                output_buffer: None,
                history,
                emitted: 0,
                pulse: None,
                injected_fault: None,
                slot: Arc::new(Mutex::new(CallbackSlot {
                    enabled: false,
                    callback: None,
                })),
            },
        );
        state.journal.push(SimEvent::Opened(id));
        tracing::debug!(device = %self.device, task = %spec.name, handle = %id, "Channels opened");
        Ok(id)
    }

    fn configure_clock(
        &self,
        handle: DriverHandle,
        rate_hz: f64,
        samples_per_channel: u64,
        mode: AcquisitionMode,
        route: ClockRoute,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        if let ClockRoute::Borrowed(source) = route {
            if source == handle || !state.handles.contains_key(&source) {
                return Err(DriverError::Hardware(format!(
                    "cannot route sample clock from {}",
                    source
                )));
            }
        }
        let h = handle_mut(&mut state, handle)?;
        // Pulse ticks depend on the rate; they must be set again
        h.pulse = None;
        h.rate_hz = rate_hz;
        h.samples_per_channel = samples_per_channel;
        h.mode = mode;
        h.route = route;
        h.timed = true;
        Ok(())
    }

    fn configure_buffer(&self, handle: DriverHandle, frames: usize) -> Result<(), DriverError> {
        if frames == 0 {
            return Err(DriverError::Unsupported("zero-length device buffer".into()));
        }
        let mut state = self.lock();
        let h = handle_mut(&mut state, handle)?;
        h.buffer_frames = frames;
        h.reset_device_buffer();
        Ok(())
    }

    fn start(&self, handle: DriverHandle) -> Result<(), DriverError> {
        let mut state = self.lock();
        if let Some(err) = state.fail_next_start.take() {
            return Err(err);
        }
        let tick = state.tick;
        let h = handle_mut(&mut state, handle)?;
        if matches!(h.phase, Phase::Running | Phase::WaitingForTrigger) {
            return Err(DriverError::Busy(format!("{} is already started", handle)));
        }
        if h.buffer_frames == 0 && h.timed && h.pulse.is_none() {
            h.buffer_frames = h.samples_per_channel.max(1) as usize;
            h.reset_device_buffer();
        }
        h.clocked = 0;
        h.since_notify = 0;
        h.emitted = 0;
        h.history.clear();

        let trigger = h.trigger;
        match trigger {
            TriggerEdge::Immediate => {
                h.phase = Phase::Running;
                h.start_tick = Some(tick);
                state.journal.push(SimEvent::Started { handle, tick });

                let mut released = Vec::new();
                for (id, other) in state.handles.iter_mut() {
                    if other.phase == Phase::WaitingForTrigger
                        && other.trigger == TriggerEdge::StartOf(handle)
                    {
                        other.phase = Phase::Running;
                        other.start_tick = Some(tick);
                        released.push(*id);
                    }
                }
                released.sort();
                for id in released {
                    state.journal.push(SimEvent::Triggered { handle: id, tick });
                }
            }
            TriggerEdge::StartOf(_) => {
                // An edge that already happened is missed
                h.phase = Phase::WaitingForTrigger;
                h.start_tick = None;
                state.journal.push(SimEvent::Armed(handle));
            }
        }
        Ok(())
    }

    fn stop(&self, handle: DriverHandle) -> Result<(), DriverError> {
        let slot = {
            let mut state = self.lock();
            let h = handle_mut(&mut state, handle)?;
            let was_active = matches!(h.phase, Phase::Running | Phase::WaitingForTrigger);
            if h.phase != Phase::Idle {
                h.phase = Phase::Done;
            }
            let slot = Arc::clone(&h.slot);
            if was_active {
                state.journal.push(SimEvent::Stopped(handle));
            }
            slot
        };
        // Waits for an in-flight callback on this handle
        slot.lock().unwrap_or_else(|e| e.into_inner()).enabled = false;
        Ok(())
    }

    fn close(&self, handle: DriverHandle) -> Result<(), DriverError> {
        self.stop(handle)?;
        let removed = {
            let mut state = self.lock();
            let removed = state.handles.remove(&handle);
            state.reservations.retain(|_, owner| *owner != handle);
            state.journal.push(SimEvent::Closed(handle));
            removed
        };
        // Dropping the callback outside the lock releases whatever it captured
        drop(removed);
        Ok(())
    }

    fn write(
        &self,
        handle: DriverHandle,
        frames: &[SampleFrame],
        _timeout: Duration,
    ) -> Result<usize, DriverError> {
        let mut state = self.lock();
        let SimState {
            handles, outputs, ..
        } = &mut *state;
        let h = handles
            .get_mut(&handle)
            .ok_or(DriverError::InvalidHandle(handle))?;
        if h.spec.direction != Direction::Output {
            return Err(DriverError::Unsupported(format!(
                "write on input {}",
                handle
            )));
        }

        // Software-timed output updates the lines immediately
        if !h.timed {
            for frame in frames {
                record_output(h, outputs, frame.clone());
            }
            return Ok(frames.len());
        }

        let buffer = h.output_buffer.as_mut().ok_or_else(|| {
            DriverError::Unsupported(format!("{} has no device buffer", handle))
        })?;
        let accepted = if buffer.is_regenerating() {
            frames.len()
        } else {
            frames.len().min(buffer.free_space())
        };
        buffer
            .write(&frames[..accepted])
            .map_err(|e| DriverError::Hardware(e.to_string()))?;
        Ok(accepted)
    }

    fn read(&self, handle: DriverHandle, count: usize) -> Result<Vec<SampleFrame>, DriverError> {
        let mut state = self.lock();
        let SimState {
            handles,
            signals,
            outputs,
            ..
        } = &mut *state;
        let (signals, outputs) = (&*signals, &*outputs);
        let h = handles
            .get_mut(&handle)
            .ok_or(DriverError::InvalidHandle(handle))?;
        if h.spec.direction != Direction::Input {
            return Err(DriverError::Unsupported(format!(
                "read on output {}",
                handle
            )));
        }

        // On-demand sampling for software-timed inputs
        if !h.timed {
            let frames = (0..count as u64)
                .map(|i| synthesize(h, h.clocked + i, signals, outputs))
                .collect();
            h.clocked += count as u64;
            return Ok(frames);
        }

        let fifo = h
            .input_fifo
            .as_mut()
            .ok_or_else(|| DriverError::Unsupported(format!("{} has no FIFO", handle)))?;
        let available = fifo.occupied_len();
        if count > available {
            return Err(DriverError::Underflow {
                requested: count,
                available,
            });
        }
        Ok((0..count).filter_map(|_| fifo.try_pop()).collect())
    }

    fn available(&self, handle: DriverHandle) -> Result<usize, DriverError> {
        let state = self.lock();
        let h = state
            .handles
            .get(&handle)
            .ok_or(DriverError::InvalidHandle(handle))?;
        Ok(h.input_fifo.as_ref().map(|f| f.occupied_len()).unwrap_or(0))
    }

    fn register_threshold_callback(
        &self,
        handle: DriverHandle,
        n: usize,
        callback: ThresholdCallback,
    ) -> Result<(), DriverError> {
        if n == 0 {
            return Err(DriverError::Unsupported("zero notification interval".into()));
        }
        let slot = {
            let mut state = self.lock();
            let h = handle_mut(&mut state, handle)?;
            h.notify_every = n;
            Arc::clone(&h.slot)
        };
        let previous = {
            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.enabled = true;
            slot.callback.replace(callback)
        };
        drop(previous);
        Ok(())
    }

    fn set_regeneration(&self, handle: DriverHandle, enabled: bool) -> Result<(), DriverError> {
        let mut state = self.lock();
        let h = handle_mut(&mut state, handle)?;
        if h.spec.direction != Direction::Output {
            return Err(DriverError::Unsupported(
                "regeneration on an input handle".into(),
            ));
        }
        h.regeneration = enabled;
        if h.buffer_frames > 0 {
            h.reset_device_buffer();
        }
        Ok(())
    }

    fn configure_trigger(
        &self,
        handle: DriverHandle,
        edge: TriggerEdge,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        if let TriggerEdge::StartOf(source) = edge {
            if source == handle || !state.handles.contains_key(&source) {
                return Err(DriverError::Hardware(format!(
                    "cannot trigger from {}",
                    source
                )));
            }
        }
        handle_mut(&mut state, handle)?.trigger = edge;
        Ok(())
    }

    fn start_timestamp(&self, handle: DriverHandle) -> Result<Option<u64>, DriverError> {
        let state = self.lock();
        let h = state
            .handles
            .get(&handle)
            .ok_or(DriverError::InvalidHandle(handle))?;
        Ok(h.start_tick)
    }

    fn configure_pulse(&self, handle: DriverHandle, spec: &PulseSpec) -> Result<(), DriverError> {
        let mut state = self.lock();
        let h = handle_mut(&mut state, handle)?;
        if h.spec.channels.kind() != ChannelKind::Counter || h.spec.channels.len() != 1 {
            return Err(DriverError::Unsupported(format!(
                "pulse generation needs a single counter channel, {} has {:?}",
                handle,
                h.spec.channels.names()
            )));
        }
        if !h.timed || h.rate_hz <= 0.0 {
            return Err(DriverError::Unsupported(format!(
                "{} has no timebase for pulse timing",
                handle
            )));
        }
        let ticks = PulseTicks::from_spec(spec, h.rate_hz);
        h.mode = AcquisitionMode::Finite;
        h.samples_per_channel = ticks.total();
        h.pulse = Some(ticks);
        tracing::debug!(
            device = %self.device,
            %handle,
            delay = ticks.delay,
            high = ticks.high,
            low = ticks.low,
            pulses = ticks.pulses,
            "Pulse timing set"
        );
        Ok(())
    }
}

fn handle_mut(state: &mut SimState, handle: DriverHandle) -> Result<&mut SimHandle, DriverError> {
    state
        .handles
        .get_mut(&handle)
        .ok_or(DriverError::InvalidHandle(handle))
}

/// Background thread advancing a [`SimulatedDriver`] in real time
pub struct SimClock {
    shutdown: ShutdownSignal,
    thread: Option<JoinHandle<()>>,
}

impl SimClock {
    /// Clock `driver` at `rate_hz` ticks per second, in steps of `period`
    pub fn start(driver: Arc<SimulatedDriver>, rate_hz: f64, period: Duration) -> Self {
        let shutdown = ShutdownSignal::new();
        let stop = shutdown.clone();
        let thread = thread::Builder::new()
            .name("sim-clock".into())
            .spawn(move || {
                let began = Instant::now();
                let mut issued = 0u64;
                while !stop.wait_timeout(period) {
                    let due = (began.elapsed().as_secs_f64() * rate_hz) as u64;
                    if due > issued {
                        driver.advance(due - issued);
                        issued = due;
                    }
                }
                tracing::debug!(ticks = issued, "Simulated clock stopped");
            })
            .ok();
        if thread.is_none() {
            tracing::error!("Failed to spawn simulated clock thread");
        }
        Self { shutdown, thread }
    }

    /// Stop ticking and join the thread
    pub fn stop(&mut self) {
        self.shutdown.trigger();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SimClock {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::channels::ChannelSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(name: &str, direction: Direction, channels: &[&str]) -> ChannelSpec {
        ChannelSpec {
            name: name.to_string(),
            direction,
            channels: ChannelSet::analog(channels),
        }
    }

    fn open_timed(
        driver: &SimulatedDriver,
        name: &str,
        direction: Direction,
        channels: &[&str],
        frames: usize,
    ) -> DriverHandle {
        let h = driver.open(&spec(name, direction, channels)).unwrap();
        driver
            .configure_clock(h, 1000.0, 0, AcquisitionMode::Continuous, ClockRoute::Internal)
            .unwrap();
        driver.configure_buffer(h, frames).unwrap();
        h
    }

    #[test]
    fn test_open_reserves_channels() {
        let driver = SimulatedDriver::new("Dev1");
        driver.open(&spec("a", Direction::Input, &["ai0"])).unwrap();
        let err = driver
            .open(&spec("b", Direction::Input, &["ai0", "ai1"]))
            .unwrap_err();
        assert!(matches!(err, DriverError::Busy(_)));
    }

    #[test]
    fn test_close_releases_channels() {
        let driver = SimulatedDriver::new("Dev1");
        let h = driver.open(&spec("a", Direction::Input, &["ai0"])).unwrap();
        driver.close(h).unwrap();
        assert!(driver.open(&spec("b", Direction::Input, &["ai0"])).is_ok());
        assert_eq!(driver.read(h, 1), Err(DriverError::InvalidHandle(h)));
    }

    #[test]
    fn test_input_fifo_fills_per_tick() {
        let driver = SimulatedDriver::new("Dev1");
        driver.set_channel_signal("ai0", SimSignal::Ramp { step: 1.0 });
        let h = open_timed(&driver, "ai", Direction::Input, &["ai0"], 16);
        driver.start(h).unwrap();
        driver.advance(5);

        assert_eq!(driver.available(h).unwrap(), 5);
        let frames = driver.read(h, 3).unwrap();
        let values: Vec<f64> = frames.iter().filter_map(|f| f.value(0)).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
        assert_eq!(driver.available(h).unwrap(), 2);
    }

    #[test]
    fn test_fifo_overrun_faults() {
        let driver = SimulatedDriver::new("Dev1");
        let h = open_timed(&driver, "ai", Direction::Input, &["ai0"], 4);
        let faults = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&faults);
        driver
            .register_threshold_callback(
                h,
                100,
                Box::new(move |note| {
                    if matches!(note.kind, NotifyKind::Fault(DriverError::Overrun { .. })) {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    NotifyFlow::Halt
                }),
            )
            .unwrap();
        driver.start(h).unwrap();
        driver.advance(10);

        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert!(!driver.is_running(h));
        assert_eq!(driver.clocked(h), 4);
    }

    #[test]
    fn test_regenerating_output_repeats() {
        let driver = SimulatedDriver::new("Dev1");
        let h = open_timed(&driver, "ao", Direction::Output, &["ao0"], 3);
        driver.set_regeneration(h, true).unwrap();
        let frames: Vec<SampleFrame> = (0..3).map(|i| SampleFrame::analog(&[i as f64])).collect();
        assert_eq!(driver.write(h, &frames, Duration::ZERO).unwrap(), 3);
        driver.start(h).unwrap();
        driver.advance(7);

        let emitted: Vec<f64> = driver
            .emitted(h)
            .iter()
            .filter_map(|f| f.value(0))
            .collect();
        assert_eq!(emitted, vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_output_underflow_faults() {
        let driver = SimulatedDriver::new("Dev1");
        let h = open_timed(&driver, "ao", Direction::Output, &["ao0"], 8);
        driver
            .write(h, &vec![SampleFrame::analog(&[1.0]); 2], Duration::ZERO)
            .unwrap();
        driver.start(h).unwrap();
        driver.advance(5);

        assert_eq!(driver.emitted_count(h), 2);
        assert!(!driver.is_running(h));
    }

    #[test]
    fn test_threshold_and_complete_notifications() {
        let driver = SimulatedDriver::new("Dev1");
        let h = driver.open(&spec("ai", Direction::Input, &["ai0"])).unwrap();
        driver
            .configure_clock(h, 1000.0, 10, AcquisitionMode::Finite, ClockRoute::Internal)
            .unwrap();
        driver.configure_buffer(h, 16).unwrap();
        let notes = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&notes);
        driver
            .register_threshold_callback(
                h,
                4,
                Box::new(move |note| {
                    log.lock().unwrap().push(note.clone());
                    NotifyFlow::Continue
                }),
            )
            .unwrap();
        driver.start(h).unwrap();
        driver.advance(20);

        let notes = notes.lock().unwrap();
        let kinds: Vec<(usize, bool)> = notes
            .iter()
            .map(|n| (n.transferred, n.kind == NotifyKind::Complete))
            .collect();
        assert_eq!(kinds, vec![(4, false), (4, false), (2, true)]);
        assert_eq!(driver.clocked(h), 10);
    }

    #[test]
    fn test_trigger_releases_follower_on_same_tick() {
        let driver = SimulatedDriver::new("Dev1");
        let leader = open_timed(&driver, "ai", Direction::Input, &["ai0"], 16);
        let follower = driver.open(&spec("ao", Direction::Output, &["ao0"])).unwrap();
        driver
            .configure_clock(
                follower,
                1000.0,
                0,
                AcquisitionMode::Continuous,
                ClockRoute::Borrowed(leader),
            )
            .unwrap();
        driver.configure_buffer(follower, 4).unwrap();
        driver.set_regeneration(follower, true).unwrap();
        driver
            .write(follower, &[SampleFrame::analog(&[0.5])], Duration::ZERO)
            .unwrap();
        driver
            .configure_trigger(follower, TriggerEdge::StartOf(leader))
            .unwrap();

        driver.advance(3);
        driver.start(follower).unwrap();
        assert_eq!(driver.start_timestamp(follower).unwrap(), None);
        driver.start(leader).unwrap();

        assert_eq!(driver.start_timestamp(leader).unwrap(), Some(3));
        assert_eq!(driver.start_timestamp(follower).unwrap(), Some(3));
        driver.advance(6);
        assert_eq!(driver.clocked(leader), 6);
        assert_eq!(driver.clocked(follower), 6);
    }

    #[test]
    fn test_missed_trigger_keeps_follower_waiting() {
        let driver = SimulatedDriver::new("Dev1");
        let leader = open_timed(&driver, "ai", Direction::Input, &["ai0"], 16);
        let follower = open_timed(&driver, "ai2", Direction::Input, &["ai1"], 16);
        driver
            .configure_trigger(follower, TriggerEdge::StartOf(leader))
            .unwrap();

        driver.start(leader).unwrap();
        driver.start(follower).unwrap();
        driver.advance(4);
        assert_eq!(driver.clocked(follower), 0);
        assert_eq!(driver.start_timestamp(follower).unwrap(), None);
    }

    #[test]
    fn test_borrowed_clock_freezes_with_source() {
        let driver = SimulatedDriver::new("Dev1");
        let source = open_timed(&driver, "ao", Direction::Output, &["ao0"], 4);
        driver.set_regeneration(source, true).unwrap();
        driver
            .write(source, &[SampleFrame::analog(&[1.0])], Duration::ZERO)
            .unwrap();
        let borrower = driver.open(&spec("ai", Direction::Input, &["ai0"])).unwrap();
        driver
            .configure_clock(
                borrower,
                1.0,
                0,
                AcquisitionMode::Continuous,
                ClockRoute::Borrowed(source),
            )
            .unwrap();
        driver.configure_buffer(borrower, 16).unwrap();

        driver.start(borrower).unwrap();
        driver.advance(3);
        assert_eq!(driver.clocked(borrower), 0);

        driver.start(source).unwrap();
        driver.advance(3);
        assert_eq!(driver.clocked(borrower), 3);
    }

    #[test]
    fn test_loopback_sees_same_tick_output() {
        let driver = SimulatedDriver::new("Dev1");
        driver.set_channel_signal("ai0", SimSignal::Loopback("ao0".into()));
        let ao = open_timed(&driver, "ao", Direction::Output, &["ao0"], 4);
        driver
            .write(
                ao,
                &[SampleFrame::analog(&[1.0]), SampleFrame::analog(&[2.0])],
                Duration::ZERO,
            )
            .unwrap();
        let ai = open_timed(&driver, "ai", Direction::Input, &["ai0"], 4);
        driver.start(ao).unwrap();
        driver.start(ai).unwrap();
        driver.advance(2);

        let values: Vec<f64> = driver
            .read(ai, 2)
            .unwrap()
            .iter()
            .filter_map(|f| f.value(0))
            .collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_untimed_read_samples_on_demand() {
        let driver = SimulatedDriver::new("Dev1");
        driver.set_channel_signal("ai0", SimSignal::Constant(2.5));
        let h = driver.open(&spec("ai", Direction::Input, &["ai0"])).unwrap();
        let frames = driver.read(h, 2).unwrap();
        assert_eq!(frames, vec![SampleFrame::analog(&[2.5]); 2]);
    }

    #[test]
    fn test_counter_pulse_levels_per_tick() {
        let driver = SimulatedDriver::new("Dev1");
        let h = driver
            .open(&ChannelSpec {
                name: "co".into(),
                direction: Direction::Output,
                channels: ChannelSet::counter(&["ctr1"]),
            })
            .unwrap();
        driver
            .configure_clock(h, 1000.0, 0, AcquisitionMode::Finite, ClockRoute::Internal)
            .unwrap();
        driver
            .configure_pulse(h, &PulseSpec::single(0.003, 0.002, 0.004))
            .unwrap();
        driver.start(h).unwrap();
        driver.advance(20);

        let levels: Vec<bool> = driver
            .emitted(h)
            .iter()
            .filter_map(|f| f.value(0))
            .map(|v| v != 0.0)
            .collect();
        let expected = [false, false, false, false, true, true, true, false, false];
        assert_eq!(levels, expected);
        assert!(!driver.is_running(h), "Pulse ends after its last low phase");
    }

    #[test]
    fn test_pulse_needs_counter_and_timebase() {
        let driver = SimulatedDriver::new("Dev1");
        let ao = open_timed(&driver, "ao", Direction::Output, &["ao0"], 4);
        let spec = PulseSpec::single(0.001, 0.001, 0.0);
        assert!(matches!(
            driver.configure_pulse(ao, &spec),
            Err(DriverError::Unsupported(_))
        ));

        let co = driver
            .open(&ChannelSpec {
                name: "co".into(),
                direction: Direction::Output,
                channels: ChannelSet::counter(&["ctr0"]),
            })
            .unwrap();
        assert!(matches!(
            driver.configure_pulse(co, &spec),
            Err(DriverError::Unsupported(_))
        ));
    }

    #[test]
    fn test_pulse_train_repeats() {
        let ticks = PulseTicks::from_spec(
            &PulseSpec {
                high_time: 0.002,
                low_time: 0.001,
                initial_delay: 0.0,
                pulses: 2,
            },
            1000.0,
        );
        assert_eq!(ticks.total(), 6);
        let levels: Vec<bool> = (0..8).map(|n| ticks.level_at(n)).collect();
        assert_eq!(levels, [true, true, false, true, true, false, false, false]);
    }

    #[test]
    fn test_fail_next_start() {
        let driver = SimulatedDriver::new("Dev1");
        let h = open_timed(&driver, "ai", Direction::Input, &["ai0"], 4);
        driver.fail_next_start(DriverError::Busy("timing engine".into()));
        assert!(matches!(driver.start(h), Err(DriverError::Busy(_))));
        assert!(driver.start(h).is_ok());
    }

    #[test]
    fn test_injected_fault_stops_handle() {
        let driver = SimulatedDriver::new("Dev1");
        let h = open_timed(&driver, "ai", Direction::Input, &["ai0"], 16);
        let faults = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&faults);
        driver
            .register_threshold_callback(
                h,
                100,
                Box::new(move |note| {
                    if matches!(note.kind, NotifyKind::Fault(DriverError::Busy(_))) {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    NotifyFlow::Halt
                }),
            )
            .unwrap();
        driver.start(h).unwrap();
        driver.advance(3);
        driver.inject_fault(h, DriverError::Busy("timing engine".into()));
        driver.advance(3);

        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert_eq!(driver.clocked(h), 3, "Faulted before the fourth frame");
        assert_eq!(driver.available(h).unwrap(), 3, "Acquired frames stay readable");
    }
}
