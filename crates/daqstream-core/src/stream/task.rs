//! Stream task: one direction of buffered, clocked data movement
//!
//! Lifecycle:
//!
//! ```text
//! Created -> Configured -> (Armed) -> Running -> Stopped -> Closed
//!                ^                                  |
//!                +----------- configure ------------+
//! ```
//!
//! Notifications from the adapter run on the adapter's own context. The
//! handler reaches the task only through an `Arc<TaskShared>` captured when
//! the callback is registered, so it stays valid for as long as the adapter
//! can call it.

use crate::driver::{
    ChannelSpec, ClockRoute, DriverAdapter, DriverHandle, Notification, NotifyFlow, NotifyKind,
    TriggerEdge,
};
use crate::stream::buffer::SampleBuffer;
use crate::stream::callback::{FrameConsumer, FrameSource};
use crate::stream::channels::{ChannelKind, ChannelSet, Direction};
use crate::stream::clock::{ClockEntry, ClockRegistry, ClockSource, StreamClockConfig, TaskId};
use crate::stream::error::StreamError;
use crate::stream::frame::SampleFrame;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Timeout passed to the adapter for output writes
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a [`StreamTask`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Created,
    Configured,
    /// Hardware is waiting for a start trigger
    Armed,
    Running,
    Stopped,
    Closed,
}

impl TaskState {
    /// Whether the hardware may be moving data
    pub fn is_active(self) -> bool {
        matches!(self, Self::Armed | Self::Running)
    }
}

/// Counters for a task since its last start
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    /// Notifications handled
    pub notifications: u64,
    /// Frames the adapter reports as clocked
    pub frames_transferred: u64,
    /// Input frames handed to the consumer
    pub frames_delivered: u64,
    /// Output frames queued to the adapter
    pub frames_written: u64,
    /// Frames currently held in the task's buffer
    pub fill_level: usize,
    /// Logical device tick of the first sample
    pub start_tick: Option<u64>,
    /// Wall-clock time of the start call
    pub started_at: Option<DateTime<Utc>>,
}

/// State reachable from the notification handler
struct TaskInner {
    state: TaskState,
    buffer: Option<SampleBuffer>,
    source: Option<Box<dyn FrameSource>>,
    consumer: Option<Box<dyn FrameConsumer>>,
    last_error: Option<StreamError>,
    stats: TaskStats,
}

struct TaskShared {
    inner: Mutex<TaskInner>,
    state_changed: Condvar,
    /// Set by `stop` before the adapter is stopped; late notifications halt
    halted: AtomicBool,
}

impl TaskShared {
    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything the notification handler needs besides the shared state
struct HandlerContext {
    name: String,
    direction: Direction,
    handle: DriverHandle,
    driver: Arc<dyn DriverAdapter>,
    width: usize,
    kind: ChannelKind,
    regeneration: bool,
    /// Samples per channel for finite streams
    finite_target: Option<u64>,
    write_timeout: Duration,
}

/// A configured channel set plus its clock, buffer and callbacks
///
/// Created through [`StreamContext::create_task`](crate::stream::context::StreamContext::create_task).
/// Dropping a task closes it.
pub struct StreamTask {
    id: TaskId,
    name: String,
    direction: Direction,
    driver: Arc<dyn DriverAdapter>,
    registry: ClockRegistry,
    handle: Option<DriverHandle>,
    channels: Option<ChannelSet>,
    clock: Option<StreamClockConfig>,
    regeneration: bool,
    /// Threshold set through `set_callback_threshold`
    threshold: Option<usize>,
    write_timeout: Duration,
    /// Clock, buffer and callback have been pushed to the adapter
    prepared: bool,
    shared: Arc<TaskShared>,
}

impl StreamTask {
    pub(crate) fn new(
        id: TaskId,
        name: &str,
        direction: Direction,
        driver: Arc<dyn DriverAdapter>,
        registry: ClockRegistry,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            direction,
            driver,
            registry,
            handle: None,
            channels: None,
            clock: None,
            regeneration: false,
            threshold: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            prepared: false,
            shared: Arc::new(TaskShared {
                inner: Mutex::new(TaskInner {
                    state: TaskState::Created,
                    buffer: None,
                    source: None,
                    consumer: None,
                    last_error: None,
                    stats: TaskStats::default(),
                }),
                state_changed: Condvar::new(),
                halted: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> TaskState {
        self.shared.lock().state
    }

    /// Adapter handle, once configured
    pub fn handle(&self) -> Option<DriverHandle> {
        self.handle
    }

    pub fn channels(&self) -> Option<&ChannelSet> {
        self.channels.as_ref()
    }

    pub fn clock(&self) -> Option<&StreamClockConfig> {
        self.clock.as_ref()
    }

    /// Threshold the callback is (or will be) registered with
    pub fn callback_threshold(&self) -> Option<usize> {
        self.threshold.or_else(|| {
            self.shared
                .lock()
                .buffer
                .as_ref()
                .map(|b| (b.capacity() / 2).max(1))
        })
    }

    /// Runtime error that stopped the task, if any
    pub fn last_error(&self) -> Option<StreamError> {
        self.shared.lock().last_error.clone()
    }

    /// Snapshot of the task's counters
    pub fn stats(&self) -> TaskStats {
        let inner = self.shared.lock();
        let mut stats = inner.stats.clone();
        stats.fill_level = inner
            .buffer
            .as_ref()
            .map(|b| b.peek_fill_level())
            .unwrap_or(0);
        stats
    }

    /// Bind channels, timing and buffering
    ///
    /// Allowed from `Created`, `Configured` and `Stopped`. Reconfiguring
    /// discards buffered frames and resets the counters. The adapter handle is
    /// opened here and kept until [`close`](Self::close). A failed reconfigure
    /// keeps the previous channels, clock and handle.
    ///
    /// # Errors
    /// `InvalidChannelSet`, `InvalidClockConfig`, `InvalidClockTopology`,
    /// `InvalidBufferCapacity` or `InvalidThreshold` for bad arguments;
    /// `DeviceBusy` if the adapter cannot reserve the channels.
    ///
    /// # Panics
    /// Panics if the task was closed.
    pub fn configure(
        &mut self,
        channels: ChannelSet,
        clock: StreamClockConfig,
        buffer_capacity: usize,
        regeneration: bool,
    ) -> Result<(), StreamError> {
        self.ensure_open();
        let state = self.state();
        if !matches!(
            state,
            TaskState::Created | TaskState::Configured | TaskState::Stopped
        ) {
            return Err(StreamError::InvalidState {
                op: "configure",
                state,
            });
        }

        channels.validate()?;
        clock.validate()?;
        if regeneration && self.direction == Direction::Input {
            return Err(StreamError::InvalidConfig(
                "regeneration only applies to output tasks".to_string(),
            ));
        }
        let buffer = SampleBuffer::new(buffer_capacity, regeneration)?;
        if let Some(threshold) = self.threshold {
            if threshold > buffer_capacity {
                return Err(StreamError::InvalidThreshold {
                    threshold,
                    capacity: buffer_capacity,
                });
            }
        }
        self.registry
            .validate_source(self.id, clock.clock_source)
            .map_err(StreamError::InvalidClockTopology)?;

        let handle = self.acquire_handle(&channels)?;

        self.registry.register(
            self.id,
            ClockEntry {
                name: self.name.clone(),
                sample_rate_hz: clock.sample_rate_hz,
                source: clock.clock_source,
                handle: Some(handle),
            },
        );

        tracing::info!(
            task = %self.name,
            channels = channels.len(),
            rate = clock.sample_rate_hz,
            mode = ?clock.mode,
            buffer = buffer_capacity,
            regeneration,
            "Task configured"
        );

        self.channels = Some(channels);
        self.clock = Some(clock);
        self.regeneration = regeneration;
        self.prepared = false;

        let mut inner = self.shared.lock();
        inner.buffer = Some(buffer);
        inner.last_error = None;
        inner.stats = TaskStats::default();
        inner.state = TaskState::Configured;
        Ok(())
    }

    /// Open `channels` on the adapter, giving up the current handle only once
    /// the new one is held
    ///
    /// Channel sets that share a channel cannot be open at once, so the old
    /// handle is closed first and reopened if the new open fails. If even
    /// that fails the task falls back to `Created`.
    fn acquire_handle(&mut self, channels: &ChannelSet) -> Result<DriverHandle, StreamError> {
        let (old, old_channels) = match (self.handle, self.channels.clone()) {
            (Some(handle), Some(current)) if current == *channels => return Ok(handle),
            (Some(handle), Some(current)) => (handle, current),
            (old, _) => {
                let handle = self.open_channels(channels)?;
                if let Some(old) = old {
                    self.release_handle(old);
                }
                self.handle = Some(handle);
                return Ok(handle);
            }
        };

        let overlaps = old_channels
            .names()
            .iter()
            .any(|name| channels.index_of(name).is_some());
        if !overlaps {
            let handle = self.open_channels(channels)?;
            self.release_handle(old);
            self.handle = Some(handle);
            return Ok(handle);
        }

        self.release_handle(old);
        self.handle = None;
        self.prepared = false;
        match self.open_channels(channels) {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(handle)
            }
            Err(e) => {
                self.reopen(&old_channels);
                Err(e)
            }
        }
    }

    /// Put back the channel set a failed reconfigure gave up
    fn reopen(&mut self, channels: &ChannelSet) {
        match self.open_channels(channels) {
            Ok(handle) => {
                self.handle = Some(handle);
                if let Some(clock) = self.clock {
                    self.registry.register(
                        self.id,
                        ClockEntry {
                            name: self.name.clone(),
                            sample_rate_hz: clock.sample_rate_hz,
                            source: clock.clock_source,
                            handle: Some(handle),
                        },
                    );
                }
                tracing::debug!(task = %self.name, %handle, "Previous channels reopened");
            }
            Err(e) => {
                tracing::warn!(
                    task = %self.name,
                    "Could not reopen previous channels, task is unconfigured: {}",
                    e
                );
                self.channels = None;
                self.clock = None;
                self.registry.remove(self.id);
                let mut inner = self.shared.lock();
                inner.buffer = None;
                inner.state = TaskState::Created;
                drop(inner);
                self.shared.state_changed.notify_all();
            }
        }
    }

    fn open_channels(&self, channels: &ChannelSet) -> Result<DriverHandle, StreamError> {
        self.driver
            .open(&ChannelSpec {
                name: self.name.clone(),
                direction: self.direction,
                channels: channels.clone(),
            })
            .map_err(StreamError::from_start)
    }

    fn release_handle(&self, handle: DriverHandle) {
        if let Err(e) = self.driver.close(handle) {
            tracing::warn!(task = %self.name, "Failed to release {}: {}", handle, e);
        }
    }

    /// Change where the sample clock comes from without reconfiguring
    pub fn set_clock_source(&mut self, source: ClockSource) -> Result<(), StreamError> {
        self.ensure_open();
        let state = self.state();
        if state != TaskState::Configured {
            return Err(StreamError::InvalidState {
                op: "set clock source",
                state,
            });
        }
        self.registry
            .validate_source(self.id, source)
            .map_err(StreamError::InvalidClockTopology)?;
        if let Some(clock) = self.clock.as_mut() {
            clock.clock_source = source;
        }
        self.registry.set_source(self.id, source);
        self.prepared = false;
        Ok(())
    }

    /// Notify every `n` transferred frames instead of every half buffer
    ///
    /// # Errors
    /// `InvalidThreshold` if `n` is zero or larger than the configured buffer.
    pub fn set_callback_threshold(&mut self, n: usize) -> Result<(), StreamError> {
        self.ensure_open();
        let state = self.state();
        if !matches!(
            state,
            TaskState::Created | TaskState::Configured | TaskState::Stopped
        ) {
            return Err(StreamError::InvalidState {
                op: "set callback threshold",
                state,
            });
        }
        let capacity = self
            .shared
            .lock()
            .buffer
            .as_ref()
            .map(|b| b.capacity())
            .unwrap_or(usize::MAX);
        if n == 0 || n > capacity {
            return Err(StreamError::InvalidThreshold {
                threshold: n,
                capacity,
            });
        }
        self.threshold = Some(n);
        self.prepared = false;
        Ok(())
    }

    /// Use `source` for output frames
    pub fn set_source<S: FrameSource + 'static>(&mut self, source: S) -> Result<(), StreamError> {
        self.ensure_open();
        self.ensure_direction(Direction::Output, "set a source on")?;
        self.ensure_idle("set source")?;
        self.shared.lock().source = Some(Box::new(source));
        self.prepared = false;
        Ok(())
    }

    /// Hand acquired frames to `consumer`
    pub fn set_consumer<C: FrameConsumer + 'static>(
        &mut self,
        consumer: C,
    ) -> Result<(), StreamError> {
        self.ensure_open();
        self.ensure_direction(Direction::Input, "set a consumer on")?;
        self.ensure_idle("set consumer")?;
        self.shared.lock().consumer = Some(Box::new(consumer));
        Ok(())
    }

    /// Timeout for output writes issued to the adapter
    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
        self.prepared = false;
    }

    /// Begin data movement
    ///
    /// From `Configured` this pushes clock and buffer settings to the adapter,
    /// pre-fills output tasks, registers the notification callback and starts
    /// the hardware. From `Armed` the hardware is already waiting on its
    /// trigger and the task only records that it is running.
    ///
    /// # Errors
    /// `InvalidState` from any other state, `ClockConflict` if a borrowed
    /// clock cannot be resolved, `DeviceBusy` and `Driver` for adapter
    /// refusals, `SourceExhausted` if the initial fill cannot be produced,
    /// in which case the task is left `Stopped` with the error recorded.
    ///
    /// # Panics
    /// Panics if the task was closed.
    pub fn start(&mut self) -> Result<(), StreamError> {
        self.ensure_open();
        let handle = self.require_handle()?;
        match self.state() {
            TaskState::Configured => {
                self.prepare()?;
                self.driver.start(handle).map_err(StreamError::from_start)?;
            }
            TaskState::Armed => {}
            state => return Err(StreamError::InvalidState { op: "start", state }),
        }

        let start_tick = self.driver.start_timestamp(handle).ok().flatten();
        let mut inner = self.shared.lock();
        // A finite stream can complete before we get the lock back
        if inner.state.is_active() || inner.state == TaskState::Configured {
            inner.state = TaskState::Running;
        }
        inner.stats.started_at = Some(Utc::now());
        inner.stats.start_tick = start_tick;
        self.shared.state_changed.notify_all();
        drop(inner);

        tracing::info!(task = %self.name, ?start_tick, "Task started");
        Ok(())
    }

    /// Configure the trigger on the clock source's start edge and wait for it
    ///
    /// The task must borrow its clock from the leader. After `arm` returns the
    /// hardware is waiting; the leader's start releases it.
    pub(crate) fn arm(&mut self) -> Result<(), StreamError> {
        self.ensure_open();
        let state = self.state();
        if state != TaskState::Configured {
            return Err(StreamError::InvalidState { op: "arm", state });
        }
        let leader = match self.clock.map(|c| c.clock_source) {
            Some(ClockSource::External(peer)) => peer,
            _ => {
                return Err(StreamError::InvalidConfig(format!(
                    "'{}' has no clock source to trigger from",
                    self.name
                )))
            }
        };
        let handle = self.require_handle()?;
        let leader_handle = self.registry.handle_of(leader).ok_or_else(|| {
            StreamError::ClockConflict(format!("trigger source {} is not open", leader))
        })?;

        self.prepare()?;
        self.driver
            .configure_trigger(handle, TriggerEdge::StartOf(leader_handle))
            .map_err(StreamError::from_start)?;
        self.driver.start(handle).map_err(StreamError::from_start)?;

        self.shared.lock().state = TaskState::Armed;
        self.shared.state_changed.notify_all();
        tracing::info!(task = %self.name, leader = %leader_handle, "Task armed");
        Ok(())
    }

    /// Push clock, buffer and callback settings to the adapter
    ///
    /// Idempotent until something is reconfigured.
    pub(crate) fn prepare(&mut self) -> Result<(), StreamError> {
        if self.prepared {
            return Ok(());
        }
        let handle = self.require_handle()?;
        let (channels, clock) = match (self.channels.clone(), self.clock) {
            (Some(channels), Some(clock)) => (channels, clock),
            _ => {
                return Err(StreamError::InvalidState {
                    op: "prepare",
                    state: self.state(),
                })
            }
        };

        self.registry
            .validate_source(self.id, clock.clock_source)
            .map_err(StreamError::ClockConflict)?;
        let route = match clock.clock_source {
            ClockSource::Internal => ClockRoute::Internal,
            ClockSource::External(peer) => {
                ClockRoute::Borrowed(self.registry.handle_of(peer).ok_or_else(|| {
                    StreamError::ClockConflict(format!("clock source {} is not open", peer))
                })?)
            }
        };
        let rate = self
            .registry
            .effective_rate(self.id)
            .unwrap_or(clock.sample_rate_hz);

        let capacity = {
            let mut inner = self.shared.lock();
            let state = inner.state;
            let buffer = inner
                .buffer
                .as_mut()
                .ok_or(StreamError::InvalidState { op: "prepare", state })?;
            buffer.clear();
            inner.last_error = None;
            inner.stats = TaskStats::default();
            buffer_capacity(&inner)
        };

        self.driver
            .configure_clock(handle, rate, clock.samples_per_channel, clock.mode, route)
            .map_err(StreamError::from_start)?;
        self.driver
            .configure_buffer(handle, capacity)
            .map_err(StreamError::from_start)?;
        self.driver
            .configure_trigger(handle, TriggerEdge::Immediate)
            .map_err(StreamError::from_start)?;

        let register = match self.direction {
            Direction::Output => {
                self.driver
                    .set_regeneration(handle, self.regeneration)
                    .map_err(StreamError::from_start)?;
                self.prefill(handle, &channels, &clock, capacity)?;
                !self.regeneration || self.threshold.is_some()
            }
            Direction::Input => {
                if self.shared.lock().consumer.is_none() {
                    return Err(StreamError::InvalidConfig(format!(
                        "input task '{}' has no consumer",
                        self.name
                    )));
                }
                true
            }
        };

        self.shared.halted.store(false, Ordering::Release);
        if register {
            let threshold = self.threshold.unwrap_or((capacity / 2).max(1));
            let shared = Arc::clone(&self.shared);
            let ctx = HandlerContext {
                name: self.name.clone(),
                direction: self.direction,
                handle,
                driver: Arc::clone(&self.driver),
                width: channels.len(),
                kind: channels.kind(),
                regeneration: self.regeneration,
                finite_target: clock.is_finite().then_some(clock.samples_per_channel),
                write_timeout: self.write_timeout,
            };
            self.driver
                .register_threshold_callback(
                    handle,
                    threshold,
                    Box::new(move |note: &Notification| on_notification(&shared, &ctx, note)),
                )
                .map_err(StreamError::from_start)?;
            tracing::debug!(task = %self.name, threshold, "Notification callback registered");
        }

        self.prepared = true;
        Ok(())
    }

    /// Fill the output buffer before the hardware starts
    fn prefill(
        &self,
        handle: DriverHandle,
        channels: &ChannelSet,
        clock: &StreamClockConfig,
        capacity: usize,
    ) -> Result<(), StreamError> {
        let mut inner = self.shared.lock();
        let count = if clock.is_finite() {
            capacity.min(clock.samples_per_channel as usize)
        } else {
            capacity
        };
        let source = inner.source.as_mut().ok_or_else(|| {
            StreamError::InvalidConfig(format!("output task '{}' has no source", self.name))
        })?;
        let frames = match source.produce(count) {
            Ok(frames) => frames,
            Err(_) => {
                // Count what the source still held so the error says how far it got
                let mut produced = 0u64;
                while (produced as usize) < count && source.produce(1).is_ok() {
                    produced += 1;
                }
                let err = StreamError::SourceExhausted { produced };
                tracing::warn!(task = %self.name, wanted = count, "Stopping on error: {}", err);
                inner.last_error = Some(err.clone());
                inner.state = TaskState::Stopped;
                drop(inner);
                self.shared.state_changed.notify_all();
                return Err(err);
            }
        };
        check_frames(&frames, count, channels.len(), channels.kind())?;

        if let Some(buffer) = inner.buffer.as_mut() {
            buffer.write(&frames)?;
        }
        let accepted = self.driver.write(handle, &frames, self.write_timeout)?;
        if accepted < frames.len() {
            return Err(StreamError::BufferOverflow {
                requested: frames.len(),
                free: accepted,
            });
        }
        inner.stats.frames_written = accepted as u64;
        tracing::debug!(task = %self.name, frames = accepted, "Output buffer pre-filled");
        Ok(())
    }

    /// Stop data movement
    ///
    /// Input tasks deliver every frame already acquired before this returns.
    /// Stopping a stopped task is a no-op.
    ///
    /// # Panics
    /// Panics if the task was closed.
    pub fn stop(&mut self) -> Result<(), StreamError> {
        self.ensure_open();
        let state = self.state();
        match state {
            TaskState::Stopped => return Ok(()),
            TaskState::Running | TaskState::Armed => {}
            state => return Err(StreamError::InvalidState { op: "stop", state }),
        }
        let handle = self.require_handle()?;

        // The adapter waits for an in-flight notification, which needs the lock
        self.shared.halted.store(true, Ordering::Release);
        let stopped = self.driver.stop(handle);

        let mut inner = self.shared.lock();
        if inner.state != TaskState::Stopped {
            if self.direction == Direction::Input {
                let ctx = self.handler_context(handle);
                if let Err(e) = drain_remaining(&mut inner, &ctx) {
                    tracing::warn!(task = %self.name, "Final drain failed: {}", e);
                    inner.last_error.get_or_insert(e);
                }
            }
            inner.state = TaskState::Stopped;
        }
        let stats = inner.stats.clone();
        drop(inner);
        self.shared.state_changed.notify_all();
        self.prepared = false;

        tracing::info!(
            task = %self.name,
            transferred = stats.frames_transferred,
            delivered = stats.frames_delivered,
            written = stats.frames_written,
            "Task stopped"
        );
        stopped.map_err(StreamError::Driver)
    }

    /// Stop if needed and release the adapter handle
    ///
    /// Closing twice is a no-op. Every other operation on a closed task panics.
    pub fn close(&mut self) -> Result<(), StreamError> {
        let state = self.state();
        if state == TaskState::Closed {
            return Ok(());
        }

        let mut result = Ok(());
        if state.is_active() {
            result = self.stop();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.driver.close(handle) {
                tracing::warn!(task = %self.name, "Failed to release {}: {}", handle, e);
                if result.is_ok() {
                    result = Err(StreamError::Driver(e));
                }
            }
        }
        self.registry.remove(self.id);

        let mut inner = self.shared.lock();
        inner.state = TaskState::Closed;
        inner.source = None;
        inner.consumer = None;
        drop(inner);
        self.shared.state_changed.notify_all();

        tracing::info!(task = %self.name, "Task closed");
        result
    }

    /// Block until the task leaves `Armed`/`Running` or `timeout` elapses
    ///
    /// Returns `true` if the task is no longer moving data.
    pub fn wait_until_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.lock();
        while inner.state.is_active() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self
                .shared
                .state_changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }

    fn handler_context(&self, handle: DriverHandle) -> HandlerContext {
        let (width, kind) = self
            .channels
            .as_ref()
            .map(|c| (c.len(), c.kind()))
            .unwrap_or((0, ChannelKind::Analog));
        HandlerContext {
            name: self.name.clone(),
            direction: self.direction,
            handle,
            driver: Arc::clone(&self.driver),
            width,
            kind,
            regeneration: self.regeneration,
            finite_target: self
                .clock
                .filter(|c| c.is_finite())
                .map(|c| c.samples_per_channel),
            write_timeout: self.write_timeout,
        }
    }

    fn require_handle(&self) -> Result<DriverHandle, StreamError> {
        self.handle.ok_or(StreamError::InvalidState {
            op: "use the device",
            state: self.state(),
        })
    }

    fn ensure_direction(&self, expected: Direction, op: &str) -> Result<(), StreamError> {
        if self.direction != expected {
            return Err(StreamError::InvalidConfig(format!(
                "cannot {} {:?} task '{}'",
                op, self.direction, self.name
            )));
        }
        Ok(())
    }

    fn ensure_idle(&self, op: &'static str) -> Result<(), StreamError> {
        let state = self.state();
        if state.is_active() {
            return Err(StreamError::InvalidState { op, state });
        }
        Ok(())
    }

    fn ensure_open(&self) {
        assert!(
            self.state() != TaskState::Closed,
            "{}",
            StreamError::UseAfterClose(self.name.clone())
        );
    }
}

impl Drop for StreamTask {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(task = %self.name, "Error closing task on drop: {}", e);
        }
    }
}

fn buffer_capacity(inner: &TaskInner) -> usize {
    inner.buffer.as_ref().map(|b| b.capacity()).unwrap_or(0)
}

fn check_frames(
    frames: &[SampleFrame],
    expected_len: usize,
    width: usize,
    kind: ChannelKind,
) -> Result<(), StreamError> {
    if frames.len() != expected_len {
        return Err(StreamError::NotificationHandlerError(format!(
            "expected {} frames, got {}",
            expected_len,
            frames.len()
        )));
    }
    for frame in frames {
        if frame.width() != width {
            return Err(StreamError::FrameWidthMismatch {
                expected: width,
                actual: frame.width(),
            });
        }
        if frame.is_digital() != kind.is_digital() {
            return Err(StreamError::NotificationHandlerError(format!(
                "{:?} task received a frame of the other kind",
                kind
            )));
        }
    }
    Ok(())
}

/// Threshold callback body
fn on_notification(shared: &TaskShared, ctx: &HandlerContext, note: &Notification) -> NotifyFlow {
    if shared.halted.load(Ordering::Acquire) {
        return NotifyFlow::Halt;
    }
    let mut inner = shared.lock();
    if !inner.state.is_active() && inner.state != TaskState::Configured {
        return NotifyFlow::Halt;
    }
    inner.stats.notifications += 1;
    inner.stats.frames_transferred = note.total;

    let (result, finished) = match &note.kind {
        NotifyKind::Threshold => {
            let moved = match ctx.direction {
                Direction::Input => deliver_input(&mut inner, ctx, note.transferred),
                Direction::Output => refill_output(&mut inner, ctx, note.transferred),
            };
            (moved, false)
        }
        NotifyKind::Complete => {
            let moved = match ctx.direction {
                Direction::Input => drain_remaining(&mut inner, ctx),
                Direction::Output => mirror_output(&mut inner, note.transferred),
            };
            (moved, true)
        }
        NotifyKind::Fault(err) => {
            if ctx.direction == Direction::Input {
                if let Err(e) = drain_remaining(&mut inner, ctx) {
                    tracing::warn!(task = %ctx.name, "Final drain failed: {}", e);
                }
            }
            (Err(StreamError::from_fault(err.clone())), true)
        }
    };

    let flow = match result {
        Ok(()) if !finished => return NotifyFlow::Continue,
        Ok(()) => {
            tracing::info!(task = %ctx.name, total = note.total, "Finite stream complete");
            NotifyFlow::Halt
        }
        Err(e) => {
            tracing::warn!(task = %ctx.name, "Stopping on error: {}", e);
            inner.last_error = Some(e);
            NotifyFlow::Halt
        }
    };
    inner.state = TaskState::Stopped;
    drop(inner);
    shared.state_changed.notify_all();
    flow
}

/// Move `n` acquired frames from the adapter to the consumer
fn deliver_input(inner: &mut TaskInner, ctx: &HandlerContext, n: usize) -> Result<(), StreamError> {
    let frames = ctx.driver.read(ctx.handle, n)?;
    check_frames(&frames, n, ctx.width, ctx.kind)?;

    let TaskInner {
        buffer,
        consumer,
        stats,
        ..
    } = inner;
    let buffer = buffer
        .as_mut()
        .ok_or_else(|| StreamError::NotificationHandlerError("no buffer".to_string()))?;
    let consumer = consumer
        .as_mut()
        .ok_or_else(|| StreamError::NotificationHandlerError("no consumer".to_string()))?;

    buffer.write(&frames)?;
    let batch = buffer.read(n)?;
    consumer
        .deliver(&batch)
        .map_err(|e| StreamError::NotificationHandlerError(e.0))?;
    stats.frames_delivered += n as u64;
    Ok(())
}

/// Deliver everything the adapter still holds, in buffer-sized chunks
fn drain_remaining(inner: &mut TaskInner, ctx: &HandlerContext) -> Result<(), StreamError> {
    let TaskInner {
        buffer,
        consumer,
        stats,
        ..
    } = inner;
    let (Some(buffer), Some(consumer)) = (buffer.as_mut(), consumer.as_mut()) else {
        return Ok(());
    };

    loop {
        let available = ctx.driver.available(ctx.handle)?;
        let chunk = available.min(buffer.free_space());
        if chunk > 0 {
            let frames = ctx.driver.read(ctx.handle, chunk)?;
            check_frames(&frames, chunk, ctx.width, ctx.kind)?;
            buffer.write(&frames)?;
        }
        let batch = buffer.drain_available();
        if !batch.is_empty() {
            consumer
                .deliver(&batch)
                .map_err(|e| StreamError::NotificationHandlerError(e.0))?;
            stats.frames_delivered += batch.len() as u64;
        }
        if available <= chunk {
            return Ok(());
        }
    }
}

/// Account for `n` frames the hardware consumed from the output buffer
fn mirror_output(inner: &mut TaskInner, n: usize) -> Result<(), StreamError> {
    match inner.buffer.as_mut() {
        Some(buffer) => buffer.read(n).map(|_| ()),
        None => Ok(()),
    }
}

/// Replace the `n` frames the hardware just consumed
fn refill_output(inner: &mut TaskInner, ctx: &HandlerContext, n: usize) -> Result<(), StreamError> {
    mirror_output(inner, n)?;
    if ctx.regeneration {
        return Ok(());
    }

    let written = inner.stats.frames_written;
    let remaining = ctx
        .finite_target
        .map(|target| target.saturating_sub(written))
        .unwrap_or(u64::MAX);
    let want = (n as u64).min(remaining) as usize;
    if want == 0 {
        return Ok(());
    }

    let TaskInner {
        buffer,
        source,
        stats,
        ..
    } = inner;
    let source = source
        .as_mut()
        .ok_or_else(|| StreamError::NotificationHandlerError("no source".to_string()))?;
    let frames = source
        .produce(want)
        .map_err(|_| StreamError::SourceExhausted { produced: written })?;
    check_frames(&frames, want, ctx.width, ctx.kind)?;

    if let Some(buffer) = buffer.as_mut() {
        buffer.write(&frames)?;
    }
    let accepted = ctx.driver.write(ctx.handle, &frames, ctx.write_timeout)?;
    if accepted < want {
        return Err(StreamError::BufferOverflow {
            requested: want,
            free: accepted,
        });
    }
    stats.frames_written += accepted as u64;
    Ok(())
}
