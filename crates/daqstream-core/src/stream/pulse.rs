//! Counter pulse generation
//!
//! A counter output drives its terminal from the device timebase with no
//! sample buffer. The host sets high time, low time and initial delay, starts
//! the counter and waits for the last low phase to end.

use crate::driver::{
    ChannelSpec, ClockRoute, DriverAdapter, DriverHandle, Notification, NotifyFlow, NotifyKind,
    PulseSpec,
};
use crate::stream::channels::{ChannelSet, Direction};
use crate::stream::clock::AcquisitionMode;
use crate::stream::error::StreamError;
use crate::stream::task::TaskState;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct PulseStatus {
    state: TaskState,
    last_error: Option<StreamError>,
}

struct PulseShared {
    status: Mutex<PulseStatus>,
    changed: Condvar,
}

impl PulseShared {
    fn lock(&self) -> MutexGuard<'_, PulseStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: TaskState) {
        self.lock().state = state;
        self.changed.notify_all();
    }
}

/// Check pulse timing before it reaches the adapter
pub fn validate_pulse(spec: &PulseSpec) -> Result<(), StreamError> {
    let times = [spec.high_time, spec.low_time, spec.initial_delay];
    if times.iter().any(|t| !t.is_finite()) {
        return Err(StreamError::InvalidConfig(
            "pulse times must be finite".to_string(),
        ));
    }
    if spec.high_time <= 0.0 || spec.low_time <= 0.0 {
        return Err(StreamError::InvalidConfig(format!(
            "high and low time must be positive, got {}s/{}s",
            spec.high_time, spec.low_time
        )));
    }
    if spec.initial_delay < 0.0 {
        return Err(StreamError::InvalidConfig(format!(
            "initial delay must not be negative, got {}s",
            spec.initial_delay
        )));
    }
    if spec.pulses == 0 {
        return Err(StreamError::InvalidConfig(
            "at least one pulse is required".to_string(),
        ));
    }
    Ok(())
}

/// Timed pulse on a single counter output
///
/// Created through [`StreamContext::create_pulse_task`](crate::stream::context::StreamContext::create_pulse_task).
/// Unlike a [`StreamTask`](crate::stream::task::StreamTask), a stopped pulse
/// task can be started again without reconfiguring. Dropping it closes it.
pub struct PulseTask {
    name: String,
    driver: Arc<dyn DriverAdapter>,
    handle: Option<DriverHandle>,
    channel: Option<String>,
    spec: Option<PulseSpec>,
    timebase_hz: f64,
    shared: Arc<PulseShared>,
}

impl PulseTask {
    pub(crate) fn new(name: &str, driver: Arc<dyn DriverAdapter>) -> Self {
        Self {
            name: name.to_string(),
            driver,
            handle: None,
            channel: None,
            spec: None,
            timebase_hz: 0.0,
            shared: Arc::new(PulseShared {
                status: Mutex::new(PulseStatus {
                    state: TaskState::Created,
                    last_error: None,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.shared.lock().state
    }

    pub fn handle(&self) -> Option<DriverHandle> {
        self.handle
    }

    pub fn spec(&self) -> Option<PulseSpec> {
        self.spec
    }

    /// Counter timebase the pulse times are counted in
    pub fn timebase_hz(&self) -> f64 {
        self.timebase_hz
    }

    /// Fault that stopped the last pulse, if any
    pub fn last_error(&self) -> Option<StreamError> {
        self.shared.lock().last_error.clone()
    }

    /// Bind a counter channel (e.g. `Dev1/ctr1`) and its pulse timing
    ///
    /// A counter that cannot be opened leaves the previous one in place.
    ///
    /// # Errors
    /// `InvalidConfig` for bad timing, `InvalidClockConfig` for a bad
    /// timebase, `DeviceBusy` if the counter is reserved.
    pub fn configure(
        &mut self,
        channel: &str,
        spec: PulseSpec,
        timebase_hz: f64,
    ) -> Result<(), StreamError> {
        self.ensure_open();
        let state = self.state();
        if state.is_active() {
            return Err(StreamError::InvalidState {
                op: "configure",
                state,
            });
        }
        validate_pulse(&spec)?;
        if !(timebase_hz.is_finite() && timebase_hz > 0.0) {
            return Err(StreamError::InvalidClockConfig(format!(
                "counter timebase must be positive, got {}",
                timebase_hz
            )));
        }
        let channels = ChannelSet::counter(&[channel]);
        channels.validate()?;

        let handle = match self.handle {
            Some(handle) if self.channel.as_deref() == Some(channel) => handle,
            old => {
                let handle = self
                    .driver
                    .open(&ChannelSpec {
                        name: self.name.clone(),
                        direction: Direction::Output,
                        channels,
                    })
                    .map_err(StreamError::from_start)?;
                if let Some(old) = old {
                    if let Err(e) = self.driver.close(old) {
                        tracing::warn!(task = %self.name, "Failed to release {}: {}", old, e);
                    }
                }
                self.handle = Some(handle);
                self.channel = Some(channel.to_string());
                handle
            }
        };

        self.driver
            .configure_clock(
                handle,
                timebase_hz,
                0,
                AcquisitionMode::Finite,
                ClockRoute::Internal,
            )
            .map_err(StreamError::from_start)?;
        self.driver
            .configure_pulse(handle, &spec)
            .map_err(StreamError::from_start)?;

        self.spec = Some(spec);
        self.timebase_hz = timebase_hz;
        let mut status = self.shared.lock();
        status.state = TaskState::Configured;
        status.last_error = None;
        drop(status);

        tracing::info!(
            task = %self.name,
            channel,
            high = spec.high_time,
            low = spec.low_time,
            delay = spec.initial_delay,
            pulses = spec.pulses,
            "Pulse configured"
        );
        Ok(())
    }

    /// Start the counter; the first rising edge follows the initial delay
    pub fn start(&mut self) -> Result<(), StreamError> {
        self.ensure_open();
        let state = self.state();
        if !matches!(state, TaskState::Configured | TaskState::Stopped) {
            return Err(StreamError::InvalidState { op: "start", state });
        }
        let handle = self.handle.ok_or(StreamError::InvalidState {
            op: "use the device",
            state,
        })?;

        let shared = Arc::clone(&self.shared);
        let name = self.name.clone();
        // Only the completion and fault notifications matter
        self.driver
            .register_threshold_callback(
                handle,
                usize::MAX,
                Box::new(move |note: &Notification| on_pulse_notification(&shared, &name, note)),
            )
            .map_err(StreamError::from_start)?;

        {
            let mut status = self.shared.lock();
            status.state = TaskState::Running;
            status.last_error = None;
        }
        if let Err(e) = self.driver.start(handle) {
            self.shared.set_state(state);
            return Err(StreamError::from_start(e));
        }
        tracing::info!(task = %self.name, "Pulse started");
        Ok(())
    }

    /// Stop the counter, cutting short a pulse in progress
    pub fn stop(&mut self) -> Result<(), StreamError> {
        self.ensure_open();
        let state = self.state();
        match state {
            TaskState::Stopped => return Ok(()),
            TaskState::Running => {}
            state => return Err(StreamError::InvalidState { op: "stop", state }),
        }
        let stopped = match self.handle {
            Some(handle) => self.driver.stop(handle),
            None => Ok(()),
        };
        self.shared.set_state(TaskState::Stopped);
        tracing::info!(task = %self.name, "Pulse stopped");
        stopped.map_err(StreamError::Driver)
    }

    /// Block until the pulse finishes or `timeout` elapses
    pub fn wait_until_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.lock();
        while status.state.is_active() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            status = self
                .shared
                .changed
                .wait_timeout(status, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }

    /// Release the counter; closing twice is a no-op
    pub fn close(&mut self) -> Result<(), StreamError> {
        if self.state() == TaskState::Closed {
            return Ok(());
        }
        let mut result = Ok(());
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.driver.close(handle) {
                tracing::warn!(task = %self.name, "Failed to release {}: {}", handle, e);
                result = Err(StreamError::Driver(e));
            }
        }
        self.shared.set_state(TaskState::Closed);
        tracing::info!(task = %self.name, "Pulse task closed");
        result
    }

    fn ensure_open(&self) {
        assert!(
            self.state() != TaskState::Closed,
            "{}",
            StreamError::UseAfterClose(self.name.clone())
        );
    }
}

impl Drop for PulseTask {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(task = %self.name, "Error closing pulse task on drop: {}", e);
        }
    }
}

fn on_pulse_notification(shared: &PulseShared, name: &str, note: &Notification) -> NotifyFlow {
    let mut status = shared.lock();
    if status.state != TaskState::Running {
        return NotifyFlow::Halt;
    }
    match &note.kind {
        NotifyKind::Threshold => return NotifyFlow::Continue,
        NotifyKind::Complete => {
            tracing::info!(task = %name, ticks = note.total, "Pulse complete");
        }
        NotifyKind::Fault(err) => {
            let err = StreamError::from_fault(err.clone());
            tracing::warn!(task = %name, "Stopping on error: {}", err);
            status.last_error = Some(err);
        }
    }
    status.state = TaskState::Stopped;
    drop(status);
    shared.changed.notify_all();
    NotifyFlow::Halt
}
