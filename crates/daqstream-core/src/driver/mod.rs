//! Driver adapter contract
//!
//! The adapter is the only component that talks to hardware. Stream tasks
//! drive it through [`DriverAdapter`]; the adapter in turn raises
//! per-N-samples notifications on its own execution context.
//!
//! Contract for implementors:
//! - Notifications for one handle never overlap and arrive in order.
//! - Once [`DriverAdapter::stop`] or [`DriverAdapter::close`] returns, no
//!   further notification is delivered for that handle.
//! - A callback returning [`NotifyFlow::Halt`] stops clocking the handle as if
//!   `stop` had been called, without re-entering the caller.
//! - Frames already acquired stay readable after `stop` until `close`.
//!
//! [`simulated::SimulatedDriver`] is an in-process implementation used by the
//! demos and tests.

pub mod simulated;

use crate::stream::channels::{ChannelSet, Direction};
use crate::stream::clock::AcquisitionMode;
use crate::stream::frame::SampleFrame;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a driver adapter
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Invalid driver handle: {0}")]
    InvalidHandle(DriverHandle),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Input FIFO overrun: {pending} frames did not fit in {capacity}")]
    Overrun { pending: usize, capacity: usize },

    #[error("Output underflow: {requested} frames needed, {available} buffered")]
    Underflow { requested: usize, available: usize },

    #[error("Hardware fault: {0}")]
    Hardware(String),
}

/// Opaque handle to an opened channel set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverHandle(pub u64);

impl fmt::Display for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// What to open on the device
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    /// Task name, used in diagnostics
    pub name: String,
    pub direction: Direction,
    pub channels: ChannelSet,
}

/// Pulse timing for a counter output, in seconds
///
/// The output idles low, waits `initial_delay`, then repeats `high_time` high
/// followed by `low_time` low for each of `pulses` pulses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseSpec {
    pub high_time: f64,
    pub low_time: f64,
    pub initial_delay: f64,
    pub pulses: u64,
}

impl PulseSpec {
    /// One pulse after `initial_delay`
    pub fn single(high_time: f64, low_time: f64, initial_delay: f64) -> Self {
        Self {
            high_time,
            low_time,
            initial_delay,
            pulses: 1,
        }
    }

    /// Seconds from start until the last low phase ends
    pub fn duration(&self) -> f64 {
        self.initial_delay + self.pulses as f64 * (self.high_time + self.low_time)
    }
}

/// Resolved sample clock for a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRoute {
    /// Onboard clock at the handle's own rate
    Internal,
    /// Sample clock exported by another handle
    Borrowed(DriverHandle),
}

/// Start trigger for a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEdge {
    /// Start as soon as `start` is called
    Immediate,
    /// Start on the start-of-acquisition edge of another handle
    StartOf(DriverHandle),
}

/// Why a notification fired
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyKind {
    /// Another `n` frames were transferred
    Threshold,
    /// A finite stream reached its sample count
    Complete,
    /// The hardware stopped on an error
    Fault(DriverError),
}

/// Event passed to a threshold callback
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Frames transferred since the previous notification
    pub transferred: usize,
    /// Frames transferred since start
    pub total: u64,
    pub kind: NotifyKind,
}

/// Callback verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyFlow {
    Continue,
    /// Stop clocking this handle; no further notifications
    Halt,
}

/// Per-N-samples callback registered on a handle
pub type ThresholdCallback = Box<dyn FnMut(&Notification) -> NotifyFlow + Send>;

/// Narrow interface to a data-acquisition driver
pub trait DriverAdapter: Send + Sync {
    /// Reserve channels and return a handle for them
    fn open(&self, spec: &ChannelSpec) -> Result<DriverHandle, DriverError>;

    /// Configure the sample clock
    fn configure_clock(
        &self,
        handle: DriverHandle,
        rate_hz: f64,
        samples_per_channel: u64,
        mode: AcquisitionMode,
        route: ClockRoute,
    ) -> Result<(), DriverError>;

    /// Size the device-side buffer in frames
    fn configure_buffer(&self, handle: DriverHandle, frames: usize) -> Result<(), DriverError>;

    /// Begin clocking (or wait for the configured trigger)
    fn start(&self, handle: DriverHandle) -> Result<(), DriverError>;

    /// Stop clocking; no notifications are delivered after this returns
    fn stop(&self, handle: DriverHandle) -> Result<(), DriverError>;

    /// Release the channels; the handle is invalid afterwards
    fn close(&self, handle: DriverHandle) -> Result<(), DriverError>;

    /// Queue output frames, returning how many were accepted
    fn write(
        &self,
        handle: DriverHandle,
        frames: &[SampleFrame],
        timeout: Duration,
    ) -> Result<usize, DriverError>;

    /// Read exactly `count` acquired frames
    fn read(&self, handle: DriverHandle, count: usize) -> Result<Vec<SampleFrame>, DriverError>;

    /// Acquired frames waiting to be read
    fn available(&self, handle: DriverHandle) -> Result<usize, DriverError>;

    /// Call `callback` every `n` transferred frames
    fn register_threshold_callback(
        &self,
        handle: DriverHandle,
        n: usize,
        callback: ThresholdCallback,
    ) -> Result<(), DriverError>;

    /// Allow or forbid replaying the output buffer
    fn set_regeneration(&self, handle: DriverHandle, enabled: bool) -> Result<(), DriverError>;

    /// Configure the start trigger
    fn configure_trigger(&self, handle: DriverHandle, edge: TriggerEdge)
        -> Result<(), DriverError>;

    /// Logical device tick at which the handle's first sample was clocked
    fn start_timestamp(&self, handle: DriverHandle) -> Result<Option<u64>, DriverError>;

    /// Generate `spec` on a counter handle, timed by its configured clock
    ///
    /// The handle becomes a finite stream that completes once the last low
    /// phase ends.
    fn configure_pulse(&self, handle: DriverHandle, spec: &PulseSpec) -> Result<(), DriverError> {
        let _ = spec;
        Err(DriverError::Unsupported(format!(
            "pulse generation on {}",
            handle
        )))
    }
}
