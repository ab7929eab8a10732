//! Daqstream Core - buffered, hardware-clocked streaming I/O
//!
//! Moves analog and digital samples between a host and a data-acquisition
//! device through a driver adapter. Provides ring-buffered continuous and
//! finite streams, per-N-samples notifications, clock sharing between tasks,
//! a trigger-synchronized start for input/output pairs and counter pulses.

pub mod driver;
pub mod signal;
pub mod stream;

pub use driver::simulated::{SimClock, SimSignal, SimulatedDriver};
pub use driver::{DriverAdapter, DriverError, DriverHandle, PulseSpec};
pub use signal::waveform::{DigitalPattern, SineWaveform, WaveformSource};
pub use stream::buffer::SampleBuffer;
pub use stream::callback::{ChannelConsumer, FrameConsumer, FrameSequence, FrameSource};
pub use stream::channels::{ChannelKind, ChannelSet, Direction};
pub use stream::clock::{AcquisitionMode, ClockSource, StreamClockConfig, TaskId};
pub use stream::context::StreamContext;
pub use stream::error::StreamError;
pub use stream::frame::SampleFrame;
pub use stream::poll::SoftwarePoller;
pub use stream::pulse::PulseTask;
pub use stream::shutdown::ShutdownSignal;
pub use stream::sync::SyncCoordinator;
pub use stream::task::{StreamTask, TaskState, TaskStats};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sample clock rate in Hz
pub const DEFAULT_SAMPLE_RATE: f64 = 5000.0;

/// Default buffer size in frames per task
pub const DEFAULT_BUFFER_FRAMES: usize = 1000;
