//! Daqstream - buffered, hardware-clocked streaming for DAQ devices
//!
//! This library re-exports the streaming engine from `daqstream-core` and
//! adds the JSON configuration used by the `daqstream` binary.

pub mod config;

pub use daqstream_core::{driver, signal, stream};

pub use daqstream_core::{
    ChannelSet, Direction, PulseSpec, PulseTask, SampleBuffer, SampleFrame, ShutdownSignal,
    SimulatedDriver, StreamClockConfig, StreamContext, StreamError, StreamTask, SyncCoordinator,
    TaskState,
};
pub use daqstream_core::{DEFAULT_BUFFER_FRAMES, DEFAULT_SAMPLE_RATE, VERSION};
