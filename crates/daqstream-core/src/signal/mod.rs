//! Output signal generation

pub mod waveform;
