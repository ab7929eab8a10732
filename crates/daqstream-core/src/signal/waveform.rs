//! Output waveform generation
//!
//! Waveforms are computed once as a table of frames covering one period and
//! then replayed. A table can be written straight into a regenerating output
//! buffer, or wrapped in a [`WaveformSource`] that feeds a task's refill
//! notifications.

use crate::stream::callback::{FrameSource, SourceExhausted};
use crate::stream::frame::SampleFrame;
use std::f64::consts::PI;

/// One period of a sine wave, optionally with a quadrature (cosine) channel
#[derive(Debug, Clone)]
pub struct SineWaveform {
    points: usize,
    amplitude: f64,
    quadrature: bool,
}

impl SineWaveform {
    /// Create a single-channel sine sampled at `points` per period
    ///
    /// # Panics
    /// Panics if `points` is zero.
    ///
    /// # Example
    /// ```
    /// use daqstream_core::signal::waveform::SineWaveform;
    ///
    /// let table = SineWaveform::new(500, 1.0).frames();
    /// assert_eq!(table.len(), 500);
    /// ```
    pub fn new(points: usize, amplitude: f64) -> Self {
        assert!(points > 0, "A waveform needs at least one point");
        Self {
            points,
            amplitude,
            quadrature: false,
        }
    }

    /// Add a second channel carrying the cosine
    pub fn with_quadrature(mut self) -> Self {
        self.quadrature = true;
        self
    }

    /// Number of channels per frame
    pub fn width(&self) -> usize {
        if self.quadrature {
            2
        } else {
            1
        }
    }

    pub fn points(&self) -> usize {
        self.points
    }

    /// Value of the sine channel at point `i`
    pub fn sample(&self, i: usize) -> f64 {
        self.amplitude * self.phase(i).sin()
    }

    /// Frames covering exactly one period
    pub fn frames(&self) -> Vec<SampleFrame> {
        (0..self.points)
            .map(|i| {
                let phase = self.phase(i);
                if self.quadrature {
                    SampleFrame::Analog(vec![
                        self.amplitude * phase.sin(),
                        self.amplitude * phase.cos(),
                    ])
                } else {
                    SampleFrame::Analog(vec![self.amplitude * phase.sin()])
                }
            })
            .collect()
    }

    fn phase(&self, i: usize) -> f64 {
        2.0 * PI * (i % self.points) as f64 / self.points as f64
    }
}

/// Endless (or limited) replay of a frame table
#[derive(Debug, Clone)]
pub struct WaveformSource {
    table: Vec<SampleFrame>,
    position: usize,
    produced: u64,
    limit: Option<u64>,
}

impl WaveformSource {
    /// Replay `table` forever
    ///
    /// # Panics
    /// Panics if `table` is empty.
    pub fn new(table: Vec<SampleFrame>) -> Self {
        assert!(!table.is_empty(), "Waveform table must not be empty");
        Self {
            table,
            position: 0,
            produced: 0,
            limit: None,
        }
    }

    /// Report exhaustion once `total` frames have been produced
    pub fn with_limit(mut self, total: u64) -> Self {
        self.limit = Some(total);
        self
    }

    /// Frames produced so far
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Restart from the first point of the table
    pub fn reset(&mut self) {
        self.position = 0;
        self.produced = 0;
    }
}

impl FrameSource for WaveformSource {
    fn produce(&mut self, n: usize) -> Result<Vec<SampleFrame>, SourceExhausted> {
        if let Some(limit) = self.limit {
            if self.produced + n as u64 > limit {
                return Err(SourceExhausted);
            }
        }
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            frames.push(self.table[self.position].clone());
            self.position = (self.position + 1) % self.table.len();
        }
        self.produced += n as u64;
        Ok(frames)
    }
}

/// Binary counter across a set of digital lines
///
/// Frame `k` sets line `j` when bit `j` of `k` is set, so line 0 toggles
/// every frame, line 1 every second frame, and so on.
#[derive(Debug, Clone)]
pub struct DigitalPattern {
    lines: usize,
    counter: u64,
}

impl DigitalPattern {
    /// # Panics
    /// Panics unless `lines` is between 1 and 64.
    pub fn counter(lines: usize) -> Self {
        assert!((1..=64).contains(&lines), "Lines must be between 1 and 64");
        Self { lines, counter: 0 }
    }

    /// Frame for counter value `k`
    pub fn frame(&self, k: u64) -> SampleFrame {
        SampleFrame::Digital((0..self.lines).map(|bit| (k >> bit) & 1 == 1).collect())
    }

    /// One full cycle of the counter, capped at `max` frames
    pub fn frames(&self, max: usize) -> Vec<SampleFrame> {
        let period = if self.lines >= 64 {
            u64::MAX
        } else {
            1u64 << self.lines
        };
        (0..period.min(max as u64)).map(|k| self.frame(k)).collect()
    }
}

impl FrameSource for DigitalPattern {
    fn produce(&mut self, n: usize) -> Result<Vec<SampleFrame>, SourceExhausted> {
        let frames = (0..n as u64)
            .map(|i| self.frame(self.counter.wrapping_add(i)))
            .collect();
        self.counter = self.counter.wrapping_add(n as u64);
        Ok(frames)
    }
}
