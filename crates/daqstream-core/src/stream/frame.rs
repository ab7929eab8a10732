//! Sample frames
//!
//! A frame is one simultaneous sample across every channel of a task.

use serde::{Deserialize, Serialize};

/// One simultaneous sample across all active channels of a task
///
/// Analog channels carry volts as `f64`, digital lines carry `bool`.
/// A task never mixes the two kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleFrame {
    /// Analog values, one per channel
    Analog(Vec<f64>),
    /// Digital line states, one per line
    Digital(Vec<bool>),
}

impl SampleFrame {
    /// Analog frame from a slice of channel values
    pub fn analog(values: &[f64]) -> Self {
        Self::Analog(values.to_vec())
    }

    /// Digital frame from a slice of line states
    pub fn digital(lines: &[bool]) -> Self {
        Self::Digital(lines.to_vec())
    }

    /// All-zero analog frame of the given width
    pub fn zeros(width: usize) -> Self {
        Self::Analog(vec![0.0; width])
    }

    /// Number of channels in this frame
    pub fn width(&self) -> usize {
        match self {
            Self::Analog(values) => values.len(),
            Self::Digital(lines) => lines.len(),
        }
    }

    /// Value of one channel as volts (digital lines map to 0.0 / 1.0)
    pub fn value(&self, channel: usize) -> Option<f64> {
        match self {
            Self::Analog(values) => values.get(channel).copied(),
            Self::Digital(lines) => lines.get(channel).map(|&on| if on { 1.0 } else { 0.0 }),
        }
    }

    /// Whether this frame carries digital line states
    pub fn is_digital(&self) -> bool {
        matches!(self, Self::Digital(_))
    }
}

/// Mean of one channel across a batch of frames
///
/// Returns `None` for an empty batch or a channel index outside the frames.
pub fn channel_mean(frames: &[SampleFrame], channel: usize) -> Option<f64> {
    let values: Vec<f64> = frames.iter().filter_map(|f| f.value(channel)).collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Peak absolute value of one channel across a batch of frames
pub fn channel_peak(frames: &[SampleFrame], channel: usize) -> Option<f64> {
    frames
        .iter()
        .filter_map(|f| f.value(channel))
        .map(f64::abs)
        .reduce(f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_width() {
        assert_eq!(SampleFrame::zeros(3).width(), 3);
        assert_eq!(SampleFrame::digital(&[true, false]).width(), 2);
    }

    #[test]
    fn test_digital_value_maps_to_volts() {
        let frame = SampleFrame::digital(&[true, false]);
        assert_eq!(frame.value(0), Some(1.0));
        assert_eq!(frame.value(1), Some(0.0));
        assert_eq!(frame.value(2), None);
        assert!(frame.is_digital());
    }

    #[test]
    fn test_channel_mean_and_peak() {
        let frames = vec![
            SampleFrame::analog(&[1.0, -4.0]),
            SampleFrame::analog(&[3.0, 2.0]),
        ];
        assert_eq!(channel_mean(&frames, 0), Some(2.0));
        assert_eq!(channel_peak(&frames, 1), Some(4.0));
        assert_eq!(channel_mean(&[], 0), None);
    }
}
