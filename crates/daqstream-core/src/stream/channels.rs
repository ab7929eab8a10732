//! Channel sets

use crate::stream::error::StreamError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Direction of data movement for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host (acquisition)
    Input,
    /// Host to device (generation)
    Output,
}

/// Kind of physical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Voltage channels carrying `f64` samples
    Analog,
    /// Digital lines carrying `bool` samples
    Digital,
    /// Counter outputs; their frames carry the output terminal's level
    Counter,
}

impl ChannelKind {
    /// Whether frames of this kind hold `bool` levels rather than volts
    pub fn is_digital(self) -> bool {
        !matches!(self, Self::Analog)
    }
}

/// Ordered set of physical channel identifiers (e.g. `Dev1/ai0`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSet {
    kind: ChannelKind,
    names: Vec<String>,
}

impl ChannelSet {
    /// Analog channels in the given order
    pub fn analog<S: AsRef<str>>(names: &[S]) -> Self {
        Self::new(ChannelKind::Analog, names)
    }

    /// Digital lines in the given order
    pub fn digital<S: AsRef<str>>(names: &[S]) -> Self {
        Self::new(ChannelKind::Digital, names)
    }

    /// Counter channels (e.g. `Dev1/ctr1`) for pulse generation
    pub fn counter<S: AsRef<str>>(names: &[S]) -> Self {
        Self::new(ChannelKind::Counter, names)
    }

    pub fn new<S: AsRef<str>>(kind: ChannelKind, names: &[S]) -> Self {
        Self {
            kind,
            names: names.iter().map(|n| n.as_ref().to_string()).collect(),
        }
    }

    /// Reject empty sets and duplicate identifiers
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.names.is_empty() {
            return Err(StreamError::InvalidChannelSet(
                "at least one channel is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for name in &self.names {
            if name.trim().is_empty() {
                return Err(StreamError::InvalidChannelSet(
                    "channel names must not be blank".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(StreamError::InvalidChannelSet(format!(
                    "duplicate channel '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of channels (the frame width)
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Position of a channel within the set
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_set() {
        let set = ChannelSet::analog(&["Dev1/ai0", "Dev1/ai1"]);
        assert!(set.validate().is_ok());
        assert_eq!(set.len(), 2);
        assert_eq!(set.index_of("Dev1/ai1"), Some(1));
    }

    #[test]
    fn test_empty_set_rejected() {
        let set = ChannelSet::analog::<&str>(&[]);
        assert!(matches!(
            set.validate(),
            Err(StreamError::InvalidChannelSet(_))
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let set = ChannelSet::digital(&["Dev1/port0/line0", "Dev1/port0/line0"]);
        let err = set.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
