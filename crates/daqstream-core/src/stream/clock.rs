//! Sample clock configuration and clock-source bindings
//!
//! Every configured task registers its clock in a [`ClockRegistry`] owned by
//! its [`StreamContext`](crate::stream::context::StreamContext). The registry
//! is what allows a task to borrow a peer's sample clock and is where clock
//! topologies are checked for cycles.

use crate::driver::DriverHandle;
use crate::stream::error::StreamError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Identifier of a task within its context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    /// Raw numeric id
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// How long a stream runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionMode {
    /// Stop after exactly `samples_per_channel` samples
    Finite,
    /// Run until stopped; `samples_per_channel` only sizes buffers
    Continuous,
}

/// Where a task's sample clock comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockSource {
    /// The device's onboard clock, paced at the task's own rate
    Internal,
    /// The sample clock of a peer task
    External(TaskId),
}

/// Sample clock timing for one task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamClockConfig {
    /// Sample rate in Hz (advisory when the clock is borrowed)
    pub sample_rate_hz: f64,
    /// Samples per channel: the stop point for finite streams, a buffer
    /// sizing hint for continuous ones
    pub samples_per_channel: u64,
    /// Finite or continuous acquisition
    pub mode: AcquisitionMode,
    /// Internal clock or a peer's
    pub clock_source: ClockSource,
}

impl StreamClockConfig {
    /// Continuous acquisition on the internal clock
    pub fn continuous(sample_rate_hz: f64) -> Self {
        Self {
            sample_rate_hz,
            samples_per_channel: 0,
            mode: AcquisitionMode::Continuous,
            clock_source: ClockSource::Internal,
        }
    }

    /// Finite acquisition of `samples_per_channel` samples on the internal clock
    pub fn finite(sample_rate_hz: f64, samples_per_channel: u64) -> Self {
        Self {
            sample_rate_hz,
            samples_per_channel,
            mode: AcquisitionMode::Finite,
            clock_source: ClockSource::Internal,
        }
    }

    /// Set the per-channel sample count
    pub fn with_samples_per_channel(mut self, samples: u64) -> Self {
        self.samples_per_channel = samples;
        self
    }

    /// Borrow the clock of another task
    pub fn with_source(mut self, source: ClockSource) -> Self {
        self.clock_source = source;
        self
    }

    /// Whether the stream stops on its own
    pub fn is_finite(&self) -> bool {
        self.mode == AcquisitionMode::Finite
    }

    /// Check the values that do not depend on other tasks
    pub fn validate(&self) -> Result<(), StreamError> {
        if !self.sample_rate_hz.is_finite() || self.sample_rate_hz <= 0.0 {
            return Err(StreamError::InvalidClockConfig(format!(
                "sample rate must be positive, got {}",
                self.sample_rate_hz
            )));
        }
        if self.is_finite() && self.samples_per_channel == 0 {
            return Err(StreamError::InvalidClockConfig(
                "finite acquisition needs a positive sample count".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry entry for a configured task
#[derive(Debug, Clone)]
pub(crate) struct ClockEntry {
    pub name: String,
    pub sample_rate_hz: f64,
    pub source: ClockSource,
    pub handle: Option<DriverHandle>,
}

/// Clock bindings of every configured task in a context
///
/// Cloning shares the same registry.
#[derive(Debug, Clone, Default)]
pub struct ClockRegistry {
    entries: Arc<RwLock<HashMap<TaskId, ClockEntry>>>,
}

impl ClockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: TaskId, entry: ClockEntry) {
        self.write().insert(id, entry);
    }

    pub(crate) fn set_source(&self, id: TaskId, source: ClockSource) {
        if let Some(entry) = self.write().get_mut(&id) {
            entry.source = source;
        }
    }

    pub(crate) fn remove(&self, id: TaskId) {
        self.write().remove(&id);
    }

    /// Whether a task is currently registered (configured and not closed)
    pub fn contains(&self, id: TaskId) -> bool {
        self.read().contains_key(&id)
    }

    /// Driver handle of a registered task
    pub fn handle_of(&self, id: TaskId) -> Option<DriverHandle> {
        self.read().get(&id).and_then(|e| e.handle)
    }

    /// Current clock source of a registered task
    pub fn source_of(&self, id: TaskId) -> Option<ClockSource> {
        self.read().get(&id).map(|e| e.source)
    }

    /// Rate the task is actually clocked at
    ///
    /// Follows borrowed clocks back to the task that owns the internal clock.
    /// Returns `None` for unknown tasks or a cyclic chain.
    pub fn effective_rate(&self, id: TaskId) -> Option<f64> {
        let entries = self.read();
        let mut seen = HashSet::new();
        let mut cursor = id;
        loop {
            let entry = entries.get(&cursor)?;
            match entry.source {
                ClockSource::Internal => return Some(entry.sample_rate_hz),
                ClockSource::External(next) => {
                    if !seen.insert(cursor) {
                        return None;
                    }
                    cursor = next;
                }
            }
        }
    }

    /// Check that `id` may take its clock from `source`
    ///
    /// The peer must be registered and the chain of borrowed clocks starting
    /// at the peer must end at an internal clock without passing through `id`.
    pub fn validate_source(&self, id: TaskId, source: ClockSource) -> Result<(), String> {
        let peer = match source {
            ClockSource::Internal => return Ok(()),
            ClockSource::External(peer) => peer,
        };
        if peer == id {
            return Err(format!("{} cannot take its clock from itself", id));
        }

        let entries = self.read();
        let mut seen = HashSet::from([id]);
        let mut cursor = peer;
        loop {
            let entry = entries
                .get(&cursor)
                .ok_or_else(|| format!("clock source {} is not a configured task", cursor))?;
            match entry.source {
                ClockSource::Internal => return Ok(()),
                ClockSource::External(next) => {
                    if !seen.insert(cursor) || next == id {
                        return Err(format!(
                            "clock of {} ('{}') leads back to {}",
                            cursor, entry.name, id
                        ));
                    }
                    cursor = next;
                }
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TaskId, ClockEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskId, ClockEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, rate: f64, source: ClockSource) -> ClockEntry {
        ClockEntry {
            name: name.to_string(),
            sample_rate_hz: rate,
            source,
            handle: None,
        }
    }

    #[test]
    fn test_validate_rate() {
        assert!(StreamClockConfig::continuous(1000.0).validate().is_ok());
        assert!(StreamClockConfig::continuous(0.0).validate().is_err());
        assert!(StreamClockConfig::continuous(f64::NAN).validate().is_err());
        assert!(StreamClockConfig::finite(1000.0, 0).validate().is_err());
        assert!(StreamClockConfig::finite(1000.0, 10).validate().is_ok());
    }

    #[test]
    fn test_self_source_rejected() {
        let reg = ClockRegistry::new();
        reg.register(TaskId(1), entry("ai", 1000.0, ClockSource::Internal));
        assert!(reg
            .validate_source(TaskId(1), ClockSource::External(TaskId(1)))
            .is_err());
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let reg = ClockRegistry::new();
        let err = reg
            .validate_source(TaskId(1), ClockSource::External(TaskId(7)))
            .unwrap_err();
        assert!(err.contains("task#7"));
    }

    #[test]
    fn test_mutual_cycle_rejected() {
        let reg = ClockRegistry::new();
        reg.register(TaskId(1), entry("ao", 1000.0, ClockSource::Internal));
        reg.register(TaskId(2), entry("ai", 1000.0, ClockSource::External(TaskId(1))));

        assert!(reg
            .validate_source(TaskId(1), ClockSource::External(TaskId(2)))
            .is_err());
    }

    #[test]
    fn test_longer_cycle_rejected() {
        let reg = ClockRegistry::new();
        reg.register(TaskId(1), entry("a", 1000.0, ClockSource::Internal));
        reg.register(TaskId(2), entry("b", 1000.0, ClockSource::External(TaskId(1))));
        reg.register(TaskId(3), entry("c", 1000.0, ClockSource::External(TaskId(2))));

        assert!(reg
            .validate_source(TaskId(1), ClockSource::External(TaskId(3)))
            .is_err());
        assert!(reg
            .validate_source(TaskId(4), ClockSource::External(TaskId(3)))
            .is_ok());
    }

    #[test]
    fn test_effective_rate_follows_peer() {
        let reg = ClockRegistry::new();
        reg.register(TaskId(1), entry("ao", 5000.0, ClockSource::Internal));
        reg.register(TaskId(2), entry("ai", 1.0, ClockSource::External(TaskId(1))));
        assert_eq!(reg.effective_rate(TaskId(2)), Some(5000.0));

        reg.remove(TaskId(1));
        assert_eq!(reg.effective_rate(TaskId(2)), None);
    }
}
