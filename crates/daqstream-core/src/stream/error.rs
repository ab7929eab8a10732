//! Stream engine errors

use crate::driver::DriverError;
use crate::stream::channels::Direction;
use crate::stream::task::TaskState;
use thiserror::Error;

/// Errors raised by buffers, tasks and the sync coordinator
///
/// Configuration errors are returned synchronously. Runtime errors raised while
/// handling a notification stop the owning task and are kept in its error slot
/// (see [`StreamTask::last_error`](crate::stream::task::StreamTask::last_error)).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("Invalid channel set: {0}")]
    InvalidChannelSet(String),

    #[error("Invalid clock topology: {0}")]
    InvalidClockTopology(String),

    #[error("Invalid clock configuration: {0}")]
    InvalidClockConfig(String),

    #[error("Invalid task configuration: {0}")]
    InvalidConfig(String),

    #[error("Clock conflict at start: {0}")]
    ClockConflict(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Buffer overflow: {requested} frames requested, {free} free")]
    BufferOverflow { requested: usize, free: usize },

    #[error("Buffer underrun: {requested} frames requested, {available} available")]
    BufferUnderrun { requested: usize, available: usize },

    #[error("Invalid buffer capacity: {0}")]
    InvalidBufferCapacity(usize),

    #[error("Callback threshold {threshold} outside 1..={capacity}")]
    InvalidThreshold { threshold: usize, capacity: usize },

    #[error("Frame width mismatch: expected {expected} channels, got {actual}")]
    FrameWidthMismatch { expected: usize, actual: usize },

    #[error("Source exhausted after {produced} frames")]
    SourceExhausted { produced: u64 },

    #[error("Notification handler failed: {0}")]
    NotificationHandlerError(String),

    #[error("Cannot {op} while {state:?}")]
    InvalidState { op: &'static str, state: TaskState },

    #[error("Direction mismatch: leader and follower are both {0:?}")]
    DirectionMismatch(Direction),

    #[error("Task '{0}' used after close")]
    UseAfterClose(String),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

impl StreamError {
    /// Map an adapter failure raised while starting or arming a task
    ///
    /// A busy resource becomes `DeviceBusy`; everything else keeps the
    /// adapter's diagnostic text.
    pub(crate) fn from_start(err: DriverError) -> Self {
        match err {
            DriverError::Busy(msg) => Self::DeviceBusy(msg),
            other => Self::Driver(other),
        }
    }

    /// Map a fault reported by the adapter inside a notification
    pub(crate) fn from_fault(err: DriverError) -> Self {
        match err {
            DriverError::Overrun { pending, .. } => Self::BufferOverflow {
                requested: pending,
                free: 0,
            },
            DriverError::Underflow { requested, available } => {
                Self::BufferUnderrun { requested, available }
            }
            other => Self::Driver(other),
        }
    }

    /// Whether this error stops a running task rather than being returned to a caller
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Self::BufferOverflow { .. }
                | Self::BufferUnderrun { .. }
                | Self::SourceExhausted { .. }
                | Self::NotificationHandlerError(_)
                | Self::Driver(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_device_busy() {
        let err = StreamError::from_start(DriverError::Busy("Dev1/ai0 reserved".into()));
        assert_eq!(err, StreamError::DeviceBusy("Dev1/ai0 reserved".into()));
    }

    #[test]
    fn test_other_driver_errors_keep_diagnostic() {
        let err = StreamError::from_start(DriverError::Unsupported("sample clock".into()));
        assert!(err.to_string().contains("sample clock"));
    }

    #[test]
    fn test_fault_mapping() {
        let err = StreamError::from_fault(DriverError::Underflow {
            requested: 10,
            available: 4,
        });
        assert_eq!(
            err,
            StreamError::BufferUnderrun {
                requested: 10,
                available: 4
            }
        );
        assert!(err.is_runtime());
        assert!(!StreamError::InvalidChannelSet("empty".into()).is_runtime());
    }
}
