//! Streaming engine
//!
//! - Frames and channel sets ([`frame`], [`channels`])
//! - Ring buffer between task and adapter ([`buffer`])
//! - Clock configuration and the clock registry ([`clock`])
//! - Task lifecycle and notification handling ([`task`], [`context`])
//! - Leader/follower synchronized start ([`sync`])
//! - Software-timed polling ([`poll`])
//! - Counter pulse generation ([`pulse`])

pub mod buffer;
pub mod callback;
pub mod channels;
pub mod clock;
pub mod context;
pub mod error;
pub mod frame;
pub mod poll;
pub mod pulse;
pub mod shutdown;
pub mod sync;
pub mod task;
