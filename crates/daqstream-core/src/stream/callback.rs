//! Data callbacks: where output frames come from and where input frames go
//!
//! Both traits are called from the adapter's notification context, so
//! implementations must return quickly and never block.

use crate::stream::frame::SampleFrame;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;

/// The source has no more frames to give
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("source exhausted")]
pub struct SourceExhausted;

/// A consumer rejected a batch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ConsumerError(pub String);

/// Supplies output frames
pub trait FrameSource: Send {
    /// Produce exactly `n` frames, or report that the source is exhausted
    fn produce(&mut self, n: usize) -> Result<Vec<SampleFrame>, SourceExhausted>;
}

impl<F> FrameSource for F
where
    F: FnMut(usize) -> Result<Vec<SampleFrame>, SourceExhausted> + Send,
{
    fn produce(&mut self, n: usize) -> Result<Vec<SampleFrame>, SourceExhausted> {
        self(n)
    }
}

/// Receives acquired frames
pub trait FrameConsumer: Send {
    /// Accept one batch of frames, in acquisition order
    fn deliver(&mut self, frames: &[SampleFrame]) -> Result<(), ConsumerError>;
}

impl<F> FrameConsumer for F
where
    F: FnMut(&[SampleFrame]) -> Result<(), ConsumerError> + Send,
{
    fn deliver(&mut self, frames: &[SampleFrame]) -> Result<(), ConsumerError> {
        self(frames)
    }
}

/// One delivered batch, as seen on the receiving side of a [`ChannelConsumer`]
#[derive(Debug, Clone)]
pub struct AcquiredBatch {
    /// Batch number, starting at 0
    pub sequence: u64,
    /// Index of the first frame since the task started
    pub first_frame: u64,
    pub frames: Vec<SampleFrame>,
    /// Wall-clock time the batch left the notification handler
    pub received_at: DateTime<Utc>,
}

/// Consumer that hands batches to another thread over a bounded channel
///
/// Uses `try_send` so the notification handler never blocks; a full channel
/// is reported as a consumer error, which stops the task.
pub struct ChannelConsumer {
    tx: Sender<AcquiredBatch>,
    sequence: u64,
    frames_seen: u64,
}

impl ChannelConsumer {
    /// Create a consumer and the receiver for its batches
    pub fn bounded(capacity: usize) -> (Self, Receiver<AcquiredBatch>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (
            Self {
                tx,
                sequence: 0,
                frames_seen: 0,
            },
            rx,
        )
    }
}

impl FrameConsumer for ChannelConsumer {
    fn deliver(&mut self, frames: &[SampleFrame]) -> Result<(), ConsumerError> {
        let batch = AcquiredBatch {
            sequence: self.sequence,
            first_frame: self.frames_seen,
            frames: frames.to_vec(),
            received_at: Utc::now(),
        };
        match self.tx.try_send(batch) {
            Ok(()) => {
                self.sequence += 1;
                self.frames_seen += frames.len() as u64;
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(ConsumerError(format!(
                "batch {} dropped: receiver is not keeping up",
                self.sequence
            ))),
            Err(TrySendError::Disconnected(_)) => {
                Err(ConsumerError("batch receiver was dropped".to_string()))
            }
        }
    }
}

/// Finite source over a prepared list of frames
#[derive(Debug, Clone)]
pub struct FrameSequence {
    frames: Vec<SampleFrame>,
    position: usize,
}

impl FrameSequence {
    pub fn new(frames: Vec<SampleFrame>) -> Self {
        Self {
            frames,
            position: 0,
        }
    }

    /// Frames not yet produced
    pub fn remaining(&self) -> usize {
        self.frames.len() - self.position
    }
}

impl FrameSource for FrameSequence {
    fn produce(&mut self, n: usize) -> Result<Vec<SampleFrame>, SourceExhausted> {
        if n > self.remaining() {
            return Err(SourceExhausted);
        }
        let batch = self.frames[self.position..self.position + n].to_vec();
        self.position += n;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_consumer_numbers_batches() {
        let (mut consumer, rx) = ChannelConsumer::bounded(4);
        consumer.deliver(&vec![SampleFrame::zeros(1); 3]).unwrap();
        consumer.deliver(&vec![SampleFrame::zeros(1); 2]).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.first_frame, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(second.first_frame, 3);
        assert_eq!(second.frames.len(), 2);
    }

    #[test]
    fn test_channel_consumer_full_is_error() {
        let (mut consumer, _rx) = ChannelConsumer::bounded(1);
        consumer.deliver(&[SampleFrame::zeros(1)]).unwrap();
        assert!(consumer.deliver(&[SampleFrame::zeros(1)]).is_err());
    }

    #[test]
    fn test_channel_consumer_disconnected_is_error() {
        let (mut consumer, rx) = ChannelConsumer::bounded(1);
        drop(rx);
        let err = consumer.deliver(&[SampleFrame::zeros(1)]).unwrap_err();
        assert!(err.0.contains("dropped"));
    }

    #[test]
    fn test_frame_sequence_exhausts() {
        let mut seq = FrameSequence::new(vec![SampleFrame::zeros(1); 5]);
        assert_eq!(seq.produce(3).unwrap().len(), 3);
        assert_eq!(seq.produce(3), Err(SourceExhausted));
        assert_eq!(seq.produce(2).unwrap().len(), 2);
        assert_eq!(seq.remaining(), 0);
    }

    #[test]
    fn test_closure_as_consumer() {
        let mut total = 0usize;
        {
            let mut consumer = |frames: &[SampleFrame]| -> Result<(), ConsumerError> {
                total += frames.len();
                Ok(())
            };
            consumer.deliver(&vec![SampleFrame::zeros(2); 4]).unwrap();
        }
        assert_eq!(total, 4);
    }
}
