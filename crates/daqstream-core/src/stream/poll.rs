//! Software-timed acquisition
//!
//! No sample clock and no device buffer: the host asks for one frame at a
//! time and the device samples on demand. Timing jitter is whatever the host
//! scheduler gives us, so this is only suited to slow monitoring.

use crate::driver::{ChannelSpec, DriverAdapter, DriverHandle};
use crate::stream::callback::FrameConsumer;
use crate::stream::channels::{ChannelSet, Direction};
use crate::stream::error::StreamError;
use crate::stream::frame::SampleFrame;
use crate::stream::shutdown::ShutdownSignal;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Polls single frames and keeps a rolling window of the latest ones
pub struct SoftwarePoller {
    name: String,
    driver: Arc<dyn DriverAdapter>,
    handle: Option<DriverHandle>,
    width: usize,
    window: HeapRb<SampleFrame>,
    polls: u64,
}

impl SoftwarePoller {
    /// Open `channels` for on-demand reads, keeping the last `window` frames
    pub fn open(
        driver: Arc<dyn DriverAdapter>,
        name: &str,
        channels: ChannelSet,
        window: usize,
    ) -> Result<Self, StreamError> {
        channels.validate()?;
        if window == 0 {
            return Err(StreamError::InvalidBufferCapacity(window));
        }
        let width = channels.len();
        let handle = driver
            .open(&ChannelSpec {
                name: name.to_string(),
                direction: Direction::Input,
                channels,
            })
            .map_err(StreamError::from_start)?;
        tracing::debug!(poller = name, %handle, window, "Software poller opened");

        Ok(Self {
            name: name.to_string(),
            driver,
            handle: Some(handle),
            width,
            window: HeapRb::new(window),
            polls: 0,
        })
    }

    /// Read one frame now
    pub fn poll_once(&mut self) -> Result<SampleFrame, StreamError> {
        let handle = self.handle.ok_or_else(|| StreamError::UseAfterClose(self.name.clone()))?;
        let frame = self
            .driver
            .read(handle, 1)?
            .pop()
            .ok_or_else(|| StreamError::NotificationHandlerError("empty read".to_string()))?;
        if frame.width() != self.width {
            return Err(StreamError::FrameWidthMismatch {
                expected: self.width,
                actual: frame.width(),
            });
        }
        self.window.push_overwrite(frame.clone());
        self.polls += 1;
        Ok(frame)
    }

    /// Poll every `interval` until `shutdown` fires or `max_polls` is reached
    ///
    /// Each frame is handed to `consumer` as a one-frame batch. Returns the
    /// number of frames read by this call.
    pub fn run<C: FrameConsumer + ?Sized>(
        &mut self,
        interval: Duration,
        shutdown: &ShutdownSignal,
        max_polls: Option<u64>,
        consumer: &mut C,
    ) -> Result<u64, StreamError> {
        let mut count = 0;
        loop {
            if max_polls.is_some_and(|max| count >= max) {
                break;
            }
            let frame = self.poll_once()?;
            consumer
                .deliver(std::slice::from_ref(&frame))
                .map_err(|e| StreamError::NotificationHandlerError(e.0))?;
            count += 1;
            if shutdown.wait_timeout(interval) {
                break;
            }
        }
        tracing::info!(poller = %self.name, count, "Software polling finished");
        Ok(count)
    }

    /// Poll on a background thread until `shutdown` fires
    ///
    /// The thread hands the poller back when it finishes, so the rolling
    /// window can be inspected afterwards.
    pub fn spawn<C: FrameConsumer + 'static>(
        mut self,
        interval: Duration,
        shutdown: ShutdownSignal,
        mut consumer: C,
    ) -> std::io::Result<JoinHandle<Result<SoftwarePoller, StreamError>>> {
        thread::Builder::new()
            .name(format!("poll-{}", self.name))
            .spawn(move || {
                self.run(interval, &shutdown, None, &mut consumer)?;
                Ok(self)
            })
    }

    /// Frames in the rolling window, oldest first
    pub fn window(&self) -> Vec<SampleFrame> {
        self.window.iter().cloned().collect()
    }

    /// Most recent frame
    pub fn latest(&self) -> Option<SampleFrame> {
        self.window.iter().last().cloned()
    }

    /// Frames currently held in the window
    pub fn window_len(&self) -> usize {
        self.window.occupied_len()
    }

    /// Frames read since opening
    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// Release the channels
    pub fn close(&mut self) -> Result<(), StreamError> {
        match self.handle.take() {
            Some(handle) => Ok(self.driver.close(handle)?),
            None => Ok(()),
        }
    }
}

impl Drop for SoftwarePoller {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(poller = %self.name, "Error closing poller: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::{SimSignal, SimulatedDriver};
    use crate::stream::callback::{ChannelConsumer, ConsumerError};

    #[test]
    fn test_window_keeps_latest_frames() {
        let sim = Arc::new(SimulatedDriver::new("Dev1"));
        sim.set_channel_signal("ai0", SimSignal::Ramp { step: 1.0 });
        let mut poller =
            SoftwarePoller::open(sim.clone(), "monitor", ChannelSet::analog(&["ai0"]), 3).unwrap();

        for _ in 0..5 {
            poller.poll_once().unwrap();
        }
        let values: Vec<f64> = poller.window().iter().filter_map(|f| f.value(0)).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert_eq!(poller.latest().and_then(|f| f.value(0)), Some(4.0));
        assert_eq!(poller.polls(), 5);
    }

    #[test]
    fn test_run_stops_at_max_polls() {
        let sim = Arc::new(SimulatedDriver::new("Dev1"));
        let mut poller =
            SoftwarePoller::open(sim.clone(), "monitor", ChannelSet::analog(&["ai0"]), 10).unwrap();
        let shutdown = ShutdownSignal::new();
        let mut seen = 0usize;
        let mut consumer = |frames: &[SampleFrame]| -> Result<(), ConsumerError> {
            seen += frames.len();
            Ok(())
        };
        let count = poller
            .run(Duration::ZERO, &shutdown, Some(4), &mut consumer)
            .unwrap();
        assert_eq!(count, 4);
        assert_eq!(seen, 4);
        assert_eq!(poller.window_len(), 4);
    }

    #[test]
    fn test_spawned_poller_stops_on_shutdown() {
        let sim = Arc::new(SimulatedDriver::new("Dev1"));
        let poller =
            SoftwarePoller::open(sim.clone(), "monitor", ChannelSet::analog(&["ai0"]), 100).unwrap();
        let shutdown = ShutdownSignal::new();
        let (consumer, rx) = ChannelConsumer::bounded(1000);
        let worker = poller
            .spawn(Duration::from_millis(1), shutdown.clone(), consumer)
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        shutdown.trigger();
        let poller = worker.join().unwrap().unwrap();
        assert!(poller.polls() > 0);
        assert_eq!(rx.try_iter().count() as u64, poller.polls());
    }

    #[test]
    fn test_close_releases_handle() {
        let sim = Arc::new(SimulatedDriver::new("Dev1"));
        let mut poller =
            SoftwarePoller::open(sim.clone(), "monitor", ChannelSet::analog(&["ai0"]), 2).unwrap();
        poller.close().unwrap();
        assert_eq!(sim.open_handles(), 0);
        assert!(matches!(
            poller.poll_once(),
            Err(StreamError::UseAfterClose(_))
        ));
    }
}
