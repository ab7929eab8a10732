//! Ring buffer of sample frames
//!
//! `SampleBuffer` is the double-buffering store between a task and its
//! adapter. It tracks a write cursor and a read cursor as running totals, so
//! the fill level is always `total_written - total_read` and frames are handed
//! out in strict sequence order.
//!
//! With regeneration enabled the buffer behaves like a device output buffer
//! in regeneration mode: reads never consume, the read cursor wraps over the
//! committed frames and replays them indefinitely, and writes overwrite the
//! oldest frames instead of overflowing.

use crate::stream::error::StreamError;
use crate::stream::frame::SampleFrame;

/// Circular store of [`SampleFrame`]s with fixed capacity
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    /// Frame storage, grows up to `capacity` and is then reused in place
    slots: Vec<SampleFrame>,
    /// Maximum number of frames held
    capacity: usize,
    /// Total frames ever written (write cursor)
    write_pos: u64,
    /// Total frames ever read (read cursor)
    read_pos: u64,
    /// Replay committed frames instead of under-running
    regeneration: bool,
}

impl SampleBuffer {
    /// Create an empty buffer
    ///
    /// # Errors
    /// `InvalidBufferCapacity` if `capacity` is zero.
    pub fn new(capacity: usize, regeneration: bool) -> Result<Self, StreamError> {
        if capacity == 0 {
            return Err(StreamError::InvalidBufferCapacity(capacity));
        }
        Ok(Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            write_pos: 0,
            read_pos: 0,
            regeneration,
        })
    }

    /// Append frames at the write cursor
    ///
    /// Without regeneration the whole batch is rejected with `BufferOverflow`
    /// if it does not fit in the space the reader has drained. With
    /// regeneration the oldest frames are overwritten.
    pub fn write(&mut self, frames: &[SampleFrame]) -> Result<usize, StreamError> {
        if !self.regeneration {
            let free = self.free_space();
            if frames.len() > free {
                return Err(StreamError::BufferOverflow {
                    requested: frames.len(),
                    free,
                });
            }
        }

        for frame in frames {
            let idx = (self.write_pos % self.capacity as u64) as usize;
            if idx == self.slots.len() {
                self.slots.push(frame.clone());
            } else {
                self.slots[idx] = frame.clone();
            }
            self.write_pos += 1;
        }

        Ok(frames.len())
    }

    /// Read exactly `count` frames starting at the read cursor
    ///
    /// Without regeneration, fails with `BufferUnderrun` if fewer than
    /// `count` frames are available. With regeneration the cursor wraps over
    /// the committed frames; it only under-runs if nothing was ever written.
    pub fn read(&mut self, count: usize) -> Result<Vec<SampleFrame>, StreamError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        if self.regeneration {
            let committed = self.committed();
            if committed == 0 {
                return Err(StreamError::BufferUnderrun {
                    requested: count,
                    available: 0,
                });
            }
            let frames = (0..count as u64)
                .map(|i| self.slots[((self.read_pos + i) % committed as u64) as usize].clone())
                .collect();
            self.read_pos += count as u64;
            return Ok(frames);
        }

        let available = self.peek_fill_level();
        if count > available {
            return Err(StreamError::BufferUnderrun {
                requested: count,
                available,
            });
        }

        let frames = (0..count as u64)
            .map(|i| self.slots[((self.read_pos + i) % self.capacity as u64) as usize].clone())
            .collect();
        self.read_pos += count as u64;
        Ok(frames)
    }

    /// Read whatever is available without under-running
    ///
    /// A regenerating buffer never runs dry, so this returns nothing for it.
    pub fn drain_available(&mut self) -> Vec<SampleFrame> {
        if self.regeneration {
            return Vec::new();
        }
        let available = self.peek_fill_level();
        self.read(available).unwrap_or_default()
    }

    /// Frames currently readable (committed frames when regenerating)
    #[inline]
    pub fn peek_fill_level(&self) -> usize {
        if self.regeneration {
            self.committed()
        } else {
            (self.write_pos - self.read_pos) as usize
        }
    }

    /// Frames that can be written without overflowing
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity - self.peek_fill_level()
    }

    /// Maximum number of frames held
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether reads replay committed frames
    pub fn is_regenerating(&self) -> bool {
        self.regeneration
    }

    /// Position of the read cursor within the replayed cycle
    pub fn read_offset(&self) -> usize {
        match self.committed() {
            0 => 0,
            committed if self.regeneration => (self.read_pos % committed as u64) as usize,
            _ => (self.read_pos % self.capacity as u64) as usize,
        }
    }

    /// Total frames ever written
    pub fn total_written(&self) -> u64 {
        self.write_pos
    }

    /// Total frames ever read
    pub fn total_read(&self) -> u64 {
        self.read_pos
    }

    /// Fill level as a fraction of capacity (for monitoring)
    pub fn fill_ratio(&self) -> f64 {
        self.peek_fill_level() as f64 / self.capacity as f64
    }

    /// Drop all frames and reset both cursors
    pub fn clear(&mut self) {
        self.slots.clear();
        self.write_pos = 0;
        self.read_pos = 0;
    }

    /// Frames held in storage
    fn committed(&self) -> usize {
        self.write_pos.min(self.capacity as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: usize, len: usize) -> Vec<SampleFrame> {
        (start..start + len)
            .map(|i| SampleFrame::analog(&[i as f64]))
            .collect()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            SampleBuffer::new(0, false).unwrap_err(),
            StreamError::InvalidBufferCapacity(0)
        );
    }

    #[test]
    fn test_write_then_read_preserves_order() {
        let mut buf = SampleBuffer::new(8, false).unwrap();
        let frames = ramp(0, 5);
        assert_eq!(buf.write(&frames).unwrap(), 5);
        assert_eq!(buf.peek_fill_level(), 5);
        assert_eq!(buf.read(5).unwrap(), frames);
        assert_eq!(buf.peek_fill_level(), 0);
    }

    #[test]
    fn test_wraps_around_capacity() {
        let mut buf = SampleBuffer::new(4, false).unwrap();
        buf.write(&ramp(0, 4)).unwrap();
        assert_eq!(buf.read(2).unwrap(), ramp(0, 2));

        buf.write(&ramp(4, 2)).unwrap();
        assert_eq!(buf.read(4).unwrap(), ramp(2, 4));
    }

    #[test]
    fn test_overflow_rejects_whole_batch() {
        let mut buf = SampleBuffer::new(4, false).unwrap();
        buf.write(&ramp(0, 3)).unwrap();

        let err = buf.write(&ramp(3, 2)).unwrap_err();
        assert_eq!(
            err,
            StreamError::BufferOverflow {
                requested: 2,
                free: 1
            }
        );
        // Nothing from the rejected batch was committed
        assert_eq!(buf.total_written(), 3);
    }

    #[test]
    fn test_underrun_without_regeneration() {
        let mut buf = SampleBuffer::new(4, false).unwrap();
        buf.write(&ramp(0, 2)).unwrap();
        assert_eq!(
            buf.read(3).unwrap_err(),
            StreamError::BufferUnderrun {
                requested: 3,
                available: 2
            }
        );
        // Failed read leaves the cursor alone
        assert_eq!(buf.read(2).unwrap(), ramp(0, 2));
    }

    #[test]
    fn test_regeneration_replays_cycle() {
        let mut buf = SampleBuffer::new(100, true).unwrap();
        buf.write(&vec![SampleFrame::zeros(1); 100]).unwrap();

        let frames = buf.read(250).unwrap();
        assert_eq!(frames.len(), 250);
        assert!(frames.iter().all(|f| *f == SampleFrame::zeros(1)));
        assert_eq!(buf.read_offset(), 50);
    }

    #[test]
    fn test_regeneration_partial_cycle_wraps_to_oldest() {
        let mut buf = SampleBuffer::new(10, true).unwrap();
        buf.write(&ramp(0, 3)).unwrap();

        let expected: Vec<SampleFrame> = [0, 1, 2, 0, 1, 2, 0]
            .iter()
            .map(|&v| SampleFrame::analog(&[v as f64]))
            .collect();
        assert_eq!(buf.read(7).unwrap(), expected);
    }

    #[test]
    fn test_regeneration_overwrites_instead_of_overflowing() {
        let mut buf = SampleBuffer::new(4, true).unwrap();
        buf.write(&ramp(0, 4)).unwrap();
        assert_eq!(buf.write(&ramp(4, 2)).unwrap(), 2);
        assert_eq!(buf.peek_fill_level(), 4);
        assert_eq!(buf.read(4).unwrap(), {
            let mut v = ramp(4, 2);
            v.extend(ramp(2, 2));
            v
        });
    }

    #[test]
    fn test_regeneration_empty_buffer_underruns() {
        let mut buf = SampleBuffer::new(4, true).unwrap();
        assert!(matches!(
            buf.read(1),
            Err(StreamError::BufferUnderrun { available: 0, .. })
        ));
    }

    #[test]
    fn test_drain_available() {
        let mut buf = SampleBuffer::new(8, false).unwrap();
        buf.write(&ramp(0, 3)).unwrap();
        assert_eq!(buf.drain_available(), ramp(0, 3));
        assert!(buf.drain_available().is_empty());
    }

    #[test]
    fn test_clear_resets_cursors() {
        let mut buf = SampleBuffer::new(4, false).unwrap();
        buf.write(&ramp(0, 3)).unwrap();
        buf.read(1).unwrap();
        buf.clear();
        assert_eq!(buf.peek_fill_level(), 0);
        assert_eq!(buf.total_written(), 0);
        assert_eq!(buf.free_space(), 4);
    }
}
