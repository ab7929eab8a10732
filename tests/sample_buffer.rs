//! Sample buffer behaviour seen from outside the crate
//!
//! Covers the transfer scenarios a task relies on: plain FIFO transfer,
//! overflow and underrun without side effects, and regeneration replay.

use daqstream::{SampleBuffer, SampleFrame, StreamError};

fn ramp(range: std::ops::Range<usize>) -> Vec<SampleFrame> {
    range.map(|i| SampleFrame::analog(&[i as f64])).collect()
}

fn values(frames: &[SampleFrame]) -> Vec<f64> {
    frames.iter().filter_map(|f| f.value(0)).collect()
}

/// Test that frames come out in the order they went in, across the wrap point
#[test]
fn test_fifo_order_across_wrap() {
    let mut buffer = SampleBuffer::new(4, false).unwrap();
    let mut out = Vec::new();
    for chunk in [0..3, 3..6, 6..9] {
        buffer.write(&ramp(chunk)).unwrap();
        out.extend(buffer.read(3).unwrap());
    }
    assert_eq!(values(&out), (0..9).map(|i| i as f64).collect::<Vec<_>>());
    assert_eq!(buffer.total_written(), 9);
    assert_eq!(buffer.total_read(), 9);
}

/// Test that fill level plus free space always equals capacity
#[test]
fn test_fill_and_free_space() {
    let mut buffer = SampleBuffer::new(100, false).unwrap();
    buffer.write(&ramp(0..30)).unwrap();
    buffer.read(10).unwrap();

    assert_eq!(buffer.peek_fill_level(), 20);
    assert_eq!(buffer.free_space(), 80);
    assert_eq!(
        buffer.peek_fill_level() + buffer.free_space(),
        buffer.capacity()
    );
}

/// Test that an oversized write is rejected whole
#[test]
fn test_overflow_rejects_whole_write() {
    let mut buffer = SampleBuffer::new(10, false).unwrap();
    buffer.write(&ramp(0..8)).unwrap();

    let result = buffer.write(&ramp(8..13));
    assert_eq!(
        result,
        Err(StreamError::BufferOverflow {
            requested: 5,
            free: 2
        })
    );
    assert_eq!(buffer.peek_fill_level(), 8, "Nothing from the failed write lands");
    assert_eq!(values(&buffer.read(8).unwrap())[7], 7.0);
}

/// Test that reading more than is available consumes nothing
#[test]
fn test_underrun_consumes_nothing() {
    let mut buffer = SampleBuffer::new(10, false).unwrap();
    buffer.write(&ramp(0..4)).unwrap();

    assert_eq!(
        buffer.read(5),
        Err(StreamError::BufferUnderrun {
            requested: 5,
            available: 4
        })
    );
    assert_eq!(values(&buffer.read(4).unwrap()), vec![0.0, 1.0, 2.0, 3.0]);
}

/// Test that a regenerating buffer replays its contents and keeps its offset
#[test]
fn test_regeneration_replays_with_offset() {
    let mut buffer = SampleBuffer::new(100, true).unwrap();
    buffer.write(&ramp(0..100)).unwrap();

    let out = buffer.read(250).unwrap();
    assert_eq!(out.len(), 250);
    for (i, frame) in out.iter().enumerate() {
        assert_eq!(frame.value(0), Some((i % 100) as f64), "Frame {} out of cycle", i);
    }
    assert_eq!(buffer.read_offset(), 50);
    assert_eq!(buffer.peek_fill_level(), 100, "Regeneration never drains");
}

/// Test that a regenerating buffer with nothing written under-runs
#[test]
fn test_empty_regeneration_underruns() {
    let mut buffer = SampleBuffer::new(8, true).unwrap();
    assert!(matches!(
        buffer.read(1),
        Err(StreamError::BufferUnderrun { available: 0, .. })
    ));
}

/// Test that zero capacity is refused
#[test]
fn test_zero_capacity_rejected() {
    assert_eq!(
        SampleBuffer::new(0, false).err(),
        Some(StreamError::InvalidBufferCapacity(0))
    );
}
