//! Storage callback.
//!
//! The crate never persists data itself. Downloaded and streamed samples are handed
//! to a [`StorageSink`] one [`Segment`] at a time: a contiguous run of one channel's
//! samples together with its tick range and the information needed to turn ticks
//! into time and raw codes into physical values.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::AppResult;

/// Linear calibration `raw * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Calibration {
    /// Volts (or unit) per code.
    pub scale: f64,
    /// Offset added after scaling.
    pub offset: f64,
}

impl Calibration {
    /// Build a calibration.
    pub fn new(scale: f64, offset: f64) -> Self {
        Self { scale, offset }
    }

    /// Apply to one raw code.
    pub fn apply(&self, raw: i16) -> f64 {
        f64::from(raw) * self.scale + self.offset
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::new(1.0, 0.0)
    }
}

/// A contiguous run of samples of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    /// 1-based channel number on the carrier.
    pub channel: usize,
    /// Raw sample codes.
    pub raw: Vec<i16>,
    /// Calibrated values, same length as `raw`.
    pub values: Vec<f64>,
    /// Tick of the first sample, relative to the trigger.
    pub start_tick: i64,
    /// Tick of the last sample (inclusive).
    pub end_tick: i64,
    /// Sample period in ns.
    pub dt_ns: f64,
    /// Trigger time in ns.
    pub trigger_ns: f64,
    /// Calibration applied to `raw`.
    pub calibration: Calibration,
    /// When the segment was handed over.
    pub received: DateTime<Utc>,
}

impl Segment {
    /// Build a segment, calibrating `raw`.
    ///
    /// `start_tick` is the tick of `raw[0]`; consecutive samples are one tick apart.
    pub fn new(
        channel: usize,
        raw: Vec<i16>,
        start_tick: i64,
        dt_ns: f64,
        trigger_ns: f64,
        calibration: Calibration,
    ) -> Self {
        let values = raw.iter().map(|&r| calibration.apply(r)).collect();
        let end_tick = start_tick + raw.len() as i64 - 1;
        Self {
            channel,
            raw,
            values,
            start_tick,
            end_tick,
            dt_ns,
            trigger_ns,
            calibration,
            received: Utc::now(),
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the segment holds no samples.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Time of `tick` in ns.
    pub fn tick_to_ns(&self, tick: i64) -> f64 {
        tick as f64 * self.dt_ns + self.trigger_ns
    }

    /// Time dimension, one entry per sample.
    pub fn times_ns(&self) -> Vec<f64> {
        (self.start_tick..=self.end_tick)
            .map(|tick| self.tick_to_ns(tick))
            .collect()
    }

    /// Split into pieces of at most `max_samples` samples.
    pub fn split(self, max_samples: usize) -> Vec<Segment> {
        if max_samples == 0 || self.raw.len() <= max_samples {
            return vec![self];
        }
        self.raw
            .chunks(max_samples)
            .enumerate()
            .map(|(i, part)| {
                Segment::new(
                    self.channel,
                    part.to_vec(),
                    self.start_tick + (i * max_samples) as i64,
                    self.dt_ns,
                    self.trigger_ns,
                    self.calibration,
                )
            })
            .collect()
    }
}

/// Receiver of acquired data.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Persist one segment.
    async fn store_segment(&self, segment: Segment) -> AppResult<()>;
}

/// Sink keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    segments: Mutex<Vec<Segment>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every segment received so far.
    pub fn segments(&self) -> Vec<Segment> {
        self.segments.lock().clone()
    }

    /// Number of `store_segment` calls per channel.
    pub fn calls_per_channel(&self) -> BTreeMap<usize, usize> {
        let mut calls = BTreeMap::new();
        for segment in self.segments.lock().iter() {
            *calls.entry(segment.channel).or_insert(0) += 1;
        }
        calls
    }

    /// Total samples received per channel.
    pub fn samples_per_channel(&self) -> BTreeMap<usize, usize> {
        let mut samples = BTreeMap::new();
        for segment in self.segments.lock().iter() {
            *samples.entry(segment.channel).or_insert(0) += segment.len();
        }
        samples
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.segments.lock().clear();
    }
}

#[async_trait]
impl StorageSink for MemorySink {
    async fn store_segment(&self, segment: Segment) -> AppResult<()> {
        tracing::trace!(
            channel = segment.channel,
            samples = segment.len(),
            start = segment.start_tick,
            "segment stored"
        );
        self.segments.lock().push(segment);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_and_time_base() {
        let seg = Segment::new(3, vec![0, 100, -100], -1, 1000.0, 5.0, Calibration::new(0.5, 1.0));
        assert_eq!(seg.values, vec![1.0, 51.0, -49.0]);
        assert_eq!((seg.start_tick, seg.end_tick), (-1, 1));
        assert_eq!(seg.times_ns(), vec![-995.0, 5.0, 1005.0]);
    }

    #[test]
    fn split_keeps_tick_continuity() {
        let seg = Segment::new(1, (0..10).collect(), 100, 1.0, 0.0, Calibration::default());
        let parts = seg.split(4);
        assert_eq!(parts.len(), 3);
        assert_eq!((parts[0].start_tick, parts[0].end_tick), (100, 103));
        assert_eq!((parts[1].start_tick, parts[1].end_tick), (104, 107));
        assert_eq!((parts[2].start_tick, parts[2].end_tick), (108, 109));
        assert_eq!(parts[2].raw, vec![8, 9]);
    }

    #[test]
    fn memory_sink_counts_calls() {
        let sink = MemorySink::new();
        for channel in [1, 1, 2] {
            let segment = Segment::new(channel, vec![0; 5], 0, 1.0, 0.0, Calibration::default());
            tokio_test::block_on(sink.store_segment(segment)).unwrap();
        }
        assert_eq!(sink.calls_per_channel()[&1], 2);
        assert_eq!(sink.samples_per_channel()[&2], 5);
    }
}
