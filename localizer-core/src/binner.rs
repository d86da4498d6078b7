//! Per-tag sliding-window binner: the statistical quality gate between ingest and the
//! edge builder.
//!
//! One [`Binner`] instance exists per active tag, created lazily by the coordinator on
//! first insert. `insert` and `emit_bin` both take a brief lock on the internal buffer —
//! the critical section never does anything but compare floats and push/retain on a
//! `VecDeque`, so it never blocks for long.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use uwb_types::{AnchorId, Measurement, TagId, Timestamp, Vec3};

use crate::config::BinnerConfig;
use crate::error::BinnerRejection;

/// A snapshot of recent per-anchor measurements for one tag, the unit of work handed to
/// the edge builder on each solve tick.
#[derive(Debug, Clone)]
pub struct Bin {
    pub tag_id: TagId,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    pub per_anchor: BTreeMap<AnchorId, Vec<Vec3>>,
}

#[derive(Debug, Default)]
pub struct BinnerCounters {
    pub late_drop: AtomicU64,
    pub statistical_outlier: AtomicU64,
    pub variance_too_high: AtomicU64,
}

impl BinnerCounters {
    fn record(&self, rejection: BinnerRejection) {
        let counter = match rejection {
            BinnerRejection::LateDrop => &self.late_drop,
            BinnerRejection::StatisticalOutlier(_) => &self.statistical_outlier,
            BinnerRejection::VarianceTooHigh(_) => &self.variance_too_high,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BinnerCounterSnapshot {
        BinnerCounterSnapshot {
            late_drop: self.late_drop.load(Ordering::Relaxed),
            statistical_outlier: self.statistical_outlier.load(Ordering::Relaxed),
            variance_too_high: self.variance_too_high.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinnerCounterSnapshot {
    pub late_drop: u64,
    pub statistical_outlier: u64,
    pub variance_too_high: u64,
}

pub struct Binner {
    tag_id: TagId,
    config: BinnerConfig,
    buffer: Mutex<VecDeque<Measurement>>,
    pub counters: BinnerCounters,
}

impl Binner {
    pub fn new(tag_id: TagId, config: BinnerConfig) -> Self {
        Self {
            tag_id,
            config,
            buffer: Mutex::new(VecDeque::new()),
            counters: BinnerCounters::default(),
        }
    }

    pub fn tag_id(&self) -> TagId {
        self.tag_id
    }

    /// Insert one measurement, applying the two-stage quality gate predictively — the
    /// variance check looks at what the buffer's statistics *would* become, not what they
    /// currently are.
    pub fn insert(&self, measurement: Measurement) -> Result<(), BinnerRejection> {
        let mut buf = self.buffer.lock().expect("binner buffer mutex poisoned");

        let latest_buffered_ts = buf
            .iter()
            .map(|m| m.timestamp.seconds())
            .fold(f64::NEG_INFINITY, f64::max);
        let now = latest_buffered_ts.max(measurement.timestamp.seconds());
        let window_start = now - self.config.window_seconds;

        if measurement.timestamp.seconds() < window_start {
            self.counters.record(BinnerRejection::LateDrop);
            return Err(BinnerRejection::LateDrop);
        }

        let same_anchor_magnitudes: Vec<f64> = buf
            .iter()
            .filter(|m| m.anchor_id == measurement.anchor_id)
            .map(|m| m.local_vector.norm())
            .collect();

        if same_anchor_magnitudes.len() >= self.config.min_samples_for_outlier_check {
            let (mean, std) = mean_and_std(&same_anchor_magnitudes);
            if std > 0.0 {
                let z = (measurement.local_vector.norm() - mean) / std;
                if z.abs() > self.config.outlier_sigma {
                    let rejection = BinnerRejection::StatisticalOutlier(z);
                    self.counters.record(rejection);
                    return Err(rejection);
                }
            }
        }

        let mut augmented = same_anchor_magnitudes;
        augmented.push(measurement.local_vector.norm());
        let predicted_variance = variance(&augmented);
        if predicted_variance > self.config.max_anchor_variance {
            let rejection = BinnerRejection::VarianceTooHigh(predicted_variance);
            self.counters.record(rejection);
            return Err(rejection);
        }

        buf.push_back(measurement);
        let new_latest = buf
            .iter()
            .map(|m| m.timestamp.seconds())
            .fold(f64::NEG_INFINITY, f64::max);
        let evict_before = new_latest - self.config.window_seconds;
        buf.retain(|m| m.timestamp.seconds() >= evict_before);

        Ok(())
    }

    /// Snapshot the current buffer into a [`Bin`]. Does **not** clear the buffer —
    /// eviction on insert is the sliding window's only retention policy, so consecutive
    /// ticks may legitimately share overlapping measurements.
    pub fn emit_bin(&self) -> Option<Bin> {
        let buf = self.buffer.lock().expect("binner buffer mutex poisoned");
        if buf.is_empty() {
            return None;
        }

        let mut per_anchor: BTreeMap<AnchorId, Vec<Vec3>> = BTreeMap::new();
        let mut min_ts = f64::INFINITY;
        let mut max_ts = f64::NEG_INFINITY;

        for m in buf.iter() {
            per_anchor.entry(m.anchor_id).or_default().push(m.local_vector);
            min_ts = min_ts.min(m.timestamp.seconds());
            max_ts = max_ts.max(m.timestamp.seconds());
        }

        Some(Bin {
            tag_id: self.tag_id,
            start_ts: Timestamp(min_ts),
            end_ts: Timestamp(max_ts),
            per_anchor,
        })
    }

    #[cfg(test)]
    fn buffered_len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn variance(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}
