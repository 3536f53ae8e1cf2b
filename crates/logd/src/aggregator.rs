// SPDX-License-Identifier: Apache-2.0

//! Counter, timer, and meter aggregation.
//!
//! Senders may sample: a rate of 0.1 means only one in ten real occurrences
//! was reported, so counters scale each value by `1/rate` and timers weight
//! their sample count the same way to reconstruct true totals. Timer flushes
//! compute percentile-trimmed statistics: the top `(100 - threshold)%` of
//! sorted values is discarded before taking the mean, which keeps a handful
//! of outliers from drowning the signal.
//!
//! The aggregator is an owned instance with no ambient global; reads always
//! happen through [`Aggregator::snapshot_and_reset`], a combined read+reset,
//! so every recorded value lands in exactly one flush window.

use std::time::Duration;

use fnv::FnvHashMap;
use tracing::warn;

/// One metric observation routed from the ingest server.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Counter { key: String, value: f64, rate: f64 },
    Timer { key: String, value: f64, rate: f64 },
    Meter { key: String, value: f64 },
}

/// Flushed counter: raw accumulated total and per-second normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterStat {
    pub key: String,
    pub raw: f64,
    pub per_second: f64,
}

/// Flushed meter: number of readings and their mean over the window.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterStat {
    pub key: String,
    pub count: u64,
    pub mean: f64,
}

/// Flushed timer statistics for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerStat {
    pub key: String,
    /// Mean of the values remaining after percentile trimming.
    pub mean: f64,
    /// True maximum before trimming.
    pub upper: f64,
    /// Maximum among the values kept by the threshold.
    pub upper_at_threshold: f64,
    pub lower: f64,
    /// Rate-weighted sample count, `Σ 1/rate`.
    pub count: f64,
}

/// The result of one flush cycle: everything accumulated since the last
/// snapshot, captured as the state was atomically reset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub pct_threshold: u8,
    pub counters: Vec<CounterStat>,
    pub meters: Vec<MeterStat>,
    pub timers: Vec<TimerStat>,
}

impl StatsSnapshot {
    pub fn num_stats(&self) -> usize {
        self.counters.len() + self.meters.len() + self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_stats() == 0
    }
}

#[derive(Debug, Default)]
struct TimerBucket {
    values: Vec<f64>,
    rates: Vec<f64>,
}

#[derive(Debug, Default)]
struct MeterEntry {
    count: u64,
    total: f64,
}

/// In-memory metric state. Entries are created lazily on first use and
/// reset, not destroyed, by each stats flush (timer buckets are pruned and
/// recreated on reuse, which is equivalent).
#[derive(Debug, Default)]
pub struct Aggregator {
    counters: FnvHashMap<String, f64>,
    timers: FnvHashMap<String, TimerBucket>,
    meters: FnvHashMap<String, MeterEntry>,
}

impl Aggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: Sample) {
        match sample {
            Sample::Counter { key, value, rate } => self.record_counter(key, value, rate),
            Sample::Timer { key, value, rate } => self.record_timer(key, value, rate),
            Sample::Meter { key, value } => self.record_meter(key, value),
        }
    }

    pub fn record_counter(&mut self, key: String, value: f64, rate: f64) {
        let rate = sanitize_rate(&key, rate);
        *self.counters.entry(key).or_insert(0.0) += value * (1.0 / rate);
    }

    pub fn record_timer(&mut self, key: String, value: f64, rate: f64) {
        let rate = sanitize_rate(&key, rate);
        let value = if value < 0.0 {
            warn!(%key, value, "negative timer duration, clamping to 0");
            0.0
        } else {
            value
        };
        let bucket = self.timers.entry(key).or_default();
        bucket.values.push(value);
        bucket.rates.push(rate);
    }

    pub fn record_meter(&mut self, key: String, value: f64) {
        let entry = self.meters.entry(key).or_default();
        entry.count += 1;
        entry.total += value;
    }

    /// Captures and clears all aggregate state as one step.
    ///
    /// `interval` is the length of the window being flushed and drives the
    /// per-second normalization of counters. Counter and meter keys persist
    /// zeroed; timer keys with no samples emit nothing.
    pub fn snapshot_and_reset(&mut self, interval: Duration, pct_threshold: u8) -> StatsSnapshot {
        let interval_secs = if interval.as_secs_f64() > 0.0 {
            interval.as_secs_f64()
        } else {
            1.0
        };

        let mut snapshot = StatsSnapshot {
            pct_threshold,
            ..StatsSnapshot::default()
        };

        for (key, value) in &mut self.counters {
            snapshot.counters.push(CounterStat {
                key: key.clone(),
                raw: *value,
                per_second: *value / interval_secs,
            });
            *value = 0.0;
        }

        for (key, entry) in &mut self.meters {
            let mean = if entry.count > 0 {
                entry.total / entry.count as f64
            } else {
                0.0
            };
            snapshot.meters.push(MeterStat {
                key: key.clone(),
                count: entry.count,
                mean,
            });
            entry.count = 0;
            entry.total = 0.0;
        }

        for (key, bucket) in std::mem::take(&mut self.timers) {
            if bucket.values.is_empty() {
                continue;
            }
            snapshot
                .timers
                .push(compute_timer_stat(key, bucket, pct_threshold));
        }

        snapshot
    }
}

fn sanitize_rate(key: &str, rate: f64) -> f64 {
    if rate > 0.0 {
        rate
    } else {
        warn!(%key, rate, "non-positive sample rate, treating as 1");
        1.0
    }
}

fn compute_timer_stat(key: String, bucket: TimerBucket, pct_threshold: u8) -> TimerStat {
    let mut values = bucket.values;
    values.sort_by(f64::total_cmp);

    let sample_count = values.len();
    let effective_count: f64 = bucket.rates.iter().map(|rate| 1.0 / rate).sum();
    let lower = values[0];
    let upper = values[sample_count - 1];

    let (mean, upper_at_threshold) = if effective_count > 1.0 {
        // Round half away from zero, per the historical statsd behavior.
        let threshold_index =
            (((100 - pct_threshold as i64) as f64 / 100.0) * sample_count as f64).round() as usize;
        // A degenerate threshold must still keep at least one value.
        let kept = sample_count.saturating_sub(threshold_index).max(1);
        let kept_values = &values[..kept];
        let sum: f64 = kept_values.iter().sum();
        (sum / kept as f64, kept_values[kept - 1])
    } else {
        (lower, upper)
    };

    TimerStat {
        key,
        mean,
        upper,
        upper_at_threshold,
        lower,
        count: effective_count,
    }
}
