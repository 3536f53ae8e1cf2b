// SPDX-License-Identifier: Apache-2.0

//! Stats delivery to a Graphite-style plaintext sink.
//!
//! Each flush renders the snapshot into newline-delimited `stats.*` lines
//! and writes the whole payload over one short-lived TCP connection.
//! Delivery is best-effort with bounded retry: by the time the sink is
//! invoked the aggregator has already been reset, so a cycle that cannot be
//! delivered is logged and lost rather than blocking the next tick.

use std::fmt::Write as _;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::aggregator::StatsSnapshot;
use crate::errors::SinkError;
use crate::util::now_unix_secs;

/// Bounded retry policy for sink writes.
#[derive(Debug, Clone, Copy)]
pub enum RetryStrategy {
    /// Retry immediately, up to the given number of attempts.
    Immediate(u64),
    /// Retry up to `attempts` times, sleeping `delay_secs * attempt` between
    /// tries.
    LinearBackoff(u64, u64),
}

impl RetryStrategy {
    fn attempts(&self) -> u64 {
        match self {
            RetryStrategy::Immediate(attempts) => (*attempts).max(1),
            RetryStrategy::LinearBackoff(attempts, _) => (*attempts).max(1),
        }
    }

    async fn wait(&self, attempt: u64) {
        if let RetryStrategy::LinearBackoff(_, delay_secs) = self {
            sleep(Duration::from_secs(delay_secs * attempt)).await;
        }
    }
}

pub struct StatsSink {
    addr: String,
    retry_strategy: RetryStrategy,
}

impl StatsSink {
    #[must_use]
    pub fn new(host: &str, port: u16, retry_strategy: RetryStrategy) -> Self {
        StatsSink {
            addr: format!("{host}:{port}"),
            retry_strategy,
        }
    }

    /// Renders a snapshot into the plaintext line protocol, one metric per
    /// line, `stats.numStats` as the trailer.
    #[must_use]
    pub fn render(snapshot: &StatsSnapshot, timestamp: i64) -> String {
        let mut out = String::new();

        for counter in &snapshot.counters {
            let _ = writeln!(out, "stats.{} {} {}", counter.key, counter.per_second, timestamp);
            let _ = writeln!(out, "stats.counts.{} {} {}", counter.key, counter.raw, timestamp);
        }

        for meter in &snapshot.meters {
            let _ = writeln!(out, "stats.meters.{} {} {}", meter.key, meter.mean, timestamp);
            let _ = writeln!(out, "stats.mcounts.{} {} {}", meter.key, meter.count, timestamp);
        }

        for timer in &snapshot.timers {
            let key = &timer.key;
            let _ = writeln!(out, "stats.timers.{key}.mean {} {}", timer.mean, timestamp);
            let _ = writeln!(out, "stats.timers.{key}.upper {} {}", timer.upper, timestamp);
            let _ = writeln!(
                out,
                "stats.timers.{key}.upper_{} {} {}",
                snapshot.pct_threshold, timer.upper_at_threshold, timestamp
            );
            let _ = writeln!(out, "stats.timers.{key}.lower {} {}", timer.lower, timestamp);
            let _ = writeln!(out, "stats.timers.{key}.count {} {}", timer.count, timestamp);
        }

        let _ = writeln!(out, "stats.numStats {} {}", snapshot.num_stats(), timestamp);
        out
    }

    /// Delivers one snapshot. Empty snapshots are skipped entirely, matching
    /// the ingest side where idle keys emit nothing.
    pub async fn flush(&self, snapshot: &StatsSnapshot) -> Result<(), SinkError> {
        if snapshot.is_empty() {
            debug!("no stats to flush this cycle");
            return Ok(());
        }

        let payload = Self::render(snapshot, now_unix_secs());
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send(payload.as_bytes()).await {
                Ok(()) => {
                    debug!(
                        num_stats = snapshot.num_stats(),
                        bytes = payload.len(),
                        "stats flushed to sink"
                    );
                    return Ok(());
                }
                Err(e) if attempt < self.retry_strategy.attempts() => {
                    warn!(addr = %self.addr, attempt, "sink write failed, retrying: {e}");
                    self.retry_strategy.wait(attempt).await;
                }
                Err(e) => return Err(SinkError::Io(e)),
            }
        }
    }

    async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.write_all(payload).await?;
        stream.shutdown().await?;
        Ok(())
    }
}
