// SPDX-License-Identifier: Apache-2.0

//! Single-owner task wrapping the [`Aggregator`].
//!
//! Ingestion and flush both go through one command channel, so metric
//! mutation is serialized without any shared lock and a flush observes (and
//! resets) a consistent window: an event lands in exactly one snapshot,
//! never zero or two.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::aggregator::{Aggregator, Sample, StatsSnapshot};

#[derive(Debug)]
pub enum AggregatorCommand {
    InsertBatch(Vec<Sample>),
    Flush(oneshot::Sender<StatsSnapshot>),
    Dump(oneshot::Sender<String>),
    Shutdown,
}

#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<AggregatorCommand>,
}

impl AggregatorHandle {
    pub fn insert_batch(
        &self,
        samples: Vec<Sample>,
    ) -> Result<(), mpsc::error::SendError<AggregatorCommand>> {
        self.tx.send(AggregatorCommand::InsertBatch(samples))
    }

    /// Snapshot-and-reset the aggregator. The returned snapshot is the only
    /// copy of the window's data; dropping it loses the cycle.
    pub async fn flush(&self) -> Result<StatsSnapshot, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand::Flush(response_tx))
            .map_err(|e| format!("Failed to send flush command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {}", e))
    }

    /// Read-only rendering of the current aggregate maps for the debug
    /// dump. Does not reset anything.
    pub async fn dump_state(&self) -> Result<String, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand::Dump(response_tx))
            .map_err(|e| format!("Failed to send dump command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive dump response: {}", e))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<AggregatorCommand>> {
        self.tx.send(AggregatorCommand::Shutdown)
    }
}

pub struct AggregatorService {
    aggregator: Aggregator,
    flush_interval: Duration,
    pct_threshold: u8,
    rx: mpsc::UnboundedReceiver<AggregatorCommand>,
}

impl AggregatorService {
    /// `flush_interval` is the stats window length (used for per-second
    /// normalization); `pct_threshold` the timer trimming percentile.
    #[must_use]
    pub fn new(flush_interval: Duration, pct_threshold: u8) -> (Self, AggregatorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        let service = Self {
            aggregator: Aggregator::new(),
            flush_interval,
            pct_threshold,
            rx,
        };

        let handle = AggregatorHandle { tx };

        (service, handle)
    }

    pub async fn run(mut self) {
        debug!("Aggregator service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                AggregatorCommand::InsertBatch(samples) => {
                    for sample in samples {
                        self.aggregator.record(sample);
                    }
                }

                AggregatorCommand::Flush(response_tx) => {
                    let snapshot = self
                        .aggregator
                        .snapshot_and_reset(self.flush_interval, self.pct_threshold);
                    if response_tx.send(snapshot).is_err() {
                        error!("Failed to send flush response - receiver dropped");
                    }
                }

                AggregatorCommand::Dump(response_tx) => {
                    if response_tx.send(format!("{:?}", self.aggregator)).is_err() {
                        error!("Failed to send dump response - receiver dropped");
                    }
                }

                AggregatorCommand::Shutdown => {
                    debug!("Aggregator service shutting down");
                    break;
                }
            }
        }

        debug!("Aggregator service stopped");
    }
}
