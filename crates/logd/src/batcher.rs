// SPDX-License-Identifier: Apache-2.0

//! Per-path buffering of log events between flushes.
//!
//! The batcher sits between the ingest server and the store: appends are
//! cheap synchronous queue pushes, and the scheduler periodically detaches
//! whole queues for asynchronous persistence. `drain_all` swaps each buffer
//! out before handing it over (clear-before-handoff), so an event is
//! delivered to the store exactly once even though the append that follows
//! is asynchronous. Failed batches are requeued at the front, keeping
//! per-path arrival order intact.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::event::LogEvent;

/// Maximum buffered events per path before oldest-first eviction.
///
/// If the store is down long enough for a queue to hit this cap, the oldest
/// entries are dropped with a warning rather than growing without bound.
const MAX_PATH_QUEUE_SIZE: usize = 50_000;

#[derive(Debug)]
pub struct Batcher {
    queues: HashMap<String, VecDeque<LogEvent>>,
    max_queue_size: usize,
}

impl Default for Batcher {
    fn default() -> Self {
        Batcher {
            queues: HashMap::new(),
            max_queue_size: MAX_PATH_QUEUE_SIZE,
        }
    }
}

impl Batcher {
    #[must_use]
    pub fn with_queue_size(max_queue_size: usize) -> Self {
        Batcher {
            queues: HashMap::new(),
            max_queue_size,
        }
    }

    /// Buffers one event at the tail of its path's queue.
    pub fn append(&mut self, event: LogEvent) {
        let queue = self.queues.entry(event.path.clone()).or_default();
        if queue.len() >= self.max_queue_size {
            warn!(path = %event.path, "log queue full, evicting oldest entry");
            queue.pop_front();
        }
        queue.push_back(event);
    }

    /// Puts a batch that failed to persist back at the front of its queue,
    /// ahead of anything that arrived since the drain. The cap is not
    /// enforced here; a requeued batch was already counted once.
    pub fn requeue(&mut self, path: &str, events: Vec<LogEvent>) {
        let queue = self.queues.entry(path.to_string()).or_default();
        for event in events.into_iter().rev() {
            queue.push_front(event);
        }
    }

    /// Detaches every non-empty queue and returns the batches. The path keys
    /// stay registered with empty queues, mirroring how counter keys persist
    /// across stats flushes.
    pub fn drain_all(&mut self) -> Vec<(String, Vec<LogEvent>)> {
        self.queues
            .iter_mut()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(path, queue)| (path.clone(), Vec::from(std::mem::take(queue))))
            .collect()
    }

    /// Total events currently buffered across all paths.
    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

#[derive(Debug)]
pub enum BatcherCommand {
    Append(LogEvent),
    Requeue {
        path: String,
        events: Vec<LogEvent>,
    },
    Drain(oneshot::Sender<Vec<(String, Vec<LogEvent>)>>),
    Shutdown,
}

#[derive(Clone)]
pub struct BatcherHandle {
    tx: mpsc::UnboundedSender<BatcherCommand>,
}

impl BatcherHandle {
    pub fn append(
        &self,
        event: LogEvent,
    ) -> Result<(), mpsc::error::SendError<BatcherCommand>> {
        self.tx.send(BatcherCommand::Append(event))
    }

    pub fn requeue(
        &self,
        path: String,
        events: Vec<LogEvent>,
    ) -> Result<(), mpsc::error::SendError<BatcherCommand>> {
        self.tx.send(BatcherCommand::Requeue { path, events })
    }

    /// Atomically detaches all buffered batches.
    pub async fn drain(&self) -> Result<Vec<(String, Vec<LogEvent>)>, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(BatcherCommand::Drain(response_tx))
            .map_err(|e| format!("Failed to send drain command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive drain response: {}", e))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<BatcherCommand>> {
        self.tx.send(BatcherCommand::Shutdown)
    }
}

/// Single-owner task serializing batcher mutation, same shape as the
/// aggregator service.
pub struct BatcherService {
    batcher: Batcher,
    rx: mpsc::UnboundedReceiver<BatcherCommand>,
}

impl BatcherService {
    #[must_use]
    pub fn new() -> (Self, BatcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        let service = Self {
            batcher: Batcher::default(),
            rx,
        };

        let handle = BatcherHandle { tx };

        (service, handle)
    }

    pub async fn run(mut self) {
        debug!("Batcher service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                BatcherCommand::Append(event) => self.batcher.append(event),

                BatcherCommand::Requeue { path, events } => {
                    self.batcher.requeue(&path, events);
                }

                BatcherCommand::Drain(response_tx) => {
                    let batches = self.batcher.drain_all();
                    if response_tx.send(batches).is_err() {
                        error!("Failed to send drain response - receiver dropped");
                    }
                }

                BatcherCommand::Shutdown => {
                    debug!("Batcher service shutting down");
                    break;
                }
            }
        }

        debug!("Batcher service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogMetadata;

    fn log(path: &str, message: &str) -> LogEvent {
        LogEvent {
            path: path.to_string(),
            level: "INFO".to_string(),
            name: "test".to_string(),
            time: 1_700_000_000.0,
            message: message.to_string(),
            metadata: LogMetadata::default(),
        }
    }

    #[test]
    fn test_append_and_drain_preserves_order() {
        let mut batcher = Batcher::default();
        batcher.append(log("a", "1"));
        batcher.append(log("b", "x"));
        batcher.append(log("a", "2"));

        let mut batches = batcher.drain_all();
        batches.sort_by(|(p1, _), (p2, _)| p1.cmp(p2));

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, "a");
        let messages: Vec<&str> = batches[0].1.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["1", "2"]);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn test_drain_detaches_buffer() {
        let mut batcher = Batcher::default();
        batcher.append(log("a", "1"));

        let first = batcher.drain_all();
        assert_eq!(first.len(), 1);

        // The handed-off batch is gone; a second drain sees nothing.
        assert!(batcher.drain_all().is_empty());

        // New appends after the handoff land in a fresh buffer.
        batcher.append(log("a", "2"));
        let second = batcher.drain_all();
        assert_eq!(second[0].1.len(), 1);
        assert_eq!(second[0].1[0].message, "2");
    }

    #[test]
    fn test_requeue_goes_ahead_of_new_arrivals() {
        let mut batcher = Batcher::default();
        batcher.append(log("a", "1"));
        batcher.append(log("a", "2"));

        let batches = batcher.drain_all();
        let failed = batches.into_iter().next().expect("missing batch").1;

        // Something new arrives while the failed batch is in flight.
        batcher.append(log("a", "3"));
        batcher.requeue("a", failed);

        let replayed = batcher.drain_all();
        let messages: Vec<&str> = replayed[0].1.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_queue_cap_evicts_oldest() {
        let mut batcher = Batcher::with_queue_size(3);
        for i in 0..5 {
            batcher.append(log("a", &i.to_string()));
        }

        let batches = batcher.drain_all();
        let messages: Vec<&str> = batches[0].1.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_batcher_service_flow() {
        let (service, handle) = BatcherService::new();
        let service_task = tokio::spawn(service.run());

        handle.append(log("a", "1")).expect("append failed");
        handle.append(log("a", "2")).expect("append failed");

        let batches = handle.drain().await.expect("drain failed");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 2);

        let empty = handle.drain().await.expect("drain failed");
        assert!(empty.is_empty());

        handle.shutdown().expect("shutdown failed");
        service_task.await.expect("service task failed");
    }
}
