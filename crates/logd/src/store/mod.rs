// SPDX-License-Identifier: Apache-2.0

//! Durable, keyed, capped log storage.
//!
//! [`LogStore`] is the capability interface the rest of the daemon writes
//! through; any backing engine that can do keyed appends, level/name
//! secondary indices, capped trims, and whole-path deletes can sit behind
//! it. Backends with native capped collections should let that feature do
//! the trimming rather than re-implementing eviction. The in-process
//! [`memory::MemoryStore`] is the default engine.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::event::{LogEvent, LogMetadata};

/// A persisted log record. `id` is the per-path sequence number: strictly
/// increasing, assigned in arrival order, never reused while the path
/// exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub path: String,
    pub id: u64,
    pub level: String,
    pub name: String,
    pub time: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "LogMetadata::is_empty")]
    pub metadata: LogMetadata,
}

impl LogRecord {
    pub fn from_event(id: u64, event: &LogEvent) -> Self {
        LogRecord {
            path: event.path.clone(),
            id,
            level: event.level.clone(),
            name: event.name.clone(),
            time: event.time,
            message: event.message.clone(),
            metadata: event.metadata.clone(),
        }
    }
}

/// Write-path capability contract for a log storage backend.
///
/// Error contract: an `Err` from [`append`](LogStore::append) means nothing
/// from that call was committed; partial success is reported as `Ok(n)` with
/// `n < events.len()`. Either way the caller re-drives exactly the unwritten
/// suffix on its next tick. Backends handle their own bounded retry/backoff
/// internally so a slow engine cannot stall the scheduler.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Idempotently creates path metadata and a zeroed sequence counter.
    async fn ensure_path(&self, path: &str) -> Result<(), StoreError>;

    /// Appends `events` in arrival order, assigning sequential ids, and
    /// updates the level/name indices and the path's name set. Returns the
    /// number of records committed.
    async fn append(&self, path: &str, events: &[LogEvent]) -> Result<usize, StoreError>;

    /// Evicts oldest records (lowest ids first) until the path holds at most
    /// `max_size`, removing payload and all secondary-index entries for each
    /// evicted id as a pair. Returns the number evicted.
    async fn trim(&self, path: &str, max_size: usize) -> Result<usize, StoreError>;

    /// Removes all records, indices, the name set, and the path metadata.
    /// Not an error if the path does not exist.
    async fn delete_log(&self, path: &str) -> Result<(), StoreError>;

    /// Recomputes each path's distinct `name` set for discoverability. Not
    /// correctness-critical.
    async fn update_aggregates(&self) -> Result<(), StoreError>;

    /// All currently known paths.
    async fn paths(&self) -> Result<Vec<String>, StoreError>;

    /// Number of live records under `path` (0 for unknown paths).
    async fn record_count(&self, path: &str) -> Result<usize, StoreError>;
}
