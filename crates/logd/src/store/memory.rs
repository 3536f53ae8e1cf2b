// SPDX-License-Identifier: Apache-2.0

//! In-process [`LogStore`] backend.
//!
//! Layout per path: a primary `BTreeMap` keyed by sequence id (so
//! oldest-first eviction is a `pop_first`), `BTreeSet` id-indices per level
//! and per logger name, and the distinct-name set. Sequence high-water marks
//! are kept in a map that survives `delete_log`, so a recreated path
//! continues numbering where it left off and stale index references can
//! never alias a new record.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::errors::StoreError;
use crate::event::LogEvent;
use crate::store::{LogRecord, LogStore};

#[derive(Debug, Default)]
struct PathState {
    /// Last assigned sequence id; the next record gets `last_id + 1`.
    last_id: u64,
    records: BTreeMap<u64, LogRecord>,
    by_level: HashMap<String, BTreeSet<u64>>,
    by_name: HashMap<String, BTreeSet<u64>>,
    names: BTreeSet<String>,
}

impl PathState {
    fn with_high_water(last_id: u64) -> Self {
        PathState {
            last_id,
            ..PathState::default()
        }
    }

    fn insert(&mut self, record: LogRecord) {
        let id = record.id;
        self.by_level
            .entry(record.level.clone())
            .or_default()
            .insert(id);
        self.by_name
            .entry(record.name.clone())
            .or_default()
            .insert(id);
        self.names.insert(record.name.clone());
        self.records.insert(id, record);
    }

    /// Removes the oldest record together with its index entries.
    fn evict_oldest(&mut self) -> Option<u64> {
        let (id, record) = self.records.pop_first()?;
        if let Some(ids) = self.by_level.get_mut(&record.level) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_level.remove(&record.level);
            }
        }
        if let Some(ids) = self.by_name.get_mut(&record.name) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_name.remove(&record.name);
            }
        }
        Some(id)
    }
}

#[derive(Debug, Default)]
struct Inner {
    paths: HashMap<String, PathState>,
    /// Last ids of deleted paths, so recreation never reuses a sequence id.
    high_water: HashMap<String, u64>,
}

impl Inner {
    fn state_mut(&mut self, path: &str) -> &mut PathState {
        let high_water = self.high_water.get(path).copied().unwrap_or(0);
        self.paths
            .entry(path.to_string())
            .or_insert_with(|| PathState::with_high_water(high_water))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Fatal("store mutex poisoned".to_string()))
    }

    /// Fetches one record by (path, id). Primary-index read for tests and
    /// diagnostics.
    pub fn record(&self, path: &str, id: u64) -> Result<Option<LogRecord>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .paths
            .get(path)
            .and_then(|state| state.records.get(&id))
            .cloned())
    }

    /// Ids reachable through the level index, ascending.
    pub fn ids_for_level(&self, path: &str, level: &str) -> Result<Vec<u64>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .paths
            .get(path)
            .and_then(|state| state.by_level.get(level))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    /// Ids reachable through the name index, ascending.
    pub fn ids_for_name(&self, path: &str, name: &str) -> Result<Vec<u64>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .paths
            .get(path)
            .and_then(|state| state.by_name.get(name))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    /// The path's distinct-name set as last computed.
    pub fn names(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .paths
            .get(path)
            .map(|state| state.names.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// All live ids under a path, ascending.
    pub fn ids(&self, path: &str) -> Result<Vec<u64>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .paths
            .get(path)
            .map(|state| state.records.keys().copied().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn ensure_path(&self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.locked()?;
        inner.state_mut(path);
        Ok(())
    }

    async fn append(&self, path: &str, events: &[LogEvent]) -> Result<usize, StoreError> {
        let mut inner = self.locked()?;
        let state = inner.state_mut(path);

        let mut committed = 0;
        for event in events {
            let id = state.last_id + 1;
            state.last_id = id;
            state.insert(LogRecord::from_event(id, event));
            committed += 1;
        }

        debug!(%path, committed, last_id = state.last_id, "appended records");
        Ok(committed)
    }

    async fn trim(&self, path: &str, max_size: usize) -> Result<usize, StoreError> {
        let mut inner = self.locked()?;
        let Some(state) = inner.paths.get_mut(path) else {
            return Ok(0);
        };

        let mut evicted = 0;
        while state.records.len() > max_size {
            if state.evict_oldest().is_none() {
                break;
            }
            evicted += 1;
        }

        if evicted > 0 {
            debug!(%path, evicted, max_size, "trimmed records");
        }
        Ok(evicted)
    }

    async fn delete_log(&self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.locked()?;
        if let Some(state) = inner.paths.remove(path) {
            inner.high_water.insert(path.to_string(), state.last_id);
            debug!(%path, high_water = state.last_id, "deleted log");
        }
        Ok(())
    }

    async fn update_aggregates(&self) -> Result<(), StoreError> {
        let mut inner = self.locked()?;
        for state in inner.paths.values_mut() {
            state.names = state
                .by_name
                .iter()
                .filter(|(_, ids)| !ids.is_empty())
                .map(|(name, _)| name.clone())
                .collect();
        }
        Ok(())
    }

    async fn paths(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.locked()?;
        Ok(inner.paths.keys().cloned().collect())
    }

    async fn record_count(&self, path: &str) -> Result<usize, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .paths
            .get(path)
            .map(|state| state.records.len())
            .unwrap_or(0))
    }
}
