// SPDX-License-Identifier: Apache-2.0

//! Periodic flush driving.
//!
//! Independently timed activities with no ordering between them:
//! stats-flush (aggregator snapshot to the sink), log-flush (batcher drain
//! to per-path store appends), retention-trim, aggregate-refresh, and an
//! optional aggregator state dump when the debug flag is set.
//! Store-facing ticks spawn their slow work so a lagging backend never
//! stalls the next tick; the stats flush instead runs inline with missed
//! ticks skipped, because snapshot-and-reset must never overlap itself.
//! Appends are serialized per path: while one append for a path is
//! outstanding, freshly drained batches for that path go back to the front
//! of the batcher (where a requeued failure would land too), so sequence
//! ids always follow arrival order. On cancellation each loop makes one
//! final pass so shutdown drains outstanding data instead of dropping it.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator_service::AggregatorHandle;
use crate::batcher::BatcherHandle;
use crate::config::Config;
use crate::event::LogEvent;
use crate::sink::StatsSink;
use crate::store::LogStore;

pub struct FlushScheduler {
    config: Arc<Config>,
    aggregator_handle: AggregatorHandle,
    batcher_handle: BatcherHandle,
    store: Arc<dyn LogStore>,
    sink: Arc<StatsSink>,
    cancel_token: CancellationToken,
}

impl FlushScheduler {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        aggregator_handle: AggregatorHandle,
        batcher_handle: BatcherHandle,
        store: Arc<dyn LogStore>,
        sink: Arc<StatsSink>,
        cancel_token: CancellationToken,
    ) -> Self {
        FlushScheduler {
            config,
            aggregator_handle,
            batcher_handle,
            store,
            sink,
            cancel_token,
        }
    }

    /// Starts the tick loops and returns their task handles; awaiting
    /// them after cancelling the token completes the shutdown drain.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let FlushScheduler {
            config,
            aggregator_handle,
            batcher_handle,
            store,
            sink,
            cancel_token,
        } = self;

        let mut tasks = vec![
            tokio::spawn(stats_loop(
                config.stats_interval,
                aggregator_handle.clone(),
                sink,
                cancel_token.clone(),
            )),
            tokio::spawn(log_flush_loop(
                config.flush_interval,
                batcher_handle,
                Arc::clone(&store),
                cancel_token.clone(),
            )),
            tokio::spawn(trim_loop(
                Arc::clone(&config),
                Arc::clone(&store),
                cancel_token.clone(),
            )),
            tokio::spawn(aggregates_loop(
                config.aggregates_interval,
                store,
                cancel_token.clone(),
            )),
        ];
        if config.debug {
            tasks.push(tokio::spawn(debug_dump_loop(
                config.debug_interval,
                aggregator_handle,
                cancel_token,
            )));
        }
        tasks
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn stats_loop(
    period: Duration,
    aggregator_handle: AggregatorHandle,
    sink: Arc<StatsSink>,
    cancel_token: CancellationToken,
) {
    let mut ticker = ticker(period);
    ticker.tick().await; // discard first tick, which is instantaneous
    loop {
        tokio::select! {
            _ = ticker.tick() => flush_stats(&aggregator_handle, &sink).await,
            _ = cancel_token.cancelled() => {
                flush_stats(&aggregator_handle, &sink).await;
                break;
            }
        }
    }
    debug!("stats flush loop stopped");
}

async fn flush_stats(aggregator_handle: &AggregatorHandle, sink: &StatsSink) {
    match aggregator_handle.flush().await {
        Ok(snapshot) => {
            // The snapshot already reset the aggregator; a delivery failure
            // here loses this cycle's stats and nothing else.
            if let Err(e) = sink.flush(&snapshot).await {
                warn!("stats flush failed, cycle dropped: {e}");
            }
        }
        Err(e) => error!("aggregator flush failed: {e}"),
    }
}

async fn log_flush_loop(
    period: Duration,
    batcher_handle: BatcherHandle,
    store: Arc<dyn LogStore>,
    cancel_token: CancellationToken,
) {
    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let mut ticker = ticker(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => flush_logs(&batcher_handle, &store, &in_flight, true).await,
            _ = cancel_token.cancelled() => {
                // Final pass runs the appends inline so they finish before
                // the task reports done.
                flush_logs(&batcher_handle, &store, &in_flight, false).await;
                break;
            }
        }
    }
    debug!("log flush loop stopped");
}

async fn flush_logs(
    batcher_handle: &BatcherHandle,
    store: &Arc<dyn LogStore>,
    in_flight: &Arc<Mutex<HashSet<String>>>,
    detach: bool,
) {
    let batches = match batcher_handle.drain().await {
        Ok(batches) => batches,
        Err(e) => {
            error!("batcher drain failed: {e}");
            return;
        }
    };

    for (path, events) in batches {
        // One outstanding append per path. A batch drained while its path
        // is still appending goes back to the front of the queue, so it
        // cannot overtake the in-flight batch and take lower ids, and a
        // requeued failure replays before it.
        if !in_flight.lock().await.insert(path.clone()) {
            debug!(%path, "append still in flight, deferring batch");
            requeue(batcher_handle, &path, events);
            continue;
        }
        let store = Arc::clone(store);
        let batcher_handle = batcher_handle.clone();
        let in_flight = Arc::clone(in_flight);
        if detach {
            tokio::spawn(append_batch(store, batcher_handle, in_flight, path, events));
        } else {
            append_batch(store, batcher_handle, in_flight, path, events).await;
        }
    }
}

async fn append_batch(
    store: Arc<dyn LogStore>,
    batcher_handle: BatcherHandle,
    in_flight: Arc<Mutex<HashSet<String>>>,
    path: String,
    mut events: Vec<LogEvent>,
) {
    match store.append(&path, &events).await {
        Ok(committed) if committed < events.len() => {
            warn!(
                %path,
                committed,
                total = events.len(),
                "partial append, requeueing remainder"
            );
            let remainder = events.split_off(committed);
            requeue(&batcher_handle, &path, remainder);
        }
        Ok(committed) => debug!(%path, committed, "log batch appended"),
        Err(e) if e.is_transient() => {
            warn!(
                %path,
                count = events.len(),
                "transient append failure, requeueing batch: {e}"
            );
            requeue(&batcher_handle, &path, events);
        }
        Err(e) => {
            error!(
                %path,
                lost = events.len(),
                "fatal append failure, dropping batch: {e}"
            );
        }
    }
    // Cleared only after any requeue, so the next drain sees the replayed
    // batch already at the front.
    in_flight.lock().await.remove(&path);
}

fn requeue(batcher_handle: &BatcherHandle, path: &str, events: Vec<LogEvent>) {
    if let Err(e) = batcher_handle.requeue(path.to_string(), events) {
        error!(%path, "failed to requeue batch: {e}");
    }
}

async fn trim_loop(config: Arc<Config>, store: Arc<dyn LogStore>, cancel_token: CancellationToken) {
    let mut ticker = ticker(config.trim_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => trim_all(&config, &store).await,
            _ = cancel_token.cancelled() => break,
        }
    }
    debug!("retention trim loop stopped");
}

async fn trim_all(config: &Config, store: &Arc<dyn LogStore>) {
    let paths = match store.paths().await {
        Ok(paths) => paths,
        Err(e) => {
            error!("failed to list paths for trim: {e}");
            return;
        }
    };

    for path in paths {
        let cap = config.retention_cap(&path);
        let store = Arc::clone(store);
        tokio::spawn(async move {
            match store.trim(&path, cap).await {
                Ok(evicted) if evicted > 0 => debug!(%path, evicted, cap, "retention trim"),
                Ok(_) => {}
                // Trim is idempotent; the next tick simply tries again.
                Err(e) => warn!(%path, "trim failed, retrying next tick: {e}"),
            }
        });
    }
}

/// Periodic dump of the live aggregator maps, active only when the debug
/// flag is set. Reads without resetting, so it never perturbs a flush
/// window.
async fn debug_dump_loop(
    period: Duration,
    aggregator_handle: AggregatorHandle,
    cancel_token: CancellationToken,
) {
    let mut ticker = ticker(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => match aggregator_handle.dump_state().await {
                Ok(state) => info!(%state, "aggregator state"),
                Err(e) => error!("aggregator state dump failed: {e}"),
            },
            _ = cancel_token.cancelled() => break,
        }
    }
    debug!("debug dump loop stopped");
}

async fn aggregates_loop(
    period: Duration,
    store: Arc<dyn LogStore>,
    cancel_token: CancellationToken,
) {
    let mut ticker = ticker(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.update_aggregates().await {
                    warn!("aggregate refresh failed: {e}");
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
    debug!("aggregate refresh loop stopped");
}
