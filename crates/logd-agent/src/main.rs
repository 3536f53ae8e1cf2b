// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{
    env,
    sync::{atomic::Ordering, Arc},
};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logd::{
    aggregator_service::AggregatorService,
    batcher::BatcherService,
    config::Config,
    scheduler::FlushScheduler,
    server::EventServer,
    sink::{RetryStrategy, StatsSink},
    store::{memory::MemoryStore, LogStore},
    util::ThroughputWindow,
};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOGD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = Arc::new(Config::from_env());
    info!(
        port = config.port,
        graphite = %format!("{}:{}", config.graphite_host, config.graphite_port),
        "starting logd agent"
    );

    let cancel_token = CancellationToken::new();

    let (aggregator_service, aggregator_handle) =
        AggregatorService::new(config.stats_interval, config.percent_threshold);
    tokio::spawn(aggregator_service.run());

    let (batcher_service, batcher_handle) = BatcherService::new();
    tokio::spawn(batcher_service.run());

    let store: Arc<dyn LogStore> = Arc::new(MemoryStore::new());

    let sink = Arc::new(StatsSink::new(
        &config.graphite_host,
        config.graphite_port,
        RetryStrategy::LinearBackoff(3, 1),
    ));

    let server = match EventServer::bind(
        &config.host,
        config.port,
        aggregator_handle.clone(),
        batcher_handle.clone(),
        Arc::clone(&store),
        cancel_token.clone(),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            error!("Unable to bind ingest socket: {e}");
            return;
        }
    };
    info!("logd-udp: starting to listen on port {}", config.port);

    let received = server.received_counter();
    tokio::spawn(async move {
        server.spin().await;
    });

    let scheduler = FlushScheduler::new(
        Arc::clone(&config),
        aggregator_handle.clone(),
        batcher_handle.clone(),
        store,
        sink,
        cancel_token.clone(),
    );
    let scheduler_tasks = scheduler.spawn();

    let mut throughput_ticker = interval(config.log_interval);
    throughput_ticker.tick().await; // discard first tick, which is instantaneous
    let mut throughput = ThroughputWindow::default();

    loop {
        tokio::select! {
            _ = throughput_ticker.tick() => {
                let total = received.load(Ordering::Relaxed);
                if let Some(window) = throughput.advance(total) {
                    info!("Received {window} messages ({total} total)");
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Unable to listen for shutdown signal: {e}");
                }
                break;
            }
        }
    }

    info!("shutting down, draining pending flushes");
    cancel_token.cancel();
    for task in scheduler_tasks {
        if let Err(e) = task.await {
            error!("scheduler task failed during shutdown: {e}");
        }
    }

    if let Err(e) = aggregator_handle.shutdown() {
        error!("failed to stop aggregator service: {e}");
    }
    if let Err(e) = batcher_handle.shutdown() {
        error!("failed to stop batcher service: {e}");
    }
    info!("logd agent stopped");
}
