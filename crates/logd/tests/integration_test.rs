// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use logd::{
    aggregator_service::AggregatorService,
    batcher::BatcherService,
    config::Config,
    errors::StoreError,
    event::LogEvent,
    scheduler::FlushScheduler,
    server::EventServer,
    sink::{RetryStrategy, StatsSink},
    store::{memory::MemoryStore, LogStore},
};

fn pack(value: &serde_json::Value) -> Vec<u8> {
    rmp_serde::to_vec(value).expect("failed to pack envelope")
}

struct TestAgent {
    store: Arc<MemoryStore>,
    cancel_token: CancellationToken,
    ingest_addr: std::net::SocketAddr,
}

/// Brings up the full ingest pipeline on ephemeral ports: UDP server,
/// aggregator and batcher services, memory store, and the scheduler ticking
/// every 20ms against the given graphite port.
async fn start_agent(graphite_port: u16) -> TestAgent {
    let config = Arc::new(Config {
        flush_interval: Duration::from_millis(20),
        stats_interval: Duration::from_millis(20),
        trim_interval: Duration::from_millis(20),
        aggregates_interval: Duration::from_millis(20),
        ..Config::default()
    });

    let (aggregator_service, aggregator_handle) =
        AggregatorService::new(config.stats_interval, config.percent_threshold);
    tokio::spawn(aggregator_service.run());

    let (batcher_service, batcher_handle) = BatcherService::new();
    tokio::spawn(batcher_service.run());

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(StatsSink::new(
        "127.0.0.1",
        graphite_port,
        RetryStrategy::Immediate(1),
    ));
    let cancel_token = CancellationToken::new();

    let server = EventServer::bind(
        "127.0.0.1",
        0,
        aggregator_handle.clone(),
        batcher_handle.clone(),
        Arc::clone(&store) as Arc<dyn LogStore>,
        cancel_token.clone(),
    )
    .await
    .expect("failed to bind ingest socket");
    let ingest_addr = server.local_addr().expect("no ingest address");
    tokio::spawn(server.spin());

    let scheduler = FlushScheduler::new(
        config,
        aggregator_handle.clone(),
        batcher_handle.clone(),
        Arc::clone(&store) as Arc<dyn LogStore>,
        sink,
        cancel_token.clone(),
    );
    let tasks = scheduler.spawn();
    // The scheduler tasks are detached; cancellation stops them and the
    // tests do not need to join them.
    drop(tasks);

    TestAgent {
        store,
        cancel_token,
        ingest_addr,
    }
}

async fn send_datagrams(target: std::net::SocketAddr, datagrams: &[Vec<u8>]) {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("failed to bind client socket");
    for datagram in datagrams {
        socket
            .send_to(datagram, target)
            .await
            .expect("failed to send datagram");
    }
}

/// Accepts connections on the listener and returns the first payload whose
/// text contains `needle`. Each flush cycle opens a fresh connection.
async fn capture_until(listener: TcpListener, needle: &str) -> String {
    loop {
        let (mut conn, _) = listener.accept().await.expect("accept failed");
        let mut payload = String::new();
        conn.read_to_string(&mut payload)
            .await
            .expect("read failed");
        if payload.contains(needle) {
            return payload;
        }
    }
}

#[tokio::test]
async fn metrics_flow_from_udp_to_graphite() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind graphite listener");
    let graphite_port = listener.local_addr().expect("no listener address").port();

    let agent = start_agent(graphite_port).await;

    send_datagrams(
        agent.ingest_addr,
        &[
            pack(&json!({"id": 2, "key": "requests", "value": 2, "rate": 0.5})),
            pack(&json!({"id": 3, "key": "db.query", "value": 120})),
            pack(&json!({"id": 3, "key": "db.query", "value": 80})),
            pack(&json!({"id": 4, "key": "queue.depth", "value": 10})),
            pack(&json!({"id": 4, "key": "queue.depth", "value": 20})),
        ],
    )
    .await;

    let payload = timeout(
        Duration::from_secs(5),
        capture_until(listener, "stats.numStats"),
    )
    .await
    .expect("no graphite payload arrived");

    // Counter: 2 at rate 0.5 reconstructs to 4 raw hits.
    assert!(
        payload.contains("stats.counts.requests 4 "),
        "missing raw counter in: {payload}"
    );
    // Timers: mean of 120 and 80.
    assert!(
        payload.contains("stats.timers.db.query.mean 100 "),
        "missing timer mean in: {payload}"
    );
    assert!(payload.contains("stats.timers.db.query.upper 120 "));
    assert!(payload.contains("stats.timers.db.query.lower 80 "));
    // Meter: two observations, mean 15.
    assert!(payload.contains("stats.meters.queue.depth 15 "));
    assert!(payload.contains("stats.mcounts.queue.depth 2 "));

    agent.cancel_token.cancel();
}

#[tokio::test]
async fn logs_flow_from_udp_to_store_with_sequential_ids() {
    let agent = start_agent(1).await;

    let first: Vec<Vec<u8>> = (0..3)
        .map(|i| {
            pack(&json!({
                "id": 1,
                "path": "myapp/web.log",
                "level": "INFO",
                "name": "web",
                "msg": format!("request {i}"),
            }))
        })
        .collect();
    send_datagrams(agent.ingest_addr, &first).await;

    wait_for_count(&agent.store, "myapp/web.log", 3).await;

    // A second wave lands in a later flush cycle; ids keep climbing.
    let second: Vec<Vec<u8>> = (3..5)
        .map(|i| {
            pack(&json!({
                "id": 1,
                "path": "myapp/web.log",
                "msg": format!("request {i}"),
            }))
        })
        .collect();
    send_datagrams(agent.ingest_addr, &second).await;

    wait_for_count(&agent.store, "myapp/web.log", 5).await;

    assert_eq!(
        agent.store.ids("myapp/web.log").expect("ids failed"),
        vec![1, 2, 3, 4, 5]
    );
    // Explicit fields survive the trip; the second wave fell back to
    // defaults.
    let record = agent
        .store
        .record("myapp/web.log", 1)
        .expect("lookup failed")
        .expect("missing record");
    assert_eq!(record.level, "INFO");
    assert_eq!(record.name, "web");
    assert_eq!(record.message, "request 0");
    let record = agent
        .store
        .record("myapp/web.log", 4)
        .expect("lookup failed")
        .expect("missing record");
    assert_eq!(record.level, "INFO");
    assert_eq!(record.name, "root");

    agent.cancel_token.cancel();
}

#[tokio::test]
async fn delete_log_drops_path_over_udp() {
    let agent = start_agent(1).await;

    send_datagrams(
        agent.ingest_addr,
        &[pack(&json!({"id": 1, "path": "scratch.log", "msg": "hello"}))],
    )
    .await;
    wait_for_count(&agent.store, "scratch.log", 1).await;

    send_datagrams(
        agent.ingest_addr,
        &[pack(&json!({"id": 1000, "path": "scratch.log"}))],
    )
    .await;
    wait_for_count(&agent.store, "scratch.log", 0).await;

    agent.cancel_token.cancel();
}

async fn wait_for_count(store: &Arc<MemoryStore>, path: &str, expected: usize) {
    for _ in 0..250 {
        if store.record_count(path).await.expect("count failed") == expected {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "store never reached {expected} records for {path}, have {}",
        store.record_count(path).await.expect("count failed")
    );
}

/// Store that rejects its first N appends with a transient error, then
/// delegates to an in-memory store.
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

#[async_trait]
impl LogStore for FlakyStore {
    async fn ensure_path(&self, path: &str) -> Result<(), StoreError> {
        self.inner.ensure_path(path).await
    }

    async fn append(&self, path: &str, events: &[LogEvent]) -> Result<usize, StoreError> {
        if self.failing.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Transient("backend unavailable".to_string()));
        }
        self.inner.append(path, events).await
    }

    async fn trim(&self, path: &str, max_size: usize) -> Result<usize, StoreError> {
        self.inner.trim(path, max_size).await
    }

    async fn delete_log(&self, path: &str) -> Result<(), StoreError> {
        self.inner.delete_log(path).await
    }

    async fn update_aggregates(&self) -> Result<(), StoreError> {
        self.inner.update_aggregates().await
    }

    async fn paths(&self) -> Result<Vec<String>, StoreError> {
        self.inner.paths().await
    }

    async fn record_count(&self, path: &str) -> Result<usize, StoreError> {
        self.inner.record_count(path).await
    }
}

#[tokio::test]
async fn transient_append_failure_is_redriven() {
    let config = Arc::new(Config {
        flush_interval: Duration::from_millis(20),
        stats_interval: Duration::from_secs(3600),
        trim_interval: Duration::from_secs(3600),
        aggregates_interval: Duration::from_secs(3600),
        ..Config::default()
    });

    let (aggregator_service, aggregator_handle) =
        AggregatorService::new(config.stats_interval, config.percent_threshold);
    tokio::spawn(aggregator_service.run());

    let (batcher_service, batcher_handle) = BatcherService::new();
    tokio::spawn(batcher_service.run());

    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        failing: AtomicBool::new(true),
    });
    let sink = Arc::new(StatsSink::new("127.0.0.1", 1, RetryStrategy::Immediate(1)));
    let cancel_token = CancellationToken::new();

    let scheduler = FlushScheduler::new(
        config,
        aggregator_handle.clone(),
        batcher_handle.clone(),
        Arc::clone(&store) as Arc<dyn LogStore>,
        sink,
        cancel_token.clone(),
    );
    drop(scheduler.spawn());

    batcher_handle
        .append(LogEvent {
            path: "redrive.log".to_string(),
            level: "ERROR".to_string(),
            name: "worker".to_string(),
            time: 1_700_000_000.0,
            message: "first try fails".to_string(),
            metadata: Default::default(),
        })
        .expect("append failed");

    // First flush hits the transient failure and requeues; a later tick
    // replays the batch against the recovered store.
    for _ in 0..250 {
        if store
            .inner
            .record_count("redrive.log")
            .await
            .expect("count failed")
            == 1
        {
            assert!(!store.failing.load(Ordering::SeqCst));
            cancel_token.cancel();
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("transient failure was never redriven");
}
