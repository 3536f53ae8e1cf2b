// SPDX-License-Identifier: Apache-2.0

//! Ingest server: receives event datagrams and routes them.
//!
//! One msgpack envelope arrives per datagram. Decoded metric events go to
//! the aggregator handle, log events to the batcher handle, and delete-log
//! requests are spawned against the store so the ingest loop never waits on
//! the backend. Decode failures are logged and dropped; the only fatal
//! condition is failing to bind the socket at boot.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::aggregator::Sample;
use crate::aggregator_service::AggregatorHandle;
use crate::batcher::BatcherHandle;
use crate::errors::DecodeError;
use crate::event::{decode, Event};
use crate::store::LogStore;

// Matches the largest datagram clients send; oversized payloads are
// truncated by the OS and fail decoding.
const BUFFER_SIZE: usize = 8192;

// BufferReader abstracts the datagram source for testing.
enum BufferReader {
    UdpSocket(UdpSocket),

    /// Replays a fixed buffer once per read - test only.
    #[allow(dead_code)]
    MirrorTest(Vec<u8>, SocketAddr),
}

impl BufferReader {
    async fn read(&self) -> std::io::Result<(Vec<u8>, SocketAddr)> {
        match self {
            BufferReader::UdpSocket(socket) => {
                let mut buf = [0; BUFFER_SIZE];
                let (amt, src) = socket.recv_from(&mut buf).await?;
                Ok((buf[..amt].to_owned(), src))
            }
            BufferReader::MirrorTest(data, src) => Ok((data.clone(), *src)),
        }
    }
}

/// UDP server feeding the aggregator, batcher, and store.
pub struct EventServer {
    cancel_token: CancellationToken,
    aggregator_handle: AggregatorHandle,
    batcher_handle: BatcherHandle,
    store: Arc<dyn LogStore>,
    buffer_reader: BufferReader,
    received: Arc<AtomicU64>,
}

impl EventServer {
    /// Binds the ingest socket. This is the one startup step that is allowed
    /// to fail fatally.
    pub async fn bind(
        host: &str,
        port: u16,
        aggregator_handle: AggregatorHandle,
        batcher_handle: BatcherHandle,
        store: Arc<dyn LogStore>,
        cancel_token: CancellationToken,
    ) -> std::io::Result<EventServer> {
        let socket = UdpSocket::bind(format!("{host}:{port}")).await?;

        Ok(EventServer {
            cancel_token,
            aggregator_handle,
            batcher_handle,
            store,
            buffer_reader: BufferReader::UdpSocket(socket),
            received: Arc::new(AtomicU64::new(0)),
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.buffer_reader {
            BufferReader::UdpSocket(socket) => socket.local_addr().ok(),
            BufferReader::MirrorTest(_, src) => Some(*src),
        }
    }

    /// Shared counter of datagrams received, read by the throughput log.
    pub fn received_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.received)
    }

    /// Main event loop: receives and routes datagrams until cancelled.
    pub async fn spin(self) {
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                result = self.buffer_reader.read() => match result {
                    Ok((buf, src)) => self.handle_datagram(&buf, src),
                    Err(e) => warn!("failed to receive datagram: {e}"),
                },
            }
        }
        debug!("ingest server stopped");
    }

    fn handle_datagram(&self, buf: &[u8], src: SocketAddr) {
        self.received.fetch_add(1, Ordering::Relaxed);
        trace!(%src, len = buf.len(), "received datagram");

        match decode(buf) {
            Ok(event) => self.route(event),
            // Unknown discriminators are expected from newer clients and
            // dropped quietly; anything else gets a real warning.
            Err(e @ DecodeError::UnknownKind(_)) => debug!(%src, "dropping event: {e}"),
            Err(e) => warn!(%src, "failed to decode datagram: {e}"),
        }
    }

    fn route(&self, event: Event) {
        match event {
            Event::Counter { key, value, rate } => {
                self.insert_sample(Sample::Counter { key, value, rate });
            }
            Event::Timer { key, value, rate } => {
                self.insert_sample(Sample::Timer { key, value, rate });
            }
            Event::Meter { key, value } => {
                self.insert_sample(Sample::Meter { key, value });
            }
            Event::Log(log) => {
                if let Err(e) = self.batcher_handle.append(log) {
                    error!("Failed to send log to batcher: {e}");
                }
            }
            Event::DeleteLog { path } => {
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    if let Err(e) = store.delete_log(&path).await {
                        error!(%path, "delete_log failed: {e}");
                    }
                });
            }
        }
    }

    fn insert_sample(&self, sample: Sample) {
        if let Err(e) = self.aggregator_handle.insert_batch(vec![sample]) {
            error!("Failed to send sample to aggregator: {e}");
        }
    }
}
