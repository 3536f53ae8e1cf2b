// SPDX-License-Identifier: Apache-2.0

//! # logd
//!
//! A metrics and log aggregation daemon. Clients send msgpack-encoded
//! events over UDP; counters, timers, and meters are aggregated in memory
//! and flushed to a Graphite-compatible backend, while log events are
//! batched and persisted to a pluggable [`store::LogStore`] with capped,
//! indexed retention.
//!
//! The pipeline is split into single-owner service tasks wired together by
//! channels:
//! - [`server`]: UDP ingest, decoding, and routing
//! - [`aggregator`] / [`aggregator_service`]: stats accumulation windows
//! - [`batcher`]: per-path log buffering between flushes
//! - [`store`]: the persistence trait and in-memory implementation
//! - [`scheduler`]: the periodic flush, trim, and refresh ticks
//! - [`sink`]: Graphite plaintext delivery

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod aggregator_service;
pub mod batcher;
pub mod config;
pub mod errors;
pub mod event;
pub mod scheduler;
pub mod server;
pub mod sink;
pub mod store;
pub mod util;
