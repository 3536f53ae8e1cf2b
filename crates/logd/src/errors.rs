// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the daemon.
//!
//! Decode failures drop the offending datagram and continue. Store and sink
//! failures distinguish transient conditions (retried on the next tick, with
//! in-memory data preserved) from fatal ones (logged loudly, the cycle's data
//! accepted as lost).

use thiserror::Error;

/// Errors raised while turning a raw datagram into a typed event.
///
/// None of these are fatal: the ingest loop logs them and moves on.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Envelope(#[from] rmp_serde::decode::Error),

    #[error("unknown event kind {0}")]
    UnknownKind(u64),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid `{field}`: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

/// Errors surfaced by a [`crate::store::LogStore`] backend.
///
/// An `Err` from `append` means no record from that call was durably
/// committed; partial success is reported through the `Ok(count)` path
/// instead, so the scheduler can re-drive exactly the unwritten suffix.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity or timeout trouble; the batch stays buffered and is
    /// replayed on the next flush tick.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Misconfiguration or a permanently broken backend. Retrying is
    /// pointless, so the current cycle's data is dropped.
    #[error("fatal store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Failure to deliver a stats payload to the sink. Best-effort only: the
/// aggregator was already reset, so the cycle's stats are lost.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink connection failed: {0}")]
    Io(#[from] std::io::Error),
}
