// SPDX-License-Identifier: Apache-2.0

//! Envelope decoding: raw datagram bytes into typed events.
//!
//! Each datagram carries one msgpack-encoded map with an `id` discriminator
//! and kind-specific fields. Clients pack numeric fields as either integers
//! or floats depending on their language, so all numeric fields tolerate
//! both encodings. Decode failures are reported to the caller, who logs and
//! drops the datagram; nothing here is ever fatal.

use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;
use crate::util::{now_unix_secs, parse_stat_key};

/// Wire discriminators for the event kinds.
pub const KIND_LOG: u64 = 1;
pub const KIND_COUNTER: u64 = 2;
pub const KIND_TIMER: u64 = 3;
pub const KIND_METER: u64 = 4;
pub const KIND_DELETE_LOG: u64 = 1000;

/// Optional client-supplied context attached to a log event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogMetadata {
    /// Sending process id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    /// Source location, e.g. `module file.py:42`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Formatted traceback text for error-level records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl LogMetadata {
    pub fn is_empty(&self) -> bool {
        self.pid.is_none() && self.location.is_none() && self.traceback.is_none()
    }
}

/// A decoded log message bound for the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub path: String,
    pub level: String,
    pub name: String,
    /// Client-side timestamp, fractional unix seconds.
    pub time: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "LogMetadata::is_empty")]
    pub metadata: LogMetadata,
}

/// One decoded ingestion record.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Log(LogEvent),
    Counter { key: String, value: f64, rate: f64 },
    Timer { key: String, value: f64, rate: f64 },
    Meter { key: String, value: f64 },
    DeleteLog { path: String },
}

/// The raw wire shape. Everything but `id` is optional; the conversion into
/// [`Event`] decides which fields a given kind actually requires.
#[derive(Debug, Deserialize)]
struct Envelope {
    id: u64,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    rate: Option<f64>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    time: Option<f64>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    pid: Option<i64>,
    #[serde(default)]
    loc: Option<String>,
    #[serde(default)]
    tb: Option<String>,
}

/// Decodes one datagram payload into an [`Event`].
///
/// Missing `value` and `rate` default to 1, matching what minimal clients
/// send for plain increments.
pub fn decode(buf: &[u8]) -> Result<Event, DecodeError> {
    let envelope: Envelope = rmp_serde::from_slice(buf)?;
    envelope.into_event()
}

impl Envelope {
    fn into_event(self) -> Result<Event, DecodeError> {
        match self.id {
            KIND_LOG => {
                let path = required_key(self.path, "path")?;
                Ok(Event::Log(LogEvent {
                    path,
                    level: self.level.unwrap_or_else(|| "INFO".to_string()),
                    name: self.name.unwrap_or_else(|| "root".to_string()),
                    time: self.time.unwrap_or_else(|| now_unix_secs() as f64),
                    message: self.msg.unwrap_or_default(),
                    metadata: LogMetadata {
                        pid: self.pid,
                        location: self.loc,
                        traceback: self.tb,
                    },
                }))
            }
            KIND_COUNTER => Ok(Event::Counter {
                key: required_key(self.key, "key")?,
                value: self.value.unwrap_or(1.0),
                rate: self.rate.unwrap_or(1.0),
            }),
            KIND_TIMER => Ok(Event::Timer {
                key: required_key(self.key, "key")?,
                value: self.value.unwrap_or(1.0),
                rate: self.rate.unwrap_or(1.0),
            }),
            KIND_METER => Ok(Event::Meter {
                key: required_key(self.key, "key")?,
                value: self.value.unwrap_or(1.0),
            }),
            KIND_DELETE_LOG => Ok(Event::DeleteLog {
                path: required_key(self.path, "path")?,
            }),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

fn required_key(
    raw: Option<String>,
    field: &'static str,
) -> Result<String, DecodeError> {
    let raw = raw.ok_or(DecodeError::MissingField(field))?;
    parse_stat_key(&raw).ok_or_else(|| DecodeError::InvalidField {
        field,
        reason: format!("'{raw}' is empty or contains whitespace"),
    })
}
