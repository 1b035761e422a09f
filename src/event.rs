//! The common telemetry model every input is normalized into.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single event.
///
/// Only `key` is mandatory at the edge; everything else is optional and
/// filled in by the core emitter from the `core` configuration before the
/// event reaches any sink.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Seconds since the unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Time-to-live in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl Event {
    /// Create an event carrying nothing but its key.
    pub fn new(key: impl Into<String>) -> Self {
        Event {
            key: key.into(),
            ..Default::default()
        }
    }
}

/// A single metric sample.
///
/// Same shape as [`Event`] except `value` is required, and an optional
/// `proc` names the processor the sample should be routed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc: Option<String>,
}

impl Metric {
    pub fn new(key: impl Into<String>, value: f64) -> Self {
        Metric {
            key: key.into(),
            value,
            time: None,
            host: None,
            tags: BTreeSet::new(),
            attributes: BTreeMap::new(),
            proc: None,
        }
    }

    /// Route this sample through the named processor.
    pub fn with_proc(mut self, proc: impl Into<String>) -> Self {
        self.proc = Some(proc.into());
        self
    }
}

/// Current wall-clock time in seconds since the unix epoch.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
