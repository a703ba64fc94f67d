//! Raw driver readings, before any normalization.

use std::collections::HashMap;

/// Raw counter readings for one device, exactly as the driver reported them.
///
/// Keys are the driver's own dictionary keys and values carry no defined
/// units until [`stats::normalize`](super::stats::normalize) runs. Apple
/// renames counter keys between macOS versions, so lookups go through
/// ordered fallback lists rather than single keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawCounters {
    readings: HashMap<String, i64>,
}

impl RawCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: i64) {
        self.readings.insert(key.into(), value);
    }

    /// Returns the first reading present among `keys`.
    pub fn first(&self, keys: &[&str]) -> Option<i64> {
        keys.iter().find_map(|key| self.readings.get(*key).copied())
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// One per-process usage record: one record per (process, API context) pair
/// currently active on the device.
#[derive(Clone, Debug, PartialEq)]
pub struct RawUsageRecord {
    /// Raw process ID. May be invalid; the aggregator drops those records.
    pub pid: i64,
    /// Process display name. May be empty, the driver omits it in some
    /// records.
    pub name: String,
    /// API stack identifier, e.g. "metal" or "opencl".
    pub api: String,
    /// This context's share of the device, as a raw percentage value.
    pub usage: f32,
}

impl RawUsageRecord {
    pub fn new(pid: i64, name: impl Into<String>, api: impl Into<String>, usage: f32) -> Self {
        Self {
            pid,
            name: name.into(),
            api: api.into(),
            usage,
        }
    }
}
