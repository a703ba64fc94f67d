//! GPU telemetry collection.
//!
//! Everything the renderer consumes comes from here: device enumeration,
//! per-device counter snapshots, and per-process activity attribution. The
//! platform driver sits behind the [`CounterSource`] trait so the
//! normalization and aggregation logic is unit-testable with synthetic raw
//! data, independent of real hardware.
//!
//! Public objects:
//! - `CounterSource`: boundary to the platform telemetry interface.
//! - `DeviceIdentity`, `RawSample`: what a source reports.
//! - `CollectionError`: error taxonomy for the refresh path.
//! - `default_source`: the backend for the current platform, if any.
//!
//! External dependencies: thiserror, cfg-if.

pub mod activity;
pub mod counters;
pub mod registry;
pub mod scheduler;
pub mod stats;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "macos", feature = "apple-gpu"))] {
        pub mod apple;
    }
}

use thiserror::Error;

use crate::collection::counters::{RawCounters, RawUsageRecord};

/// Errors surfaced by the telemetry boundary and the refresh path.
///
/// Only the first three abort a refresh; `InvalidUsageRecord` is classified
/// per-record inside the aggregator and the offending record is skipped.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CollectionError {
    /// The device is unreachable: disconnected, driver not loaded, or access
    /// denied. The device keeps its registry entry so the caller can report
    /// "device lost" instead of having it vanish mid-session.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A transient read error. The previous snapshot stays in place.
    #[error("sample failed: {0}")]
    SampleFailed(String),

    /// The driver returned an unparseable or incomplete reading.
    #[error("malformed counter data: {0}")]
    MalformedCounterData(String),

    /// One per-process usage record was unusable. Dropped per-record, never
    /// fatal to the refresh that carried it.
    #[error("invalid usage record: {0}")]
    InvalidUsageRecord(String),
}

/// Static identity of one GPU as reported at enumeration time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Human-readable device name.
    pub name: String,
    /// Number of GPU cores, or 0 when the driver does not report it.
    pub core_count: u32,
    /// Backend-specific stable handle used to re-resolve the device on each
    /// sample (the IOKit registry entry ID for the Apple backend).
    pub handle: u64,
}

/// One point-in-time read from a device: the raw counters and the raw
/// per-process usage records, both taken from the same underlying driver
/// read. Keeping the pair together is what lets the registry guarantee a
/// consistent snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawSample {
    pub counters: RawCounters,
    pub usage: Vec<RawUsageRecord>,
}

/// Boundary to the platform's hardware-telemetry interface.
///
/// Implementations read, they do not mutate: `sample` may block on the
/// underlying telemetry call but has no side effects beyond the read. A
/// failure must come back as an error, never a panic, so one bad device
/// cannot take down the whole monitor.
pub trait CounterSource {
    /// Lists the devices this source can sample. Called once, at registry
    /// construction; ordinals are assigned from the returned order.
    fn enumerate(&mut self) -> Result<Vec<DeviceIdentity>, CollectionError>;

    /// Reads one point-in-time sample for `device`.
    fn sample(&mut self, device: &DeviceIdentity) -> Result<RawSample, CollectionError>;
}

/// Returns the telemetry backend for the current platform, or `None` when
/// the crate was built for a platform without one.
pub fn default_source() -> Option<Box<dyn CounterSource>> {
    #[cfg(all(target_os = "macos", feature = "apple-gpu"))]
    {
        return Some(Box::new(apple::AppleCounterSource::new()));
    }
    #[cfg(not(all(target_os = "macos", feature = "apple-gpu")))]
    None
}
