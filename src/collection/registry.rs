//! Device registry and refresh lifecycle.
//!
//! Enumerates the available GPUs once at construction and, on every refresh,
//! re-pulls one consistent (statistics, activities) pair per device from the
//! counter source. A failed refresh never touches the last good pair; the
//! error is recorded on the device so a renderer can say "device lost" or
//! "showing last known values" instead of freezing.

use log::warn;

use crate::collection::{
    CollectionError, CounterSource, DeviceIdentity, RawSample,
    activity::{self, PidMap, ProcessActivity},
    stats::{self, PerformanceStatistics},
};

/// Static identity of an enumerated GPU. Set once at discovery, immutable
/// thereafter; the ordinal is stable for the lifetime of the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    index: usize,
    identity: DeviceIdentity,
}

impl Device {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn core_count(&self) -> u32 {
        self.identity.core_count
    }
}

/// Current state for one device: the last good snapshot pair plus the error
/// from the most recent refresh, if it failed.
#[derive(Debug)]
pub struct DeviceState {
    device: Device,
    statistics: PerformanceStatistics,
    activities: PidMap<ProcessActivity>,
    last_error: Option<CollectionError>,
}

impl DeviceState {
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Statistics from the most recent successful sample. Zeroed until the
    /// first refresh succeeds.
    pub fn statistics(&self) -> &PerformanceStatistics {
        &self.statistics
    }

    /// Per-process activity from the same sample as [`statistics`].
    ///
    /// [`statistics`]: Self::statistics
    pub fn activities(&self) -> &PidMap<ProcessActivity> {
        &self.activities
    }

    /// Error from the most recent refresh, if it failed. The snapshot pair
    /// still holds the last good sample.
    pub fn last_error(&self) -> Option<&CollectionError> {
        self.last_error.as_ref()
    }

    fn apply(&mut self, sample: RawSample) -> Result<(), CollectionError> {
        let statistics = stats::normalize(&sample.counters)?;
        let activities = activity::aggregate(&sample.usage);
        // Both halves come from the same sample and swap in together, only
        // once the whole sample parsed.
        self.statistics = statistics;
        self.activities = activities;
        self.last_error = None;
        Ok(())
    }
}

/// Owns the counter source and the per-device current state.
///
/// One instance per process; callers hold an explicit handle, there is no
/// ambient singleton. Refreshes are synchronous and sequential: one
/// [`refresh`](Self::refresh) call per device per interval, driven by the
/// caller.
pub struct GpuRegistry {
    source: Box<dyn CounterSource>,
    devices: Vec<DeviceState>,
}

impl GpuRegistry {
    /// Enumerates devices once. Ordinals are assigned from the enumeration
    /// order and never change afterwards.
    pub fn new(mut source: Box<dyn CounterSource>) -> Result<Self, CollectionError> {
        let identities = source.enumerate()?;
        let devices = identities
            .into_iter()
            .enumerate()
            .map(|(index, identity)| DeviceState {
                device: Device { index, identity },
                statistics: PerformanceStatistics::default(),
                activities: PidMap::default(),
                last_error: None,
            })
            .collect();
        Ok(Self { source, devices })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices in ordinal order.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceState> {
        self.devices.iter()
    }

    pub fn device(&self, index: usize) -> Option<&DeviceState> {
        self.devices.get(index)
    }

    /// Re-samples one device.
    ///
    /// On success the (statistics, activities) pair is replaced wholesale;
    /// on failure the previous pair is untouched and the error is both
    /// recorded on the device and returned. A device that disappeared keeps
    /// its entry and ordinal, surfacing `DeviceUnavailable` on every attempt
    /// until it returns.
    pub fn refresh(&mut self, index: usize) -> Result<(), CollectionError> {
        let state = self.devices.get_mut(index).ok_or_else(|| {
            CollectionError::DeviceUnavailable(format!("no device at ordinal {index}"))
        })?;

        let outcome = self
            .source
            .sample(&state.device.identity)
            .and_then(|sample| state.apply(sample));

        if let Err(err) = &outcome {
            warn!("refresh failed for device {index}: {err}");
            state.last_error = Some(err.clone());
        }
        outcome
    }

    /// Refreshes every device in ordinal order, continuing past individual
    /// failures. Errors are recorded on each device state for the renderer.
    pub fn refresh_all(&mut self) {
        for index in 0..self.devices.len() {
            let _ = self.refresh(index);
        }
    }
}
