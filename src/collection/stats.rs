//! Counter normalization.
//!
//! Converts [`RawCounters`] into [`PerformanceStatistics`] with fixed units:
//! percent, bytes, Hz, mV, mW, °C. Normalization is a pure function; the
//! same raw readings always produce the same statistics, which is what makes
//! the snapshot layer testable without a device.
//!
//! Public objects:
//! - `PerformanceStatistics`: the normalized per-device snapshot.
//! - `normalize`: raw readings -> statistics.
//!
//! External dependencies: log.

use log::warn;

use crate::collection::{CollectionError, counters::RawCounters};

// Known dictionary keys per counter. Apple changes these between macOS
// versions, so each counter probes an ordered list of spellings.
pub(crate) const DEVICE_UTILIZATION_KEYS: &[&str] = &[
    "Device Utilization %",
    "GPU Activity(%)",
    "GPU Core Utilization",
    "gpuCoreUtilization",
    "GPU Utilization",
];
pub(crate) const RENDERER_UTILIZATION_KEYS: &[&str] =
    &["Renderer Utilization %", "Renderer Utilization"];
pub(crate) const TILER_UTILIZATION_KEYS: &[&str] = &["Tiler Utilization %", "Tiler Utilization"];
pub(crate) const ALLOC_SYSTEM_MEMORY_KEYS: &[&str] =
    &["Alloc system memory", "Alloc System Memory"];
pub(crate) const IN_USE_SYSTEM_MEMORY_KEYS: &[&str] =
    &["In use system memory", "In Use System Memory"];
pub(crate) const IN_USE_SYSTEM_MEMORY_DRIVER_KEYS: &[&str] = &[
    "In use system memory (driver)",
    "In Use System Memory (Driver)",
];
pub(crate) const ALLOCATED_PB_SIZE_KEYS: &[&str] = &["Allocated PB Size", "AllocatedPBSize"];
pub(crate) const TILED_SCENE_BYTES_KEYS: &[&str] = &["TiledSceneBytes", "Tiled Scene Bytes"];
pub(crate) const SPLIT_SCENE_COUNT_KEYS: &[&str] = &["SplitSceneCount", "Split Scene Count"];
pub(crate) const RECOVERY_COUNT_KEYS: &[&str] = &["recoveryCount", "Recovery Count"];
pub(crate) const GPU_FREQUENCY_KEYS: &[&str] =
    &["GPU Frequency(Hz)", "Actual Frequency(Hz)", "gpuFrequency"];
pub(crate) const GPU_VOLTAGE_KEYS: &[&str] = &["GPU Voltage(mV)", "gpuVoltage"];
pub(crate) const POWER_KEYS: &[&str] = &["GPU Power(mW)", "Power(mW)", "milliwatts"];
pub(crate) const TEMPERATURE_KEYS: &[&str] =
    &["Temperature(C)", "GPU Die Temperature", "temperature"];

/// Every key list a backend should probe when copying a driver dictionary
/// into [`RawCounters`].
#[allow(dead_code)] // only the macOS backend walks the full list
pub(crate) const COUNTER_KEYS: &[&[&str]] = &[
    DEVICE_UTILIZATION_KEYS,
    RENDERER_UTILIZATION_KEYS,
    TILER_UTILIZATION_KEYS,
    ALLOC_SYSTEM_MEMORY_KEYS,
    IN_USE_SYSTEM_MEMORY_KEYS,
    IN_USE_SYSTEM_MEMORY_DRIVER_KEYS,
    ALLOCATED_PB_SIZE_KEYS,
    TILED_SCENE_BYTES_KEYS,
    SPLIT_SCENE_COUNT_KEYS,
    RECOVERY_COUNT_KEYS,
    GPU_FREQUENCY_KEYS,
    GPU_VOLTAGE_KEYS,
    POWER_KEYS,
    TEMPERATURE_KEYS,
];

/// Normalized statistics for one device at one point in time.
///
/// Units are fixed: percentages in [0, 100], memory in bytes, frequency in
/// Hz, voltage in mV, power in mW, temperature in °C. `split_scene_count`
/// and `recovery_count` are monotonic counters since device init; consumers
/// compute deltas if they want rates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerformanceStatistics {
    pub device_utilization: f32,
    pub renderer_utilization: f32,
    pub tiler_utilization: f32,
    pub alloc_system_memory: u64,
    pub in_use_system_memory: u64,
    pub in_use_system_memory_driver: u64,
    pub allocated_pb_size: u64,
    pub tiled_scene_bytes: u64,
    pub split_scene_count: u64,
    pub recovery_count: u64,
    pub gpu_frequency_hz: u64,
    pub gpu_voltage_mv: u64,
    pub power_mw: u64,
    pub temperature_c: f32,
}

/// Converts raw readings into a [`PerformanceStatistics`] snapshot.
///
/// The device utilization counter is required; everything else defaults to
/// zero when absent, since pre-AGX accelerators omit the tiler and scene
/// counters entirely. Byte-denominated fields pass through verbatim.
pub fn normalize(raw: &RawCounters) -> Result<PerformanceStatistics, CollectionError> {
    let device = raw.first(DEVICE_UTILIZATION_KEYS).ok_or_else(|| {
        CollectionError::MalformedCounterData("missing device utilization counter".into())
    })?;

    Ok(PerformanceStatistics {
        device_utilization: clamp_percent(device, "device utilization"),
        renderer_utilization: clamp_percent(
            raw.first(RENDERER_UTILIZATION_KEYS).unwrap_or(0),
            "renderer utilization",
        ),
        tiler_utilization: clamp_percent(
            raw.first(TILER_UTILIZATION_KEYS).unwrap_or(0),
            "tiler utilization",
        ),
        alloc_system_memory: non_negative(raw, ALLOC_SYSTEM_MEMORY_KEYS),
        in_use_system_memory: non_negative(raw, IN_USE_SYSTEM_MEMORY_KEYS),
        in_use_system_memory_driver: non_negative(raw, IN_USE_SYSTEM_MEMORY_DRIVER_KEYS),
        allocated_pb_size: non_negative(raw, ALLOCATED_PB_SIZE_KEYS),
        tiled_scene_bytes: non_negative(raw, TILED_SCENE_BYTES_KEYS),
        split_scene_count: non_negative(raw, SPLIT_SCENE_COUNT_KEYS),
        recovery_count: non_negative(raw, RECOVERY_COUNT_KEYS),
        gpu_frequency_hz: non_negative(raw, GPU_FREQUENCY_KEYS),
        gpu_voltage_mv: non_negative(raw, GPU_VOLTAGE_KEYS),
        power_mw: non_negative(raw, POWER_KEYS),
        temperature_c: raw.first(TEMPERATURE_KEYS).unwrap_or(0) as f32,
    })
}

/// Clamps a raw percentage reading to [0, 100]. An out-of-range value after
/// conversion is a normalization bug on the driver side; it is clamped and
/// logged, never propagated.
fn clamp_percent(value: i64, counter: &str) -> f32 {
    let pct = value as f32;
    if !(0.0..=100.0).contains(&pct) {
        warn!("clamping out-of-range {counter} reading {value} to [0, 100]");
        pct.clamp(0.0, 100.0)
    } else {
        pct
    }
}

fn non_negative(raw: &RawCounters, keys: &[&str]) -> u64 {
    let value = raw.first(keys).unwrap_or(0);
    if value < 0 {
        warn!("negative reading {value} for {:?}, treating as 0", keys[0]);
        0
    } else {
        value as u64
    }
}
