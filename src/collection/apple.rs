//! macOS GPU telemetry via IOKit.
//!
//! Implements [`CounterSource`] over IOAccelerator services. Device counters
//! come from each accelerator's `PerformanceStatistics` property dictionary;
//! per-process usage records come from the accelerator's child entries in
//! the service plane, whose creator property carries the owning PID. Works
//! on Apple Silicon (AGX) and Intel-era accelerators, which simply report
//! fewer counters.
//!
//! Public objects:
//! - `AppleCounterSource`: IOKit-backed `CounterSource`.
//!
//! External dependencies: core-foundation, libc, mach2, sysinfo.

use std::{ffi::CStr, ptr};

use core_foundation::{
    base::{CFAllocatorRef, CFType, TCFType, kCFAllocatorDefault},
    dictionary::{CFDictionary, CFDictionaryRef, CFMutableDictionaryRef},
    number::CFNumber,
    string::{CFString, CFStringRef},
};
use mach2::kern_return::kern_return_t;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::collection::{
    CollectionError, CounterSource, DeviceIdentity, RawSample,
    counters::{RawCounters, RawUsageRecord},
    stats,
};

// IOKit type aliases.
#[allow(non_camel_case_types)]
type io_object_t = u32;
#[allow(non_camel_case_types)]
type io_iterator_t = io_object_t;
#[allow(non_camel_case_types)]
type io_registry_entry_t = io_object_t;

const KERN_SUCCESS: kern_return_t = 0;
const IO_OBJECT_NULL: io_object_t = 0;

const ACCELERATOR_CLASS: &[u8] = b"IOAccelerator\0";
const SERVICE_PLANE: &[u8] = b"IOService\0";

// IOKit FFI bindings for GPU enumeration and per-device sampling.
#[link(name = "IOKit", kind = "framework")]
unsafe extern "C" {
    #[link_name = "kIOMasterPortDefault"]
    static kIOMasterPortDefault: u32;

    fn IOServiceMatching(name: *const libc::c_char) -> CFMutableDictionaryRef;
    fn IOServiceGetMatchingServices(
        mainPort: u32, matching: CFMutableDictionaryRef, existing: *mut io_iterator_t,
    ) -> kern_return_t;
    fn IOServiceGetMatchingService(mainPort: u32, matching: CFMutableDictionaryRef) -> io_object_t;
    fn IORegistryEntryIDMatching(entryID: u64) -> CFMutableDictionaryRef;
    fn IORegistryEntryGetRegistryEntryID(
        entry: io_registry_entry_t, entryID: *mut u64,
    ) -> kern_return_t;
    fn IORegistryEntryGetChildIterator(
        entry: io_registry_entry_t, plane: *const libc::c_char, iterator: *mut io_iterator_t,
    ) -> kern_return_t;
    fn IOIteratorNext(iterator: io_iterator_t) -> io_object_t;
    fn IORegistryEntryCreateCFProperties(
        entry: io_registry_entry_t, properties: *mut CFMutableDictionaryRef,
        allocator: CFAllocatorRef, options: u32,
    ) -> kern_return_t;
    fn IORegistryEntryGetName(entry: io_registry_entry_t, name: *mut libc::c_char)
    -> kern_return_t;
    fn IOObjectRelease(object: io_object_t) -> kern_return_t;
}

// Keys probed on the accelerator entry itself (not the statistics dict).
const CORE_COUNT_KEYS: &[&str] = &["gpu-core-count", "GPUCoreCount", "core-count"];
const DEVICE_NAME_KEYS: &[&str] = &["model", "MetalPluginName", "IOGLBundleName"];

// Keys probed on accelerator child entries for per-process usage.
const CONTEXT_USAGE_KEYS: &[&str] = &["Device Utilization %", "GPU Usage %", "DeviceUsage"];
const CONTEXT_API_KEYS: &[&str] = &["IOAccelAPI", "API", "CreatorAPI"];
const CONTEXT_CREATOR_KEY: &str = "IOUserClientCreator";

/// IOKit-backed counter source.
///
/// One instance serves every accelerator on the system. Devices are
/// re-resolved by registry entry ID on each sample, so a device that was
/// pulled surfaces as `DeviceUnavailable` rather than a stale handle.
pub struct AppleCounterSource {
    /// Used only to resolve process names the driver omitted.
    processes: System,
}

impl AppleCounterSource {
    pub fn new() -> Self {
        Self {
            processes: System::new(),
        }
    }

    fn process_name(&mut self, pid: u32) -> Option<String> {
        let target = Pid::from_u32(pid);
        self.processes.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing(),
        );
        self.processes
            .process(target)
            .map(|p| p.name().to_string_lossy().into_owned())
    }

    /// Collects per-process usage records from the accelerator's child
    /// entries. Contexts without a usage reading are idle and skipped;
    /// records with an unparseable creator get an invalid PID and are left
    /// for the aggregator to drop.
    fn usage_records(&mut self, accelerator: io_registry_entry_t) -> Vec<RawUsageRecord> {
        let mut records = Vec::new();

        let mut iterator: io_iterator_t = 0;
        // SAFETY: IORegistryEntryGetChildIterator populates the iterator for
        // a valid registry entry; the plane name is a static C string.
        let result = unsafe {
            IORegistryEntryGetChildIterator(
                accelerator,
                SERVICE_PLANE.as_ptr() as *const libc::c_char,
                &mut iterator,
            )
        };
        if result != KERN_SUCCESS {
            return records;
        }

        loop {
            // SAFETY: IOIteratorNext returns the next object or IO_OBJECT_NULL.
            let child = unsafe { IOIteratorNext(iterator) };
            if child == IO_OBJECT_NULL {
                break;
            }

            if let Some(record) = self.usage_record_for(child) {
                records.push(record);
            }

            // SAFETY: release the child object after use.
            unsafe {
                IOObjectRelease(child);
            }
        }

        // SAFETY: release the iterator.
        unsafe {
            IOObjectRelease(iterator);
        }

        records
    }

    fn usage_record_for(&mut self, child: io_registry_entry_t) -> Option<RawUsageRecord> {
        let properties = entry_properties(child)?;
        let usage = find_number(&properties, CONTEXT_USAGE_KEYS)? as f32;

        let (pid, mut name) = find_string(&properties, &[CONTEXT_CREATOR_KEY])
            .and_then(|creator| parse_creator(&creator))
            .unwrap_or((-1, String::new()));

        let api = find_string(&properties, CONTEXT_API_KEYS)
            .unwrap_or_else(|| infer_api(&entry_name(child).unwrap_or_default()));

        if name.is_empty() {
            if let Ok(pid) = u32::try_from(pid) {
                if let Some(resolved) = self.process_name(pid) {
                    name = resolved;
                }
            }
        }

        Some(RawUsageRecord::new(pid, name, api, usage))
    }
}

impl Default for AppleCounterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for AppleCounterSource {
    fn enumerate(&mut self) -> Result<Vec<DeviceIdentity>, CollectionError> {
        let mut devices = Vec::new();

        // SAFETY: IOServiceMatching takes a C string and returns a matching
        // dictionary that IOServiceGetMatchingServices consumes.
        let matching =
            unsafe { IOServiceMatching(ACCELERATOR_CLASS.as_ptr() as *const libc::c_char) };
        if matching.is_null() {
            return Err(CollectionError::DeviceUnavailable(
                "IOAccelerator matching dictionary could not be created".into(),
            ));
        }

        let mut iterator: io_iterator_t = 0;
        // SAFETY: consumes `matching` and populates `iterator`.
        let result =
            unsafe { IOServiceGetMatchingServices(kIOMasterPortDefault, matching, &mut iterator) };
        if result != KERN_SUCCESS {
            return Err(CollectionError::DeviceUnavailable(format!(
                "IOServiceGetMatchingServices failed with {result}"
            )));
        }

        loop {
            // SAFETY: IOIteratorNext returns the next object or IO_OBJECT_NULL.
            let service = unsafe { IOIteratorNext(iterator) };
            if service == IO_OBJECT_NULL {
                break;
            }

            if let Some(identity) = identity_for(service) {
                devices.push(identity);
            }

            // SAFETY: release the service object after use.
            unsafe {
                IOObjectRelease(service);
            }
        }

        // SAFETY: release the iterator.
        unsafe {
            IOObjectRelease(iterator);
        }

        Ok(devices)
    }

    fn sample(&mut self, device: &DeviceIdentity) -> Result<RawSample, CollectionError> {
        // SAFETY: IORegistryEntryIDMatching returns a matching dictionary
        // that IOServiceGetMatchingService consumes.
        let service = unsafe {
            IOServiceGetMatchingService(
                kIOMasterPortDefault,
                IORegistryEntryIDMatching(device.handle),
            )
        };
        if service == IO_OBJECT_NULL {
            return Err(CollectionError::DeviceUnavailable(format!(
                "device '{}' is no longer present",
                device.name
            )));
        }

        let sample = self.sample_service(service, device);

        // SAFETY: release the resolved service object.
        unsafe {
            IOObjectRelease(service);
        }

        sample
    }
}

impl AppleCounterSource {
    fn sample_service(
        &mut self, service: io_registry_entry_t, device: &DeviceIdentity,
    ) -> Result<RawSample, CollectionError> {
        let properties = entry_properties(service).ok_or_else(|| {
            CollectionError::SampleFailed(format!(
                "could not read properties of '{}'",
                device.name
            ))
        })?;

        let perf_stats = find_dictionary(&properties, "PerformanceStatistics").ok_or_else(|| {
            CollectionError::MalformedCounterData("missing PerformanceStatistics dictionary".into())
        })?;

        let mut counters = RawCounters::new();
        for key in stats::COUNTER_KEYS.iter().flat_map(|keys| keys.iter().copied()) {
            if let Some(value) = find_number(&perf_stats, &[key]) {
                counters.insert(key, value);
            }
        }

        // The usage records come from the same resolved service as the
        // counters, so the registry's snapshot pair is consistent.
        let usage = self.usage_records(service);

        Ok(RawSample { counters, usage })
    }
}

/// Builds the static identity for one accelerator service.
fn identity_for(service: io_registry_entry_t) -> Option<DeviceIdentity> {
    let mut entry_id: u64 = 0;
    // SAFETY: IORegistryEntryGetRegistryEntryID writes the stable 64-bit ID.
    let result = unsafe { IORegistryEntryGetRegistryEntryID(service, &mut entry_id) };
    if result != KERN_SUCCESS {
        return None;
    }

    let properties = entry_properties(service);
    let name = properties
        .as_ref()
        .and_then(|p| find_string(p, DEVICE_NAME_KEYS))
        .or_else(|| entry_name(service))?;
    let core_count = properties
        .as_ref()
        .and_then(|p| find_number(p, CORE_COUNT_KEYS))
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);

    Some(DeviceIdentity {
        name,
        core_count,
        handle: entry_id,
    })
}

/// Gets the registry name of an IOKit entry.
fn entry_name(entry: io_registry_entry_t) -> Option<String> {
    let mut name_buffer: [libc::c_char; 128] = [0; 128];

    // SAFETY: IORegistryEntryGetName writes a null-terminated name into the
    // buffer.
    let result = unsafe { IORegistryEntryGetName(entry, name_buffer.as_mut_ptr()) };
    if result != KERN_SUCCESS {
        return None;
    }

    // SAFETY: the buffer is null-terminated by IORegistryEntryGetName.
    let c_str = unsafe { CStr::from_ptr(name_buffer.as_ptr()) };
    Some(c_str.to_string_lossy().into_owned())
}

/// Gets all properties of an IOKit entry as a CFDictionary.
fn entry_properties(entry: io_registry_entry_t) -> Option<CFDictionary<CFString, CFType>> {
    let mut properties_ref: CFMutableDictionaryRef = ptr::null_mut();

    // SAFETY: IORegistryEntryCreateCFProperties allocates a new dictionary.
    let result = unsafe {
        IORegistryEntryCreateCFProperties(
            entry,
            &mut properties_ref,
            kCFAllocatorDefault as CFAllocatorRef,
            0,
        )
    };
    if result != KERN_SUCCESS || properties_ref.is_null() {
        return None;
    }

    // SAFETY: we own the dictionary reference and wrap it in a safe type.
    // CFMutableDictionary is a subtype of CFDictionary, so the cast is fine.
    Some(unsafe { CFDictionary::wrap_under_create_rule(properties_ref as CFDictionaryRef) })
}

/// Returns the first numeric value present among `keys`.
fn find_number(properties: &CFDictionary<CFString, CFType>, keys: &[&str]) -> Option<i64> {
    for key_str in keys {
        let key = CFString::new(key_str);
        if let Some(value) = properties.find(&key) {
            if let Some(num) = extract_number(&value) {
                return Some(num);
            }
        }
    }
    None
}

/// Returns the first string value present among `keys`.
fn find_string(properties: &CFDictionary<CFString, CFType>, keys: &[&str]) -> Option<String> {
    for key_str in keys {
        let key = CFString::new(key_str);
        if let Some(value) = properties.find(&key) {
            if value.type_of() == CFString::type_id() {
                let string_ref = value.as_CFTypeRef() as CFStringRef;
                // SAFETY: downcast to CFString after the type check above.
                let string: CFString = unsafe { CFString::wrap_under_get_rule(string_ref) };
                return Some(string.to_string());
            }
        }
    }
    None
}

/// Returns a sub-dictionary by key.
fn find_dictionary(
    properties: &CFDictionary<CFString, CFType>, key: &str,
) -> Option<CFDictionary<CFString, CFType>> {
    let value = properties.find(&CFString::new(key))?;

    let dict_ref = value.as_CFTypeRef() as CFDictionaryRef;
    if dict_ref.is_null() {
        return None;
    }
    // SAFETY: downcast the CFType to CFDictionary; retain since we create a
    // new wrapper.
    Some(unsafe { CFDictionary::wrap_under_get_rule(dict_ref) })
}

/// Extracts a numeric value from a CFType as i64.
fn extract_number(value: &CFType) -> Option<i64> {
    if value.type_of() == CFNumber::type_id() {
        let num_ref = value.as_CFTypeRef() as core_foundation::number::CFNumberRef;
        // SAFETY: downcast to CFNumber after the type check above.
        let num: CFNumber = unsafe { CFNumber::wrap_under_get_rule(num_ref) };

        if let Some(val) = num.to_i64() {
            return Some(val);
        }
        if let Some(val) = num.to_f64() {
            return Some(val as i64);
        }
    }
    None
}

/// The creator property reads like `"pid 380, WindowServer"`.
fn parse_creator(creator: &str) -> Option<(i64, String)> {
    let rest = creator.strip_prefix("pid ")?;
    let (pid, name) = match rest.split_once(',') {
        Some((pid, name)) => (pid.trim(), name.trim()),
        None => (rest.trim(), ""),
    };
    Some((pid.parse().ok()?, name.to_string()))
}

/// Maps a context entry's registry name to an API label when the entry has
/// no explicit API property. AGX entries are Metal contexts.
fn infer_api(entry_name: &str) -> String {
    let lowered = entry_name.to_lowercase();
    if lowered.contains("metal") || lowered.contains("agx") {
        "metal".into()
    } else if lowered.contains("cl") {
        "opencl".into()
    } else if lowered.contains("gl") {
        "opengl".into()
    } else {
        lowered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_strings_parse() {
        assert_eq!(
            parse_creator("pid 380, WindowServer"),
            Some((380, "WindowServer".to_string()))
        );
        assert_eq!(parse_creator("pid 99"), Some((99, String::new())));
        assert_eq!(parse_creator("WindowServer"), None);
        assert_eq!(parse_creator("pid x, y"), None);
    }

    #[test]
    fn api_inference_from_entry_names() {
        assert_eq!(infer_api("AGXCommandQueue"), "metal");
        assert_eq!(infer_api("IOAccelMetalContext"), "metal");
        assert_eq!(infer_api("IOAccelGLContext2"), "opengl");
        assert_eq!(infer_api("IOAccelCLContext2"), "opencl");
        assert_eq!(infer_api("SomethingElse"), "somethingelse");
    }

    #[test]
    fn enumerate_does_not_crash() {
        // Basic smoke test - should not panic, with or without a GPU.
        let _ = AppleCounterSource::new().enumerate();
    }
}
