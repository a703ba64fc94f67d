//! End-to-end refresh cycle tests against a synthetic counter source.

use std::collections::VecDeque;

use agxtop::collection::{
    CollectionError, CounterSource, DeviceIdentity, RawSample,
    counters::{RawCounters, RawUsageRecord},
    registry::GpuRegistry,
};

/// Replays a scripted sequence of sample results, round-robin across devices.
struct ScriptedSource {
    devices: Vec<DeviceIdentity>,
    samples: VecDeque<Result<RawSample, CollectionError>>,
}

impl CounterSource for ScriptedSource {
    fn enumerate(&mut self) -> Result<Vec<DeviceIdentity>, CollectionError> {
        Ok(self.devices.clone())
    }

    fn sample(&mut self, _device: &DeviceIdentity) -> Result<RawSample, CollectionError> {
        self.samples
            .pop_front()
            .unwrap_or_else(|| Err(CollectionError::SampleFailed("script exhausted".into())))
    }
}

fn device(name: &str, cores: u32) -> DeviceIdentity {
    DeviceIdentity {
        name: name.into(),
        core_count: cores,
        handle: 0,
    }
}

fn sample(device_util: i64, usage: Vec<RawUsageRecord>) -> Result<RawSample, CollectionError> {
    let mut counters = RawCounters::new();
    counters.insert("Device Utilization %", device_util);
    counters.insert("Renderer Utilization %", device_util / 2);
    counters.insert("In use system memory", 256 * 1024 * 1024);
    Ok(RawSample { counters, usage })
}

#[test]
fn full_cycle_attributes_activity_per_device() {
    let source = Box::new(ScriptedSource {
        devices: vec![device("Apple M2 Pro", 19)],
        samples: VecDeque::from([sample(
            40,
            vec![
                RawUsageRecord::new(380, "WindowServer", "metal", 20.0),
                RawUsageRecord::new(380, "", "opencl", 15.0),
                // Same context reported twice; must not double count.
                RawUsageRecord::new(380, "", "metal", 20.0),
                RawUsageRecord::new(512, "game", "metal", 50.0),
                // Invalid record, dropped without failing the batch.
                RawUsageRecord::new(0, "ghost", "metal", 99.0),
            ],
        )]),
    });

    let mut registry = GpuRegistry::new(source).unwrap();
    assert_eq!(registry.len(), 1);

    registry.refresh(0).unwrap();
    let state = registry.device(0).unwrap();

    assert_eq!(state.device().name(), "Apple M2 Pro");
    assert_eq!(state.device().core_count(), 19);
    assert_eq!(state.statistics().device_utilization, 40.0);
    assert_eq!(state.statistics().renderer_utilization, 20.0);

    let activities = state.activities();
    assert_eq!(activities.len(), 2);
    assert_eq!(activities[&380].percentage, 35.0);
    assert_eq!(activities[&380].usage.len(), 2);
    assert_eq!(activities[&380].name, "WindowServer");
    assert_eq!(activities[&512].percentage, 50.0);
}

#[test]
fn one_bad_device_does_not_poison_the_other() {
    let source = Box::new(ScriptedSource {
        devices: vec![device("first", 10), device("second", 10)],
        // Cycle 1: both fine. Cycle 2: first fails, second still refreshes.
        samples: VecDeque::from([
            sample(10, vec![]),
            sample(20, vec![]),
            Err(CollectionError::DeviceUnavailable("unplugged".into())),
            sample(25, vec![]),
        ]),
    });

    let mut registry = GpuRegistry::new(source).unwrap();
    registry.refresh_all();
    registry.refresh_all();

    let first = registry.device(0).unwrap();
    assert_eq!(first.statistics().device_utilization, 10.0);
    assert!(matches!(
        first.last_error(),
        Some(CollectionError::DeviceUnavailable(_))
    ));

    let second = registry.device(1).unwrap();
    assert_eq!(second.statistics().device_utilization, 25.0);
    assert!(second.last_error().is_none());
}
