//! Per-process activity attribution.
//!
//! Turns the driver's raw per-(process, API context) usage records into one
//! consolidated [`ProcessActivity`] per PID. This is the only place double
//! counting can be introduced, so it is also the only place it is prevented:
//! duplicate API identifiers within one PID are coalesced before the
//! per-process percentage is computed.
//!
//! Public objects:
//! - `ActivityUsage`, `ProcessActivity`: the consolidated records.
//! - `PidMap`: PID-keyed map alias.
//! - `aggregate`: raw records -> per-PID activity map.
//! - `sorted_for_display`: deterministic display ordering.
//!
//! External dependencies: nohash, itertools, log.

use std::{cmp::Ordering, collections::HashMap};

use itertools::Itertools;
use log::debug;
use nohash::BuildNoHashHasher;

use crate::collection::{CollectionError, counters::RawUsageRecord};

/// Map keyed by PID. PIDs are already well distributed; skip hashing.
pub type PidMap<V> = HashMap<u32, V, BuildNoHashHasher<u32>>;

/// One API stack's share of a process's GPU usage.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivityUsage {
    pub api: String,
    pub usage: f32,
}

/// Consolidated GPU activity for one process on one device.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessActivity {
    pub pid: u32,
    pub name: String,
    /// One entry per API stack, in discovery order.
    pub usage: Vec<ActivityUsage>,
    /// Consolidated share of the device for this process, in [0, 100].
    pub percentage: f32,
}

/// Consolidates raw usage records into one activity record per PID.
///
/// Records are grouped by PID, then by API identifier within the PID. When
/// the driver reports the same API identifier twice for one PID it is the
/// same context observed twice, so the duplicates coalesce to the larger
/// reading rather than summing; summing here is exactly the double count the
/// data model forbids. The consolidated percentage is the sum of the
/// deduplicated per-API values, clamped to [0, 100].
///
/// A record with an invalid PID is dropped with a debug log; it never fails
/// the batch.
pub fn aggregate(records: &[RawUsageRecord]) -> PidMap<ProcessActivity> {
    let mut activities: PidMap<ProcessActivity> = PidMap::default();

    for record in records {
        let pid = match validate_pid(record) {
            Ok(pid) => pid,
            Err(err) => {
                debug!("dropping usage record: {err}");
                continue;
            }
        };

        let entry = activities.entry(pid).or_insert_with(|| ProcessActivity {
            pid,
            name: String::new(),
            usage: Vec::new(),
            percentage: 0.0,
        });

        // First non-empty name wins; the driver omits the name in some
        // records.
        if entry.name.is_empty() && !record.name.is_empty() {
            entry.name = record.name.clone();
        }

        match entry.usage.iter_mut().find(|u| u.api == record.api) {
            Some(existing) => existing.usage = existing.usage.max(record.usage),
            None => entry.usage.push(ActivityUsage {
                api: record.api.clone(),
                usage: record.usage,
            }),
        }
    }

    for activity in activities.values_mut() {
        activity.percentage = activity
            .usage
            .iter()
            .map(|u| u.usage)
            .sum::<f32>()
            .clamp(0.0, 100.0);
    }

    activities
}

/// Display order: busiest process first, ties broken by ascending PID so
/// output is reproducible.
pub fn sorted_for_display(activities: &PidMap<ProcessActivity>) -> Vec<&ProcessActivity> {
    activities
        .values()
        .sorted_by(|a, b| {
            b.percentage
                .partial_cmp(&a.percentage)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.pid.cmp(&b.pid))
        })
        .collect()
}

fn validate_pid(record: &RawUsageRecord) -> Result<u32, CollectionError> {
    u32::try_from(record.pid)
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| {
            CollectionError::InvalidUsageRecord(format!(
                "pid {} out of range (api {:?})",
                record.pid, record.api
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: i64, api: &str, usage: f32) -> RawUsageRecord {
        RawUsageRecord::new(pid, "", api, usage)
    }

    #[test]
    fn aggregates_across_apis_and_processes() {
        let records = [
            record(1, "metal", 20.0),
            record(1, "opencl", 15.0),
            record(2, "metal", 50.0),
        ];
        let activities = aggregate(&records);

        let first = &activities[&1];
        assert_eq!(first.usage.len(), 2);
        assert_eq!(first.percentage, 35.0);

        let second = &activities[&2];
        assert_eq!(second.usage.len(), 1);
        assert_eq!(second.percentage, 50.0);

        let order: Vec<u32> = sorted_for_display(&activities)
            .iter()
            .map(|a| a.pid)
            .collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn duplicate_api_reports_never_double_count() {
        // Policy: duplicates for one (PID, API) coalesce to the max reading,
        // not the sum. Two reports of one context are the same work twice.
        let records = [record(1, "metal", 30.0), record(1, "metal", 30.0)];
        let activities = aggregate(&records);

        let activity = &activities[&1];
        assert_eq!(activity.usage.len(), 1);
        assert_eq!(activity.usage[0].api, "metal");
        assert_eq!(activity.percentage, 30.0);
    }

    #[test]
    fn duplicate_coalescing_keeps_the_larger_reading() {
        let records = [record(7, "metal", 12.0), record(7, "metal", 18.0)];
        let activities = aggregate(&records);
        assert_eq!(activities[&7].percentage, 18.0);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let records = [
            record(3, "metal", 10.0),
            record(3, "metal", 10.0),
            record(4, "opengl", 5.0),
        ];
        assert_eq!(aggregate(&records), aggregate(&records));
    }

    #[test]
    fn invalid_pids_are_dropped_without_failing_the_batch() {
        let records = [
            record(0, "metal", 90.0),
            record(-1, "metal", 90.0),
            record(i64::from(u32::MAX) + 1, "metal", 90.0),
            record(5, "metal", 25.0),
        ];
        let activities = aggregate(&records);
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[&5].percentage, 25.0);
    }

    #[test]
    fn consolidated_percentage_is_clamped() {
        let records = [record(9, "metal", 80.0), record(9, "opencl", 45.0)];
        assert_eq!(aggregate(&records)[&9].percentage, 100.0);
    }

    #[test]
    fn first_non_empty_name_wins() {
        let records = [
            RawUsageRecord::new(6, "", "metal", 1.0),
            RawUsageRecord::new(6, "WindowServer", "opengl", 2.0),
            RawUsageRecord::new(6, "other", "opencl", 3.0),
        ];
        assert_eq!(aggregate(&records)[&6].name, "WindowServer");
    }

    #[test]
    fn usage_entries_keep_discovery_order() {
        let records = [
            record(8, "opengl", 1.0),
            record(8, "metal", 2.0),
            record(8, "opengl", 0.5),
        ];
        let aggregated = aggregate(&records);
        let apis: Vec<&str> = aggregated[&8]
            .usage
            .iter()
            .map(|u| u.api.as_str())
            .collect();
        assert_eq!(apis, vec!["opengl", "metal"]);
    }

    #[test]
    fn tie_break_is_ascending_pid() {
        let records = [
            record(30, "metal", 10.0),
            record(10, "metal", 10.0),
            record(20, "metal", 10.0),
        ];
        let activities = aggregate(&records);
        let order: Vec<u32> = sorted_for_display(&activities)
            .iter()
            .map(|a| a.pid)
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }
}
