//! Terminal frame rendering.
//!
//! Pure "registry -> text" formatting plus the clear-and-redraw write. Kept
//! apart from `collection` so the telemetry core stays renderer-agnostic: a
//! different front end could consume the same registry.

use std::{
    fmt::Write as _,
    io::{self, Write as _},
    time::Duration,
};

use concat_string::concat_string;
use crossterm::{cursor, execute, terminal};
use itertools::Itertools;

use crate::collection::{
    activity::{ProcessActivity, sorted_for_display},
    registry::{DeviceState, GpuRegistry},
    stats::PerformanceStatistics,
};

const MB: f64 = 1024.0 * 1024.0;

/// Clears the terminal and writes one rendered frame.
pub fn draw(registry: &GpuRegistry, rate: Duration, show_processes: bool) -> io::Result<()> {
    let frame = render_frame(registry, rate, show_processes);
    let mut stdout = io::stdout();
    execute!(
        stdout,
        terminal::Clear(terminal::ClearType::All),
        cursor::MoveTo(0, 0)
    )?;
    stdout.write_all(frame.as_bytes())?;
    stdout.flush()
}

/// Renders one full frame as text.
pub fn render_frame(registry: &GpuRegistry, rate: Duration, show_processes: bool) -> String {
    let mut frame = String::from("GPU TOP (IOKit / AGX)\n========================\n\n");

    if registry.is_empty() {
        frame.push_str("No GPUs found.\n");
    } else {
        for state in registry.devices() {
            render_device(&mut frame, state, show_processes);
        }
    }

    let _ = write!(
        frame,
        "\nUpdated every {} (Ctrl+C to quit)\n",
        humantime::format_duration(rate)
    );
    frame
}

fn render_device(frame: &mut String, state: &DeviceState, show_processes: bool) {
    let device = state.device();
    let _ = writeln!(frame, "GPU #{}", device.index());
    frame.push_str(&concat_string!(
        "  Name: ",
        device.name(),
        " (",
        device.core_count().to_string(),
        " cores)\n"
    ));

    let (first, second) = stats_lines(state.statistics());
    frame.push_str(&first);
    frame.push_str(&second);

    if let Some(err) = state.last_error() {
        let _ = writeln!(frame, "  [showing last good sample: {err}]");
    }

    if show_processes && !state.activities().is_empty() {
        frame.push_str("\n  Processes:\n");
        frame.push_str("    PID     GPU %     API            NAME\n");
        for activity in sorted_for_display(state.activities()) {
            frame.push_str(&process_row(activity));
        }
    }

    frame.push('\n');
}

/// The two per-device stats lines: utilization/memory, then scenes/recovery
/// and hardware readings. Byte counters render in MB, frequency in MHz,
/// voltage in V, power in W.
fn stats_lines(stats: &PerformanceStatistics) -> (String, String) {
    let first = format!(
        "  Stats: device={}%  renderer={}%  tiler={}%  alloc_sys={:.1}MB  in_use_sys={:.1}MB  in_use_drv={:.1}MB  pb_alloc={:.1}MB\n",
        stats.device_utilization,
        stats.renderer_utilization,
        stats.tiler_utilization,
        stats.alloc_system_memory as f64 / MB,
        stats.in_use_system_memory as f64 / MB,
        stats.in_use_system_memory_driver as f64 / MB,
        stats.allocated_pb_size as f64 / MB,
    );
    let second = format!(
        "         tiled={:.1}MB  splits={}  recov={}  freq={}MHz  volt={:.1}V  watts={:.1}W  temp={}C\n",
        stats.tiled_scene_bytes as f64 / MB,
        stats.split_scene_count,
        stats.recovery_count,
        stats.gpu_frequency_hz / 1_000_000,
        stats.gpu_voltage_mv as f64 / 1000.0,
        stats.power_mw as f64 / 1000.0,
        stats.temperature_c,
    );
    (first, second)
}

fn process_row(activity: &ProcessActivity) -> String {
    let apis = activity.usage.iter().map(|u| u.api.as_str()).join(",");
    format!(
        "    {:>6}  {:>6.1}%   {:<12}   {}\n",
        activity.pid, activity.percentage, apis, activity.name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::activity::ActivityUsage;

    #[test]
    fn stats_lines_convert_units() {
        let stats = PerformanceStatistics {
            device_utilization: 42.0,
            alloc_system_memory: (512.0 * MB) as u64,
            gpu_frequency_hz: 1_296_000_000,
            gpu_voltage_mv: 815,
            power_mw: 4_250,
            temperature_c: 47.0,
            ..Default::default()
        };
        let (first, second) = stats_lines(&stats);
        assert!(first.contains("device=42%"));
        assert!(first.contains("alloc_sys=512.0MB"));
        assert!(second.contains("freq=1296MHz"));
        assert!(second.contains("volt=0.8V"));
        assert!(second.contains("watts=4.2W"));
        assert!(second.contains("temp=47C"));
    }

    #[test]
    fn process_rows_join_apis() {
        let activity = ProcessActivity {
            pid: 380,
            name: "WindowServer".into(),
            usage: vec![
                ActivityUsage {
                    api: "metal".into(),
                    usage: 20.0,
                },
                ActivityUsage {
                    api: "opencl".into(),
                    usage: 15.0,
                },
            ],
            percentage: 35.0,
        };
        let row = process_row(&activity);
        assert!(row.contains("380"));
        assert!(row.contains("35.0%"));
        assert!(row.contains("metal,opencl"));
        assert!(row.ends_with("WindowServer\n"));
    }
}
