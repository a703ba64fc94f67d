//! Entry point for the `agxtop` binary: resolve options, enumerate GPUs,
//! then refresh and redraw once per interval until interrupted.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::Context;
use clap::Parser;

use agxtop::{
    canvas,
    collection::{self, registry::GpuRegistry, scheduler::RefreshScheduler},
    options::{Args, Options},
};

/// File logger for debugging. Not compiled into release builds.
#[cfg(feature = "logging")]
fn init_logger() -> anyhow::Result<()> {
    let format = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    fern::Dispatch::new()
        .format(move |out, message, record| {
            let now = time::OffsetDateTime::now_local()
                .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
            out.finish(format_args!(
                "{} [{}] {}: {}",
                now.format(format).unwrap_or_default(),
                record.level(),
                record.target(),
                message
            ));
        })
        .level(log::LevelFilter::Debug)
        .chain(fern::log_file("agxtop.log")?)
        .apply()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let options = Options::load(&args)?;

    #[cfg(feature = "logging")]
    init_logger()?;

    let source = collection::default_source()
        .context("no GPU telemetry backend is available on this platform")?;
    let mut registry = GpuRegistry::new(source).context("GPU enumeration failed")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    let mut scheduler = RefreshScheduler::new(options.rate);
    let mut cycles: u64 = 0;
    while running.load(Ordering::SeqCst) {
        registry.refresh_all();
        canvas::draw(&registry, options.rate, options.show_processes)?;

        cycles += 1;
        if options.iterations.is_some_and(|limit| cycles >= limit) {
            break;
        }
        scheduler.wait();
    }

    Ok(())
}
