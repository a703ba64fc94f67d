//! Runtime options: CLI flags merged over an optional TOML config file.
//!
//! Flags always win over the file; the file wins over built-in defaults.
//! The config file lives at `<config dir>/agxtop/agxtop.toml` unless
//! `--config` points elsewhere.

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

const DEFAULT_RATE: Duration = Duration::from_secs(1);
const CONFIG_DIR: &str = "agxtop";
const CONFIG_FILE: &str = "agxtop.toml";

#[derive(Debug, Parser)]
#[command(author, version, about = "A live terminal monitor for Apple GPUs.")]
pub struct Args {
    /// Refresh rate, e.g. "1s" or "250ms".
    #[arg(short = 'r', long, value_parser = humantime::parse_duration)]
    pub rate: Option<Duration>,

    /// Path to a TOML config file.
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Exit after this many refresh cycles instead of running until
    /// interrupted. Mostly useful for scripting and testing.
    #[arg(long)]
    pub iterations: Option<u64>,

    /// Hide the per-process activity table.
    #[arg(long)]
    pub no_processes: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    /// Refresh rate as a humantime string, e.g. "1s".
    rate: Option<String>,
    show_processes: Option<bool>,
}

/// Fully resolved runtime options.
#[derive(Clone, Debug)]
pub struct Options {
    pub rate: Duration,
    pub iterations: Option<u64>,
    pub show_processes: bool,
}

impl Options {
    /// Resolves options from CLI args and the config file, if one exists.
    ///
    /// A missing default-location file is fine; a missing file passed via
    /// `--config` is an error.
    pub fn load(args: &Args) -> anyhow::Result<Options> {
        let file = match &args.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("could not read config file {}", path.display()))?;
                parse_config(&contents)?
            }
            None => match default_config_path().and_then(|p| std::fs::read_to_string(p).ok()) {
                Some(contents) => parse_config(&contents)?,
                None => ConfigFile::default(),
            },
        };
        merge(args, file)
    }
}

fn parse_config(contents: &str) -> anyhow::Result<ConfigFile> {
    toml_edit::de::from_str(contents).context("invalid config file")
}

fn merge(args: &Args, file: ConfigFile) -> anyhow::Result<Options> {
    let rate = match (args.rate, &file.rate) {
        (Some(rate), _) => rate,
        (None, Some(rate)) => humantime::parse_duration(rate)
            .with_context(|| format!("invalid rate {rate:?} in config file"))?,
        (None, None) => DEFAULT_RATE,
    };

    Ok(Options {
        rate,
        iterations: args.iterations,
        show_processes: !args.no_processes && file.show_processes.unwrap_or(true),
    })
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        let mut full = vec!["agxtop"];
        full.extend_from_slice(argv);
        Args::parse_from(full)
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let options = merge(&args(&[]), ConfigFile::default()).unwrap();
        assert_eq!(options.rate, DEFAULT_RATE);
        assert_eq!(options.iterations, None);
        assert!(options.show_processes);
    }

    #[test]
    fn cli_rate_beats_config_file() {
        let file = parse_config("rate = \"5s\"").unwrap();
        let options = merge(&args(&["--rate", "2s"]), file).unwrap();
        assert_eq!(options.rate, Duration::from_secs(2));

        let file = parse_config("rate = \"5s\"").unwrap();
        let options = merge(&args(&[]), file).unwrap();
        assert_eq!(options.rate, Duration::from_secs(5));
    }

    #[test]
    fn bad_rate_in_config_file_is_an_error() {
        let file = parse_config("rate = \"very fast\"").unwrap();
        assert!(merge(&args(&[]), file).is_err());
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        assert!(parse_config("rtae = \"1s\"").is_err());
    }

    #[test]
    fn no_processes_flag_wins_over_file() {
        let file = parse_config("show_processes = true").unwrap();
        let options = merge(&args(&["--no-processes"]), file).unwrap();
        assert!(!options.show_processes);

        let file = parse_config("show_processes = false").unwrap();
        let options = merge(&args(&[]), file).unwrap();
        assert!(!options.show_processes);
    }
}
