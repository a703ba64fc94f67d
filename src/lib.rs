//! A live terminal monitor for Apple GPUs.
//!
//! The crate splits into the telemetry core ([`collection`]) — device
//! enumeration, counter normalization, and per-process activity attribution
//! behind a mockable `CounterSource` boundary — and thin presentation glue
//! ([`canvas`], [`options`]) used by the `agxtop` binary.

pub mod canvas;
pub mod collection;
pub mod options;
