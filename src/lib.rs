//! # rust-camac
//!
//! Front end for the [`camac_core`] driver. The library half holds what the
//! `rust-camac` binary and its tests share:
//!
//! - **`config`**: the TOML plus environment configuration (`AppConfig`),
//!   loaded with Figment and validated before use.
//! - **`logging`**: `tracing-subscriber` setup in pretty, compact or JSON
//!   format.
//! - **`simulation`**: a [`camac_core::CamacDriver`] running on the simulated
//!   highway from `camac-driver-mock`, populated from configuration.

pub mod config;
pub mod logging;
pub mod simulation;
