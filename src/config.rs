//! Application configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/rust_camac.toml` by default)
//! 2. environment variables prefixed with `RUST_CAMAC_`, with `__` between
//!    nested keys (e.g. `RUST_CAMAC_CAMAC__MAX_NOQ_RETRY=10`)
//!
//! # Example
//! ```no_run
//! use rust_camac::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), figment::Error>(())
//! ```

use crate::logging::OutputFormat;
use camac_core::{CamacConfig, Topology};
use camac_driver_mock::ModulePlacement;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/rust_camac.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Driver core tunables
    #[serde(default)]
    pub camac: CamacConfig,
    /// Simulated highway contents
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// The simulated highway the CLI drives.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Driver name shown in reports
    #[serde(default = "default_driver_name")]
    pub driver_name: String,
    /// Highway topology
    #[serde(default = "default_topology")]
    pub topology: Topology,
    /// Modules installed at start-up
    #[serde(default)]
    pub modules: Vec<ModulePlacement>,
}

fn default_name() -> String {
    "rust-camac".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_driver_name() -> String {
    "mock".to_string()
}

fn default_topology() -> Topology {
    Topology::BranchHighway
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            driver_name: default_driver_name(),
            topology: default_topology(),
            modules: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_CAMAC_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        self.camac.validate()?;

        let mut seen = HashSet::new();
        for placement in &self.simulation.modules {
            let at = (placement.branch, placement.crate_num, placement.slot);
            if placement.branch > self.camac.max_branch {
                return Err(format!(
                    "Module '{}' is on branch {} above max_branch {}",
                    placement.module.name, placement.branch, self.camac.max_branch
                ));
            }
            if placement.slot == 0 || placement.slot > camac_core::address::MAX_NORMAL_SLOT {
                return Err(format!(
                    "Module '{}' is in slot {}. Must be 1-{}",
                    placement.module.name,
                    placement.slot,
                    camac_core::address::MAX_NORMAL_SLOT
                ));
            }
            if !seen.insert(at) {
                return Err(format!(
                    "Two modules in branch {} crate {} slot {}",
                    at.0, at.1, at.2
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camac_driver_mock::MockModule;

    fn placement(slot: u8) -> ModulePlacement {
        ModulePlacement {
            branch: 0,
            crate_num: 1,
            slot,
            module: MockModule::new("ADC"),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.simulation.topology, Topology::BranchHighway);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_module_slots() {
        let mut config = AppConfig::default();
        config.simulation.modules = vec![placement(5), placement(5)];
        let err = config.validate().unwrap_err();
        assert!(err.contains("slot 5"));
    }

    #[test]
    fn test_module_slot_range() {
        let mut config = AppConfig::default();
        config.simulation.modules = vec![placement(24)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_camac_section_is_validated() {
        let mut config = AppConfig::default();
        config.camac.lam_queue_depth = 0;
        assert!(config.validate().is_err());
    }
}
