//! Driver configuration.
//!
//! These are the boot-time constants of the driver core. The struct is plain
//! `serde` data; applications load it with figment as part of their own
//! configuration file and call [`CamacConfig::validate`] before use.

use crate::address::MAX_CRATE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the CAMAC driver core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CamacConfig {
    /// Branches probed by `library_init` (all of `0..=max_branch` when unset)
    pub branches: Option<Vec<u8>>,
    /// Highest branch number
    pub max_branch: u8,
    /// Lowest crate number (topology default when unset)
    pub min_crate: Option<u8>,
    /// Highest crate number (topology default when unset)
    pub max_crate: Option<u8>,
    /// Depth of the LAM event queue
    pub lam_queue_depth: usize,
    /// Attempts per transfer for repeat-until-Q before giving up
    pub max_noq_retry: u32,
    /// Error-rate decay constant, 0 < decay < 1 (smaller decays faster)
    pub error_decay: f64,
    /// Rates below this snap to zero
    pub error_rate_threshold: f64,
    /// Period of the error-rate monitor
    pub monitor_period_ms: u64,
    /// Host clock rate used to convert wait timeouts to ticks
    pub tick_rate_hz: u32,
}

impl Default for CamacConfig {
    fn default() -> Self {
        Self {
            branches: None,
            max_branch: 7,
            min_crate: None,
            max_crate: None,
            lam_queue_depth: 64,
            max_noq_retry: 100,
            error_decay: 0.6,
            error_rate_threshold: 0.005,
            monitor_period_ms: 1000,
            tick_rate_hz: 60,
        }
    }
}

impl CamacConfig {
    /// Branch numbers `library_init` should probe.
    pub fn branch_numbers(&self) -> Vec<u8> {
        match &self.branches {
            Some(list) => list.clone(),
            None => (0..=self.max_branch).collect(),
        }
    }

    /// Monitor period as a [`Duration`].
    pub fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_period_ms.max(1))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.error_decay > 0.0 && self.error_decay < 1.0) {
            return Err(format!(
                "Invalid error_decay {}. Must be strictly between 0 and 1",
                self.error_decay
            ));
        }

        if !(self.error_rate_threshold >= 0.0) {
            return Err(format!(
                "Invalid error_rate_threshold {}. Must not be negative",
                self.error_rate_threshold
            ));
        }

        if self.lam_queue_depth == 0 {
            return Err("Invalid lam_queue_depth 0. Must be at least 1".to_string());
        }

        if self.max_noq_retry == 0 {
            return Err("Invalid max_noq_retry 0. Must be at least 1".to_string());
        }

        if self.tick_rate_hz == 0 {
            return Err("Invalid tick_rate_hz 0. Must be at least 1".to_string());
        }

        if let Some(max) = self.max_crate {
            if max > MAX_CRATE {
                return Err(format!(
                    "Invalid max_crate {}. Channel addresses hold crates up to {}",
                    max, MAX_CRATE
                ));
            }
        }

        if let (Some(min), Some(max)) = (self.min_crate, self.max_crate) {
            if min > max {
                return Err(format!("Invalid crate range: min_crate {} > max_crate {}", min, max));
            }
        }

        if let Some(branches) = &self.branches {
            if let Some(bad) = branches.iter().find(|b| **b > self.max_branch) {
                return Err(format!(
                    "Branch {} exceeds max_branch {}",
                    bad, self.max_branch
                ));
            }
        }

        Ok(())
    }
}
