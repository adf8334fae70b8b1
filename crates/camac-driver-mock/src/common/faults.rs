//! Fault injection for the simulated highway.
//!
//! Faults are checked at the start of every backend primitive. Scripted
//! [`FaultScenario`]s fire deterministically; a seeded failure rate adds
//! random highway timeouts on top.

use super::rng::FaultRng;
use camac_core::{Bcna, CamacError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Operation names understood by [`FaultConfig`].
pub mod op {
    /// Single cycle
    pub const SINGLE_ACTION: &str = "single_action";
    /// Multi-address scan
    pub const ADDRESS_SCAN: &str = "address_scan";
    /// Repeat until no Q
    pub const REPEAT_UNTIL_NO_Q: &str = "repeat_until_no_q";
    /// Repeat until Q
    pub const REPEAT_UNTIL_Q: &str = "repeat_until_q";
    /// Branch bring-up
    pub const INIT_BRANCH: &str = "init_branch";
}

/// Fault injection configuration.
#[derive(Clone, Debug)]
pub struct FaultConfig {
    /// Per-operation failure rate (0.0 to 1.0), `"*"` for every operation
    failure_rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<FaultScenario>>,
    rng: Arc<FaultRng>,
    state: Arc<Mutex<FaultState>>,
}

/// A scripted fault.
#[derive(Debug, Clone)]
pub enum FaultScenario {
    /// Fail with `error` once `operation` has succeeded `count` times
    FailAfterN {
        /// Operation name
        operation: &'static str,
        /// Successful calls before the first failure
        count: u32,
        /// Error returned
        error: CamacError,
    },
    /// Fail every call of `operation`
    Always {
        /// Operation name
        operation: &'static str,
        /// Error returned
        error: CamacError,
    },
    /// One crate reports itself off line
    CrateOffline {
        /// Branch number
        branch: u8,
        /// Crate number
        crate_num: u8,
    },
    /// The highway driver drops out on the first cycle and never recovers
    HighwayDown,
}

#[derive(Default, Debug)]
struct FaultState {
    operation_counts: HashMap<&'static str, u32>,
    highway_down: bool,
}

impl FaultConfig {
    /// No faults.
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Uniform random highway timeouts with a fixed seed.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// A single scripted fault.
    pub fn scenario(scenario: FaultScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scripted faults, checked in order.
    pub fn scenarios(scenarios: Vec<FaultScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Custom failure rates per operation.
    pub fn with_rates(rates: HashMap<&'static str, f64>) -> Self {
        Self::build(rates, Vec::new(), None)
    }

    fn build(rates: HashMap<&'static str, f64>, scenarios: Vec<FaultScenario>, seed: Option<u64>) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(FaultRng::new(seed)),
            state: Arc::new(Mutex::new(FaultState::default())),
        }
    }

    /// Check whether `operation` on `target` should fail.
    pub fn check(&self, operation: &'static str, target: Option<Bcna>) -> Result<(), CamacError> {
        let mut state = self.state.lock();
        if state.highway_down {
            return Err(CamacError::NotReady);
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                FaultScenario::FailAfterN {
                    operation: op,
                    count,
                    error,
                } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current = current.saturating_add(1);
                    if *current > *count {
                        return Err(*error);
                    }
                }
                FaultScenario::Always { operation: op, error } if *op == operation => {
                    return Err(*error);
                }
                FaultScenario::CrateOffline { branch, crate_num } => {
                    if target.is_some_and(|t| t.branch == *branch && t.crate_num == *crate_num) {
                        return Err(CamacError::CrateOffline);
                    }
                }
                FaultScenario::HighwayDown => {
                    state.highway_down = true;
                    return Err(CamacError::NotReady);
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.roll(rate) {
            return Err(CamacError::HardwareTimeout);
        }
        Ok(())
    }

    /// Clear counters and latched faults.
    pub fn reset(&self) {
        *self.state.lock() = FaultState::default();
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: Option<Bcna> = Some(Bcna::new(0, 1, 5, 0));

    #[test]
    fn test_no_faults() {
        let config = FaultConfig::none();
        for _ in 0..100 {
            assert!(config.check(op::SINGLE_ACTION, TARGET).is_ok());
        }
    }

    #[test]
    fn test_random_failures() {
        let config = FaultConfig::random_failures_seeded(0.5, Some(42));
        let failures = (0..1000)
            .filter(|_| config.check(op::SINGLE_ACTION, TARGET).is_err())
            .count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }

    #[test]
    fn test_fail_after_n() {
        let config = FaultConfig::scenario(FaultScenario::FailAfterN {
            operation: op::SINGLE_ACTION,
            count: 3,
            error: CamacError::LongitudinalParity,
        });
        for _ in 0..3 {
            assert!(config.check(op::SINGLE_ACTION, TARGET).is_ok());
        }
        assert_eq!(
            config.check(op::SINGLE_ACTION, TARGET),
            Err(CamacError::LongitudinalParity)
        );
        assert!(config.check(op::ADDRESS_SCAN, TARGET).is_ok());

        config.reset();
        assert!(config.check(op::SINGLE_ACTION, TARGET).is_ok());
    }

    #[test]
    fn test_crate_offline_only_hits_its_crate() {
        let config = FaultConfig::scenario(FaultScenario::CrateOffline {
            branch: 0,
            crate_num: 1,
        });
        assert_eq!(config.check(op::SINGLE_ACTION, TARGET), Err(CamacError::CrateOffline));
        assert!(config
            .check(op::SINGLE_ACTION, Some(Bcna::new(0, 2, 5, 0)))
            .is_ok());
        assert!(config.check(op::INIT_BRANCH, None).is_ok());
    }

    #[test]
    fn test_highway_down_latches() {
        let config = FaultConfig::scenario(FaultScenario::HighwayDown);
        assert_eq!(config.check(op::SINGLE_ACTION, TARGET), Err(CamacError::NotReady));
        assert_eq!(config.check(op::ADDRESS_SCAN, TARGET), Err(CamacError::NotReady));
    }

    #[test]
    fn test_custom_rates() {
        let mut rates = HashMap::new();
        rates.insert(op::REPEAT_UNTIL_Q, 1.0);
        let config = FaultConfig::with_rates(rates);
        assert_eq!(
            config.check(op::REPEAT_UNTIL_Q, TARGET),
            Err(CamacError::HardwareTimeout)
        );
        assert!(config.check(op::SINGLE_ACTION, TARGET).is_ok());
    }
}
