//! Common infrastructure for the simulated highway.
//!
//! - **faults**: fault injection framework
//! - **rng**: seeded source for random failures

pub mod faults;
pub mod rng;

pub use faults::{FaultConfig, FaultScenario};
pub use rng::FaultRng;
