//! Simulated CAMAC highway for rust-camac
//!
//! [`MockHighway`] implements [`camac_core::HardwareBackend`] entirely in
//! memory, so the driver core can be exercised without a branch or serial
//! highway controller.
//!
//! - Modules carry sixteen registers plus per-subaddress and status-register
//!   LAM sources ([`MockModule`], [`LamSource`]).
//! - Slot 30 of every crate behaves like a standard crate controller.
//! - [`MockHighway::raise_lam`] models the interrupt path: it posts through the
//!   driver's LAM producer once the request passes the slot mask and crate
//!   demand gates.
//! - Faults are injected with [`FaultConfig`]; every cycle lands in a call log
//!   and can be observed as it happens.
//!
//! ```rust,ignore
//! use camac_core::{CamacConfig, CamacDriver};
//! use camac_driver_mock::{MockHighway, MockModule};
//!
//! let highway = MockHighway::builder()
//!     .module(0, 1, 5, MockModule::new("ADC").with_register(0, 0x1234))
//!     .build();
//! let driver = CamacDriver::new(highway, CamacConfig::default());
//! driver.library_init()?;
//! ```

pub mod common;
mod highway;
mod module;

pub use common::{FaultConfig, FaultScenario, FaultRng};
pub use highway::{CallObserver, CallRecord, MockBranch, MockHighway, MockHighwayBuilder, ModulePlacement};
pub use module::{LamSource, MockModule};
