//! `camac-core`
//!
//! Device-independent core of an ESONE CAMAC driver.
//!
//! The crate sits between callers (device support, test programs, the
//! `rust-camac` CLI) and a [`HardwareBackend`] that knows how to drive one
//! family of branch or serial highway controllers. It owns everything that is
//! the same for every controller:
//!
//! - **Addressing**: validation and packing of branch/crate/slot/subaddress
//!   tuples into opaque [`ChannelAddress`] values ([`address`]).
//! - **Resource registry**: the lazily built branch/crate/slot tree with one
//!   bus lock per branch ([`registry`]).
//! - **LAMs**: deduplicated LAM descriptors, a lossy non-blocking event queue
//!   fed from interrupt context, one dispatcher thread and race-free waits
//!   ([`lam`]).
//! - **Operations**: single actions, general multi-actions, address scans and
//!   the two repeat modes, each with uniform error classification.
//! - **Error statistics**: per-node counters with a decaying rate estimate and
//!   the text I/O report ([`stats`]).
//!
//! ## Example
//!
//! ```rust,ignore
//! use camac_core::{CamacConfig, CamacDriver};
//!
//! let driver = CamacDriver::new(backend, CamacConfig::default());
//! driver.library_init()?;
//! let address = driver.encode(0, 1, 5, 0)?;
//! let mut value: u32 = 0;
//! driver.single_action(0, address, &mut value)?;
//! ```

pub mod address;
pub mod backend;
pub mod config;
pub mod controller;
mod driver;
pub mod error;
pub mod lam;
pub mod registry;
pub mod stats;
pub mod status;
pub mod timeout;

pub use address::{AddressCodec, Bcna, ChannelAddress, FunctionCode, Topology, Word, WordSize};
pub use backend::{BusAccess, ControlBlock, HardwareBackend, ScanRange};
pub use config::CamacConfig;
pub use controller::{ControllerStatus, CrateFunctions};
pub use driver::{Action, BranchLock, CamacDriver, InitRoutine, ReportLevel};
pub use error::{CamacError, Result};
pub use lam::{LamAddressing, LamCallback, LamCodes, LamEvent, LamHandle, LamPoster};
pub use registry::{Branch, CardInit, CrateNode, SlotNode};
pub use stats::{BranchErrorKind, CrateErrorKind, ErrorCounter, SlotErrorKind};
pub use timeout::WAIT_FOREVER;
