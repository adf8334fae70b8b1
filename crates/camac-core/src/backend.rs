//! The hardware backend seam.
//!
//! A backend drives one physical controller family. The core never touches a
//! register itself: it validates, locks, calls into [`HardwareBackend`] and
//! classifies what comes back. Backends report success or failure plus the Q
//! flag of each cycle; X failures and highway faults come back as errors.
//!
//! Crate-level primitives have default implementations that follow the
//! standard crate-controller register conventions (see [`crate::controller`]),
//! so most backends only implement the cycle primitives.

use crate::address::{Bcna, ChannelAddress, FunctionCode, Topology, WordSize};
use crate::controller::{self, ControllerStatus, CrateFunctions};
use crate::error::{CamacError, Result};
use crate::lam::{LamHandle, LamPoster};
use crate::timeout::WAIT_FOREVER;

/// Issues single CAMAC cycles on a branch whose lock is already held.
///
/// Crate hooks and the default crate-controller primitives receive one of
/// these so they can talk to the controller without re-entering the branch
/// lock.
pub trait BusAccess {
    /// Execute one cycle and return its Q flag.
    fn single_action(
        &self,
        function: FunctionCode,
        address: ChannelAddress,
        size: WordSize,
        data: &mut u32,
    ) -> Result<bool>;
}

/// ESONE control block for block transfers.
#[derive(Debug, Clone)]
pub struct ControlBlock {
    /// Number of transfers (or list entries) requested
    pub repeat_count: usize,
    /// Number of transfers actually completed
    pub tally: usize,
    /// LAM to wait for before the transfer starts
    pub lam: Option<LamHandle>,
    /// Timeout for the LAM wait in milliseconds
    pub timeout_ms: i64,
}

impl ControlBlock {
    /// Control block for `repeat_count` transfers with no LAM synchronisation.
    pub fn new(repeat_count: usize) -> Self {
        Self {
            repeat_count,
            tally: 0,
            lam: None,
            timeout_ms: WAIT_FOREVER,
        }
    }

    /// Wait for `lam` (bounded by `timeout_ms`) before transferring.
    pub fn with_lam(mut self, lam: LamHandle, timeout_ms: i64) -> Self {
        self.lam = Some(lam);
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Inclusive address range of a multi-address scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRange {
    /// First address
    pub start: ChannelAddress,
    /// Last address
    pub end: ChannelAddress,
}

/// Primitive operations of one controller family.
pub trait HardwareBackend: Send + Sync + 'static {
    /// Per-branch state returned by [`HardwareBackend::init_branch`].
    type Handle: Send + Sync + 'static;

    /// Driver name used in reports.
    fn name(&self) -> &str;

    /// Highway topology of the controller.
    fn topology(&self) -> Topology;

    /// Pack a validated address.
    fn encode(&self, bcna: Bcna) -> ChannelAddress {
        ChannelAddress::pack(bcna)
    }

    /// Unpack an address. The result is validated by the caller.
    fn decode(&self, address: ChannelAddress) -> Bcna {
        address.unpack()
    }

    /// Bring up a branch. `None` means there is no hardware for it.
    ///
    /// `lams` is the non-blocking producer the backend's interrupt path must
    /// use to report LAMs on this branch.
    fn init_branch(&self, branch: u8, lams: LamPoster) -> Option<Self::Handle>;

    /// Execute one cycle and return its Q flag.
    fn single_action(
        &self,
        handle: &Self::Handle,
        function: FunctionCode,
        address: ChannelAddress,
        size: WordSize,
        data: &mut u32,
    ) -> Result<bool>;

    /// Apply `function` across `range`, filling or draining `data`.
    /// Sets `cb.tally` to the number of transfers made.
    fn address_scan(
        &self,
        handle: &Self::Handle,
        function: FunctionCode,
        range: ScanRange,
        size: WordSize,
        data: &mut [u32],
        cb: &mut ControlBlock,
    ) -> Result<()>;

    /// Repeat `function` at `address` until the module stops answering with Q
    /// or `cb.repeat_count` transfers are done.
    fn repeat_until_no_q(
        &self,
        handle: &Self::Handle,
        function: FunctionCode,
        address: ChannelAddress,
        size: WordSize,
        data: &mut [u32],
        cb: &mut ControlBlock,
    ) -> Result<()>;

    /// Make `cb.repeat_count` transfers, retrying each one until Q (at most
    /// `max_retries` times, then [`CamacError::WaitForQTimeout`]).
    #[allow(clippy::too_many_arguments)]
    fn repeat_until_q(
        &self,
        handle: &Self::Handle,
        function: FunctionCode,
        address: ChannelAddress,
        size: WordSize,
        data: &mut [u32],
        cb: &mut ControlBlock,
        max_retries: u32,
    ) -> Result<()>;

    /// Reject scan ranges the controller cannot walk.
    fn check_scan_range(&self, range: ScanRange) -> Result<()> {
        let start = self.decode(range.start);
        let end = self.decode(range.end);
        if start > end {
            return Err(CamacError::BadAddressRange);
        }
        if start.branch != end.branch {
            return Err(CamacError::MultiBranchScan);
        }
        if start.crate_num != end.crate_num {
            return Err(CamacError::MultiCrate);
        }
        Ok(())
    }

    /// Register addresses and hooks for a newly created crate.
    fn crate_functions(&self, branch: u8, crate_num: u8) -> CrateFunctions {
        CrateFunctions::standard(branch, crate_num, |bcna| self.encode(bcna))
    }

    /// Put the crate controller into a known state.
    fn crate_init(&self, bus: &dyn BusAccess, funcs: &CrateFunctions) -> Result<()> {
        controller::init_crate(bus, funcs)
    }

    /// Slots with a LAM that could have raised a demand (bit `n-1` for slot `n`).
    fn read_lam_pattern(&self, bus: &dyn BusAccess, funcs: &CrateFunctions) -> u32 {
        controller::lam_pattern(bus, funcs)
    }

    /// Issue dataway C.
    fn assert_clear(&self, bus: &dyn BusAccess, funcs: &CrateFunctions) -> Result<()> {
        controller::modify_status(bus, funcs, ControllerStatus::C, true)
    }

    /// Issue dataway Z.
    fn assert_initialize(&self, bus: &dyn BusAccess, funcs: &CrateFunctions) -> Result<()> {
        controller::modify_status(bus, funcs, ControllerStatus::Z, true)
    }

    /// Enable or disable demands from the crate.
    fn set_demand(&self, bus: &dyn BusAccess, funcs: &CrateFunctions, enable: bool) -> Result<()> {
        controller::modify_status(bus, funcs, ControllerStatus::DEMAND_ENABLE, enable)
    }

    /// Test the demand-enable state.
    fn test_demand(&self, bus: &dyn BusAccess, funcs: &CrateFunctions) -> Result<bool> {
        controller::test_status(bus, funcs, ControllerStatus::DEMAND_ENABLE)
    }

    /// Set or clear dataway inhibit.
    fn set_inhibit(&self, bus: &dyn BusAccess, funcs: &CrateFunctions, on: bool) -> Result<()> {
        controller::modify_status(bus, funcs, ControllerStatus::INHIBIT, on)
    }

    /// Read back dataway inhibit.
    fn test_inhibit(&self, bus: &dyn BusAccess, funcs: &CrateFunctions) -> Result<bool> {
        controller::test_status(bus, funcs, ControllerStatus::INHIBIT_READBACK)
    }

    /// Test the controller for a pending LAM.
    fn test_lam_present(&self, bus: &dyn BusAccess, funcs: &CrateFunctions) -> Result<bool> {
        controller::test_status(bus, funcs, ControllerStatus::LAM_PRESENT)
    }
}
