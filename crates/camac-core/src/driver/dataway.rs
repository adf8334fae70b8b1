//! Crate-level dataway operations (cccc, cccz, cccd, ctcd, ctgl, ccci, ctci).
//!
//! Each takes any channel address inside the crate. A crate seen for the
//! first time is created and initialised before the operation runs.

use super::{BranchLock, CamacDriver};
use crate::address::{Bcna, ChannelAddress, CONTROLLER_SLOT};
use crate::backend::HardwareBackend;
use crate::controller::CrateFunctions;
use crate::error::{CamacError, Result};
use crate::registry::{Branch, CrateNode};
use crate::status;
use std::sync::atomic::Ordering;
use tracing::debug;

impl<B: HardwareBackend> CamacDriver<B> {
    fn crate_op<T>(
        &self,
        address: ChannelAddress,
        op: impl FnOnce(&B, &BranchLock<'_, B>, &CrateFunctions) -> Result<T>,
    ) -> Result<T> {
        status::clear();
        let (bcna, branch) = status::track(self.resolve(address))?;
        let node = status::track(
            branch
                .crate_node(bcna.crate_num)
                .ok_or(CamacError::InvalidAddress),
        )?;
        let funcs = node.functions();
        let result = {
            let bus = self.lock(branch);
            op(&self.inner.backend, &bus, &funcs)
        };
        self.finish_crate(bcna, result)
    }

    fn finish_crate<T>(&self, bcna: Bcna, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.record_error(Bcna::new(bcna.branch, bcna.crate_num, CONTROLLER_SLOT, 0), *err);
        }
        status::track(result)
    }

    /// Assert dataway C (cccc).
    pub fn assert_clear(&self, address: ChannelAddress) -> Result<()> {
        self.crate_op(address, |backend, bus, funcs| backend.assert_clear(bus, funcs))
    }

    /// Assert dataway Z (cccz).
    pub fn assert_initialize(&self, address: ChannelAddress) -> Result<()> {
        self.crate_op(address, |backend, bus, funcs| backend.assert_initialize(bus, funcs))
    }

    /// Enable or disable crate demands (cccd).
    ///
    /// The setting is remembered and re-applied whenever the crate is
    /// re-initialised. The crate's grader hook runs after the bus is released.
    pub fn set_crate_demand(&self, address: ChannelAddress, enable: bool) -> Result<()> {
        status::clear();
        let (bcna, branch) = status::track(self.resolve(address))?;
        let node = status::track(
            branch
                .crate_node(bcna.crate_num)
                .ok_or(CamacError::InvalidAddress),
        )?;
        let result = self.apply_crate_demand(branch, node, enable);
        self.finish_crate(bcna, result)
    }

    pub(crate) fn apply_crate_demand(&self, branch: &Branch<B>, node: &CrateNode, enable: bool) -> Result<()> {
        let funcs = node.functions();
        let result = {
            let bus = self.lock(branch);
            node.lams_enabled.store(enable, Ordering::Release);
            self.inner.backend.set_demand(&bus, &funcs, enable)
        };
        node.lam.lock().lam_init = true;
        debug!(
            branch = node.branch(),
            crate_num = node.number(),
            enable,
            ok = result.is_ok(),
            "Crate demand"
        );

        let grader = if enable {
            funcs.enable_grader.clone()
        } else {
            funcs.disable_grader.clone()
        };
        if let Some(grader) = grader {
            grader(&funcs);
        }
        result
    }

    /// Test whether crate demands are enabled (ctcd).
    pub fn test_crate_demand(&self, address: ChannelAddress) -> Result<bool> {
        self.crate_op(address, |backend, bus, funcs| backend.test_demand(bus, funcs))
    }

    /// Test whether a LAM is present in the crate (ctgl).
    pub fn test_crate_lam(&self, address: ChannelAddress) -> Result<bool> {
        self.crate_op(address, |backend, bus, funcs| backend.test_lam_present(bus, funcs))
    }

    /// Set or remove dataway inhibit (ccci).
    pub fn set_inhibit(&self, address: ChannelAddress, on: bool) -> Result<()> {
        self.crate_op(address, |backend, bus, funcs| backend.set_inhibit(bus, funcs, on))
    }

    /// Test dataway inhibit (ctci).
    pub fn test_inhibit(&self, address: ChannelAddress) -> Result<bool> {
        self.crate_op(address, |backend, bus, funcs| backend.test_inhibit(bus, funcs))
    }
}
