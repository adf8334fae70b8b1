//! LAM registration and control (cdlam, cclnk, cclm, cclc, ctlm, cclwt).

use super::{BranchLock, CamacDriver};
use crate::address::{Bcna, WordSize};
use crate::backend::{BusAccess, HardwareBackend};
use crate::controller::CrateFunctions;
use crate::error::{CamacError, Result};
use crate::lam::{BoundAction, LamAddressing, LamCallback, LamDescriptor, LamHandle};
use crate::registry::{Branch, CrateNode};
use crate::status;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

fn issue(bus: &dyn BusAccess, action: &BoundAction) -> Result<bool> {
    let mut data = action.mask;
    bus.single_action(action.function, action.address, WordSize::Bits24, &mut data)
}

/// Test a LAM source. Register-style sources are judged on the mask bit,
/// the others on Q.
pub(crate) fn test_on(bus: &dyn BusAccess, lam: &LamDescriptor) -> Result<bool> {
    let Some(action) = &lam.test else {
        return Ok(false);
    };
    let mut data = 0;
    let q = bus.single_action(action.function, action.address, WordSize::Bits24, &mut data)?;
    if action.function.is_read() {
        Ok(data & action.mask != 0)
    } else {
        Ok(q)
    }
}

pub(crate) fn clear_on(bus: &dyn BusAccess, lam: &LamDescriptor) -> Result<()> {
    match &lam.clear {
        Some(action) => issue(bus, action).map(|_| ()),
        None => Ok(()),
    }
}

/// Enable or disable one source.
///
/// Enabling also opens the slot's gate when it has never been opened, or
/// when the source has no disable action of its own (it may then have been
/// silenced by closing the gate). Disabling falls back to closing the gate
/// only if the source cannot be disabled individually.
pub(crate) fn enable_on(
    bus: &dyn BusAccess,
    node: &CrateNode,
    funcs: &CrateFunctions,
    lam: &LamDescriptor,
    handle: &LamHandle,
    enable: bool,
) -> Result<()> {
    if enable {
        let result = match &lam.enable {
            Some(action) => issue(bus, action).map(|_| ()),
            None => Ok(()),
        };
        let slot_mask = handle.slot_mask();
        if node.lam_mask() & slot_mask == 0 || lam.disable.is_none() {
            node.lam_mask.fetch_or(slot_mask, Ordering::AcqRel);
            if let Some(hook) = &funcs.enable_slot_lam {
                hook(bus, funcs, handle.slot());
            }
        }
        result
    } else {
        match &lam.disable {
            Some(action) => issue(bus, action).map(|_| ()),
            None => {
                if let Some(hook) = &funcs.disable_slot_lam {
                    hook(bus, funcs, handle.slot());
                }
                Ok(())
            }
        }
    }
}

impl<B: HardwareBackend> CamacDriver<B> {
    pub(crate) fn lam_crate(&self, handle: &LamHandle) -> Result<(&Branch<B>, &CrateNode)> {
        let branch = self
            .inner
            .registry
            .get(handle.branch())
            .ok_or(CamacError::InvalidLam)?;
        let node = branch
            .crate_node(handle.crate_num())
            .ok_or(CamacError::InvalidLam)?;
        Ok((branch, node))
    }

    fn lam_op<T>(
        &self,
        handle: &LamHandle,
        op: impl FnOnce(&BranchLock<'_, B>, &CrateNode, &CrateFunctions) -> Result<T>,
    ) -> Result<T> {
        status::clear();
        let (branch, node) = status::track(self.lam_crate(handle))?;
        let funcs = node.functions();
        let result = {
            let bus = self.lock(branch);
            op(&bus, node, &funcs)
        };
        if let Err(err) = &result {
            self.record_error(
                Bcna::new(handle.branch(), handle.crate_num(), handle.slot(), 0),
                *err,
            );
        }
        status::track(result)
    }

    /// Register a LAM source (cdlam).
    ///
    /// Registering the same `(slot, addressing)` again returns the existing
    /// handle. The first registration on a crate enables its demands.
    pub fn declare_lam(
        &self,
        branch: u32,
        crate_num: u32,
        slot: u32,
        addressing: LamAddressing,
    ) -> Result<LamHandle> {
        status::clear();
        status::track(self.declare_lam_inner(branch, crate_num, slot, addressing))
    }

    fn declare_lam_inner(
        &self,
        branch: u32,
        crate_num: u32,
        slot: u32,
        addressing: LamAddressing,
    ) -> Result<LamHandle> {
        let codec = &self.inner.codec;
        let b = codec.validate_branch(branch)?;
        let c = codec.validate_crate(crate_num)?;
        let n = codec.validate_lam_slot(slot)?;
        addressing.codes()?;
        let branch_node = self.existing_branch(b)?;
        let node = self.ensure_crate(branch_node, c)?;

        let (handle, needs_demand) = {
            let mut state = node.lam.lock();
            let handle = match state.lookup(n, &addressing) {
                Some(existing) => existing,
                None => {
                    let backend = &self.inner.backend;
                    let lam = LamDescriptor::new(b, c, n, addressing, |bcna| backend.encode(bcna))?;
                    let handle = LamHandle(Arc::new(lam));
                    state.insert(handle.clone())?;
                    debug!(branch = b, crate_num = c, slot = n, ?addressing, "LAM declared");
                    handle
                }
            };
            (handle, !state.lam_init)
        };

        if needs_demand {
            if let Err(err) = self.apply_crate_demand(branch_node, node, true) {
                warn!(branch = b, crate_num = c, error = %err, "Unable to enable crate demands");
            }
        }
        Ok(handle)
    }

    /// Install (or remove) the closure run when a LAM fires (cclnk).
    pub fn link_lam(&self, handle: &LamHandle, callback: Option<LamCallback>) -> Result<()> {
        status::clear();
        status::track(self.lam_crate(handle))?;
        handle.set_callback(callback);
        Ok(())
    }

    /// Enable or disable a LAM source (cclm).
    pub fn enable_lam(&self, handle: &LamHandle, enable: bool) -> Result<()> {
        self.lam_op(handle, |bus, node, funcs| {
            enable_on(bus, node, funcs, &handle.0, handle, enable)
        })
    }

    /// Clear a LAM source (cclc).
    pub fn clear_lam(&self, handle: &LamHandle) -> Result<()> {
        self.lam_op(handle, |bus, _, _| clear_on(bus, &handle.0))
    }

    /// Test a LAM source (ctlm).
    pub fn test_lam(&self, handle: &LamHandle) -> Result<bool> {
        self.lam_op(handle, |bus, _, _| test_on(bus, &handle.0))
    }

    /// Block until the LAM fires (cclwt).
    ///
    /// `None` returns immediately. A timeout of 0 or
    /// [`WAIT_FOREVER`](crate::timeout::WAIT_FOREVER) waits without bound;
    /// short timeouts are rounded up to one clock tick and over-long ones are
    /// rejected with [`CamacError::BadTimeout`].
    pub fn wait_lam(&self, handle: Option<&LamHandle>, timeout_ms: i64) -> Result<()> {
        status::clear();
        match handle {
            Some(lam) => status::track(self.wait_for(lam, timeout_ms)),
            None => Ok(()),
        }
    }

    pub(crate) fn wait_for(&self, handle: &LamHandle, timeout_ms: i64) -> Result<()> {
        let bounds = self.timeout_bounds();
        let limit = bounds.duration(bounds.deadline(timeout_ms)?);
        let deadline = limit.map(|d| Instant::now() + d);
        let (branch, node) = self.lam_crate(handle)?;
        let lam = &handle.0;

        let mut state = node.lam.lock();
        lam.waiting.fetch_add(1, Ordering::AcqRel);
        let generation = lam.generation.load(Ordering::Acquire);

        {
            let funcs = node.functions();
            let bus = self.lock(branch);
            if let Err(err) = enable_on(&bus, node, &funcs, lam, handle, true) {
                debug!(slot = handle.slot(), error = %err, "LAM re-enable before wait failed");
            }
        }

        while lam.generation.load(Ordering::Acquire) == generation {
            match deadline {
                None => lam.fired.wait(&mut state),
                Some(at) => {
                    if lam.fired.wait_until(&mut state, at).timed_out()
                        && lam.generation.load(Ordering::Acquire) == generation
                    {
                        let _ = lam.waiting.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                            Some(n.saturating_sub(1))
                        });
                        return Err(CamacError::LamTimeout);
                    }
                }
            }
        }
        Ok(())
    }
}
