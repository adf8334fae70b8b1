//! LAM dispatcher: turns queued LAM events into cleared sources, callbacks
//! and woken waiters.

use super::lam::{clear_on, enable_on, test_on};
use super::{CamacDriver, DriverInner};
use crate::address::{Bcna, FunctionCode, WordSize, MAX_NORMAL_SLOT, MAX_SUBADDRESS};
use crate::backend::{BusAccess, HardwareBackend};
use crate::lam::{LamEvent, LamHandle};
use crate::registry::{Branch, CrateNode};
use crate::stats::{ErrorCategory, SlotErrorKind};
use std::sync::atomic::Ordering;
use std::sync::Weak;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const REGISTER_CLEAR_SUBADDRESS: u8 = 12;
const REGISTER_GATE_SUBADDRESS: u8 = 13;

const UNEXPECTED_LAM: ErrorCategory = ErrorCategory::Slot(SlotErrorKind::UnexpectedLam);

/// Body of the `camac-lam` thread. Exits once the driver is gone.
pub(super) fn run_worker<B: HardwareBackend>(
    driver: Weak<DriverInner<B>>,
    mut receiver: mpsc::Receiver<LamEvent>,
) {
    debug!("LAM dispatcher started");
    while let Some(event) = receiver.blocking_recv() {
        let Some(inner) = driver.upgrade() else {
            break;
        };
        CamacDriver::from_inner(inner).process_lam_event(event);
    }
    debug!("LAM dispatcher stopped");
}

impl<B: HardwareBackend> CamacDriver<B> {
    /// Handle one LAM event on the calling thread.
    ///
    /// The dispatcher thread calls this for every queued event. An event for a
    /// crate that does not exist yet only initialises the crate.
    pub fn process_lam_event(&self, event: LamEvent) {
        trace!(?event, "LAM event");
        let Some(branch) = self.branch(event.branch) else {
            debug!(branch = event.branch, "LAM event for unknown branch");
            return;
        };
        let Ok(crate_num) = self.inner.codec.validate_crate(u32::from(event.crate_num)) else {
            debug!(crate_num = event.crate_num, "LAM event for illegal crate");
            return;
        };
        let Some(node) = branch.crate_node(crate_num) else {
            if let Err(err) = self.initialize_crate(branch, crate_num, true) {
                warn!(branch = event.branch, crate_num, error = %err, "Crate init on LAM failed");
            }
            return;
        };

        let funcs = node.functions();
        match event.slot {
            Some(slot) if (1..=MAX_NORMAL_SLOT).contains(&slot) => {
                if let Some(ack) = &funcs.ack_slot_lam {
                    let bus = self.lock(branch);
                    ack(&bus, &funcs, slot);
                }
                let claimed = self.deliver_lams(branch, node, slot);
                // A silenced slot stays gated off
                if claimed {
                    if let Some(enable) = &funcs.enable_slot_lam {
                        let bus = self.lock(branch);
                        enable(&bus, &funcs, slot);
                    }
                }
            }
            _ => {
                let pattern = {
                    let bus = self.lock(branch);
                    self.inner.backend.read_lam_pattern(&bus, &funcs)
                };
                for slot in 1..=MAX_NORMAL_SLOT {
                    if pattern & (1 << (slot - 1)) != 0 {
                        self.deliver_lams(branch, node, slot);
                    }
                }
                if let Some(reset) = &funcs.reset_crate_lam {
                    let bus = self.lock(branch);
                    reset(&bus, &funcs);
                }
            }
        }
    }

    /// Deliver a slot's LAM to the descriptors that claim it. Returns
    /// `false` when no descriptor claimed it and the slot was silenced.
    fn deliver_lams(&self, branch: &Branch<B>, node: &CrateNode, slot: u8) -> bool {
        let lams: Vec<LamHandle> = node.lam.lock().slot_list(slot).to_vec();
        let test_each = lams.len() > 1;
        let funcs = node.functions();
        let mut claimed = false;

        for handle in &lams {
            let lam = &handle.0;
            let fired = if test_each {
                let bus = self.lock(branch);
                test_on(&bus, lam).unwrap_or_else(|err| {
                    debug!(slot, error = %err, "LAM test failed");
                    false
                })
            } else {
                true
            };
            if !fired {
                continue;
            }
            claimed = true;

            {
                let bus = self.lock(branch);
                if let Err(err) = clear_on(&bus, lam) {
                    debug!(slot, error = %err, "LAM clear failed");
                }
            }

            let callback = lam.callback();
            if let Some(callback) = &callback {
                callback();
            }

            let woken = {
                let _state = node.lam.lock();
                let waiting = lam.waiting.swap(0, Ordering::AcqRel);
                if waiting > 0 {
                    lam.generation.fetch_add(1, Ordering::AcqRel);
                    lam.fired.notify_all();
                }
                waiting
            };

            if woken == 0 && callback.is_none() {
                let bus = self.lock(branch);
                if let Err(err) = enable_on(&bus, node, &funcs, lam, handle, false) {
                    debug!(slot, error = %err, "LAM disable failed");
                }
                self.record_category(
                    Bcna::new(node.branch(), node.number(), slot, 0),
                    UNEXPECTED_LAM,
                );
                debug!(
                    branch = node.branch(),
                    crate_num = node.number(),
                    slot,
                    "Unclaimed LAM disabled"
                );
            } else {
                trace!(slot, woken, "LAM delivered");
            }
        }

        if !claimed {
            self.silence_slot(branch, node, slot);
        }
        claimed
    }

    /// Stop a slot that raised a LAM nobody registered for. Counts one
    /// unexpected LAM against the slot.
    fn silence_slot(&self, branch: &Branch<B>, node: &CrateNode, slot: u8) {
        let funcs = node.functions();
        let renegade = Bcna::new(node.branch(), node.number(), slot, REGISTER_CLEAR_SUBADDRESS);
        let bus = self.lock(branch);
        if let Some(disable) = &funcs.disable_slot_lam {
            disable(&bus, &funcs, slot);
            node.lam_mask.fetch_and(!(1u32 << (slot - 1)), Ordering::AcqRel);
            self.record_category(renegade, UNEXPECTED_LAM);
            warn!(
                branch = node.branch(),
                crate_num = node.number(),
                slot,
                "Renegade LAM, slot disabled"
            );
            return;
        }

        let backend = &self.inner.backend;
        let at = |a| backend.encode(Bcna::new(node.branch(), node.number(), slot, a));
        for a in 0..=MAX_SUBADDRESS {
            let address = at(a);
            let mut dummy = 0;
            let _ = bus.single_action(FunctionCode::CLEAR_LAM, address, WordSize::Bits16, &mut dummy);
            let _ = bus.single_action(FunctionCode::DISABLE_LAM, address, WordSize::Bits16, &mut dummy);
        }
        for a in [REGISTER_CLEAR_SUBADDRESS, REGISTER_GATE_SUBADDRESS] {
            let mut mask = WordSize::Bits24.mask();
            let _ = bus.single_action(FunctionCode::SELECTIVE_CLEAR, at(a), WordSize::Bits24, &mut mask);
        }
        self.record_category(renegade, UNEXPECTED_LAM);
        warn!(
            branch = node.branch(),
            crate_num = node.number(),
            slot,
            "Renegade LAM, all sources in slot cleared and disabled"
        );
    }
}
