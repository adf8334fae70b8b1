//! Crate controller registers and per-crate hooks.
//!
//! Every crate carries a [`CrateFunctions`] table: the addresses of its
//! controller registers plus optional hooks used by the LAM dispatcher and by
//! `set_crate_demand`. Backends supply the initial table; init routines
//! declared with `declare_init_routine` may rewrite it before the crate is
//! used.
//!
//! The free functions here implement the standard controller at slot 30 and
//! back the default methods of [`HardwareBackend`](crate::backend::HardwareBackend).

use crate::address::{Bcna, ChannelAddress, FunctionCode, WordSize, CONTROLLER_SLOT};
use crate::backend::BusAccess;
use crate::error::{CamacError, Result};
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

/// Status register subaddress.
pub const STATUS_SUBADDRESS: u8 = 0;
/// LAM pattern register subaddress.
pub const LAM_PATTERN_SUBADDRESS: u8 = 12;
/// LAM mask register subaddress.
pub const LAM_MASK_SUBADDRESS: u8 = 13;

const READ: FunctionCode = FunctionCode::READ_LAM;
const WRITE: FunctionCode = FunctionCode::OVERWRITE;

bitflags! {
    /// Bits of the crate controller status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControllerStatus: u16 {
        /// Assert dataway Z
        const Z = 0x0001;
        /// Assert dataway C
        const C = 0x0002;
        /// Dataway inhibit control
        const INHIBIT = 0x0004;
        /// Dataway inhibit read-back
        const INHIBIT_READBACK = 0x0040;
        /// Demand enable
        const DEMAND_ENABLE = 0x0100;
        /// Controller is off line
        const OFFLINE = 0x2000;
        /// A LAM is present in the crate
        const LAM_PRESENT = 0x8000;
    }
}

/// Hook that acts on one slot of a crate. Runs with the branch lock held.
pub type SlotLamHook = Arc<dyn Fn(&dyn BusAccess, &CrateFunctions, u8) + Send + Sync>;

/// Hook that acts on the whole crate. Runs with the branch lock held.
pub type CrateLamHook = Arc<dyn Fn(&dyn BusAccess, &CrateFunctions) + Send + Sync>;

/// Demand grader hook, called after the branch lock is released.
pub type GraderHook = Arc<dyn Fn(&CrateFunctions) + Send + Sync>;

/// Controller register addresses and hooks of one crate.
#[derive(Clone)]
pub struct CrateFunctions {
    /// Branch of the crate
    pub branch: u8,
    /// Crate number
    pub crate_num: u8,
    /// Controller status register
    pub status: ChannelAddress,
    /// LAM pattern register
    pub lam_pattern: ChannelAddress,
    /// LAM mask register
    pub lam_mask: ChannelAddress,
    /// Stop a slot from raising demands
    pub disable_slot_lam: Option<SlotLamHook>,
    /// Let a slot raise demands again
    pub enable_slot_lam: Option<SlotLamHook>,
    /// Acknowledge a slot demand before dispatch
    pub ack_slot_lam: Option<SlotLamHook>,
    /// Re-arm crate demands after a pattern scan
    pub reset_crate_lam: Option<CrateLamHook>,
    /// Called when crate demands are enabled
    pub enable_grader: Option<GraderHook>,
    /// Called when crate demands are disabled
    pub disable_grader: Option<GraderHook>,
}

impl CrateFunctions {
    /// Table with register addresses only and no hooks.
    pub fn bare(branch: u8, crate_num: u8, encode: impl Fn(Bcna) -> ChannelAddress) -> Self {
        let at = |a| encode(Bcna::new(branch, crate_num, CONTROLLER_SLOT, a));
        Self {
            branch,
            crate_num,
            status: at(STATUS_SUBADDRESS),
            lam_pattern: at(LAM_PATTERN_SUBADDRESS),
            lam_mask: at(LAM_MASK_SUBADDRESS),
            disable_slot_lam: None,
            enable_slot_lam: None,
            ack_slot_lam: None,
            reset_crate_lam: None,
            enable_grader: None,
            disable_grader: None,
        }
    }

    /// Table for the standard controller: slot LAMs are gated through the
    /// mask register and a pattern scan is re-armed by enabling demands.
    pub fn standard(branch: u8, crate_num: u8, encode: impl Fn(Bcna) -> ChannelAddress) -> Self {
        let mut funcs = Self::bare(branch, crate_num, encode);
        funcs.disable_slot_lam = Some(Arc::new(|bus, funcs, slot| {
            if let Err(err) = set_slot_mask(bus, funcs, slot, false) {
                tracing::debug!(branch = funcs.branch, crate_num = funcs.crate_num, slot, error = %err, "disable slot LAM failed");
            }
        }));
        funcs.enable_slot_lam = Some(Arc::new(|bus, funcs, slot| {
            if let Err(err) = set_slot_mask(bus, funcs, slot, true) {
                tracing::debug!(branch = funcs.branch, crate_num = funcs.crate_num, slot, error = %err, "enable slot LAM failed");
            }
        }));
        funcs.reset_crate_lam = Some(Arc::new(|bus, funcs| {
            if let Err(err) = modify_status(bus, funcs, ControllerStatus::DEMAND_ENABLE, true) {
                tracing::debug!(branch = funcs.branch, crate_num = funcs.crate_num, error = %err, "reset crate LAM failed");
            }
        }));
        funcs
    }
}

impl fmt::Debug for CrateFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrateFunctions")
            .field("branch", &self.branch)
            .field("crate_num", &self.crate_num)
            .field("status", &self.status)
            .field("lam_pattern", &self.lam_pattern)
            .field("lam_mask", &self.lam_mask)
            .field("disable_slot_lam", &self.disable_slot_lam.is_some())
            .field("enable_slot_lam", &self.enable_slot_lam.is_some())
            .field("ack_slot_lam", &self.ack_slot_lam.is_some())
            .field("reset_crate_lam", &self.reset_crate_lam.is_some())
            .field("enable_grader", &self.enable_grader.is_some())
            .field("disable_grader", &self.disable_grader.is_some())
            .finish()
    }
}

/// Read a controller register. `None` when the controller gave no Q.
pub fn read_register(bus: &dyn BusAccess, address: ChannelAddress) -> Result<Option<u32>> {
    let mut data = 0;
    if bus.single_action(READ, address, WordSize::Bits24, &mut data)? {
        Ok(Some(data & WordSize::Bits24.mask()))
    } else {
        Ok(None)
    }
}

/// Write a controller register, mapping a missing Q to [`CamacError::NoQ`].
pub fn write_register(bus: &dyn BusAccess, address: ChannelAddress, value: u32) -> Result<()> {
    let mut data = value & WordSize::Bits24.mask();
    if bus.single_action(WRITE, address, WordSize::Bits24, &mut data)? {
        Ok(())
    } else {
        Err(CamacError::NoQ)
    }
}

fn read_status(bus: &dyn BusAccess, funcs: &CrateFunctions) -> Result<ControllerStatus> {
    let raw = read_register(bus, funcs.status)?.ok_or(CamacError::NoQ)?;
    Ok(ControllerStatus::from_bits_retain(raw as u16))
}

/// Clear the status and mask registers.
pub fn init_crate(bus: &dyn BusAccess, funcs: &CrateFunctions) -> Result<()> {
    write_register(bus, funcs.status, 0)?;
    write_register(bus, funcs.lam_mask, 0)
}

/// Pending LAMs gated by the mask register; 0 when either read fails.
pub fn lam_pattern(bus: &dyn BusAccess, funcs: &CrateFunctions) -> u32 {
    let pattern = read_register(bus, funcs.lam_pattern);
    let mask = read_register(bus, funcs.lam_mask);
    match (pattern, mask) {
        (Ok(Some(pattern)), Ok(Some(mask))) => pattern & mask,
        _ => 0,
    }
}

/// Read-modify-write of status bits.
pub fn modify_status(
    bus: &dyn BusAccess,
    funcs: &CrateFunctions,
    bits: ControllerStatus,
    set: bool,
) -> Result<()> {
    let mut status = read_status(bus, funcs)?;
    status.set(bits, set);
    write_register(bus, funcs.status, u32::from(status.bits()))
}

/// Test status bits.
pub fn test_status(bus: &dyn BusAccess, funcs: &CrateFunctions, bits: ControllerStatus) -> Result<bool> {
    Ok(read_status(bus, funcs)?.contains(bits))
}

/// Set or clear the mask register bit of `slot`.
pub fn set_slot_mask(bus: &dyn BusAccess, funcs: &CrateFunctions, slot: u8, on: bool) -> Result<()> {
    if slot == 0 {
        return Err(CamacError::InvalidSlot(0));
    }
    let bit = 1u32 << (slot - 1);
    let mask = read_register(bus, funcs.lam_mask)?.ok_or(CamacError::NoQ)?;
    let mask = if on { mask | bit } else { mask & !bit };
    write_register(bus, funcs.lam_mask, mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Registers {
        values: RefCell<HashMap<u32, u32>>,
        silent: Option<ChannelAddress>,
    }

    impl BusAccess for Registers {
        fn single_action(
            &self,
            function: FunctionCode,
            address: ChannelAddress,
            _size: WordSize,
            data: &mut u32,
        ) -> Result<bool> {
            if self.silent == Some(address) {
                return Ok(false);
            }
            let mut values = self.values.borrow_mut();
            if function.is_read() {
                *data = values.get(&address.raw()).copied().unwrap_or(0);
            } else {
                values.insert(address.raw(), *data);
            }
            Ok(true)
        }
    }

    fn funcs() -> CrateFunctions {
        CrateFunctions::standard(0, 1, ChannelAddress::pack)
    }

    #[test]
    fn test_register_addresses() {
        let f = funcs();
        assert_eq!(f.status.unpack(), Bcna::new(0, 1, 30, 0));
        assert_eq!(f.lam_pattern.unpack(), Bcna::new(0, 1, 30, 12));
        assert_eq!(f.lam_mask.unpack(), Bcna::new(0, 1, 30, 13));
        assert!(f.disable_slot_lam.is_some());
        assert!(f.ack_slot_lam.is_none());
    }

    #[test]
    fn test_status_read_modify_write() {
        let bus = Registers::default();
        let f = funcs();
        write_register(&bus, f.status, 0x0040).unwrap();
        modify_status(&bus, &f, ControllerStatus::DEMAND_ENABLE, true).unwrap();
        assert!(test_status(&bus, &f, ControllerStatus::DEMAND_ENABLE).unwrap());
        assert!(test_status(&bus, &f, ControllerStatus::INHIBIT_READBACK).unwrap());
        modify_status(&bus, &f, ControllerStatus::DEMAND_ENABLE, false).unwrap();
        assert!(!test_status(&bus, &f, ControllerStatus::DEMAND_ENABLE).unwrap());
    }

    #[test]
    fn test_missing_q_is_no_q() {
        let f = funcs();
        let bus = Registers {
            silent: Some(f.status),
            ..Default::default()
        };
        assert_eq!(
            modify_status(&bus, &f, ControllerStatus::C, true),
            Err(CamacError::NoQ)
        );
    }

    #[test]
    fn test_lam_pattern_is_gated_by_mask() {
        let bus = Registers::default();
        let f = funcs();
        write_register(&bus, f.lam_pattern, 0b1011).unwrap();
        write_register(&bus, f.lam_mask, 0b0011).unwrap();
        assert_eq!(lam_pattern(&bus, &f), 0b0011);

        let silent = Registers {
            silent: Some(f.lam_mask),
            ..Default::default()
        };
        write_register(&silent, f.lam_pattern, 0xFF).unwrap();
        assert_eq!(lam_pattern(&silent, &f), 0);
    }

    #[test]
    fn test_slot_hooks_toggle_mask_bit() {
        let bus = Registers::default();
        let f = funcs();
        init_crate(&bus, &f).unwrap();
        let enable = f.enable_slot_lam.clone().unwrap();
        let disable = f.disable_slot_lam.clone().unwrap();
        enable(&bus, &f, 5);
        enable(&bus, &f, 1);
        assert_eq!(read_register(&bus, f.lam_mask).unwrap(), Some(0b1_0001));
        disable(&bus, &f, 5);
        assert_eq!(read_register(&bus, f.lam_mask).unwrap(), Some(0b1));
    }
}
