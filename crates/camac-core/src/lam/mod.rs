//! LAM sources: addressing styles, descriptors and per-crate bookkeeping.
//!
//! A LAM source is described by up to four actions (test, clear, enable,
//! disable), each a function code at a subaddress of the module plus an
//! optional bit mask. Modules follow one of two conventions, or the caller
//! supplies the codes explicitly:
//!
//! - **Subaddress style**: F8 test, F10 clear, F26 enable and F24 disable, all
//!   at one subaddress.
//! - **Mask-register style**: the LAM status register is read with F1 at A14,
//!   cleared with F23 at A12 and gated with F19/F23 at A13, each selecting one
//!   bit.
//!
//! Registrations are deduplicated on `(slot, addressing)`: two callers that
//! describe the same physical source share one [`LamHandle`] and therefore one
//! wake channel.

mod queue;

pub use queue::{LamEvent, LamPoster};
pub(crate) use queue::lam_queue;

use crate::address::{Bcna, ChannelAddress, FunctionCode, MAX_NORMAL_SLOT, MAX_SUBADDRESS};
use crate::error::{CamacError, Result};
use parking_lot::{Condvar, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Highest bit a mask-register LAM may select.
pub const MAX_LAM_MASK_BIT: u8 = 23;

const MASK_TEST_SUBADDRESS: u8 = 14;
const MASK_CLEAR_SUBADDRESS: u8 = 12;
const MASK_GATE_SUBADDRESS: u8 = 13;

/// Closure run by the dispatcher when a LAM fires.
pub type LamCallback = Arc<dyn Fn() + Send + Sync>;

/// One LAM action relative to the module's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LamAction {
    /// Subaddress the function is issued at
    pub subaddress: u8,
    /// Function code
    pub function: FunctionCode,
    /// Data mask (bit selector for register-style sources, 0 otherwise)
    pub mask: u32,
}

impl LamAction {
    /// Action without a data mask.
    pub const fn new(subaddress: u8, function: FunctionCode) -> Self {
        Self {
            subaddress,
            function,
            mask: 0,
        }
    }

    /// Action acting on the bits in `mask`.
    pub const fn with_mask(subaddress: u8, function: FunctionCode, mask: u32) -> Self {
        Self {
            subaddress,
            function,
            mask,
        }
    }
}

/// Explicit LAM action codes; `None` means the action is not available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LamCodes {
    /// Test whether the source fired
    pub test: Option<LamAction>,
    /// Clear the source
    pub clear: Option<LamAction>,
    /// Enable the source
    pub enable: Option<LamAction>,
    /// Disable the source
    pub disable: Option<LamAction>,
}

/// How a LAM source is addressed within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LamAddressing {
    /// Standard LAM functions at one subaddress
    Subaddress(u8),
    /// One bit of the module's LAM status/mask registers
    MaskRegister(u8),
    /// Caller-supplied codes
    Custom(LamCodes),
}

impl LamAddressing {
    /// Interpret the classic `m` argument: `m >= 0` selects subaddress style
    /// at A`m`, `m < 0` selects mask-register bit `-(m + 1)`.
    pub fn from_classic(m: i32) -> Result<Self> {
        if m >= 0 {
            if m > i32::from(MAX_SUBADDRESS) {
                return Err(CamacError::InvalidSubaddress(m as u32));
            }
            return Ok(Self::Subaddress(m as u8));
        }
        let bit = -(i64::from(m) + 1);
        if bit > i64::from(MAX_LAM_MASK_BIT) {
            return Err(CamacError::InvalidSubaddress(bit as u32));
        }
        Ok(Self::MaskRegister(bit as u8))
    }

    /// Resolve into explicit codes, validating subaddresses and mask bits.
    pub fn codes(&self) -> Result<LamCodes> {
        match *self {
            Self::Subaddress(a) => {
                if a > MAX_SUBADDRESS {
                    return Err(CamacError::InvalidSubaddress(u32::from(a)));
                }
                Ok(LamCodes {
                    test: Some(LamAction::new(a, FunctionCode::TEST_LAM)),
                    clear: Some(LamAction::new(a, FunctionCode::CLEAR_LAM)),
                    enable: Some(LamAction::new(a, FunctionCode::ENABLE_LAM)),
                    disable: Some(LamAction::new(a, FunctionCode::DISABLE_LAM)),
                })
            }
            Self::MaskRegister(bit) => {
                if bit > MAX_LAM_MASK_BIT {
                    return Err(CamacError::InvalidSubaddress(u32::from(bit)));
                }
                let mask = 1u32 << bit;
                Ok(LamCodes {
                    test: Some(LamAction::with_mask(MASK_TEST_SUBADDRESS, FunctionCode::READ_LAM, mask)),
                    clear: Some(LamAction::with_mask(
                        MASK_CLEAR_SUBADDRESS,
                        FunctionCode::SELECTIVE_CLEAR,
                        mask,
                    )),
                    enable: Some(LamAction::with_mask(
                        MASK_GATE_SUBADDRESS,
                        FunctionCode::SELECTIVE_SET,
                        mask,
                    )),
                    disable: Some(LamAction::with_mask(
                        MASK_GATE_SUBADDRESS,
                        FunctionCode::SELECTIVE_CLEAR,
                        mask,
                    )),
                })
            }
            Self::Custom(codes) => {
                for action in [codes.test, codes.clear, codes.enable, codes.disable]
                    .into_iter()
                    .flatten()
                {
                    if action.subaddress > MAX_SUBADDRESS {
                        return Err(CamacError::InvalidSubaddress(u32::from(action.subaddress)));
                    }
                }
                Ok(codes)
            }
        }
    }
}

/// A LAM action bound to a concrete channel address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAction {
    /// Encoded module address
    pub address: ChannelAddress,
    /// Function code
    pub function: FunctionCode,
    /// Data mask
    pub mask: u32,
}

/// One registered LAM source.
///
/// `waiting`, `generation` and the condition variable are only touched while
/// the owning crate's LAM lock is held.
pub struct LamDescriptor {
    branch: u8,
    crate_num: u8,
    slot: u8,
    slot_mask: u32,
    addressing: LamAddressing,
    pub(crate) test: Option<BoundAction>,
    pub(crate) clear: Option<BoundAction>,
    pub(crate) enable: Option<BoundAction>,
    pub(crate) disable: Option<BoundAction>,
    pub(crate) waiting: AtomicUsize,
    pub(crate) generation: AtomicU64,
    pub(crate) fired: Condvar,
    callback: RwLock<Option<LamCallback>>,
}

impl LamDescriptor {
    pub(crate) fn new(
        branch: u8,
        crate_num: u8,
        slot: u8,
        addressing: LamAddressing,
        encode: impl Fn(Bcna) -> ChannelAddress,
    ) -> Result<Self> {
        if slot == 0 || slot > MAX_NORMAL_SLOT {
            return Err(CamacError::InvalidSlot(u32::from(slot)));
        }
        let codes = addressing.codes()?;
        let bind = |action: Option<LamAction>| {
            action.map(|a| BoundAction {
                address: encode(Bcna::new(branch, crate_num, slot, a.subaddress)),
                function: a.function,
                mask: a.mask,
            })
        };
        Ok(Self {
            branch,
            crate_num,
            slot,
            slot_mask: 1 << (slot - 1),
            addressing,
            test: bind(codes.test),
            clear: bind(codes.clear),
            enable: bind(codes.enable),
            disable: bind(codes.disable),
            waiting: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            fired: Condvar::new(),
            callback: RwLock::new(None),
        })
    }

    pub(crate) fn callback(&self) -> Option<LamCallback> {
        self.callback.read().clone()
    }
}

impl fmt::Debug for LamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LamDescriptor")
            .field("branch", &self.branch)
            .field("crate_num", &self.crate_num)
            .field("slot", &self.slot)
            .field("addressing", &self.addressing)
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .field("has_callback", &self.callback.read().is_some())
            .finish()
    }
}

/// Shared reference to a registered LAM source.
///
/// Handles compare equal when they refer to the same descriptor.
#[derive(Clone, Debug)]
pub struct LamHandle(pub(crate) Arc<LamDescriptor>);

impl LamHandle {
    /// Branch of the source.
    pub fn branch(&self) -> u8 {
        self.0.branch
    }

    /// Crate of the source.
    pub fn crate_num(&self) -> u8 {
        self.0.crate_num
    }

    /// Slot of the source.
    pub fn slot(&self) -> u8 {
        self.0.slot
    }

    /// Bit of the slot in crate-level LAM masks.
    pub fn slot_mask(&self) -> u32 {
        self.0.slot_mask
    }

    /// Addressing the source was registered with.
    pub fn addressing(&self) -> LamAddressing {
        self.0.addressing
    }

    /// Number of callers currently blocked in `wait_lam`.
    pub fn waiting(&self) -> usize {
        self.0.waiting.load(Ordering::Acquire)
    }

    /// Install or remove the closure run when the source fires.
    pub fn set_callback(&self, callback: Option<LamCallback>) {
        *self.0.callback.write() = callback;
    }

    /// Check whether a callback is installed.
    pub fn has_callback(&self) -> bool {
        self.0.callback.read().is_some()
    }
}

impl PartialEq for LamHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for LamHandle {}

/// LAM bookkeeping of one crate, guarded by the crate's LAM lock.
#[derive(Debug, Default)]
pub(crate) struct LamState {
    by_slot: Vec<Vec<LamHandle>>,
    index: HashMap<(u8, LamAddressing), LamHandle>,
    /// Set once the first LAM is registered or demands were configured
    pub(crate) lam_init: bool,
}

impl LamState {
    pub(crate) fn new() -> Self {
        Self {
            by_slot: vec![Vec::new(); usize::from(MAX_NORMAL_SLOT) + 1],
            index: HashMap::new(),
            lam_init: false,
        }
    }

    /// Canonical handle for `(slot, addressing)`, if registered.
    pub(crate) fn lookup(&self, slot: u8, addressing: &LamAddressing) -> Option<LamHandle> {
        self.index.get(&(slot, *addressing)).cloned()
    }

    /// Add a new descriptor. Fails without side effects if memory runs out.
    pub(crate) fn insert(&mut self, handle: LamHandle) -> Result<()> {
        let slot = usize::from(handle.slot());
        let list = self
            .by_slot
            .get_mut(slot)
            .ok_or(CamacError::InvalidSlot(slot as u32))?;
        list.try_reserve(1)
            .map_err(|_| CamacError::ResourceExhausted("LAM descriptor"))?;
        self.index
            .try_reserve(1)
            .map_err(|_| CamacError::ResourceExhausted("LAM descriptor"))?;
        self.index.insert((handle.slot(), handle.addressing()), handle.clone());
        list.push(handle);
        Ok(())
    }

    /// Descriptors of one slot, in registration order.
    pub(crate) fn slot_list(&self, slot: u8) -> &[LamHandle] {
        self.by_slot
            .get(usize::from(slot))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of descriptors on a slot.
    pub(crate) fn count(&self, slot: u8) -> usize {
        self.slot_list(slot).len()
    }
}
