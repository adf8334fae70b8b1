//! Branch, crate and slot nodes.
//!
//! The tree is append-only: nodes are created on first use and live as long
//! as the driver. Each level is a fixed table of `OnceCell`s, so looking up an
//! existing node takes no lock and references to nodes can be handed out
//! freely. Only the contents of a node (bus transactions, LAM lists, counters)
//! are locked.

use crate::address::MAX_SLOT;
use crate::backend::HardwareBackend;
use crate::controller::CrateFunctions;
use crate::lam::LamState;
use crate::stats::{
    BranchErrorKind, CrateErrorKind, DecayPolicy, ErrorCounter, ErrorCounters, SlotErrorKind,
};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Initialisation closure attached to a slot by `register_card`.
pub type CardInit = Arc<dyn Fn() + Send + Sync>;

/// Identity of the module in a slot.
#[derive(Clone)]
pub struct CardRegistration {
    /// Human-readable module name
    pub name: String,
    /// Run whenever the crate is (re)initialised
    pub init: Option<CardInit>,
}

impl fmt::Debug for CardRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardRegistration")
            .field("name", &self.name)
            .field("init", &self.init.is_some())
            .finish()
    }
}

/// One module position in a crate.
#[derive(Debug)]
pub struct SlotNode {
    number: u8,
    pub(crate) card: OnceCell<CardRegistration>,
    pub(crate) errors: Mutex<ErrorCounters<SlotErrorKind>>,
    pub(crate) error_seen: AtomicBool,
}

impl SlotNode {
    fn new(number: u8) -> Self {
        Self {
            number,
            card: OnceCell::new(),
            errors: Mutex::new(ErrorCounters::new()),
            error_seen: AtomicBool::new(false),
        }
    }

    /// Slot number.
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Name of the registered card, if any.
    pub fn card_name(&self) -> Option<&str> {
        self.card.get().map(|card| card.name.as_str())
    }

    /// Snapshot of one error counter.
    pub fn error_counter(&self, kind: SlotErrorKind) -> ErrorCounter {
        self.errors.lock().get(kind)
    }

    /// Check whether any error was ever recorded on this slot.
    pub fn has_errors(&self) -> bool {
        self.error_seen.load(Ordering::Relaxed)
    }

    pub(crate) fn record(&self, kind: SlotErrorKind) {
        self.errors.lock().record(kind);
        self.error_seen.store(true, Ordering::Relaxed);
    }
}

/// One crate on a branch.
pub struct CrateNode {
    branch: u8,
    number: u8,
    pub(crate) functions: RwLock<CrateFunctions>,
    pub(crate) lam: Mutex<LamState>,
    pub(crate) lam_mask: AtomicU32,
    pub(crate) lams_enabled: AtomicBool,
    pub(crate) errors: Mutex<ErrorCounters<CrateErrorKind>>,
    slots: Box<[SlotNode]>,
}

impl CrateNode {
    pub(crate) fn new(branch: u8, number: u8, functions: CrateFunctions) -> Self {
        Self {
            branch,
            number,
            functions: RwLock::new(functions),
            lam: Mutex::new(LamState::new()),
            lam_mask: AtomicU32::new(0),
            lams_enabled: AtomicBool::new(false),
            errors: Mutex::new(ErrorCounters::new()),
            slots: (0..=MAX_SLOT).map(SlotNode::new).collect(),
        }
    }

    /// Branch number.
    pub fn branch(&self) -> u8 {
        self.branch
    }

    /// Crate number.
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Slot node `n` (0..=30).
    pub fn slot(&self, n: u8) -> Option<&SlotNode> {
        self.slots.get(usize::from(n))
    }

    /// All slot nodes, in slot order.
    pub fn slots(&self) -> impl Iterator<Item = &SlotNode> {
        self.slots.iter()
    }

    /// Copy of the crate's register addresses and hooks.
    pub fn functions(&self) -> CrateFunctions {
        self.functions.read().clone()
    }

    /// Number of LAM descriptors registered on `slot`.
    pub fn lam_count(&self, slot: u8) -> usize {
        self.lam.lock().count(slot)
    }

    /// Slots whose LAM has been enabled through the slot hook.
    pub fn lam_mask(&self) -> u32 {
        self.lam_mask.load(Ordering::Acquire)
    }

    /// Last demand-enable state set with `set_crate_demand`.
    pub fn lams_enabled(&self) -> bool {
        self.lams_enabled.load(Ordering::Acquire)
    }

    /// Snapshot of one error counter.
    pub fn error_counter(&self, kind: CrateErrorKind) -> ErrorCounter {
        self.errors.lock().get(kind)
    }

    pub(crate) fn decay_errors(&self, policy: DecayPolicy) {
        self.errors.lock().decay_all(policy);
        for slot in self.slots.iter() {
            if slot.has_errors() {
                slot.errors.lock().decay_all(policy);
            }
        }
    }
}

impl fmt::Debug for CrateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrateNode")
            .field("branch", &self.branch)
            .field("number", &self.number)
            .field("lam_mask", &self.lam_mask())
            .field("lams_enabled", &self.lams_enabled())
            .finish_non_exhaustive()
    }
}

/// One initialised branch.
pub struct Branch<B: HardwareBackend> {
    number: u8,
    pub(crate) handle: B::Handle,
    pub(crate) bus: Mutex<()>,
    pub(crate) errors: Mutex<ErrorCounters<BranchErrorKind>>,
    crates: Box<[OnceCell<CrateNode>]>,
}

impl<B: HardwareBackend> Branch<B> {
    pub(crate) fn new(number: u8, handle: B::Handle, max_crate: u8) -> Self {
        Self {
            number,
            handle,
            bus: Mutex::new(()),
            errors: Mutex::new(ErrorCounters::new()),
            crates: (0..=max_crate).map(|_| OnceCell::new()).collect(),
        }
    }

    /// Branch number.
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Backend state of the branch.
    pub fn handle(&self) -> &B::Handle {
        &self.handle
    }

    /// Crate node, if it has been created.
    pub fn crate_node(&self, crate_num: u8) -> Option<&CrateNode> {
        self.crates.get(usize::from(crate_num)).and_then(OnceCell::get)
    }

    /// Existing crate nodes, in crate order.
    pub fn crates(&self) -> impl Iterator<Item = &CrateNode> {
        self.crates.iter().filter_map(OnceCell::get)
    }

    /// Check whether the branch bus lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.bus.is_locked()
    }

    /// Snapshot of one error counter.
    pub fn error_counter(&self, kind: BranchErrorKind) -> ErrorCounter {
        self.errors.lock().get(kind)
    }

    /// Create the crate node exactly once. Returns the node and whether this
    /// call created it. Caller must hold the bus lock.
    pub(crate) fn insert_crate(
        &self,
        crate_num: u8,
        functions: impl FnOnce() -> CrateFunctions,
    ) -> Option<(&CrateNode, bool)> {
        let cell = self.crates.get(usize::from(crate_num))?;
        let mut created = false;
        let node = cell.get_or_init(|| {
            created = true;
            CrateNode::new(self.number, crate_num, functions())
        });
        Some((node, created))
    }

    /// Fold one monitor period into every counter of the branch.
    pub(crate) fn decay_errors(&self, policy: DecayPolicy) {
        let _bus = self.bus.lock();
        self.errors.lock().decay_all(policy);
        for node in self.crates() {
            node.decay_errors(policy);
        }
    }
}

impl<B: HardwareBackend> fmt::Debug for Branch<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("number", &self.number)
            .field("crates", &self.crates().count())
            .finish_non_exhaustive()
    }
}

/// Table of branches indexed by branch number.
pub(crate) struct Registry<B: HardwareBackend> {
    branches: Box<[OnceCell<Branch<B>>]>,
    creation: Mutex<()>,
}

impl<B: HardwareBackend> Registry<B> {
    pub(crate) fn new(max_branch: u8) -> Self {
        Self {
            branches: (0..=max_branch).map(|_| OnceCell::new()).collect(),
            creation: Mutex::new(()),
        }
    }

    pub(crate) fn get(&self, branch: u8) -> Option<&Branch<B>> {
        self.branches.get(usize::from(branch)).and_then(OnceCell::get)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Branch<B>> {
        self.branches.iter().filter_map(OnceCell::get)
    }

    /// Run `create` under the creation lock unless the branch already exists.
    /// Returns `None` when `create` reports no hardware.
    pub(crate) fn get_or_create(
        &self,
        branch: u8,
        create: impl FnOnce() -> Option<Branch<B>>,
    ) -> Option<(&Branch<B>, bool)> {
        let cell = self.branches.get(usize::from(branch))?;
        if let Some(existing) = cell.get() {
            return Some((existing, false));
        }
        let _guard = self.creation.lock();
        if let Some(existing) = cell.get() {
            return Some((existing, false));
        }
        let node = create()?;
        Some((cell.get_or_init(|| node), true))
    }
}
