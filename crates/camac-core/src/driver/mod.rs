//! The CAMAC driver: registry, lifecycle and the public operation surface.
//!
//! [`CamacDriver`] is a cheap-to-clone handle around shared state. It owns the
//! hardware backend, the branch/crate/slot tree, the LAM event queue and the
//! two background threads (LAM dispatcher and error-rate monitor) started by
//! [`CamacDriver::library_init`].
//!
//! # Lock order
//!
//! A crate's LAM lock may be held while taking its branch's bus lock, never
//! the other way round. Neither lock is held while a LAM callback, a card init
//! closure or the LAM producer runs.

mod dataway;
mod dispatch;
mod lam;
mod monitor;
mod ops;

pub use monitor::ReportLevel;
pub use ops::Action;

use crate::address::{AddressCodec, Bcna, ChannelAddress, FunctionCode, WordSize, CONTROLLER_SLOT};
use crate::backend::{BusAccess, HardwareBackend};
use crate::config::CamacConfig;
use crate::controller::CrateFunctions;
use crate::error::{CamacError, Result};
use crate::lam::{lam_queue, LamEvent, LamPoster};
use crate::registry::{Branch, CardInit, CardRegistration, CrateNode, Registry};
use crate::stats::DecayPolicy;
use crate::status;
use crate::timeout::TimeoutBounds;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Crate or LAM-grader initialisation routine.
///
/// Called with the branch lock held, the crate's function table (which it may
/// rewrite, e.g. to install grader hooks) and the slot it was declared for.
pub type InitRoutine = Arc<dyn Fn(&dyn BusAccess, &mut CrateFunctions, u8) + Send + Sync>;

#[derive(Clone)]
struct InitRegistration {
    routine: InitRoutine,
    branch: u8,
    crate_num: u8,
    slot: u8,
}

pub(crate) struct DriverInner<B: HardwareBackend> {
    backend: B,
    config: CamacConfig,
    codec: AddressCodec,
    policy: DecayPolicy,
    registry: Registry<B>,
    poster: LamPoster,
    receiver: Mutex<Option<mpsc::Receiver<LamEvent>>>,
    bounds: OnceCell<TimeoutBounds>,
    initialized: Mutex<bool>,
    init_routines: Mutex<Vec<InitRegistration>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Device-independent CAMAC driver over a hardware backend.
pub struct CamacDriver<B: HardwareBackend> {
    inner: Arc<DriverInner<B>>,
}

impl<B: HardwareBackend> Clone for CamacDriver<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: HardwareBackend> fmt::Debug for CamacDriver<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CamacDriver")
            .field("backend", &self.inner.backend.name())
            .field("topology", &self.inner.codec.topology())
            .field("branches", &self.inner.registry.iter().count())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Exclusive access to one branch.
///
/// Holding the guard serialises all bus traffic on the branch; dropping it
/// unlocks. Use it to build multi-cycle sequences that must not interleave
/// with other callers.
pub struct BranchLock<'a, B: HardwareBackend> {
    backend: &'a B,
    branch: &'a Branch<B>,
    _guard: MutexGuard<'a, ()>,
}

impl<B: HardwareBackend> BranchLock<'_, B> {
    /// Branch number the guard locks.
    pub fn branch(&self) -> u8 {
        self.branch.number()
    }
}

impl<B: HardwareBackend> BusAccess for BranchLock<'_, B> {
    fn single_action(
        &self,
        function: FunctionCode,
        address: ChannelAddress,
        size: WordSize,
        data: &mut u32,
    ) -> Result<bool> {
        self.backend
            .single_action(&self.branch.handle, function, address, size, data)
    }
}

impl<B: HardwareBackend> fmt::Debug for BranchLock<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchLock")
            .field("branch", &self.branch.number())
            .finish()
    }
}

impl<B: HardwareBackend> CamacDriver<B> {
    /// Create a driver. Nothing touches the hardware until
    /// [`library_init`](Self::library_init) or
    /// [`init_branch`](Self::init_branch) is called.
    pub fn new(backend: B, config: CamacConfig) -> Self {
        let codec = AddressCodec::from_config(backend.topology(), &config);
        let (poster, receiver) = lam_queue(config.lam_queue_depth);
        let policy = DecayPolicy {
            decay: config.error_decay,
            threshold: config.error_rate_threshold,
        };
        let registry = Registry::new(config.max_branch);
        Self {
            inner: Arc::new(DriverInner {
                backend,
                codec,
                policy,
                registry,
                poster,
                receiver: Mutex::new(Some(receiver)),
                bounds: OnceCell::new(),
                initialized: Mutex::new(false),
                init_routines: Mutex::new(Vec::new()),
                threads: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    fn from_inner(inner: Arc<DriverInner<B>>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<DriverInner<B>> {
        Arc::downgrade(&self.inner)
    }

    /// The hardware backend.
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Configuration the driver was built with.
    pub fn config(&self) -> &CamacConfig {
        &self.inner.config
    }

    /// Address validation rules of this highway.
    pub fn codec(&self) -> &AddressCodec {
        &self.inner.codec
    }

    /// Producer end of the LAM event queue.
    pub fn lam_poster(&self) -> LamPoster {
        self.inner.poster.clone()
    }

    /// Wait-timeout bounds, calibrated on first use.
    pub fn timeout_bounds(&self) -> TimeoutBounds {
        *self
            .inner
            .bounds
            .get_or_init(|| TimeoutBounds::calibrate(self.inner.config.tick_rate_hz))
    }

    /// Check whether [`library_init`](Self::library_init) has completed.
    pub fn is_initialized(&self) -> bool {
        *self.inner.initialized.lock()
    }

    /// Start the driver: calibrate timeouts, start the LAM dispatcher and the
    /// error-rate monitor, and bring up every configured branch.
    ///
    /// Repeated calls return immediately. Branches without hardware are
    /// skipped silently.
    pub fn library_init(&self) -> Result<()> {
        status::clear();
        let mut initialized = self.inner.initialized.lock();
        if *initialized {
            return Ok(());
        }

        let bounds = self.timeout_bounds();
        info!(
            driver = self.inner.backend.name(),
            topology = %self.inner.codec.topology(),
            min_timeout_ms = bounds.min_timeout_ms(),
            max_timeout_ms = bounds.max_timeout_ms(),
            "Initializing CAMAC library"
        );

        status::track(self.start_threads())?;

        for branch in self.inner.config.branch_numbers() {
            match self.bring_up_branch(branch) {
                Ok(_) => {}
                Err(CamacError::NoHardware(b)) => debug!(branch = b, "No hardware for branch"),
                Err(err) => warn!(branch, error = %err, "Branch initialization failed"),
            }
        }

        *initialized = true;
        Ok(())
    }

    fn start_threads(&self) -> Result<()> {
        let mut threads = self.inner.threads.lock();
        if let Some(receiver) = self.inner.receiver.lock().take() {
            let weak = self.downgrade();
            let handle = std::thread::Builder::new()
                .name("camac-lam".into())
                .spawn(move || dispatch::run_worker(weak, receiver))
                .map_err(|_| CamacError::ResourceExhausted("LAM dispatcher thread"))?;
            threads.push(handle);
        }

        let weak = self.downgrade();
        let period = self.inner.config.monitor_period();
        let handle = std::thread::Builder::new()
            .name("camac-errmon".into())
            .spawn(move || monitor::run_monitor(weak, period))
            .map_err(|_| CamacError::ResourceExhausted("error monitor thread"))?;
        threads.push(handle);
        Ok(())
    }

    /// Bring up one branch. A branch that already exists is returned as is.
    pub fn init_branch(&self, branch: u32) -> Result<&Branch<B>> {
        status::clear();
        status::track(
            self.inner
                .codec
                .validate_branch(branch)
                .and_then(|b| self.bring_up_branch(b)),
        )
    }

    fn bring_up_branch(&self, branch: u8) -> Result<&Branch<B>> {
        let inner = &self.inner;
        let max_crate = *inner.codec.crate_range().end();
        let (node, created) = inner
            .registry
            .get_or_create(branch, || {
                inner
                    .backend
                    .init_branch(branch, inner.poster.clone())
                    .map(|handle| Branch::new(branch, handle, max_crate))
            })
            .ok_or(CamacError::NoHardware(branch))?;
        if created {
            info!(branch, driver = inner.backend.name(), "Branch initialized");
        }
        Ok(node)
    }

    /// Branch node, if the branch has been brought up.
    pub fn branch(&self, branch: u8) -> Option<&Branch<B>> {
        self.inner.registry.get(branch)
    }

    /// Every initialised branch, in branch order.
    pub fn branches(&self) -> impl Iterator<Item = &Branch<B>> {
        self.inner.registry.iter()
    }

    /// Crate node, if it exists.
    pub fn crate_node(&self, branch: u8, crate_num: u8) -> Option<&CrateNode> {
        self.branch(branch)?.crate_node(crate_num)
    }

    fn existing_branch(&self, branch: u8) -> Result<&Branch<B>> {
        self.inner
            .registry
            .get(branch)
            .ok_or(CamacError::NoHardware(branch))
    }

    pub(crate) fn lock<'a>(&'a self, branch: &'a Branch<B>) -> BranchLock<'a, B> {
        BranchLock {
            backend: &self.inner.backend,
            branch,
            _guard: branch.bus.lock(),
        }
    }

    /// Validate an address and find its branch, creating the crate on first
    /// reference. Must be called without the branch's bus lock.
    pub(crate) fn resolve(&self, address: ChannelAddress) -> Result<(Bcna, &Branch<B>)> {
        let decoded = self.inner.backend.decode(address);
        let bcna = self.inner.codec.validate_address(address, decoded)?;
        let branch = self.existing_branch(bcna.branch)?;
        self.ensure_crate(branch, bcna.crate_num)?;
        Ok((bcna, branch))
    }

    /// Build a channel address (cdreg). Creates and initialises the crate on
    /// first reference.
    pub fn encode(&self, branch: u32, crate_num: u32, slot: u32, subaddress: u32) -> Result<ChannelAddress> {
        status::clear();
        status::track(self.encode_inner(branch, crate_num, slot, subaddress))
    }

    fn encode_inner(&self, branch: u32, crate_num: u32, slot: u32, subaddress: u32) -> Result<ChannelAddress> {
        let bcna = self
            .inner
            .codec
            .validate_bcna(branch, crate_num, slot, subaddress)?;
        let address = self.inner.backend.encode(bcna);
        if self.inner.backend.decode(address) != bcna {
            return Err(CamacError::InvalidCrate(crate_num));
        }
        let node = self.existing_branch(bcna.branch)?;
        self.ensure_crate(node, bcna.crate_num)?;
        Ok(address)
    }

    /// Take a channel address apart (cgreg).
    pub fn decode(&self, address: ChannelAddress) -> Result<Bcna> {
        status::clear();
        let decoded = self.inner.backend.decode(address);
        status::track(self.inner.codec.validate_address(address, decoded))
    }

    /// Lock the branch an address belongs to.
    pub fn lock_branch(&self, address: ChannelAddress) -> Result<BranchLock<'_, B>> {
        status::clear();
        let (_, node) = status::track(self.resolve(address))?;
        Ok(self.lock(node))
    }

    /// Check whether a branch's bus lock is currently held by anyone.
    pub fn branch_is_locked(&self, branch: u8) -> bool {
        self.branch(branch).is_some_and(Branch::is_locked)
    }

    /// Error from the most recent failed operation on this thread (ctstat).
    pub fn last_error(&self) -> Option<CamacError> {
        status::last_error()
    }

    /// Return the crate node, initialising the crate exactly once if needed.
    pub(crate) fn ensure_crate<'a>(&'a self, branch: &'a Branch<B>, crate_num: u8) -> Result<&'a CrateNode> {
        match branch.crate_node(crate_num) {
            Some(node) => Ok(node),
            None => self.initialize_crate(branch, crate_num, true),
        }
    }

    /// (Re)initialise a crate (camacCrateInit).
    pub fn crate_init(&self, branch: u32, crate_num: u32) -> Result<()> {
        status::clear();
        status::track(self.crate_init_inner(branch, crate_num))
    }

    fn crate_init_inner(&self, branch: u32, crate_num: u32) -> Result<()> {
        let b = self.inner.codec.validate_branch(branch)?;
        let node = self.existing_branch(b)?;
        let c = self.inner.codec.validate_crate(crate_num)?;
        self.initialize_crate(node, c, false).map(|_| ())
    }

    fn initialize_crate<'a>(
        &'a self,
        branch: &'a Branch<B>,
        crate_num: u8,
        only_if_new: bool,
    ) -> Result<&'a CrateNode> {
        let inner = &self.inner;
        let b = branch.number();
        let node = {
            let bus = self.lock(branch);
            let (node, created) = branch
                .insert_crate(crate_num, || inner.backend.crate_functions(b, crate_num))
                .ok_or(CamacError::InvalidCrate(u32::from(crate_num)))?;
            if only_if_new && !created {
                return Ok(node);
            }

            let funcs = node.functions();
            match inner.backend.crate_init(&bus, &funcs) {
                Ok(()) => info!(branch = b, crate_num, "Crate initialized"),
                Err(err) => {
                    warn!(branch = b, crate_num, error = %err, "Hardware error initializing crate");
                    self.record_error(Bcna::new(b, crate_num, CONTROLLER_SLOT, 0), err);
                }
            }

            let routines: Vec<InitRegistration> = inner
                .init_routines
                .lock()
                .iter()
                .filter(|r| r.branch == b && r.crate_num == crate_num)
                .cloned()
                .collect();
            if !routines.is_empty() {
                let mut funcs = node.functions.write();
                for registration in &routines {
                    (registration.routine)(&bus, &mut funcs, registration.slot);
                }
            }
            node
        };

        let card_inits: Vec<CardInit> = node
            .slots()
            .filter_map(|slot| slot.card.get().and_then(|card| card.init.clone()))
            .collect();
        for init in card_inits {
            init();
        }

        if node.lams_enabled() {
            if let Err(err) = self.apply_crate_demand(branch, node, true) {
                warn!(branch = b, crate_num, error = %err, "Unable to re-enable crate demands");
            }
        }
        Ok(node)
    }

    /// Declare a crate or LAM-grader initialisation routine.
    ///
    /// The routine is replayed, in declaration order, every time the crate
    /// is initialised. If the crate is already up it also runs immediately.
    pub fn declare_init_routine(&self, routine: InitRoutine, branch: u32, crate_num: u32, slot: u8) -> Result<()> {
        status::clear();
        status::track(self.declare_init_routine_inner(routine, branch, crate_num, slot))
    }

    fn declare_init_routine_inner(
        &self,
        routine: InitRoutine,
        branch: u32,
        crate_num: u32,
        slot: u8,
    ) -> Result<()> {
        let b = self.inner.codec.validate_branch(branch)?;
        let c = self.inner.codec.validate_crate(crate_num)?;
        {
            let mut routines = self.inner.init_routines.lock();
            routines
                .try_reserve(1)
                .map_err(|_| CamacError::ResourceExhausted("init routine"))?;
            routines.push(InitRegistration {
                routine: Arc::clone(&routine),
                branch: b,
                crate_num: c,
                slot,
            });
        }

        if !self.is_initialized() {
            return Ok(());
        }
        let Some(node) = self.branch(b) else {
            return Ok(());
        };
        match node.crate_node(c) {
            None => {
                self.initialize_crate(node, c, true)?;
            }
            Some(crate_node) => {
                let bus = self.lock(node);
                let mut funcs = crate_node.functions.write();
                routine(&bus, &mut funcs, slot);
            }
        }
        Ok(())
    }

    /// Attach a module name and init closure to a slot.
    pub fn register_card(
        &self,
        branch: u32,
        crate_num: u32,
        slot: u32,
        name: &str,
        init: Option<CardInit>,
    ) -> Result<()> {
        status::clear();
        status::track(self.register_card_inner(branch, crate_num, slot, name, init))
    }

    fn register_card_inner(
        &self,
        branch: u32,
        crate_num: u32,
        slot: u32,
        name: &str,
        init: Option<CardInit>,
    ) -> Result<()> {
        let codec = &self.inner.codec;
        let b = codec.validate_branch(branch)?;
        let c = codec.validate_crate(crate_num)?;
        let n = codec.validate_lam_slot(slot)?;
        let node = self.ensure_crate(self.existing_branch(b)?, c)?;
        let slot_node = node.slot(n).ok_or(CamacError::InvalidSlot(slot))?;
        slot_node
            .card
            .set(CardRegistration {
                name: name.to_string(),
                init,
            })
            .map_err(|_| CamacError::SlotAlreadyRegistered { slot: n })?;
        debug!(branch = b, crate_num = c, slot = n, card = name, "Card registered");
        Ok(())
    }
}
