//! The simulated highway backend.

use crate::common::faults::op;
use crate::common::FaultConfig;
use crate::module::{LamSource, MockModule, Response, SimCrate, SimModule};
use camac_core::{
    Bcna, CamacError, ChannelAddress, ControlBlock, ControllerStatus, FunctionCode,
    HardwareBackend, LamPoster, Result, ScanRange, Topology, WordSize,
};
use camac_core::address::{CONTROLLER_SLOT, MAX_NORMAL_SLOT, MAX_SUBADDRESS};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Observer invoked after every simulated cycle, outside the highway's own
/// lock.
pub type CallObserver = Arc<dyn Fn(&CallRecord) + Send + Sync>;

/// One cycle seen by the simulated highway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    /// Backend primitive that issued the cycle
    pub primitive: &'static str,
    /// Addressed location
    pub bcna: Bcna,
    /// Function code
    pub function: FunctionCode,
    /// Data word after the cycle
    pub data: u32,
    /// Q flag, or the error the cycle failed with
    pub outcome: std::result::Result<bool, CamacError>,
}

/// Per-branch state handed back by [`MockHighway::init_branch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockBranch {
    /// Branch number
    pub number: u8,
}

/// A module placed at a fixed location, as read from configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModulePlacement {
    /// Branch number
    pub branch: u8,
    /// Crate number
    #[serde(rename = "crate")]
    pub crate_num: u8,
    /// Slot number
    pub slot: u8,
    /// The module itself
    #[serde(flatten)]
    pub module: MockModule,
}

/// In-memory CAMAC highway.
///
/// Crates exist only where the builder placed them; cycles addressed to any
/// other crate fail with [`CamacError::CrateNotPresent`]. Empty slots answer
/// with neither Q nor X.
pub struct MockHighway {
    name: String,
    topology: Topology,
    branches: BTreeSet<u8>,
    crates: Mutex<BTreeMap<(u8, u8), SimCrate>>,
    posters: Mutex<BTreeMap<u8, LamPoster>>,
    faults: FaultConfig,
    slot_events: bool,
    calls: Mutex<Vec<CallRecord>>,
    observer: RwLock<Option<CallObserver>>,
}

impl MockHighway {
    /// Start building a highway.
    pub fn builder() -> MockHighwayBuilder {
        MockHighwayBuilder::default()
    }

    /// The fault injection configuration in effect.
    pub fn faults(&self) -> &FaultConfig {
        &self.faults
    }

    /// Install (or remove) the per-cycle observer.
    pub fn set_observer(&self, observer: Option<CallObserver>) {
        *self.observer.write() = observer;
    }

    /// Every cycle issued so far.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    /// Cycles issued so far with function `f`.
    pub fn calls_with(&self, f: FunctionCode) -> Vec<CallRecord> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.function == f)
            .copied()
            .collect()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Installed modules with their locations.
    pub fn modules(&self) -> Vec<(Bcna, String)> {
        self.crates
            .lock()
            .iter()
            .flat_map(|(&(b, c), sim)| {
                sim.modules
                    .iter()
                    .map(move |(&n, module)| (Bcna::new(b, c, n, 0), module.name.clone()))
            })
            .collect()
    }

    fn with_module<T>(&self, b: u8, c: u8, n: u8, f: impl FnOnce(&mut SimModule) -> T) -> Option<T> {
        self.crates
            .lock()
            .get_mut(&(b, c))
            .and_then(|sim| sim.modules.get_mut(&n))
            .map(f)
    }

    /// Read a module register directly.
    pub fn register(&self, b: u8, c: u8, n: u8, a: u8) -> Option<u32> {
        self.with_module(b, c, n, |module| module.register(a))
    }

    /// Set a module register directly.
    pub fn set_register(&self, b: u8, c: u8, n: u8, a: u8, value: u32) {
        self.with_module(b, c, n, |module| module.set_register(a, value));
    }

    /// Queue Q responses that override the next cycles to a module.
    pub fn script_q(&self, b: u8, c: u8, n: u8, responses: impl IntoIterator<Item = bool>) {
        self.with_module(b, c, n, |module| module.script_q(responses));
    }

    /// Whether a LAM source is pending.
    pub fn lam_pending(&self, b: u8, c: u8, n: u8, source: LamSource) -> bool {
        self.with_module(b, c, n, |module| module.source_pending(source))
            .unwrap_or(false)
    }

    /// Whether a LAM source is enabled.
    pub fn lam_enabled(&self, b: u8, c: u8, n: u8, source: LamSource) -> bool {
        self.with_module(b, c, n, |module| module.source_enabled(source))
            .unwrap_or(false)
    }

    /// Crate controller status register.
    pub fn controller_status(&self, b: u8, c: u8) -> Option<ControllerStatus> {
        self.crates.lock().get(&(b, c)).map(SimCrate::status)
    }

    /// Crate controller LAM mask register.
    pub fn lam_mask_register(&self, b: u8, c: u8) -> Option<u32> {
        self.crates.lock().get(&(b, c)).map(|sim| sim.lam_mask)
    }

    /// Number of Z cycles the crate has seen.
    pub fn z_count(&self, b: u8, c: u8) -> u32 {
        self.crates.lock().get(&(b, c)).map_or(0, |sim| sim.z_count)
    }

    /// Number of C cycles the crate has seen.
    pub fn c_count(&self, b: u8, c: u8) -> u32 {
        self.crates.lock().get(&(b, c)).map_or(0, |sim| sim.c_count)
    }

    /// Make a module raise a LAM.
    ///
    /// The LAM reaches the driver only if the source is enabled, the slot is
    /// open in the controller's LAM mask and crate demands are enabled.
    /// Returns whether an event was posted.
    pub fn raise_lam(&self, b: u8, c: u8, n: u8, source: LamSource) -> bool {
        let demand = {
            let mut crates = self.crates.lock();
            let Some(sim) = crates.get_mut(&(b, c)) else {
                return false;
            };
            let Some(module) = sim.modules.get_mut(&n) else {
                return false;
            };
            module.raise(source) && sim.demand_pending(n)
        };
        if !demand {
            trace!(branch = b, crate_num = c, slot = n, ?source, "LAM raised, no demand");
            return false;
        }
        let slot = self.slot_events.then_some(n);
        self.post_event(b, c, slot)
    }

    /// Post a LAM event as the interrupt path would, whether or not any
    /// module is requesting.
    pub fn post_event(&self, b: u8, c: u8, slot: Option<u8>) -> bool {
        let poster = self.posters.lock().get(&b).cloned();
        match poster {
            Some(poster) => poster.post(b, c, slot),
            None => false,
        }
    }

    fn cycle(
        &self,
        primitive: &'static str,
        function: FunctionCode,
        address: ChannelAddress,
        size: WordSize,
        data: &mut u32,
    ) -> Result<bool> {
        let bcna = self.decode(address);
        if !function.is_read() {
            *data &= size.mask();
        }
        let outcome = {
            let mut crates = self.crates.lock();
            match crates.get_mut(&(bcna.branch, bcna.crate_num)) {
                None => Err(CamacError::CrateNotPresent),
                Some(sim) => {
                    let response = if bcna.slot == CONTROLLER_SLOT {
                        sim.controller_cycle(function, bcna.subaddress, data)
                    } else {
                        match sim.modules.get_mut(&bcna.slot) {
                            Some(module) => module.cycle(function, bcna.subaddress, data),
                            None => Response::NONE,
                        }
                    };
                    if response.x {
                        Ok(response.q)
                    } else {
                        Err(CamacError::NoQNoX)
                    }
                }
            }
        };
        if function.is_read() {
            *data &= size.mask();
        }
        self.log(CallRecord {
            primitive,
            bcna,
            function,
            data: *data,
            outcome,
        });
        outcome
    }

    fn log(&self, record: CallRecord) {
        trace!(primitive = record.primitive, bcna = %record.bcna, function = %record.function, outcome = ?record.outcome, "cycle");
        self.calls.lock().push(record);
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer(&record);
        }
    }
}

impl fmt::Debug for MockHighway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockHighway")
            .field("name", &self.name)
            .field("topology", &self.topology)
            .field("branches", &self.branches)
            .field("crates", &self.crates.lock().len())
            .finish_non_exhaustive()
    }
}

impl HardwareBackend for MockHighway {
    type Handle = MockBranch;

    fn name(&self) -> &str {
        &self.name
    }

    fn topology(&self) -> Topology {
        self.topology
    }

    fn init_branch(&self, branch: u8, lams: LamPoster) -> Option<MockBranch> {
        if let Err(err) = self.faults.check(op::INIT_BRANCH, None) {
            warn!(branch, error = %err, "Simulated branch failed to initialize");
            return None;
        }
        if !self.branches.contains(&branch) {
            return None;
        }
        self.posters.lock().insert(branch, lams);
        debug!(branch, "Simulated branch online");
        Some(MockBranch { number: branch })
    }

    fn single_action(
        &self,
        _handle: &MockBranch,
        function: FunctionCode,
        address: ChannelAddress,
        size: WordSize,
        data: &mut u32,
    ) -> Result<bool> {
        self.faults
            .check(op::SINGLE_ACTION, Some(self.decode(address)))?;
        self.cycle(op::SINGLE_ACTION, function, address, size, data)
    }

    fn address_scan(
        &self,
        _handle: &MockBranch,
        function: FunctionCode,
        range: ScanRange,
        size: WordSize,
        data: &mut [u32],
        cb: &mut ControlBlock,
    ) -> Result<()> {
        let start = self.decode(range.start);
        let end = self.decode(range.end);
        self.faults.check(op::ADDRESS_SCAN, Some(start))?;

        // Q steps to the next subaddress; no Q (or no X) skips to A0 of the
        // next slot. Only cycles with Q move data.
        let mut at = start;
        let mut next = 0;
        while next < data.len() && at <= end && at.slot <= MAX_NORMAL_SLOT {
            let mut word = data[next];
            let q = match self.cycle(op::ADDRESS_SCAN, function, self.encode(at), size, &mut word) {
                Ok(q) => q,
                Err(CamacError::NoQNoX) => false,
                Err(err) => return Err(err),
            };
            at = if !q {
                Bcna { slot: at.slot + 1, subaddress: 0, ..at }
            } else if at.subaddress < MAX_SUBADDRESS {
                Bcna { subaddress: at.subaddress + 1, ..at }
            } else {
                Bcna { slot: at.slot + 1, subaddress: 0, ..at }
            };
            if q {
                data[next] = word;
                next += 1;
                cb.tally += 1;
            }
        }
        Ok(())
    }

    fn repeat_until_no_q(
        &self,
        _handle: &MockBranch,
        function: FunctionCode,
        address: ChannelAddress,
        size: WordSize,
        data: &mut [u32],
        cb: &mut ControlBlock,
    ) -> Result<()> {
        self.faults
            .check(op::REPEAT_UNTIL_NO_Q, Some(self.decode(address)))?;
        for word in data.iter_mut() {
            if !self.cycle(op::REPEAT_UNTIL_NO_Q, function, address, size, word)? {
                break;
            }
            cb.tally += 1;
        }
        Ok(())
    }

    fn repeat_until_q(
        &self,
        _handle: &MockBranch,
        function: FunctionCode,
        address: ChannelAddress,
        size: WordSize,
        data: &mut [u32],
        cb: &mut ControlBlock,
        max_retries: u32,
    ) -> Result<()> {
        self.faults
            .check(op::REPEAT_UNTIL_Q, Some(self.decode(address)))?;
        for word in data.iter_mut() {
            let mut retries = 0;
            while !self.cycle(op::REPEAT_UNTIL_Q, function, address, size, word)? {
                if retries >= max_retries {
                    return Err(CamacError::WaitForQTimeout);
                }
                retries += 1;
            }
            cb.tally += 1;
        }
        Ok(())
    }
}

/// Builder for [`MockHighway`].
#[derive(Debug)]
pub struct MockHighwayBuilder {
    name: String,
    topology: Topology,
    branches: BTreeSet<u8>,
    crates: BTreeMap<(u8, u8), BTreeMap<u8, MockModule>>,
    faults: FaultConfig,
    slot_events: bool,
}

impl Default for MockHighwayBuilder {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            topology: Topology::BranchHighway,
            branches: BTreeSet::new(),
            crates: BTreeMap::new(),
            faults: FaultConfig::none(),
            slot_events: false,
        }
    }
}

impl MockHighwayBuilder {
    /// Driver name shown in reports.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Highway topology.
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Add a branch with no crates.
    pub fn branch(mut self, branch: u8) -> Self {
        self.branches.insert(branch);
        self
    }

    /// Add an empty crate (and its branch).
    pub fn crate_at(mut self, branch: u8, crate_num: u8) -> Self {
        self.branches.insert(branch);
        self.crates.entry((branch, crate_num)).or_default();
        self
    }

    /// Install a module (creating its crate and branch).
    pub fn module(mut self, branch: u8, crate_num: u8, slot: u8, module: MockModule) -> Self {
        self.branches.insert(branch);
        self.crates
            .entry((branch, crate_num))
            .or_default()
            .insert(slot, module);
        self
    }

    /// Install every placed module.
    pub fn placements<'a>(self, placements: impl IntoIterator<Item = &'a ModulePlacement>) -> Self {
        placements.into_iter().fold(self, |builder, p| {
            builder.module(p.branch, p.crate_num, p.slot, p.module.clone())
        })
    }

    /// Fault injection.
    pub fn faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }

    /// Post slot-specific events instead of crate-wide ones, as a highway
    /// with a LAM grader would.
    pub fn slot_events(mut self, enabled: bool) -> Self {
        self.slot_events = enabled;
        self
    }

    /// Build the highway.
    pub fn build(self) -> MockHighway {
        let crates = self
            .crates
            .into_iter()
            .map(|(key, modules)| {
                let mut sim = SimCrate::default();
                sim.modules = modules
                    .iter()
                    .map(|(&n, module)| (n, SimModule::new(module)))
                    .collect();
                (key, sim)
            })
            .collect();
        MockHighway {
            name: self.name,
            topology: self.topology,
            branches: self.branches,
            crates: Mutex::new(crates),
            posters: Mutex::new(BTreeMap::new()),
            faults: self.faults,
            slot_events: self.slot_events,
            calls: Mutex::new(Vec::new()),
            observer: RwLock::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adc_highway() -> MockHighway {
        MockHighway::builder()
            .module(0, 1, 5, MockModule::new("ADC").with_register(0, 0x1234))
            .build()
    }

    fn addr(b: u8, c: u8, n: u8, a: u8) -> ChannelAddress {
        ChannelAddress::pack(Bcna::new(b, c, n, a))
    }

    #[test]
    fn test_single_action_reads_register() {
        let highway = adc_highway();
        let handle = MockBranch { number: 0 };
        let mut data = 0;
        let q = highway
            .single_action(&handle, FunctionCode::new(0).unwrap(), addr(0, 1, 5, 0), WordSize::Bits24, &mut data)
            .unwrap();
        assert!(q);
        assert_eq!(data, 0x1234);
        assert_eq!(highway.calls().len(), 1);
    }

    #[test]
    fn test_empty_slot_and_missing_crate() {
        let highway = adc_highway();
        let handle = MockBranch { number: 0 };
        let f0 = FunctionCode::new(0).unwrap();
        let mut data = 0;
        assert_eq!(
            highway.single_action(&handle, f0, addr(0, 1, 6, 0), WordSize::Bits24, &mut data),
            Err(CamacError::NoQNoX)
        );
        assert_eq!(
            highway.single_action(&handle, f0, addr(0, 2, 5, 0), WordSize::Bits24, &mut data),
            Err(CamacError::CrateNotPresent)
        );
    }

    #[test]
    fn test_sixteen_bit_reads_are_truncated() {
        let highway = MockHighway::builder()
            .module(0, 1, 2, MockModule::new("Scaler").with_register(1, 0x00AB_CDEF))
            .build();
        let mut data = 0;
        highway
            .single_action(
                &MockBranch { number: 0 },
                FunctionCode::new(0).unwrap(),
                addr(0, 1, 2, 1),
                WordSize::Bits16,
                &mut data,
            )
            .unwrap();
        assert_eq!(data, 0xCDEF);
    }

    #[test]
    fn test_repeat_until_q_gives_up() {
        let highway = adc_highway();
        highway.script_q(0, 1, 5, [false, false, false, false]);
        let mut data = [0u32; 2];
        let mut cb = ControlBlock::new(2);
        let result = highway.repeat_until_q(
            &MockBranch { number: 0 },
            FunctionCode::new(2).unwrap(),
            addr(0, 1, 5, 0),
            WordSize::Bits24,
            &mut data,
            &mut cb,
            2,
        );
        assert_eq!(result, Err(CamacError::WaitForQTimeout));
        assert_eq!(cb.tally, 0);
    }

    #[test]
    fn test_address_scan_walks_subaddresses() {
        let highway = MockHighway::builder()
            .module(0, 1, 3, MockModule::new("A").with_register(15, 7))
            .module(0, 1, 4, MockModule::new("B").with_register(0, 9))
            .build();
        let mut data = [0u32; 4];
        let mut cb = ControlBlock::new(4);
        highway
            .address_scan(
                &MockBranch { number: 0 },
                FunctionCode::new(0).unwrap(),
                ScanRange {
                    start: addr(0, 1, 3, 15),
                    end: addr(0, 1, 4, 0),
                },
                WordSize::Bits24,
                &mut data,
                &mut cb,
            )
            .unwrap();
        assert_eq!(cb.tally, 2);
        assert_eq!(&data[..2], &[7, 9]);
    }

    #[test]
    fn test_address_scan_skips_slot_without_q() {
        let highway = MockHighway::builder()
            .module(0, 1, 3, MockModule::new("A").with_register(0, 11).with_register(1, 12))
            .module(0, 1, 5, MockModule::new("C").with_register(0, 30).with_register(1, 31))
            .build();
        highway.script_q(0, 1, 3, [true, true, false]);

        let mut data = [0u32; 8];
        let mut cb = ControlBlock::new(8);
        highway
            .address_scan(
                &MockBranch { number: 0 },
                FunctionCode::new(0).unwrap(),
                ScanRange {
                    start: addr(0, 1, 3, 0),
                    end: addr(0, 1, 5, 1),
                },
                WordSize::Bits24,
                &mut data,
                &mut cb,
            )
            .unwrap();
        assert_eq!(cb.tally, 4);
        assert_eq!(&data[..4], &[11, 12, 30, 31]);

        // A2 of slot 3 gave no Q, so the scan went to slot 4 and on to slot 5
        let visited: Vec<(u8, u8)> = highway
            .calls_with(FunctionCode::new(0).unwrap())
            .iter()
            .map(|c| (c.bcna.slot, c.bcna.subaddress))
            .collect();
        assert_eq!(visited, [(3, 0), (3, 1), (3, 2), (4, 0), (5, 0), (5, 1)]);
    }
}
