//! Simulated modules and crate controllers.
//!
//! A module has sixteen data registers (one per subaddress) and two kinds of
//! LAM source:
//!
//! - one request per subaddress, tested with F8, cleared with F10 and gated
//!   with F24/F26;
//! - a 24-bit LAM status register, read with F1 A14, cleared with F23 A12 and
//!   gated through the enable register with F19/F23 A13.
//!
//! The crate controller at slot 30 carries the status, LAM pattern and LAM
//! mask registers of a standard controller.

use camac_core::controller::{LAM_MASK_SUBADDRESS, LAM_PATTERN_SUBADDRESS, STATUS_SUBADDRESS};
use camac_core::{ControllerStatus, FunctionCode};
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};

const SUBADDRESSES: usize = 16;
const STATUS_READ_SUBADDRESS: u8 = 14;
const STATUS_CLEAR_SUBADDRESS: u8 = 12;
const STATUS_GATE_SUBADDRESS: u8 = 13;
const WORD_MASK: u32 = 0x00FF_FFFF;

/// Where a simulated LAM comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LamSource {
    /// Per-subaddress request
    Subaddress(u8),
    /// Bit of the LAM status register
    StatusBit(u8),
}

/// Description of a module installed in the simulated highway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MockModule {
    /// Module name, shown in the slot report
    pub name: String,
    /// Initial register contents, starting at A0
    #[serde(default)]
    pub registers: Vec<u32>,
    /// Start with every LAM source enabled
    #[serde(default)]
    pub lams_enabled: bool,
}

impl MockModule {
    /// Module with zeroed registers and all LAM sources disabled.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registers: Vec::new(),
            lams_enabled: false,
        }
    }

    /// Preload one register.
    pub fn with_register(mut self, subaddress: u8, value: u32) -> Self {
        let index = usize::from(subaddress);
        if index < SUBADDRESSES {
            if self.registers.len() <= index {
                self.registers.resize(index + 1, 0);
            }
            self.registers[index] = value;
        }
        self
    }

    /// Start with every LAM source enabled.
    pub fn with_lams_enabled(mut self) -> Self {
        self.lams_enabled = true;
        self
    }
}

/// Outcome of one simulated cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Response {
    pub q: bool,
    pub x: bool,
}

impl Response {
    const Q: Self = Self { q: true, x: true };
    const NO_Q: Self = Self { q: false, x: true };
    pub(crate) const NONE: Self = Self { q: false, x: false };
}

#[derive(Debug)]
pub(crate) struct SimModule {
    pub(crate) name: String,
    registers: [u32; SUBADDRESSES],
    lam_pending: u16,
    lam_enabled: u16,
    status_pending: u32,
    status_enabled: u32,
    q_script: VecDeque<bool>,
}

impl SimModule {
    pub(crate) fn new(module: &MockModule) -> Self {
        let mut registers = [0; SUBADDRESSES];
        for (reg, value) in registers.iter_mut().zip(&module.registers) {
            *reg = value & WORD_MASK;
        }
        let (lam_enabled, status_enabled) = if module.lams_enabled {
            (u16::MAX, WORD_MASK)
        } else {
            (0, 0)
        };
        Self {
            name: module.name.clone(),
            registers,
            lam_pending: 0,
            lam_enabled,
            status_pending: 0,
            status_enabled,
            q_script: VecDeque::new(),
        }
    }

    pub(crate) fn register(&self, a: u8) -> u32 {
        self.registers.get(usize::from(a)).copied().unwrap_or(0)
    }

    pub(crate) fn set_register(&mut self, a: u8, value: u32) {
        if let Some(reg) = self.registers.get_mut(usize::from(a)) {
            *reg = value & WORD_MASK;
        }
    }

    pub(crate) fn script_q(&mut self, responses: impl IntoIterator<Item = bool>) {
        self.q_script.extend(responses);
    }

    pub(crate) fn raise(&mut self, source: LamSource) -> bool {
        match source {
            LamSource::Subaddress(a) if usize::from(a) < SUBADDRESSES => {
                self.lam_pending |= 1 << a;
            }
            LamSource::StatusBit(bit) if bit < 24 => {
                self.status_pending |= 1 << bit;
            }
            _ => return false,
        }
        self.source_enabled(source)
    }

    pub(crate) fn source_pending(&self, source: LamSource) -> bool {
        match source {
            LamSource::Subaddress(a) => a < 16 && self.lam_pending & (1 << a) != 0,
            LamSource::StatusBit(bit) => bit < 24 && self.status_pending & (1 << bit) != 0,
        }
    }

    pub(crate) fn source_enabled(&self, source: LamSource) -> bool {
        match source {
            LamSource::Subaddress(a) => a < 16 && self.lam_enabled & (1 << a) != 0,
            LamSource::StatusBit(bit) => bit < 24 && self.status_enabled & (1 << bit) != 0,
        }
    }

    /// Whether the module is asserting its LAM line.
    pub(crate) fn requesting(&self) -> bool {
        self.lam_pending & self.lam_enabled != 0 || self.status_pending & self.status_enabled != 0
    }

    pub(crate) fn cycle(&mut self, f: FunctionCode, a: u8, data: &mut u32) -> Response {
        let response = self.execute(f, a, data);
        match self.q_script.pop_front() {
            Some(q) => Response { q, ..response },
            None => response,
        }
    }

    fn execute(&mut self, f: FunctionCode, a: u8, data: &mut u32) -> Response {
        let bit = 1u16 << (a & 0x0F);
        match f.code() {
            1 if a == STATUS_READ_SUBADDRESS => {
                *data = self.status_pending;
                Response::Q
            }
            0..=7 => {
                *data = self.register(a);
                Response::Q
            }
            8 => {
                if self.lam_pending & self.lam_enabled & bit != 0 {
                    Response::Q
                } else {
                    Response::NO_Q
                }
            }
            9 => {
                self.registers = [0; SUBADDRESSES];
                Response::Q
            }
            10 => {
                self.lam_pending &= !bit;
                Response::Q
            }
            16 | 17 => {
                self.set_register(a, *data);
                Response::Q
            }
            19 if a == STATUS_GATE_SUBADDRESS => {
                self.status_enabled |= *data & WORD_MASK;
                Response::Q
            }
            19 => {
                let value = self.register(a) | *data;
                self.set_register(a, value);
                Response::Q
            }
            23 if a == STATUS_CLEAR_SUBADDRESS => {
                self.status_pending &= !*data;
                Response::Q
            }
            23 if a == STATUS_GATE_SUBADDRESS => {
                self.status_enabled &= !*data;
                Response::Q
            }
            23 => {
                let value = self.register(a) & !*data;
                self.set_register(a, value);
                Response::Q
            }
            24 => {
                self.lam_enabled &= !bit;
                Response::Q
            }
            25 => Response::Q,
            26 => {
                self.lam_enabled |= bit;
                Response::Q
            }
            _ => Response::NO_Q,
        }
    }
}

/// One simulated crate: controller registers plus installed modules.
#[derive(Debug)]
pub(crate) struct SimCrate {
    status: ControllerStatus,
    pub(crate) lam_mask: u32,
    pub(crate) modules: BTreeMap<u8, SimModule>,
    pub(crate) z_count: u32,
    pub(crate) c_count: u32,
}

impl Default for SimCrate {
    fn default() -> Self {
        Self {
            status: ControllerStatus::empty(),
            lam_mask: 0,
            modules: BTreeMap::new(),
            z_count: 0,
            c_count: 0,
        }
    }
}

impl SimCrate {
    pub(crate) fn status(&self) -> ControllerStatus {
        let mut status = self.status;
        status.set(
            ControllerStatus::INHIBIT_READBACK,
            self.status.contains(ControllerStatus::INHIBIT),
        );
        status.set(ControllerStatus::LAM_PRESENT, self.pattern() != 0);
        status
    }

    /// Slots whose module is requesting, bit `n-1` for slot `n`.
    pub(crate) fn pattern(&self) -> u32 {
        self.modules
            .iter()
            .filter(|(_, module)| module.requesting())
            .fold(0, |acc, (&n, _)| acc | 1 << (n - 1))
    }

    /// Whether a request from `slot` reaches the highway.
    pub(crate) fn demand_pending(&self, slot: u8) -> bool {
        self.status.contains(ControllerStatus::DEMAND_ENABLE)
            && self.lam_mask & (1 << (slot - 1)) != 0
            && self.pattern() & (1 << (slot - 1)) != 0
    }

    pub(crate) fn controller_cycle(&mut self, f: FunctionCode, a: u8, data: &mut u32) -> Response {
        match (f, a) {
            (FunctionCode::READ_LAM, STATUS_SUBADDRESS) => {
                *data = u32::from(self.status().bits());
                Response::Q
            }
            (FunctionCode::OVERWRITE, STATUS_SUBADDRESS) => {
                let written = ControllerStatus::from_bits_truncate((*data & 0xFFFF) as u16);
                if written.contains(ControllerStatus::Z) {
                    self.z_count += 1;
                    for module in self.modules.values_mut() {
                        module.lam_enabled = 0;
                        module.status_enabled = 0;
                    }
                }
                if written.contains(ControllerStatus::C) {
                    self.c_count += 1;
                    for module in self.modules.values_mut() {
                        module.registers = [0; SUBADDRESSES];
                    }
                }
                self.status = written & (ControllerStatus::INHIBIT | ControllerStatus::DEMAND_ENABLE);
                Response::Q
            }
            (FunctionCode::READ_LAM, LAM_PATTERN_SUBADDRESS) => {
                *data = self.pattern();
                Response::Q
            }
            (FunctionCode::READ_LAM, LAM_MASK_SUBADDRESS) => {
                *data = self.lam_mask;
                Response::Q
            }
            (FunctionCode::OVERWRITE, LAM_MASK_SUBADDRESS) => {
                self.lam_mask = *data & WORD_MASK;
                Response::Q
            }
            _ => Response::NO_Q,
        }
    }
}
