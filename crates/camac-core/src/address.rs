//! Channel addresses, function codes and topology-dependent validation.
//!
//! A [`ChannelAddress`] is the opaque "ext" value of the ESONE library. The
//! bit layout belongs to the hardware backend (see
//! [`HardwareBackend::encode`](crate::backend::HardwareBackend::encode)); this
//! module only supplies a default packing and the range checks that every
//! backend shares through [`AddressCodec`].

use crate::config::CamacConfig;
use crate::error::{CamacError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest slot number addressable on any topology.
pub const MAX_SLOT: u8 = 30;
/// Highest slot that can hold an ordinary module.
pub const MAX_NORMAL_SLOT: u8 = 23;
/// Highest subaddress.
pub const MAX_SUBADDRESS: u8 = 15;
/// Highest function code.
pub const MAX_FUNCTION: u8 = 31;
/// Slot used to address the crate controller.
pub const CONTROLLER_SLOT: u8 = 30;
/// Highest crate number a packed [`ChannelAddress`] can hold.
pub const MAX_CRATE: u8 = 63;

const BRANCH_NSLOTS: u8 = 24;
const BRANCH_ALLSLOTS: u8 = 26;
const BRANCH_CZ_SLOT: u8 = 28;

const VALID_BIT: u32 = 1 << 31;

/// Decoded (branch, crate, slot, subaddress) tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bcna {
    /// Branch number
    pub branch: u8,
    /// Crate number
    pub crate_num: u8,
    /// Slot (station) number, N
    pub slot: u8,
    /// Subaddress, A
    pub subaddress: u8,
}

impl Bcna {
    /// Build a tuple without validating it.
    pub const fn new(branch: u8, crate_num: u8, slot: u8, subaddress: u8) -> Self {
        Self {
            branch,
            crate_num,
            slot,
            subaddress,
        }
    }
}

impl fmt::Display for Bcna {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "B{} C{} N{} A{}",
            self.branch, self.crate_num, self.slot, self.subaddress
        )
    }
}

/// Opaque channel address produced by [`HardwareBackend::encode`](crate::backend::HardwareBackend::encode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelAddress(u32);

impl ChannelAddress {
    /// The null address. Never valid.
    pub const NULL: Self = Self(0);

    /// Wrap a raw backend value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw backend value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check for the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Default packing: A in bits 0-3, N in bits 4-8, C in bits 9-14, B in
    /// bits 16-23 and a marker in bit 31 so no packed address is ever null.
    pub const fn pack(bcna: Bcna) -> Self {
        Self(
            VALID_BIT
                | ((bcna.branch as u32) << 16)
                | (((bcna.crate_num as u32) & MAX_CRATE as u32) << 9)
                | (((bcna.slot as u32) & 0x1F) << 4)
                | ((bcna.subaddress as u32) & 0x0F),
        )
    }

    /// Inverse of [`ChannelAddress::pack`].
    pub const fn unpack(self) -> Bcna {
        Bcna {
            branch: ((self.0 >> 16) & 0xFF) as u8,
            crate_num: ((self.0 >> 9) & MAX_CRATE as u32) as u8,
            slot: ((self.0 >> 4) & 0x1F) as u8,
            subaddress: (self.0 & 0x0F) as u8,
        }
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// CAMAC function code (F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionCode(u8);

impl FunctionCode {
    /// F1: read LAM pattern / mask register
    pub const READ_LAM: Self = Self(1);
    /// F8: test LAM
    pub const TEST_LAM: Self = Self(8);
    /// F10: clear LAM
    pub const CLEAR_LAM: Self = Self(10);
    /// F17: overwrite register
    pub const OVERWRITE: Self = Self(17);
    /// F19: selective set
    pub const SELECTIVE_SET: Self = Self(19);
    /// F23: selective clear
    pub const SELECTIVE_CLEAR: Self = Self(23);
    /// F24: disable LAM
    pub const DISABLE_LAM: Self = Self(24);
    /// F26: enable LAM
    pub const ENABLE_LAM: Self = Self(26);

    /// Validate a raw function code.
    pub fn new(code: u32) -> Result<Self> {
        if code > MAX_FUNCTION as u32 {
            return Err(CamacError::InvalidFunctionCode(code));
        }
        Ok(Self(code as u8))
    }

    /// Numeric value.
    pub const fn code(self) -> u8 {
        self.0
    }

    /// F0-F7 transfer data from the module.
    pub const fn is_read(self) -> bool {
        self.0 < 8
    }

    /// F16-F23 transfer data to the module.
    pub const fn is_write(self) -> bool {
        (self.0 & 0x18) == 0x10
    }

    /// Everything else moves no data.
    pub const fn is_control(self) -> bool {
        !self.is_read() && !self.is_write()
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Highway topology of the controller family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Parallel branch highway with a branch crate controller
    BranchHighway,
    /// Serial highway loop with serial crate controllers
    SerialHighway,
    /// One crate driven directly by the host
    SingleCrate,
    /// Anything else
    Other,
}

impl Topology {
    /// Default highest crate number.
    pub const fn default_max_crate(self) -> u8 {
        match self {
            Self::BranchHighway | Self::Other => 7,
            Self::SerialHighway => 62,
            Self::SingleCrate => 0,
        }
    }

    /// Default lowest crate number.
    pub const fn default_min_crate(self) -> u8 {
        match self {
            Self::BranchHighway | Self::SerialHighway => 1,
            Self::SingleCrate | Self::Other => 0,
        }
    }

    /// Check whether a slot may be addressed on this topology.
    pub const fn is_legal_slot(self, slot: u8) -> bool {
        if slot >= 1 && slot <= MAX_NORMAL_SLOT {
            return true;
        }
        match self {
            Self::BranchHighway => matches!(
                slot,
                BRANCH_NSLOTS | BRANCH_ALLSLOTS | BRANCH_CZ_SLOT | CONTROLLER_SLOT
            ),
            Self::SerialHighway | Self::Other => slot == CONTROLLER_SLOT,
            Self::SingleCrate => false,
        }
    }

    /// Human-readable name used in reports.
    pub const fn label(self) -> &'static str {
        match self {
            Self::BranchHighway => "Branch Highway",
            Self::SerialHighway => "Serial Highway",
            Self::SingleCrate => "Single Crate",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Transfer width of a data word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordSize {
    /// 24-bit transfers (the `cf*` routines)
    Bits24,
    /// 16-bit transfers (the `cs*` routines)
    Bits16,
}

impl WordSize {
    /// Mask of the bits carried by one transfer.
    pub const fn mask(self) -> u32 {
        match self {
            Self::Bits24 => 0x00FF_FFFF,
            Self::Bits16 => 0x0000_FFFF,
        }
    }
}

/// Data word that can cross the dataway.
///
/// Implemented for `u32` (24-bit transfers) and `u16` (16-bit transfers);
/// the executors are generic over it.
pub trait Word: Copy + Default + Send + Sync + 'static {
    /// Transfer width used for this word type.
    const SIZE: WordSize;

    /// Widen to the bus representation.
    fn to_bus(self) -> u32;

    /// Narrow from the bus representation.
    fn from_bus(value: u32) -> Self;
}

impl Word for u32 {
    const SIZE: WordSize = WordSize::Bits24;

    fn to_bus(self) -> u32 {
        self & WordSize::Bits24.mask()
    }

    fn from_bus(value: u32) -> Self {
        value & WordSize::Bits24.mask()
    }
}

impl Word for u16 {
    const SIZE: WordSize = WordSize::Bits16;

    fn to_bus(self) -> u32 {
        u32::from(self)
    }

    fn from_bus(value: u32) -> Self {
        (value & WordSize::Bits16.mask()) as u16
    }
}

/// Range checks for channel addresses on one highway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressCodec {
    topology: Topology,
    max_branch: u8,
    min_crate: u8,
    max_crate: u8,
}

impl AddressCodec {
    /// Build a codec with explicit bounds.
    pub const fn new(topology: Topology, max_branch: u8, min_crate: u8, max_crate: u8) -> Self {
        Self {
            topology,
            max_branch,
            min_crate,
            max_crate,
        }
    }

    /// Bounds from configuration, falling back to the topology defaults.
    /// The crate bound never exceeds [`MAX_CRATE`].
    pub fn from_config(topology: Topology, config: &CamacConfig) -> Self {
        Self::new(
            topology,
            config.max_branch,
            config.min_crate.unwrap_or(topology.default_min_crate()),
            config
                .max_crate
                .unwrap_or(topology.default_max_crate())
                .min(MAX_CRATE),
        )
    }

    /// Topology the codec validates for.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Highest branch number.
    pub fn max_branch(&self) -> u8 {
        self.max_branch
    }

    /// Legal crate numbers.
    pub fn crate_range(&self) -> std::ops::RangeInclusive<u8> {
        self.min_crate..=self.max_crate
    }

    /// Validate a branch number.
    pub fn validate_branch(&self, branch: u32) -> Result<u8> {
        if branch > u32::from(self.max_branch) {
            return Err(CamacError::InvalidBranch(branch));
        }
        Ok(branch as u8)
    }

    /// Validate a crate number.
    pub fn validate_crate(&self, crate_num: u32) -> Result<u8> {
        if crate_num < u32::from(self.min_crate) || crate_num > u32::from(self.max_crate) {
            return Err(CamacError::InvalidCrate(crate_num));
        }
        Ok(crate_num as u8)
    }

    /// Validate a slot against the topology's legal set.
    pub fn validate_slot(&self, slot: u32) -> Result<u8> {
        match u8::try_from(slot) {
            Ok(n) if self.topology.is_legal_slot(n) => Ok(n),
            _ => Err(CamacError::InvalidSlot(slot)),
        }
    }

    /// Validate a slot that may host LAM sources (normal slots only).
    pub fn validate_lam_slot(&self, slot: u32) -> Result<u8> {
        if slot == 0 || slot > u32::from(MAX_NORMAL_SLOT) {
            return Err(CamacError::InvalidSlot(slot));
        }
        Ok(slot as u8)
    }

    /// Validate a subaddress.
    pub fn validate_subaddress(&self, subaddress: u32) -> Result<u8> {
        if subaddress > u32::from(MAX_SUBADDRESS) {
            return Err(CamacError::InvalidSubaddress(subaddress));
        }
        Ok(subaddress as u8)
    }

    /// Validate a function code.
    pub fn validate_function(&self, code: u32) -> Result<FunctionCode> {
        FunctionCode::new(code)
    }

    /// Validate all four fields of a caller-supplied address.
    pub fn validate_bcna(&self, branch: u32, crate_num: u32, slot: u32, subaddress: u32) -> Result<Bcna> {
        Ok(Bcna::new(
            self.validate_branch(branch)?,
            self.validate_crate(crate_num)?,
            self.validate_slot(slot)?,
            self.validate_subaddress(subaddress)?,
        ))
    }

    /// Validate an address that was produced by the backend's decoder.
    pub fn validate_address(&self, address: ChannelAddress, decoded: Bcna) -> Result<Bcna> {
        if address.is_null() {
            return Err(CamacError::InvalidAddress);
        }
        self.validate_bcna(
            u32::from(decoded.branch),
            u32::from(decoded.crate_num),
            u32::from(decoded.slot),
            u32::from(decoded.subaddress),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let bcna = Bcna::new(3, 62, 30, 15);
        let ext = ChannelAddress::pack(bcna);
        assert!(!ext.is_null());
        assert_eq!(ext.unpack(), bcna);
        assert_eq!(ChannelAddress::pack(Bcna::new(0, 0, 0, 0)).unpack(), Bcna::new(0, 0, 0, 0));
    }

    #[test]
    fn test_packing_preserves_address_order() {
        let low = ChannelAddress::pack(Bcna::new(0, 1, 5, 15));
        let high = ChannelAddress::pack(Bcna::new(0, 1, 6, 0));
        assert!(low.raw() < high.raw());
    }

    #[test]
    fn test_function_classes() {
        let read = FunctionCode::new(0).unwrap();
        let write = FunctionCode::new(16).unwrap();
        let control = FunctionCode::new(8).unwrap();
        assert!(read.is_read() && !read.is_write());
        assert!(write.is_write() && !write.is_read());
        assert!(control.is_control());
        assert!(FunctionCode::SELECTIVE_CLEAR.is_write());
        assert!(FunctionCode::DISABLE_LAM.is_control());
        assert_eq!(FunctionCode::new(32), Err(CamacError::InvalidFunctionCode(32)));
    }

    #[test]
    fn test_topology_slots() {
        assert!(Topology::BranchHighway.is_legal_slot(28));
        assert!(!Topology::SerialHighway.is_legal_slot(28));
        assert!(Topology::SerialHighway.is_legal_slot(30));
        assert!(!Topology::SingleCrate.is_legal_slot(30));
        assert!(!Topology::Other.is_legal_slot(0));
        assert!(!Topology::Other.is_legal_slot(24));
    }

    #[test]
    fn test_codec_ranges() {
        let codec = AddressCodec::new(Topology::SerialHighway, 7, 1, 62);
        assert_eq!(codec.validate_branch(8), Err(CamacError::InvalidBranch(8)));
        assert_eq!(codec.validate_crate(0), Err(CamacError::InvalidCrate(0)));
        assert_eq!(codec.validate_crate(62), Ok(62));
        assert_eq!(codec.validate_slot(24), Err(CamacError::InvalidSlot(24)));
        assert_eq!(codec.validate_slot(u32::MAX), Err(CamacError::InvalidSlot(u32::MAX)));
        assert_eq!(codec.validate_lam_slot(30), Err(CamacError::InvalidSlot(30)));
        assert_eq!(codec.validate_subaddress(16), Err(CamacError::InvalidSubaddress(16)));
        assert_eq!(codec.validate_bcna(0, 1, 5, 0), Ok(Bcna::new(0, 1, 5, 0)));
    }

    #[test]
    fn test_codec_rejects_null_address() {
        let codec = AddressCodec::new(Topology::Other, 7, 0, 7);
        assert_eq!(
            codec.validate_address(ChannelAddress::NULL, Bcna::new(0, 0, 1, 0)),
            Err(CamacError::InvalidAddress)
        );
    }

    #[test]
    fn test_word_widths() {
        assert_eq!(<u32 as Word>::from_bus(0xFF12_3456), 0x12_3456);
        assert_eq!(<u16 as Word>::from_bus(0x0012_3456), 0x3456);
        assert_eq!(0xABCDu16.to_bus(), 0xABCD);
    }
}
