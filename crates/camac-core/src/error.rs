//! Error types for CAMAC operations.
//!
//! Every fallible operation in this crate returns [`CamacError`]. The enum is
//! `Copy` so the most recent failure can be kept per thread (see
//! [`crate::status`]) and it carries two classifications:
//!
//! - [`CamacError::status_code`] maps onto the ESONE status numbers used by the
//!   classic subroutine library, for callers that still speak that protocol.
//! - [`CamacError::category`] selects the error-statistics counter (branch,
//!   crate or slot scope) that a failure of this kind should bump.

use crate::stats::{BranchErrorKind, CrateErrorKind, ErrorCategory, SlotErrorKind};
use thiserror::Error;

/// Result type alias for CAMAC operations.
pub type Result<T> = std::result::Result<T, CamacError>;

/// Errors that can occur while talking to a CAMAC highway.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CamacError {
    /// The addressed module did not answer with Q
    #[error("No Q response")]
    NoQ,

    /// The addressed module did not answer with X
    #[error("No X response")]
    NoX,

    /// Neither Q nor X was returned
    #[error("No Q or X response")]
    NoQNoX,

    /// Branch number out of range
    #[error("Invalid branch number {0}")]
    InvalidBranch(u32),

    /// Crate number out of range for this topology
    #[error("Invalid crate number {0}")]
    InvalidCrate(u32),

    /// Slot number not legal for this topology
    #[error("Invalid slot number {0}")]
    InvalidSlot(u32),

    /// Subaddress (or LAM mask bit) out of range
    #[error("Invalid subaddress {0}")]
    InvalidSubaddress(u32),

    /// Function code outside 0..=31
    #[error("Invalid function code {0}")]
    InvalidFunctionCode(u32),

    /// Channel address does not decode to a valid location
    #[error("Invalid CAMAC channel address")]
    InvalidAddress,

    /// LAM handle does not refer to a live crate
    #[error("Invalid CAMAC LAM handle")]
    InvalidLam,

    /// Wait timeout larger than the host clock can express
    #[error("Invalid timeout value {0} ms")]
    BadTimeout(i64),

    /// No hardware was found for the branch
    #[error("No active hardware for branch {0}")]
    NoHardware(u8),

    /// Highway driver is not ready
    #[error("Highway driver is not ready")]
    NotReady,

    /// The controller timed out
    #[error("Hardware timeout")]
    HardwareTimeout,

    /// `wait_lam` exceeded its deadline
    #[error("Timeout waiting for LAM")]
    LamTimeout,

    /// Longitudinal parity error on the highway
    #[error("Longitudinal parity error")]
    LongitudinalParity,

    /// Transverse parity error on the highway
    #[error("Transverse parity error")]
    TransverseParity,

    /// Crate controller is off-line
    #[error("Crate is off-line")]
    CrateOffline,

    /// Crate is bypassed on the serial loop
    #[error("Crate is bypassed")]
    CrateBypassed,

    /// Crate does not respond
    #[error("Crate does not respond")]
    CrateNotPresent,

    /// Serial highway lost synchronisation
    #[error("Lost serial highway synch")]
    LostSync,

    /// The crate controller flagged an error
    #[error("Error detected by crate controller")]
    ControllerError,

    /// Address scan end lies before its start
    #[error("Ending address is before starting address")]
    BadAddressRange,

    /// General multi-action list spans more than one branch
    #[error("Multiple branches not supported for general multi-action")]
    MultiBranchNotSupported,

    /// Address scan spans more than one branch
    #[error("Multiple branches not supported for address scan")]
    MultiBranchScan,

    /// Address scan spans more than one crate
    #[error("Multiple crates not supported for address scan")]
    MultiCrate,

    /// Repeat count in the control block is unusable
    #[error("Invalid repeat count {0}")]
    BadRepeatCount(usize),

    /// Repeat-until-Q gave up before the module answered with Q
    #[error("Timeout waiting for Q response")]
    WaitForQTimeout,

    /// The backend does not implement this primitive
    #[error("Function not implemented by this backend")]
    NotImplemented,

    /// A card identity is already registered for the slot
    #[error("Slot {slot} already has a registered card")]
    SlotAlreadyRegistered {
        /// Slot number that was already claimed
        slot: u8,
    },

    /// Memory or an operating-system resource could not be obtained
    #[error("Unable to allocate {0}")]
    ResourceExhausted(&'static str),
}

impl CamacError {
    /// ESONE status number for this error, when the classic library defines one.
    pub fn status_code(&self) -> Option<u16> {
        let code = match self {
            Self::NoQ => 1,
            Self::NoX => 2,
            Self::NoQNoX => 3,
            Self::InvalidBranch(_) => 7,
            Self::InvalidCrate(_) => 11,
            Self::InvalidSlot(_) => 15,
            Self::InvalidSubaddress(_) => 19,
            Self::InvalidFunctionCode(_) => 23,
            Self::InvalidAddress => 27,
            Self::InvalidLam => 31,
            Self::BadTimeout(_) => 35,
            Self::NoHardware(_) => 39,
            Self::NotReady => 43,
            Self::HardwareTimeout => 47,
            Self::LamTimeout => 51,
            Self::LongitudinalParity => 55,
            Self::TransverseParity => 59,
            Self::CrateOffline => 63,
            Self::CrateBypassed => 67,
            Self::CrateNotPresent => 71,
            Self::LostSync => 75,
            Self::ControllerError => 79,
            Self::BadAddressRange => 83,
            Self::MultiBranchNotSupported => 87,
            Self::MultiBranchScan => 91,
            Self::MultiCrate => 95,
            Self::BadRepeatCount(_) => 99,
            Self::WaitForQTimeout => 103,
            Self::NotImplemented => 107,
            Self::SlotAlreadyRegistered { .. } | Self::ResourceExhausted(_) => return None,
        };
        Some(code)
    }

    /// Statistics counter that a failure of this kind is recorded under.
    ///
    /// Parameter and resource errors return `None`; they are reported to the
    /// caller but never counted.
    pub fn category(&self) -> Option<ErrorCategory> {
        let category = match self {
            Self::NotReady => ErrorCategory::Branch(BranchErrorKind::NotReady),
            Self::HardwareTimeout => ErrorCategory::Branch(BranchErrorKind::HardwareTimeout),
            Self::LongitudinalParity => ErrorCategory::Branch(BranchErrorKind::LongitudinalParity),
            Self::TransverseParity => ErrorCategory::Branch(BranchErrorKind::TransverseParity),
            Self::LostSync => ErrorCategory::Branch(BranchErrorKind::LostSync),
            Self::ControllerError => ErrorCategory::Crate(CrateErrorKind::ControllerError),
            Self::CrateNotPresent => ErrorCategory::Crate(CrateErrorKind::NotPresent),
            Self::CrateOffline => ErrorCategory::Crate(CrateErrorKind::Offline),
            Self::CrateBypassed => ErrorCategory::Crate(CrateErrorKind::Bypassed),
            Self::NoQ | Self::NoX | Self::NoQNoX => ErrorCategory::Slot(SlotErrorKind::NoX),
            Self::WaitForQTimeout => ErrorCategory::Slot(SlotErrorKind::WaitForQTimeout),
            _ => return None,
        };
        Some(category)
    }

    /// Check if this error was caused by a bad argument rather than the bus.
    pub fn is_parameter_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidBranch(_)
                | Self::InvalidCrate(_)
                | Self::InvalidSlot(_)
                | Self::InvalidSubaddress(_)
                | Self::InvalidFunctionCode(_)
                | Self::InvalidAddress
                | Self::InvalidLam
                | Self::BadTimeout(_)
                | Self::BadAddressRange
                | Self::MultiBranchNotSupported
                | Self::MultiBranchScan
                | Self::MultiCrate
                | Self::BadRepeatCount(_)
        )
    }

    /// Check if the module simply failed to acknowledge the command.
    pub fn is_no_response(&self) -> bool {
        matches!(self, Self::NoQ | Self::NoX | Self::NoQNoX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CamacError::InvalidSlot(31);
        assert!(err.to_string().contains("31"));
        assert_eq!(CamacError::NoQ.to_string(), "No Q response");
    }

    #[test]
    fn test_status_codes_follow_esone_numbering() {
        assert_eq!(CamacError::NoQ.status_code(), Some(1));
        assert_eq!(CamacError::LamTimeout.status_code(), Some(51));
        assert_eq!(CamacError::NotImplemented.status_code(), Some(107));
        assert_eq!(CamacError::ResourceExhausted("queue").status_code(), None);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            CamacError::NoQ.category(),
            Some(ErrorCategory::Slot(SlotErrorKind::NoX))
        );
        assert_eq!(
            CamacError::CrateOffline.category(),
            Some(ErrorCategory::Crate(CrateErrorKind::Offline))
        );
        assert_eq!(
            CamacError::LostSync.category(),
            Some(ErrorCategory::Branch(BranchErrorKind::LostSync))
        );
        assert_eq!(CamacError::InvalidBranch(9).category(), None);
    }

    #[test]
    fn test_parameter_errors_are_not_counted() {
        for err in [
            CamacError::InvalidBranch(8),
            CamacError::InvalidFunctionCode(40),
            CamacError::BadRepeatCount(0),
        ] {
            assert!(err.is_parameter_error());
            assert!(err.category().is_none());
        }
        assert!(!CamacError::HardwareTimeout.is_parameter_error());
    }
}
