//! Error taxonomy shared by every service (spec.md §7).
//!
//! Every error carries a [`ServiceTag`] identifying which subsystem raised it
//! and a 16-bit subcode scoped to that tag. The pair round-trips losslessly
//! through the 32-bit wire encoding carried in every response packet's
//! `status` field.

use thiserror::Error;

/// Which subsystem raised an [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServiceTag {
    General = 0x00,
    Ipc = 0x01,
    Config = 0x02,
    DataService = 0x03,
    Canonization = 0x04,
    Consensus = 0x05,
    Protocol = 0x06,
    Random = 0x07,
    Supervisor = 0x08,
}

impl ServiceTag {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x00 => Self::General,
            0x01 => Self::Ipc,
            0x02 => Self::Config,
            0x03 => Self::DataService,
            0x04 => Self::Canonization,
            0x05 => Self::Consensus,
            0x06 => Self::Protocol,
            0x07 => Self::Random,
            0x08 => Self::Supervisor,
            _ => return None,
        })
    }
}

/// A status code as carried on the wire: `(tag << 16) | subcode`.
///
/// `SUCCESS` is the all-zero code and is never tagged to a particular
/// service, matching every response handler's `status == 0` success check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    pub tag: ServiceTag,
    pub subcode: u16,
}

impl ErrorCode {
    pub const SUCCESS: u32 = 0;

    pub const fn new(tag: ServiceTag, subcode: u16) -> Self {
        Self { tag, subcode }
    }

    pub fn to_wire(self) -> u32 {
        ((self.tag as u32) << 16) | u32::from(self.subcode)
    }

    pub fn from_wire(code: u32) -> Option<Self> {
        if code == Self::SUCCESS {
            return None;
        }
        let tag = ServiceTag::from_u16((code >> 16) as u16)?;
        Some(Self {
            tag,
            subcode: (code & 0xFFFF) as u16,
        })
    }
}

/// Harmonizes the two "not found" codes documented for different data
/// service operations in `original_source` into a single value (see
/// SPEC_FULL.md, Open Question resolutions).
pub const NOT_FOUND: ErrorCode = ErrorCode::new(ServiceTag::DataService, 0x0001);
pub const NOT_AUTHORIZED: ErrorCode = ErrorCode::new(ServiceTag::DataService, 0x0002);
pub const WOULD_BLOCK: ErrorCode = ErrorCode::new(ServiceTag::Ipc, 0x0001);
pub const ACCEPT_SHOULD_RETRY: ErrorCode = ErrorCode::new(ServiceTag::Ipc, 0x0002);
pub const UNAUTHORIZED_PACKET: ErrorCode = ErrorCode::new(ServiceTag::Ipc, 0x0003);
pub const AUTHENTICATION_FAILURE: ErrorCode = ErrorCode::new(ServiceTag::Protocol, 0x0001);
pub const READ_UNEXPECTED_DATA_TYPE: ErrorCode = ErrorCode::new(ServiceTag::Ipc, 0x0004);
pub const READ_UNEXPECTED_DATA_SIZE: ErrorCode = ErrorCode::new(ServiceTag::Ipc, 0x0005);
pub const REQUEST_PACKET_INVALID_SIZE: ErrorCode = ErrorCode::new(ServiceTag::DataService, 0x0003);
pub const REQUEST_PACKET_BAD: ErrorCode = ErrorCode::new(ServiceTag::DataService, 0x0004);
pub const RESPONSE_PACKET_INVALID_SIZE: ErrorCode = ErrorCode::new(ServiceTag::DataService, 0x0006);
pub const UNEXPECTED_METHOD_CODE: ErrorCode = ErrorCode::new(ServiceTag::Protocol, 0x0002);
pub const MALFORMED_PAYLOAD_DATA: ErrorCode = ErrorCode::new(ServiceTag::Protocol, 0x0003);
pub const INVALID_STORED_TRANSACTION_NODE: ErrorCode =
    ErrorCode::new(ServiceTag::DataService, 0x0005);
pub const ALREADY_RUNNING: ErrorCode = ErrorCode::new(ServiceTag::Canonization, 0x0001);
pub const START_BEFORE_CONFIGURE: ErrorCode = ErrorCode::new(ServiceTag::Canonization, 0x0002);
pub const NO_CHILD_TRANSACTIONS: ErrorCode = ErrorCode::new(ServiceTag::Canonization, 0x0003);
pub const MISSING_BLOCK_HEIGHT: ErrorCode = ErrorCode::new(ServiceTag::Canonization, 0x0004);
pub const INVALID_BLOCK_UUID: ErrorCode = ErrorCode::new(ServiceTag::Canonization, 0x0005);
pub const BLOCK_MAKE_CONSTRAINT_HEIGHT: ErrorCode = ErrorCode::new(ServiceTag::Canonization, 0x0006);
pub const BLOCK_MAKE_CONSTRAINT_PREV_ID: ErrorCode =
    ErrorCode::new(ServiceTag::Canonization, 0x0007);

/// Top-level error type returned by the crate's fallible operations.
///
/// Distinguishes the status codes that travel to a peer on the wire
/// (`Status`) from invariant violations and OS failures that are fatal to
/// the current process (`Fatal`) and trigger `force_exit` in the owning
/// reactor (spec.md §5).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("status {0:?}")]
    Status(ErrorCode),

    #[error("fatal: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn status(tag: ServiceTag, subcode: u16) -> Self {
        Self::Status(ErrorCode::new(tag, subcode))
    }

    /// `true` for errors that must force-exit the owning connection/reactor
    /// rather than simply being reported to the peer (spec.md §7).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// `true` for the Authentication category (spec.md §7:
    /// `UNAUTHORIZED_PACKET`, `AUTHENTICATION_FAILURE` — "force-exit the
    /// connection"), as opposed to Protocol/Authorization/Domain errors,
    /// which travel to the peer as an in-band status while the connection
    /// stays open.
    pub fn is_connection_terminal(&self) -> bool {
        matches!(self, Self::Status(code) if *code == UNAUTHORIZED_PACKET || *code == AUTHENTICATION_FAILURE)
    }

    pub fn to_wire(&self) -> u32 {
        match self {
            Self::Status(code) => code.to_wire(),
            Self::Fatal(_) => ErrorCode::new(ServiceTag::General, 0x0001).to_wire(),
        }
    }
}

impl From<ErrorCode> for CoreError {
    fn from(code: ErrorCode) -> Self {
        Self::Status(code)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let code = NOT_FOUND;
        let wire = code.to_wire();
        assert_eq!(ErrorCode::from_wire(wire), Some(code));
    }

    #[test]
    fn success_has_no_tag() {
        assert_eq!(ErrorCode::from_wire(ErrorCode::SUCCESS), None);
    }
}
