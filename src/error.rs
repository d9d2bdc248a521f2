//! Error surfaces.
//!
//! Three layers cross this crate: standard ATT error codes, per-service
//! application error bytes carried in ATT error responses, and the
//! [`Error`] enum handed to the application.

use trouble_host::prelude::AttErrorCode;

/// Standard ATT error bytes the control-point gate emits directly.
pub mod att {
    /// Fragmented write (non-zero value offset).
    pub const INVALID_OFFSET: u8 = 0x07;
    /// Write length does not match the opcode's layout.
    pub const INVALID_ATTRIBUTE_VALUE_LENGTH: u8 = 0x0D;
    /// Catch-all for a failed internal step, e.g. a dead re-read.
    pub const UNLIKELY_ERROR: u8 = 0x0E;
    /// Value rejected by the profile (malformed peer payload).
    pub const WRITE_REQUEST_REJECTED: u8 = 0xFC;
}

/// Errors surfaced to the application.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No connection, or the connection went away mid-transaction.
    NotConnected,
    /// Argument outside the service's domain.
    InvalidParam,
    /// A transaction is already in flight on this instance.
    Busy,
    /// The peer or the local build lacks the capability.
    NotSupported,
    /// The operation is forbidden in the current state.
    NotPermitted,
    /// Instance already initialised.
    Already,
    /// Instance index outside the configured pool.
    OutOfRange,
    /// A bounded table or buffer is full.
    NoMemory,
    /// ATT error byte from the peer (standard or service-specific).
    Att(u8),
}

/// Wraps a service-specific or standard error byte for an ATT response.
pub(crate) fn att_error(code: u8) -> AttErrorCode {
    AttErrorCode::from(code)
}
