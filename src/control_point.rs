//! Counter-checked control points.
//!
//! Every VCS/VOCS/AICS control-point write is the same small
//! transaction: refuse fragmented writes, gate the opcode against the
//! service's table, demand the exact length that opcode implies, and
//! demand the current change counter before the service applies any
//! side effect. The client half mirrors it with a bounded
//! write-then-retry machine that transparently re-reads the counter
//! after a collision, exactly once.

use heapless::Vec;

use crate::error::{att, Error};

/// Change-counter collision. Shared byte across the volume services.
pub const INVALID_CHANGE_COUNTER: u8 = 0x80;
/// Opcode outside the service's table. Shared byte across the volume services.
pub const OPCODE_NOT_SUPPORTED: u8 = 0x81;

/// A control-point write that passed the common gate.
pub struct ControlRequest<'d> {
    pub opcode: u8,
    pub counter: u8,
    pub operand: &'d [u8],
}

/// Rejection before the opcode reached the service logic.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReject {
    InvalidOffset,
    OpcodeNotSupported,
    InvalidLength,
    InvalidChangeCounter,
}

impl ControlReject {
    /// The ATT error byte carried in the write response.
    pub fn as_att(self) -> u8 {
        match self {
            ControlReject::InvalidOffset => att::INVALID_OFFSET,
            ControlReject::OpcodeNotSupported => OPCODE_NOT_SUPPORTED,
            ControlReject::InvalidLength => att::INVALID_ATTRIBUTE_VALUE_LENGTH,
            ControlReject::InvalidChangeCounter => INVALID_CHANGE_COUNTER,
        }
    }
}

/// Runs the common gate. `operand_len` is the service's opcode table:
/// `None` for an unknown opcode, otherwise the operand size it implies.
pub(crate) fn parse_request<'d>(
    data: &'d [u8],
    offset: usize,
    current_counter: u8,
    operand_len: impl Fn(u8) -> Option<usize>,
) -> Result<ControlRequest<'d>, ControlReject> {
    if offset != 0 {
        return Err(ControlReject::InvalidOffset);
    }
    let opcode = *data.first().ok_or(ControlReject::InvalidLength)?;
    let operand = operand_len(opcode).ok_or(ControlReject::OpcodeNotSupported)?;
    if data.len() != 2 + operand {
        return Err(ControlReject::InvalidLength);
    }
    let counter = data[1];
    if counter != current_counter {
        return Err(ControlReject::InvalidChangeCounter);
    }
    Ok(ControlRequest {
        opcode,
        counter,
        operand: &data[2..],
    })
}

/// Client-side transaction state. `Idle` is the only state from which a
/// new write may start; everything else is "busy".
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteState {
    #[default]
    Idle,
    /// The control-point write is in flight.
    WritePending,
    /// The write collided on the counter; a state read is in flight.
    RereadPending,
}

/// What the driver must do next after feeding a completion in.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome<'t> {
    /// Transaction finished; deliver the result to the application.
    Complete(Result<(), Error>),
    /// Read the state characteristic and feed [`WriteTransaction::state_read_result`].
    Reread,
    /// Re-issue the control-point write with this payload.
    Retry(&'t [u8]),
    /// No transaction was in flight; drop the completion.
    Spurious,
}

/// One outstanding control-point write per client instance.
///
/// The payload is kept so the retry path can re-issue the opcode without
/// the caller resubmitting; only the counter byte is patched from the
/// re-read state.
pub struct WriteTransaction<const N: usize> {
    state: WriteState,
    buf: Vec<u8, N>,
    retried: bool,
}

impl<const N: usize> Default for WriteTransaction<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> WriteTransaction<N> {
    pub const fn new() -> Self {
        Self {
            state: WriteState::Idle,
            buf: Vec::new(),
            retried: false,
        }
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state != WriteState::Idle
    }

    /// Starts a transaction, returning the payload to write.
    pub fn begin(&mut self, opcode: u8, counter: u8, operand: &[u8]) -> Result<&[u8], Error> {
        if self.is_busy() {
            return Err(Error::Busy);
        }
        self.buf.clear();
        self.buf.push(opcode).map_err(|_| Error::InvalidParam)?;
        self.buf.push(counter).map_err(|_| Error::InvalidParam)?;
        self.buf
            .extend_from_slice(operand)
            .map_err(|_| Error::InvalidParam)?;
        self.retried = false;
        self.state = WriteState::WritePending;
        Ok(&self.buf)
    }

    /// Feeds the GATT write completion in. `Err` carries the ATT error byte.
    pub fn write_result(&mut self, result: Result<(), u8>) -> WriteOutcome<'_> {
        if self.state != WriteState::WritePending {
            return WriteOutcome::Spurious;
        }
        match result {
            Ok(()) => {
                self.state = WriteState::Idle;
                WriteOutcome::Complete(Ok(()))
            }
            Err(INVALID_CHANGE_COUNTER) if !self.retried => {
                self.state = WriteState::RereadPending;
                WriteOutcome::Reread
            }
            Err(code) => {
                // A second collision is not retried; it surfaces.
                self.state = WriteState::Idle;
                WriteOutcome::Complete(Err(Error::Att(code)))
            }
        }
    }

    /// Feeds the state re-read completion in, patching the cached counter.
    pub fn state_read_result(&mut self, counter: Result<u8, u8>) -> WriteOutcome<'_> {
        if self.state != WriteState::RereadPending {
            return WriteOutcome::Spurious;
        }
        match counter {
            Ok(counter) => {
                self.buf[1] = counter;
                self.retried = true;
                self.state = WriteState::WritePending;
                WriteOutcome::Retry(&self.buf)
            }
            Err(_) => {
                self.state = WriteState::Idle;
                WriteOutcome::Complete(Err(Error::Att(att::UNLIKELY_ERROR)))
            }
        }
    }

    /// Tears the transaction down, e.g. when the connection drops.
    pub fn reset(&mut self) {
        self.state = WriteState::Idle;
        self.buf.clear();
        self.retried = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(opcode: u8) -> Option<usize> {
        match opcode {
            0x00..=0x03 | 0x05 | 0x06 => Some(0),
            0x04 => Some(1),
            _ => None,
        }
    }

    #[test]
    fn gate_accepts_exact_write() {
        let req = parse_request(&[0x04, 0x07, 200], 0, 0x07, table).unwrap();
        assert_eq!(req.opcode, 0x04);
        assert_eq!(req.counter, 0x07);
        assert_eq!(req.operand, &[200]);
    }

    #[test]
    fn gate_rejects_fragmented_write() {
        let err = parse_request(&[0x00, 0x00], 1, 0x00, table).unwrap_err();
        assert_eq!(err, ControlReject::InvalidOffset);
        assert_eq!(err.as_att(), att::INVALID_OFFSET);
    }

    #[test]
    fn gate_rejects_unknown_opcode_before_length() {
        let err = parse_request(&[0x77], 0, 0x00, table).unwrap_err();
        assert_eq!(err, ControlReject::OpcodeNotSupported);
        assert_eq!(err.as_att(), OPCODE_NOT_SUPPORTED);
    }

    #[test]
    fn gate_rejects_bad_lengths() {
        assert_eq!(
            parse_request(&[], 0, 0, table).unwrap_err(),
            ControlReject::InvalidLength
        );
        assert_eq!(
            parse_request(&[0x00], 0, 0, table).unwrap_err(),
            ControlReject::InvalidLength
        );
        assert_eq!(
            parse_request(&[0x00, 0x00, 0x01], 0, 0, table).unwrap_err(),
            ControlReject::InvalidLength
        );
        assert_eq!(
            parse_request(&[0x04, 0x00], 0, 0, table).unwrap_err(),
            ControlReject::InvalidLength
        );
    }

    #[test]
    fn gate_rejects_stale_counter() {
        let err = parse_request(&[0x00, 0x01], 0, 0x02, table).unwrap_err();
        assert_eq!(err, ControlReject::InvalidChangeCounter);
        assert_eq!(err.as_att(), INVALID_CHANGE_COUNTER);
    }

    #[test]
    fn transaction_happy_path() {
        let mut tx: WriteTransaction<4> = WriteTransaction::new();
        let pdu = tx.begin(0x04, 0x01, &[50]).unwrap();
        assert_eq!(pdu, &[0x04, 0x01, 50]);
        assert!(tx.is_busy());
        assert_eq!(tx.state(), WriteState::WritePending);
        assert_eq!(tx.write_result(Ok(())), WriteOutcome::Complete(Ok(())));
        assert!(!tx.is_busy());
    }

    #[test]
    fn transaction_rejects_second_begin() {
        let mut tx: WriteTransaction<4> = WriteTransaction::new();
        tx.begin(0x05, 0x00, &[]).unwrap();
        assert_eq!(tx.begin(0x06, 0x00, &[]).unwrap_err(), Error::Busy);
    }

    #[test]
    fn transaction_retries_once_on_counter_collision() {
        let mut tx: WriteTransaction<4> = WriteTransaction::new();
        tx.begin(0x04, 0x00, &[50]).unwrap();
        assert_eq!(
            tx.write_result(Err(INVALID_CHANGE_COUNTER)),
            WriteOutcome::Reread
        );
        assert_eq!(tx.state(), WriteState::RereadPending);
        // Counter re-read patches the payload and re-issues the write.
        assert_eq!(
            tx.state_read_result(Ok(0x02)),
            WriteOutcome::Retry(&[0x04, 0x02, 50])
        );
        assert_eq!(tx.write_result(Ok(())), WriteOutcome::Complete(Ok(())));
    }

    #[test]
    fn transaction_surfaces_second_collision() {
        let mut tx: WriteTransaction<4> = WriteTransaction::new();
        tx.begin(0x04, 0x00, &[50]).unwrap();
        tx.write_result(Err(INVALID_CHANGE_COUNTER));
        tx.state_read_result(Ok(0x02));
        assert_eq!(
            tx.write_result(Err(INVALID_CHANGE_COUNTER)),
            WriteOutcome::Complete(Err(Error::Att(INVALID_CHANGE_COUNTER)))
        );
        assert!(!tx.is_busy());
    }

    #[test]
    fn transaction_reread_failure_is_unlikely() {
        let mut tx: WriteTransaction<4> = WriteTransaction::new();
        tx.begin(0x02, 0x00, &[]).unwrap();
        tx.write_result(Err(INVALID_CHANGE_COUNTER));
        assert_eq!(
            tx.state_read_result(Err(0x0E)),
            WriteOutcome::Complete(Err(Error::Att(att::UNLIKELY_ERROR)))
        );
    }

    #[test]
    fn transaction_surfaces_other_errors_verbatim() {
        let mut tx: WriteTransaction<4> = WriteTransaction::new();
        tx.begin(0x03, 0x00, &[]).unwrap();
        assert_eq!(
            tx.write_result(Err(0x82)),
            WriteOutcome::Complete(Err(Error::Att(0x82)))
        );
    }

    #[test]
    fn spurious_completions_are_dropped() {
        let mut tx: WriteTransaction<4> = WriteTransaction::new();
        assert_eq!(tx.write_result(Ok(())), WriteOutcome::Spurious);
        assert_eq!(tx.state_read_result(Ok(0)), WriteOutcome::Spurious);
    }
}
