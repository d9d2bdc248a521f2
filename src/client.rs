//! Client-side glue shared by the volume service mirrors.

use trouble_host::{prelude::*, types::gatt_traits::AsGatt, BleHostError, Controller};

use crate::control_point::{WriteOutcome, WriteTransaction};
use crate::error::{att, Error};
use crate::generic_audio::RawBytes;

/// Included service instances a client tracks per VCS peer.
pub const MAX_INSTANCES: usize = 2;

/// Pulls the ATT error byte out of a failed GATT operation, if the
/// failure was an ATT error response.
pub(crate) fn att_error_byte<E>(error: &BleHostError<E>) -> Option<u8> {
    match error {
        BleHostError::BleHost(trouble_host::Error::Att(code)) => Some(u8::from(*code)),
        _ => None,
    }
}

/// A client mirror with one outstanding control-point transaction and a
/// cached peer state carrying the change counter.
pub(crate) trait ControlMirror<const N: usize> {
    fn transaction(&mut self) -> &mut WriteTransaction<N>;
    /// Absorbs a state read into the cache; returns the change counter.
    fn absorb_state(&mut self, data: &[u8]) -> Option<u8>;
}

/// Drives one control-point transaction to completion: write, re-read
/// the state on a change-counter collision, retry the write exactly
/// once. Any other peer error surfaces verbatim.
pub(crate) async fn run_control_write<
    'a,
    C: Controller,
    T: AsGatt,
    M: ControlMirror<N>,
    const MAX: usize,
    const MTU: usize,
    const N: usize,
>(
    client: &GattClient<'a, C, MAX, MTU>,
    control: &Characteristic<RawBytes<N>>,
    state: &Characteristic<T>,
    mirror: &mut M,
    mut pdu: RawBytes<N>,
) -> Result<(), Error> {
    loop {
        let written = client
            .write_characteristic(control, &pdu)
            .await
            .map_err(|e| att_error_byte(&e).unwrap_or(att::UNLIKELY_ERROR));
        match mirror.transaction().write_result(written) {
            WriteOutcome::Complete(result) => return result,
            WriteOutcome::Retry(bytes) => {
                pdu = RawBytes::from_slice(bytes);
            }
            WriteOutcome::Reread => {
                let mut data = [0u8; 8];
                let counter = match client.read_characteristic(state, &mut data).await {
                    Ok(len) => mirror.absorb_state(&data[..len]).ok_or(0u8),
                    Err(_) => Err(0u8),
                };
                match mirror.transaction().state_read_result(counter) {
                    WriteOutcome::Retry(bytes) => {
                        pdu = RawBytes::from_slice(bytes);
                    }
                    WriteOutcome::Complete(result) => return result,
                    _ => return Err(Error::NotConnected),
                }
            }
            WriteOutcome::Spurious => return Err(Error::NotConnected),
        }
    }
}
