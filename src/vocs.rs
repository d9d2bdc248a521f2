//! Volume Offset Control Service
//!
//! Secondary service included by VCS. One instance per audio output,
//! carrying a signed volume offset, an audio-location mask and a
//! description string. Offset writes go through the change-counter
//! guarded control point; location and description are plain writable
//! characteristics when the server opts in at init.

use core::slice;

use heapless::String;
use trouble_host::{prelude::*, types::gatt_traits::*};

use crate::control_point::{self, ControlReject};
use crate::error::{att, Error};
use crate::generic_audio::{AudioLocation, MAX_DESCRIPTION_SIZE};

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;

/// Offset bound accepted by the control point.
pub const OFFSET_MAX: i16 = 255;
pub const OFFSET_MIN: i16 = -255;

/// Offset outside [`OFFSET_MIN`, `OFFSET_MAX`].
pub const ERR_VALUE_OUT_OF_RANGE: u8 = 0x82;

/// Volume Offset State characteristic value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct OffsetState {
    pub offset: i16,
    pub change_counter: u8,
}

impl FixedGattValue for OffsetState {
    const SIZE: usize = 3;

    fn from_gatt(data: &[u8]) -> Result<Self, FromGattError> {
        if data.len() != Self::SIZE {
            return Err(FromGattError::InvalidLength);
        }
        Ok(Self {
            offset: i16::from_le_bytes([data[0], data[1]]),
            change_counter: data[2],
        })
    }

    fn as_gatt(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }
}

/// Volume Offset Control Point opcodes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OffsetOpcode {
    SetOffset = 0x01,
}

impl OffsetOpcode {
    pub(crate) fn operand_len(raw: u8) -> Option<usize> {
        match raw {
            0x01 => Some(2),
            _ => None,
        }
    }
}

/// Rejection of an offset control-point write.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReject {
    Control(ControlReject),
    OutOfRange,
}

impl From<ControlReject> for OffsetReject {
    fn from(reject: ControlReject) -> Self {
        Self::Control(reject)
    }
}

impl OffsetReject {
    pub fn as_att(self) -> u8 {
        match self {
            Self::Control(reject) => reject.as_att(),
            Self::OutOfRange => ERR_VALUE_OUT_OF_RANGE,
        }
    }
}

/// Characteristics to notify after a committed write.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OffsetChange {
    pub state: bool,
    pub location: bool,
    pub description: bool,
}

impl OffsetChange {
    pub(crate) fn merge(&mut self, other: Self) {
        self.state |= other.state;
        self.location |= other.location;
        self.description |= other.description;
    }
}

/// Offset state machine backing one VOCS instance.
pub struct OffsetControl {
    offset: i16,
    change_counter: u8,
    location: AudioLocation,
    description: String<MAX_DESCRIPTION_SIZE>,
}

impl OffsetControl {
    pub fn new(offset: i16, location: AudioLocation) -> Result<Self, Error> {
        if !(OFFSET_MIN..=OFFSET_MAX).contains(&offset) {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            offset,
            change_counter: 0,
            location,
            description: String::new(),
        })
    }

    pub fn state(&self) -> OffsetState {
        OffsetState {
            offset: self.offset,
            change_counter: self.change_counter,
        }
    }

    pub fn offset(&self) -> i16 {
        self.offset
    }

    pub fn change_counter(&self) -> u8 {
        self.change_counter
    }

    pub fn location(&self) -> AudioLocation {
        self.location
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Handles a Volume Offset Control Point write (GATT path).
    pub fn control_write(&mut self, data: &[u8], offset: usize) -> Result<OffsetChange, OffsetReject> {
        let req = control_point::parse_request(
            data,
            offset,
            self.change_counter,
            OffsetOpcode::operand_len,
        )?;
        let value = i16::from_le_bytes([req.operand[0], req.operand[1]]);
        if !(OFFSET_MIN..=OFFSET_MAX).contains(&value) {
            return Err(OffsetReject::OutOfRange);
        }
        let mut change = OffsetChange::default();
        if value != self.offset {
            self.offset = value;
            self.change_counter = self.change_counter.wrapping_add(1);
            change.state = true;
        }
        Ok(change)
    }

    /// Local application path, forged through the control-point handler.
    pub fn set_offset(&mut self, offset: i16) -> Result<OffsetChange, Error> {
        if !(OFFSET_MIN..=OFFSET_MAX).contains(&offset) {
            return Err(Error::InvalidParam);
        }
        let le = offset.to_le_bytes();
        let pdu = [OffsetOpcode::SetOffset as u8, self.change_counter, le[0], le[1]];
        self.control_write(&pdu, 0).map_err(|_| Error::InvalidParam)
    }

    /// Handles a location characteristic write. Only reachable when the
    /// server made the location writable.
    pub fn location_write(&mut self, data: &[u8]) -> Result<OffsetChange, u8> {
        if data.len() != 1 {
            return Err(att::INVALID_ATTRIBUTE_VALUE_LENGTH);
        }
        let Some(location) = AudioLocation::from_bits(data[0]) else {
            return Err(att::WRITE_REQUEST_REJECTED);
        };
        Ok(self.set_location(location))
    }

    pub fn set_location(&mut self, location: AudioLocation) -> OffsetChange {
        let mut change = OffsetChange::default();
        if location != self.location {
            self.location = location;
            change.location = true;
        }
        change
    }

    /// Handles a description write: clips, never rejects on length. An
    /// update commits whenever the incoming byte length differs from the
    /// stored one, or the bytes themselves differ.
    pub fn description_write(&mut self, data: &[u8]) -> Result<OffsetChange, u8> {
        let text = core::str::from_utf8(data).map_err(|_| att::WRITE_REQUEST_REJECTED)?;
        Ok(self.set_description(text))
    }

    pub fn set_description(&mut self, text: &str) -> OffsetChange {
        let clipped = clip_description(text);
        let mut change = OffsetChange::default();
        if text.len() != self.description.len() || clipped != self.description {
            self.description = clipped;
            change.description = true;
        }
        change
    }
}

/// Clips a description at a char boundary inside the storage bound.
pub(crate) fn clip_description(text: &str) -> String<MAX_DESCRIPTION_SIZE> {
    let mut out = String::new();
    for ch in text.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> OffsetControl {
        OffsetControl::new(0, AudioLocation::FrontLeft).unwrap()
    }

    #[test]
    fn set_offset_commits_and_counts() {
        let mut oc = control();
        let change = oc.control_write(&[0x01, 0x00, 0x10, 0x00], 0).unwrap();
        assert!(change.state);
        assert_eq!(oc.offset(), 16);
        assert_eq!(oc.change_counter(), 1);
    }

    #[test]
    fn negative_offsets_are_stored_exactly() {
        let mut oc = control();
        let le = (-255i16).to_le_bytes();
        oc.control_write(&[0x01, 0x00, le[0], le[1]], 0).unwrap();
        assert_eq!(oc.offset(), -255);
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        let mut oc = control();
        // +256 little-endian.
        let err = oc.control_write(&[0x01, 0x00, 0x00, 0x01], 0).unwrap_err();
        assert_eq!(err, OffsetReject::OutOfRange);
        assert_eq!(err.as_att(), 0x82);
        assert_eq!(oc.offset(), 0);
        assert_eq!(oc.change_counter(), 0);
    }

    #[test]
    fn idempotent_offset_commits_nothing() {
        let mut oc = control();
        oc.set_offset(5).unwrap();
        let change = oc.control_write(&[0x01, 0x01, 0x05, 0x00], 0).unwrap();
        assert_eq!(change, OffsetChange::default());
        assert_eq!(oc.change_counter(), 1);
    }

    #[test]
    fn unknown_opcode_and_stale_counter() {
        let mut oc = control();
        assert_eq!(
            oc.control_write(&[0x02, 0x00, 0x00, 0x00], 0).unwrap_err(),
            OffsetReject::Control(ControlReject::OpcodeNotSupported)
        );
        oc.set_offset(1).unwrap();
        assert_eq!(
            oc.control_write(&[0x01, 0x00, 0x02, 0x00], 0).unwrap_err(),
            OffsetReject::Control(ControlReject::InvalidChangeCounter)
        );
    }

    #[test]
    fn location_write_validates_length_and_bits() {
        let mut oc = control();
        assert_eq!(
            oc.location_write(&[0x01, 0x02]).unwrap_err(),
            att::INVALID_ATTRIBUTE_VALUE_LENGTH
        );
        let change = oc.location_write(&[0x02]).unwrap();
        assert!(change.location);
        assert_eq!(oc.location(), AudioLocation::FrontRight);
        // Same value again: no notification.
        assert_eq!(oc.location_write(&[0x02]).unwrap(), OffsetChange::default());
    }

    #[test]
    fn description_clips_instead_of_rejecting() {
        let mut oc = control();
        let long = "abcdefghijklmnopqrstuvwxyz0123456789";
        let change = oc.description_write(long.as_bytes()).unwrap();
        assert!(change.description);
        assert_eq!(oc.description().len(), MAX_DESCRIPTION_SIZE);
        assert_eq!(oc.description(), &long[..MAX_DESCRIPTION_SIZE]);
    }

    #[test]
    fn description_same_bytes_commits_nothing() {
        let mut oc = control();
        oc.description_write(b"left output").unwrap();
        assert_eq!(
            oc.description_write(b"left output").unwrap(),
            OffsetChange::default()
        );
        // Different length always commits, even with an equal prefix.
        let change = oc.description_write(b"left output\0").unwrap();
        assert!(change.description);
    }

    #[test]
    fn wire_roundtrip() {
        let state = OffsetState { offset: -40, change_counter: 9 };
        let bytes = state.as_gatt();
        assert_eq!(bytes.len(), 3);
        assert_eq!(OffsetState::from_gatt(bytes).unwrap(), state);
        assert!(OffsetState::from_gatt(&[0; 4]).is_err());
    }
}
