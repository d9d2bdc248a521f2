//! Generic Audio structures shared between the control services.

use core::slice;

use bitflags::bitflags;
use heapless::String;
use trouble_host::{prelude::*, types::gatt_traits::*};

/// Longest description value stored or notified by VOCS/AICS. Writes
/// beyond this are clipped, never rejected.
pub const MAX_DESCRIPTION_SIZE: usize = 32;

bitflags! {
    /// Audio channel location mask carried by the VOCS location
    /// characteristic.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AudioLocation: u8 {
        const FrontLeft = 0x01;
        const FrontRight = 0x02;
        const FrontCenter = 0x04;
        const LowFrequencyEffects = 0x08;
        const BackLeft = 0x10;
        const BackRight = 0x20;
        const FrontLeftOfCenter = 0x40;
        const FrontRightOfCenter = 0x80;
    }
}

impl FixedGattValue for AudioLocation {
    const SIZE: usize = 1;

    fn from_gatt(data: &[u8]) -> Result<Self, FromGattError> {
        if data.len() != Self::SIZE {
            return Err(FromGattError::InvalidLength);
        }
        Ok(Self::from_bits_retain(data[0]))
    }

    fn as_gatt(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }
}

/// A VOCS/AICS description value. Over-long writes are clipped into the
/// bound, never rejected.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Description(pub String<MAX_DESCRIPTION_SIZE>);

impl Description {
    pub fn new(text: &str) -> Self {
        Self(crate::vocs::clip_description(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsGatt for Description {
    const MIN_SIZE: usize = 0;
    const MAX_SIZE: usize = MAX_DESCRIPTION_SIZE;

    fn as_gatt(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl FromGatt for Description {
    fn from_gatt(data: &[u8]) -> Result<Self, FromGattError> {
        let text = core::str::from_utf8(data).map_err(|_| FromGattError::InvalidLength)?;
        Ok(Self::new(text))
    }
}

/// Variable-length characteristic value backed by a bounded buffer.
/// Used where the payload layout is state dependent (ASE status,
/// control-point PDUs).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RawBytes<const N: usize>(pub heapless::Vec<u8, N>);

impl<const N: usize> RawBytes<N> {
    pub fn from_slice(data: &[u8]) -> Self {
        Self(heapless::Vec::from_slice(data).unwrap_or_default())
    }
}

impl<const N: usize> AsGatt for RawBytes<N> {
    const MIN_SIZE: usize = 0;
    const MAX_SIZE: usize = N;

    fn as_gatt(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> FromGatt for RawBytes<N> {
    fn from_gatt(data: &[u8]) -> Result<Self, FromGattError> {
        if data.len() > N {
            return Err(FromGattError::InvalidLength);
        }
        Ok(Self::from_slice(data))
    }
}

/// Source feeding an AICS audio input. Immutable after init.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AudioInputType {
    #[default]
    Local = 0x00,
    /// An isochronous LE audio stream.
    Iso = 0x01,
    Analog = 0x02,
    Digital = 0x03,
    Radio = 0x04,
    PhysicalMedia = 0x05,
    Network = 0x06,
    Other = 0x07,
}

impl AudioInputType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => Self::Local,
            0x01 => Self::Iso,
            0x02 => Self::Analog,
            0x03 => Self::Digital,
            0x04 => Self::Radio,
            0x05 => Self::PhysicalMedia,
            0x06 => Self::Network,
            0x07 => Self::Other,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_clips_at_char_boundaries() {
        // 31 ASCII bytes plus a 2-byte char that would straddle the cap.
        let mut text = std::string::String::new();
        for _ in 0..31 {
            text.push('x');
        }
        text.push('é');
        let desc = Description::new(&text);
        assert_eq!(desc.as_str().len(), 31);
        assert!(desc.as_str().chars().all(|c| c == 'x'));
    }

    #[test]
    fn description_rejects_invalid_utf8() {
        assert!(Description::from_gatt(&[0xFF, 0xFE]).is_err());
        assert_eq!(Description::from_gatt(b"aux in").unwrap().as_str(), "aux in");
    }

    #[test]
    fn raw_bytes_bounds_incoming_values() {
        let raw = RawBytes::<4>::from_gatt(&[1, 2, 3]).unwrap();
        assert_eq!(raw.as_gatt(), &[1, 2, 3]);
        assert!(RawBytes::<4>::from_gatt(&[0; 5]).is_err());
    }

    #[test]
    fn audio_location_wire_size_is_one_byte() {
        let loc = AudioLocation::FrontLeft | AudioLocation::BackRight;
        assert_eq!(loc.as_gatt(), &[0x21]);
        assert_eq!(AudioLocation::from_gatt(&[0x21]).unwrap(), loc);
        assert!(AudioLocation::from_gatt(&[0, 0]).is_err());
    }

    #[test]
    fn input_types_roundtrip() {
        for raw in 0..=7u8 {
            assert_eq!(AudioInputType::from_raw(raw).unwrap() as u8, raw);
        }
        assert!(AudioInputType::from_raw(8).is_none());
    }
}
