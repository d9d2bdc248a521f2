//! Volume Control Service
//!
//! Exposes the device's absolute volume and mute state. The control
//! point is change-counter guarded; local (application) volume calls
//! re-enter the same handler with a forged write so there is a single
//! source of truth for state transitions.

use core::slice;

use bitflags::bitflags;
use heapless::Vec;
use trouble_host::{prelude::*, types::gatt_traits::*};

use crate::control_point::{self, ControlReject};
use crate::error::Error;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;

/// Mute field of the volume state.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mute {
    #[default]
    Unmuted = 0x00,
    Muted = 0x01,
}

/// Volume State characteristic value.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct VolumeState {
    pub volume: u8,
    pub mute: u8,
    pub change_counter: u8,
}

impl VolumeState {
    pub fn is_muted(&self) -> bool {
        self.mute == Mute::Muted as u8
    }
}

impl FixedGattValue for VolumeState {
    const SIZE: usize = 3;

    fn from_gatt(data: &[u8]) -> Result<Self, FromGattError> {
        if data.len() != Self::SIZE {
            return Err(FromGattError::InvalidLength);
        }
        Ok(Self {
            volume: data[0],
            mute: data[1],
            change_counter: data[2],
        })
    }

    fn as_gatt(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }
}

bitflags! {
    /// Volume Flags characteristic value. The persisted bit latches on
    /// the first successful volume-changing opcode and stays set for the
    /// lifetime of the service.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VolumeFlags: u8 {
        const VolumeSettingPersisted = 0x01;
    }
}

impl FixedGattValue for VolumeFlags {
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

/// Volume Control Point opcodes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VolumeOpcode {
    RelativeVolumeDown = 0x00,
    RelativeVolumeUp = 0x01,
    UnmuteRelativeVolumeDown = 0x02,
    UnmuteRelativeVolumeUp = 0x03,
    SetAbsoluteVolume = 0x04,
    Unmute = 0x05,
    Mute = 0x06,
}

impl VolumeOpcode {
    /// Operand size implied by an opcode byte, `None` if unsupported.
    pub(crate) fn operand_len(raw: u8) -> Option<usize> {
        match raw {
            0x00..=0x03 | 0x05 | 0x06 => Some(0),
            0x04 => Some(1),
            _ => None,
        }
    }

    fn touches_volume(raw: u8) -> bool {
        matches!(raw, 0x00..=0x04)
    }
}

/// Characteristics to notify after a committed control-point write.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VolumeChange {
    pub state: bool,
    pub flags: bool,
}

impl VolumeChange {
    pub(crate) fn merge(&mut self, other: Self) {
        self.state |= other.state;
        self.flags |= other.flags;
    }
}

/// Volume state machine backing the GATT server instance.
pub struct VolumeControl {
    volume: u8,
    mute: Mute,
    change_counter: u8,
    flags: VolumeFlags,
    step: u8,
}

impl VolumeControl {
    pub fn new(volume: u8, mute: Mute, step: u8) -> Result<Self, Error> {
        if step == 0 {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            volume,
            mute,
            change_counter: 0,
            flags: VolumeFlags::empty(),
            step,
        })
    }

    pub fn state(&self) -> VolumeState {
        VolumeState {
            volume: self.volume,
            mute: self.mute as u8,
            change_counter: self.change_counter,
        }
    }

    pub fn flags(&self) -> VolumeFlags {
        self.flags
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn mute_state(&self) -> Mute {
        self.mute
    }

    pub fn change_counter(&self) -> u8 {
        self.change_counter
    }

    /// Sets the server-global step used by the relative opcodes.
    pub fn set_step(&mut self, step: u8) -> Result<(), Error> {
        if step == 0 {
            return Err(Error::InvalidParam);
        }
        self.step = step;
        Ok(())
    }

    /// Handles a Volume Control Point write (GATT path). On success the
    /// returned change says which characteristics must be notified.
    pub fn control_write(&mut self, data: &[u8], offset: usize) -> Result<VolumeChange, ControlReject> {
        let req = control_point::parse_request(
            data,
            offset,
            self.change_counter,
            VolumeOpcode::operand_len,
        )?;
        Ok(self.apply(req.opcode, req.operand))
    }

    fn apply(&mut self, opcode: u8, operand: &[u8]) -> VolumeChange {
        let (volume, mute) = match opcode {
            0x00 => (self.volume.saturating_sub(self.step), self.mute),
            0x01 => (self.volume.saturating_add(self.step), self.mute),
            0x02 => (self.volume.saturating_sub(self.step), Mute::Unmuted),
            0x03 => (self.volume.saturating_add(self.step), Mute::Unmuted),
            0x04 => (operand[0], self.mute),
            0x05 => (self.volume, Mute::Unmuted),
            0x06 => (self.volume, Mute::Muted),
            _ => unreachable!(),
        };

        let mut change = VolumeChange::default();
        if volume != self.volume || mute != self.mute {
            self.volume = volume;
            self.mute = mute;
            self.change_counter = self.change_counter.wrapping_add(1);
            change.state = true;
        }
        // Volume opcodes latch the persisted flag even when idempotent.
        if VolumeOpcode::touches_volume(opcode)
            && !self.flags.contains(VolumeFlags::VolumeSettingPersisted)
        {
            self.flags.insert(VolumeFlags::VolumeSettingPersisted);
            change.flags = true;
        }
        change
    }

    /// Local application path: forges a control-point write against the
    /// current counter and feeds it through the same handler.
    fn local(&mut self, opcode: VolumeOpcode, operand: &[u8]) -> Result<VolumeChange, Error> {
        let mut pdu: Vec<u8, 3> = Vec::new();
        pdu.push(opcode as u8).map_err(|_| Error::NoMemory)?;
        pdu.push(self.change_counter).map_err(|_| Error::NoMemory)?;
        pdu.extend_from_slice(operand).map_err(|_| Error::NoMemory)?;
        self.control_write(&pdu, 0).map_err(|_| Error::InvalidParam)
    }

    pub fn volume_down(&mut self) -> Result<VolumeChange, Error> {
        self.local(VolumeOpcode::RelativeVolumeDown, &[])
    }

    pub fn volume_up(&mut self) -> Result<VolumeChange, Error> {
        self.local(VolumeOpcode::RelativeVolumeUp, &[])
    }

    pub fn unmute_volume_down(&mut self) -> Result<VolumeChange, Error> {
        self.local(VolumeOpcode::UnmuteRelativeVolumeDown, &[])
    }

    pub fn unmute_volume_up(&mut self) -> Result<VolumeChange, Error> {
        self.local(VolumeOpcode::UnmuteRelativeVolumeUp, &[])
    }

    pub fn set_volume(&mut self, volume: u8) -> Result<VolumeChange, Error> {
        self.local(VolumeOpcode::SetAbsoluteVolume, &[volume])
    }

    pub fn unmute(&mut self) -> Result<VolumeChange, Error> {
        self.local(VolumeOpcode::Unmute, &[])
    }

    pub fn mute(&mut self) -> Result<VolumeChange, Error> {
        self.local(VolumeOpcode::Mute, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(volume: u8, mute: Mute, step: u8) -> VolumeControl {
        VolumeControl::new(volume, mute, step).unwrap()
    }

    #[test]
    fn rejects_zero_step() {
        assert_eq!(VolumeControl::new(0, Mute::Unmuted, 0).unwrap_err(), Error::InvalidParam);
        let mut vc = control(0, Mute::Unmuted, 1);
        assert_eq!(vc.set_step(0).unwrap_err(), Error::InvalidParam);
        assert!(vc.set_step(8).is_ok());
    }

    #[test]
    fn volume_up_commits_state_and_latches_flags() {
        let mut vc = control(100, Mute::Unmuted, 1);
        let change = vc.control_write(&[0x01, 0x00], 0).unwrap();
        assert_eq!(change, VolumeChange { state: true, flags: true });
        assert_eq!(vc.state(), VolumeState { volume: 101, mute: 0, change_counter: 1 });
        assert_eq!(vc.flags(), VolumeFlags::VolumeSettingPersisted);
    }

    #[test]
    fn set_absolute_volume_stores_operand() {
        let mut vc = control(100, Mute::Unmuted, 1);
        vc.control_write(&[0x01, 0x00], 0).unwrap();
        let change = vc.control_write(&[0x04, 0x01, 200], 0).unwrap();
        assert!(change.state);
        // Flag already latched, no second flags notification.
        assert!(!change.flags);
        assert_eq!(vc.state(), VolumeState { volume: 200, mute: 0, change_counter: 2 });
    }

    #[test]
    fn stale_counter_is_rejected_without_side_effects() {
        let mut vc = control(100, Mute::Unmuted, 1);
        vc.control_write(&[0x01, 0x00], 0).unwrap();
        vc.control_write(&[0x04, 0x01, 200], 0).unwrap();
        let err = vc.control_write(&[0x04, 0x00, 50], 0).unwrap_err();
        assert_eq!(err, ControlReject::InvalidChangeCounter);
        assert_eq!(err.as_att(), 0x80);
        assert_eq!(vc.state(), VolumeState { volume: 200, mute: 0, change_counter: 2 });
    }

    #[test]
    fn relative_ops_saturate_at_bounds() {
        let mut vc = control(254, Mute::Unmuted, 5);
        vc.volume_up().unwrap();
        assert_eq!(vc.volume(), 255);
        let mut vc = control(3, Mute::Unmuted, 5);
        vc.volume_down().unwrap();
        assert_eq!(vc.volume(), 0);
    }

    #[test]
    fn unmute_relative_ops_clear_mute() {
        let mut vc = control(10, Mute::Muted, 2);
        let change = vc.unmute_volume_up().unwrap();
        assert!(change.state);
        assert_eq!(vc.mute_state(), Mute::Unmuted);
        assert_eq!(vc.volume(), 12);
    }

    #[test]
    fn idempotent_mute_commits_nothing() {
        let mut vc = control(10, Mute::Muted, 2);
        let change = vc.mute().unwrap();
        assert_eq!(change, VolumeChange::default());
        assert_eq!(vc.change_counter(), 0);

        let change = vc.unmute().unwrap();
        assert!(change.state);
        assert_eq!(vc.change_counter(), 1);
        let change = vc.unmute().unwrap();
        assert_eq!(change, VolumeChange::default());
        assert_eq!(vc.change_counter(), 1);
    }

    #[test]
    fn idempotent_volume_opcode_still_latches_flag_once() {
        let mut vc = control(0, Mute::Unmuted, 1);
        // Volume already at the floor: no state commit, flag latches.
        let change = vc.control_write(&[0x00, 0x00], 0).unwrap();
        assert_eq!(change, VolumeChange { state: false, flags: true });
        assert_eq!(vc.change_counter(), 0);
        let change = vc.control_write(&[0x00, 0x00], 0).unwrap();
        assert_eq!(change, VolumeChange::default());
    }

    #[test]
    fn counter_wraps_modulo_256() {
        let mut vc = control(0, Mute::Unmuted, 1);
        for i in 0..=255u16 {
            let state = vc.state();
            assert_eq!(state.change_counter, i as u8);
            vc.control_write(&[0x04, state.change_counter, (i % 2) as u8 + 1], 0)
                .unwrap();
        }
        assert_eq!(vc.change_counter(), 0);
    }

    #[test]
    fn local_calls_share_the_gatt_handler() {
        let mut vc = control(100, Mute::Unmuted, 1);
        let change = vc.set_volume(42).unwrap();
        assert!(change.state && change.flags);
        assert_eq!(vc.state(), VolumeState { volume: 42, mute: 0, change_counter: 1 });
        // The forged write used the live counter, so a GATT write with
        // the previous counter now collides.
        assert_eq!(
            vc.control_write(&[0x04, 0x00, 7], 0).unwrap_err(),
            ControlReject::InvalidChangeCounter
        );
    }

    #[test]
    fn wire_roundtrip() {
        let state = VolumeState { volume: 7, mute: 1, change_counter: 250 };
        let bytes = state.as_gatt();
        assert_eq!(bytes, &[7, 1, 250]);
        assert_eq!(VolumeState::from_gatt(bytes).unwrap(), state);
        assert!(VolumeState::from_gatt(&[1, 2]).is_err());
        assert!(state.is_muted());
    }
}
