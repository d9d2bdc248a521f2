//! Audio Input Control Service
//!
//! Secondary service included by VCS, one instance per audio input.
//! Gain, mute and gain mode live in one counter-guarded state value;
//! gain settings and input type are immutable after init; the input
//! status is server-controlled.

use core::slice;

use heapless::String;
use trouble_host::{prelude::*, types::gatt_traits::*};

use crate::control_point::{self, ControlReject};
use crate::error::{att, Error};
use crate::generic_audio::{AudioInputType, MAX_DESCRIPTION_SIZE};
use crate::vocs::clip_description;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;

/// Mute/unmute on an input whose mute capability is disabled.
pub const ERR_MUTE_DISABLED: u8 = 0x82;
/// Gain outside the instance's gain settings.
pub const ERR_VALUE_OUT_OF_RANGE: u8 = 0x83;
/// Manual/automatic switch on a fixed-mode instance.
pub const ERR_GAIN_MODE_NOT_ALLOWED: u8 = 0x84;

/// Mute field of the input state. Once `Disabled`, neither mute opcode
/// can change it.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mute {
    #[default]
    Unmuted = 0x00,
    Muted = 0x01,
    Disabled = 0x02,
}

/// Gain mode field. The `*Only` values are fixed for the lifetime of
/// the instance.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GainMode {
    ManualOnly = 0x00,
    AutoOnly = 0x01,
    #[default]
    Manual = 0x02,
    Auto = 0x03,
}

impl GainMode {
    /// Whether the mode can be flipped between manual and automatic.
    pub fn is_settable(self) -> bool {
        matches!(self, GainMode::Manual | GainMode::Auto)
    }
}

/// Input status, controlled by the server application.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InputStatus {
    Inactive = 0x00,
    #[default]
    Active = 0x01,
}

/// Audio Input State characteristic value.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct InputState {
    pub gain: i8,
    pub mute: u8,
    pub mode: u8,
    pub change_counter: u8,
}

impl FixedGattValue for InputState {
    const SIZE: usize = 4;

    fn from_gatt(data: &[u8]) -> Result<Self, FromGattError> {
        if data.len() != Self::SIZE {
            return Err(FromGattError::InvalidLength);
        }
        Ok(Self {
            gain: data[0] as i8,
            mute: data[1],
            mode: data[2],
            change_counter: data[3],
        })
    }

    fn as_gatt(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }
}

/// Gain Settings characteristic value. Immutable after init.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct GainSettings {
    /// Size of one gain step in 0.1 dB increments.
    pub units: u8,
    pub min: i8,
    pub max: i8,
}

impl Default for GainSettings {
    fn default() -> Self {
        Self {
            units: 1,
            min: i8::MIN,
            max: i8::MAX,
        }
    }
}

impl FixedGattValue for GainSettings {
    const SIZE: usize = 3;

    fn from_gatt(data: &[u8]) -> Result<Self, FromGattError> {
        if data.len() != Self::SIZE {
            return Err(FromGattError::InvalidLength);
        }
        Ok(Self {
            units: data[0],
            min: data[1] as i8,
            max: data[2] as i8,
        })
    }

    fn as_gatt(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }
}

/// Audio Input Control Point opcodes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum GainOpcode {
    SetGain = 0x01,
    Unmute = 0x02,
    Mute = 0x03,
    SetManualMode = 0x04,
    SetAutoMode = 0x05,
}

impl GainOpcode {
    pub(crate) fn operand_len(raw: u8) -> Option<usize> {
        match raw {
            0x01 => Some(1),
            0x02..=0x05 => Some(0),
            _ => None,
        }
    }
}

/// Rejection of an input control-point write.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainReject {
    Control(ControlReject),
    MuteDisabled,
    OutOfRange,
    GainModeNotAllowed,
}

impl From<ControlReject> for GainReject {
    fn from(reject: ControlReject) -> Self {
        Self::Control(reject)
    }
}

impl GainReject {
    pub fn as_att(self) -> u8 {
        match self {
            Self::Control(reject) => reject.as_att(),
            Self::MuteDisabled => ERR_MUTE_DISABLED,
            Self::OutOfRange => ERR_VALUE_OUT_OF_RANGE,
            Self::GainModeNotAllowed => ERR_GAIN_MODE_NOT_ALLOWED,
        }
    }
}

/// Characteristics to notify after a committed write.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GainChange {
    pub state: bool,
    pub status: bool,
    pub description: bool,
}

impl GainChange {
    pub(crate) fn merge(&mut self, other: Self) {
        self.state |= other.state;
        self.status |= other.status;
        self.description |= other.description;
    }
}

/// Gain/mute/mode state machine backing one AICS instance.
pub struct GainControl {
    gain: i8,
    mute: Mute,
    mode: GainMode,
    change_counter: u8,
    settings: GainSettings,
    status: InputStatus,
    input_type: AudioInputType,
    description: String<MAX_DESCRIPTION_SIZE>,
}

impl GainControl {
    pub fn new(
        gain: i8,
        mute: Mute,
        mode: GainMode,
        settings: GainSettings,
        input_type: AudioInputType,
    ) -> Result<Self, Error> {
        if settings.min > settings.max || gain < settings.min || gain > settings.max {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            gain,
            mute,
            mode,
            change_counter: 0,
            settings,
            status: InputStatus::Active,
            input_type,
            description: String::new(),
        })
    }

    pub fn state(&self) -> InputState {
        InputState {
            gain: self.gain,
            mute: self.mute as u8,
            mode: self.mode as u8,
            change_counter: self.change_counter,
        }
    }

    pub fn gain(&self) -> i8 {
        self.gain
    }

    pub fn mute_state(&self) -> Mute {
        self.mute
    }

    pub fn mode(&self) -> GainMode {
        self.mode
    }

    pub fn change_counter(&self) -> u8 {
        self.change_counter
    }

    pub fn settings(&self) -> GainSettings {
        self.settings
    }

    pub fn status(&self) -> InputStatus {
        self.status
    }

    pub fn input_type(&self) -> AudioInputType {
        self.input_type
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Handles an Audio Input Control Point write (GATT path).
    pub fn control_write(&mut self, data: &[u8], offset: usize) -> Result<GainChange, GainReject> {
        let req = control_point::parse_request(
            data,
            offset,
            self.change_counter,
            GainOpcode::operand_len,
        )?;

        let (gain, mute, mode) = match req.opcode {
            0x01 => {
                let gain = req.operand[0] as i8;
                if gain < self.settings.min || gain > self.settings.max {
                    return Err(GainReject::OutOfRange);
                }
                if !self.mode.is_settable() {
                    // Fixed-mode instances accept the write but the gain
                    // is not applied.
                    return Ok(GainChange::default());
                }
                (gain, self.mute, self.mode)
            }
            0x02 | 0x03 => {
                if self.mute == Mute::Disabled {
                    return Err(GainReject::MuteDisabled);
                }
                let mute = if req.opcode == 0x02 { Mute::Unmuted } else { Mute::Muted };
                (self.gain, mute, self.mode)
            }
            0x04 | 0x05 => {
                if !self.mode.is_settable() {
                    return Err(GainReject::GainModeNotAllowed);
                }
                let mode = if req.opcode == 0x04 { GainMode::Manual } else { GainMode::Auto };
                (self.gain, self.mute, mode)
            }
            _ => unreachable!(),
        };

        let mut change = GainChange::default();
        if gain != self.gain || mute != self.mute || mode != self.mode {
            self.gain = gain;
            self.mute = mute;
            self.mode = mode;
            self.change_counter = self.change_counter.wrapping_add(1);
            change.state = true;
        }
        Ok(change)
    }

    fn local(&mut self, opcode: GainOpcode, operand: &[u8]) -> Result<GainChange, Error> {
        let mut pdu = [0u8; 3];
        pdu[0] = opcode as u8;
        pdu[1] = self.change_counter;
        pdu[2..2 + operand.len()].copy_from_slice(operand);
        self.control_write(&pdu[..2 + operand.len()], 0)
            .map_err(|reject| match reject {
                GainReject::MuteDisabled => Error::NotPermitted,
                GainReject::OutOfRange => Error::InvalidParam,
                GainReject::GainModeNotAllowed => Error::NotSupported,
                GainReject::Control(_) => Error::InvalidParam,
            })
    }

    pub fn set_gain(&mut self, gain: i8) -> Result<GainChange, Error> {
        self.local(GainOpcode::SetGain, &[gain as u8])
    }

    pub fn unmute(&mut self) -> Result<GainChange, Error> {
        self.local(GainOpcode::Unmute, &[])
    }

    pub fn mute(&mut self) -> Result<GainChange, Error> {
        self.local(GainOpcode::Mute, &[])
    }

    pub fn set_manual_mode(&mut self) -> Result<GainChange, Error> {
        self.local(GainOpcode::SetManualMode, &[])
    }

    pub fn set_auto_mode(&mut self) -> Result<GainChange, Error> {
        self.local(GainOpcode::SetAutoMode, &[])
    }

    /// Server-controlled input status. Not counter-guarded; notifies the
    /// status characteristic on change.
    pub fn set_status(&mut self, status: InputStatus) -> GainChange {
        let mut change = GainChange::default();
        if status != self.status {
            self.status = status;
            change.status = true;
        }
        change
    }

    /// Handles a description write: clips, never rejects on length.
    pub fn description_write(&mut self, data: &[u8]) -> Result<GainChange, u8> {
        let text = core::str::from_utf8(data).map_err(|_| att::WRITE_REQUEST_REJECTED)?;
        Ok(self.set_description(text))
    }

    pub fn set_description(&mut self, text: &str) -> GainChange {
        let clipped = clip_description(text);
        let mut change = GainChange::default();
        if text.len() != self.description.len() || clipped != self.description {
            self.description = clipped;
            change.description = true;
        }
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(mute: Mute, mode: GainMode) -> GainControl {
        let settings = GainSettings { units: 1, min: -10, max: 10 };
        GainControl::new(0, mute, mode, settings, AudioInputType::Iso).unwrap()
    }

    #[test]
    fn init_validates_gain_against_settings() {
        let settings = GainSettings { units: 1, min: -5, max: 5 };
        assert!(GainControl::new(6, Mute::Unmuted, GainMode::Manual, settings, AudioInputType::Local).is_err());
        let bad = GainSettings { units: 1, min: 5, max: -5 };
        assert!(GainControl::new(0, Mute::Unmuted, GainMode::Manual, bad, AudioInputType::Local).is_err());
    }

    #[test]
    fn set_gain_commits_in_settable_mode() {
        let mut gc = control(Mute::Unmuted, GainMode::Manual);
        let change = gc.control_write(&[0x01, 0x00, 0x05], 0).unwrap();
        assert!(change.state);
        assert_eq!(gc.gain(), 5);
        assert_eq!(gc.change_counter(), 1);
    }

    #[test]
    fn set_gain_out_of_range_is_rejected() {
        let mut gc = control(Mute::Unmuted, GainMode::Manual);
        let err = gc.control_write(&[0x01, 0x00, 0x0B], 0).unwrap_err();
        assert_eq!(err, GainReject::OutOfRange);
        assert_eq!(err.as_att(), 0x83);
        assert_eq!(gc.change_counter(), 0);
    }

    #[test]
    fn set_gain_in_fixed_mode_is_accepted_but_not_applied() {
        let mut gc = control(Mute::Unmuted, GainMode::AutoOnly);
        let change = gc.control_write(&[0x01, 0x00, 0x05], 0).unwrap();
        assert_eq!(change, GainChange::default());
        assert_eq!(gc.gain(), 0);
        assert_eq!(gc.change_counter(), 0);
    }

    #[test]
    fn mute_opcodes_fail_when_mute_disabled() {
        let mut gc = control(Mute::Disabled, GainMode::Manual);
        for opcode in [0x02u8, 0x03] {
            let err = gc.control_write(&[opcode, 0x00], 0).unwrap_err();
            assert_eq!(err, GainReject::MuteDisabled);
            assert_eq!(err.as_att(), 0x82);
        }
        assert_eq!(gc.change_counter(), 0);
        assert_eq!(gc.mute_state(), Mute::Disabled);
    }

    #[test]
    fn mute_and_unmute_commit_once() {
        let mut gc = control(Mute::Unmuted, GainMode::Manual);
        assert!(gc.control_write(&[0x03, 0x00], 0).unwrap().state);
        assert_eq!(gc.mute_state(), Mute::Muted);
        // Redundant mute: success, nothing committed.
        assert_eq!(gc.control_write(&[0x03, 0x01], 0).unwrap(), GainChange::default());
        assert_eq!(gc.change_counter(), 1);
    }

    #[test]
    fn mode_switch_guards_fixed_modes() {
        for mode in [GainMode::ManualOnly, GainMode::AutoOnly] {
            let mut gc = control(Mute::Unmuted, mode);
            for opcode in [0x04u8, 0x05] {
                let err = gc.control_write(&[opcode, 0x00], 0).unwrap_err();
                assert_eq!(err, GainReject::GainModeNotAllowed);
                assert_eq!(err.as_att(), 0x84);
            }
            assert_eq!(gc.mode(), mode);
        }
    }

    #[test]
    fn mode_switch_commits_in_settable_modes() {
        let mut gc = control(Mute::Unmuted, GainMode::Manual);
        assert!(gc.control_write(&[0x05, 0x00], 0).unwrap().state);
        assert_eq!(gc.mode(), GainMode::Auto);
        assert_eq!(gc.control_write(&[0x05, 0x01], 0).unwrap(), GainChange::default());
    }

    #[test]
    fn local_calls_map_rejects_to_api_errors() {
        let mut gc = control(Mute::Disabled, GainMode::ManualOnly);
        assert_eq!(gc.mute().unwrap_err(), Error::NotPermitted);
        assert_eq!(gc.unmute().unwrap_err(), Error::NotPermitted);
        assert_eq!(gc.set_auto_mode().unwrap_err(), Error::NotSupported);
        assert_eq!(gc.set_gain(100).unwrap_err(), Error::InvalidParam);
    }

    #[test]
    fn status_is_server_controlled() {
        let mut gc = control(Mute::Unmuted, GainMode::Manual);
        assert_eq!(gc.set_status(InputStatus::Active), GainChange::default());
        let change = gc.set_status(InputStatus::Inactive);
        assert!(change.status);
        // Status is not part of the counter-guarded state.
        assert_eq!(gc.change_counter(), 0);
    }

    #[test]
    fn wire_roundtrip() {
        let state = InputState { gain: -3, mute: 1, mode: 2, change_counter: 7 };
        assert_eq!(InputState::from_gatt(state.as_gatt()).unwrap(), state);
        let settings = GainSettings { units: 2, min: -100, max: 100 };
        assert_eq!(GainSettings::from_gatt(settings.as_gatt()).unwrap(), settings);
        assert!(InputState::from_gatt(&[0; 3]).is_err());
        assert!(GainSettings::from_gatt(&[0; 4]).is_err());
    }
}
