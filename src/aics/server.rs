//! AICS GATT server glue: attribute registration, handle dispatch and
//! notification flush for a pool of instances.

use bt_hci::uuid::{characteristic, service};
use embassy_sync::blocking_mutex::raw::RawMutex;
use trouble_host::prelude::*;

use crate::aics::{GainChange, GainControl, GainMode, GainSettings, InputState, InputStatus, Mute};
use crate::error::{att_error, Error};
use crate::generic_audio::{AudioInputType, Description, MAX_DESCRIPTION_SIZE};
use crate::server::{
    push_event, AudioControlService, EventContext, EventQueue, ServerEvent, MAX_ATTRIBUTES,
};

/// Attribute slots one instance occupies in the table.
pub const AICS_ATTRIBUTES: usize = 16;
/// Value storage one instance needs: state, gain settings, input type,
/// input status, control point, description.
pub(crate) const AICS_STORAGE: usize = 4 + 3 + 1 + 1 + 3 + MAX_DESCRIPTION_SIZE;

/// Bounded instance pool. Instances are acquired at init time and never
/// reclaimed for the lifetime of the process.
pub struct AicsPool<const N: usize> {
    used: usize,
}

impl<const N: usize> Default for AicsPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> AicsPool<N> {
    pub const fn new() -> Self {
        Self { used: 0 }
    }

    pub fn in_use(&self) -> usize {
        self.used
    }

    pub(crate) fn acquire(&mut self) -> Result<u8, Error> {
        if self.used >= N {
            return Err(Error::NoMemory);
        }
        let index = self.used as u8;
        self.used += 1;
        Ok(index)
    }
}

/// Init-time configuration of one instance.
pub struct AicsConfig<'a> {
    pub gain: i8,
    pub mute: Mute,
    pub mode: GainMode,
    pub settings: GainSettings,
    pub input_type: AudioInputType,
    pub description: &'a str,
    /// Let peers rewrite the description (writes clip, never fail).
    pub description_writable: bool,
}

impl Default for AicsConfig<'_> {
    fn default() -> Self {
        Self {
            gain: 0,
            mute: Mute::Unmuted,
            mode: GainMode::Manual,
            settings: GainSettings::default(),
            input_type: AudioInputType::Local,
            description: "",
            description_writable: false,
        }
    }
}

/// One registered AICS instance.
pub struct AicsServer {
    index: u8,
    control: GainControl,
    description_writable: bool,
    state: Characteristic<InputState>,
    gain_settings: Characteristic<GainSettings>,
    input_type: Characteristic<u8>,
    status: Characteristic<u8>,
    control_point: Characteristic<u8>,
    description: Characteristic<Description>,
    pending: GainChange,
}

impl AicsServer {
    pub(crate) fn new<'a, M: RawMutex>(
        table: &mut AttributeTable<'a, M, MAX_ATTRIBUTES>,
        index: u8,
        config: &AicsConfig<'_>,
        storage: &'a mut [u8],
    ) -> Result<Self, Error> {
        if storage.len() < AICS_STORAGE {
            return Err(Error::NoMemory);
        }
        let mut control = GainControl::new(
            config.gain,
            config.mute,
            config.mode,
            config.settings,
            config.input_type,
        )?;
        control.set_description(config.description);

        let (state_store, storage) = storage.split_at_mut(4);
        let (settings_store, storage) = storage.split_at_mut(3);
        let (type_store, storage) = storage.split_at_mut(1);
        let (status_store, storage) = storage.split_at_mut(1);
        let (cp_store, desc_store) = storage.split_at_mut(3);

        let mut service = table.add_service(Service::new(service::AUDIO_INPUT_CONTROL));

        let state = service
            .add_characteristic(
                characteristic::AUDIO_INPUT_STATE,
                &[CharacteristicProp::Read, CharacteristicProp::Notify],
                control.state(),
                state_store,
            )
            .build();

        let gain_settings = service
            .add_characteristic(
                characteristic::GAIN_SETTINGS_ATTRIBUTE,
                &[CharacteristicProp::Read],
                config.settings,
                settings_store,
            )
            .build();

        let input_type = service
            .add_characteristic(
                characteristic::AUDIO_INPUT_TYPE,
                &[CharacteristicProp::Read],
                config.input_type as u8,
                type_store,
            )
            .build();

        let status = service
            .add_characteristic(
                characteristic::AUDIO_INPUT_STATUS,
                &[CharacteristicProp::Read, CharacteristicProp::Notify],
                control.status() as u8,
                status_store,
            )
            .build();

        let control_point = service
            .add_characteristic(
                characteristic::AUDIO_INPUT_CONTROL_POINT,
                &[CharacteristicProp::Write],
                0u8,
                cp_store,
            )
            .build();

        let mut desc_props = heapless::Vec::<CharacteristicProp, 3>::new();
        let _ = desc_props.push(CharacteristicProp::Read);
        let _ = desc_props.push(CharacteristicProp::Notify);
        if config.description_writable {
            let _ = desc_props.push(CharacteristicProp::WriteWithoutResponse);
        }
        let description = service
            .add_characteristic(
                characteristic::AUDIO_INPUT_DESCRIPTION,
                &desc_props,
                Description::new(config.description),
                desc_store,
            )
            .build();

        service.build();

        Ok(Self {
            index,
            control,
            description_writable: config.description_writable,
            state,
            gain_settings,
            input_type,
            status,
            control_point,
            description,
            pending: GainChange::default(),
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn state(&self) -> InputState {
        self.control.state()
    }

    pub fn settings(&self) -> GainSettings {
        self.control.settings()
    }

    pub fn input_type(&self) -> AudioInputType {
        self.control.input_type()
    }

    pub fn status(&self) -> InputStatus {
        self.control.status()
    }

    pub fn description(&self) -> &str {
        self.control.description()
    }

    pub fn set_gain(&mut self, gain: i8) -> Result<(), Error> {
        let change = self.control.set_gain(gain)?;
        self.pending.merge(change);
        Ok(())
    }

    pub fn mute(&mut self) -> Result<(), Error> {
        let change = self.control.mute()?;
        self.pending.merge(change);
        Ok(())
    }

    pub fn unmute(&mut self) -> Result<(), Error> {
        let change = self.control.unmute()?;
        self.pending.merge(change);
        Ok(())
    }

    pub fn set_manual_mode(&mut self) -> Result<(), Error> {
        let change = self.control.set_manual_mode()?;
        self.pending.merge(change);
        Ok(())
    }

    pub fn set_auto_mode(&mut self) -> Result<(), Error> {
        let change = self.control.set_auto_mode()?;
        self.pending.merge(change);
        Ok(())
    }

    pub fn set_status(&mut self, status: InputStatus) {
        let change = self.control.set_status(status);
        self.pending.merge(change);
    }

    pub fn set_description(&mut self, text: &str) {
        let change = self.control.set_description(text);
        self.pending.merge(change);
    }

    pub(crate) async fn flush<M: RawMutex, const MAX: usize>(
        &mut self,
        server: &AttributeServer<'_, M, MAX>,
        conn: &Connection<'_>,
        events: &mut EventQueue,
    ) {
        let pending = core::mem::take(&mut self.pending);
        if pending.state {
            let state = self.control.state();
            let _ = server.set(&self.state, &state);
            let _ = server.notify(&self.state, conn, &state).await;
            push_event(events, ServerEvent::AicsState(self.index, state));
        }
        if pending.status {
            let status = self.control.status() as u8;
            let _ = server.set(&self.status, &status);
            let _ = server.notify(&self.status, conn, &status).await;
            push_event(events, ServerEvent::AicsStatus(self.index, self.control.status()));
        }
        if pending.description {
            let description = Description::new(self.control.description());
            let _ = server.set(&self.description, &description);
            let _ = server.notify(&self.description, conn, &description).await;
            push_event(events, ServerEvent::AicsDescription(self.index));
        }
    }
}

impl AudioControlService for AicsServer {
    fn handle_read_event(&self, event: &ReadEvent) -> Option<Result<(), AttErrorCode>> {
        if event.handle() == self.state.handle
            || event.handle() == self.gain_settings.handle
            || event.handle() == self.input_type.handle
            || event.handle() == self.status.handle
            || event.handle() == self.description.handle
        {
            return Some(Ok(()));
        }
        if event.handle() == self.control_point.handle {
            return Some(Err(AttErrorCode::READ_NOT_PERMITTED));
        }
        None
    }

    fn handle_write_event(
        &mut self,
        _ctx: &EventContext,
        event: &WriteEvent,
    ) -> Option<Result<(), AttErrorCode>> {
        if event.handle() == self.control_point.handle {
            return Some(match self.control.control_write(event.data(), 0) {
                Ok(change) => {
                    self.pending.merge(change);
                    Ok(())
                }
                Err(reject) => Err(att_error(reject.as_att())),
            });
        }
        if event.handle() == self.description.handle {
            if !self.description_writable {
                return Some(Err(AttErrorCode::WRITE_NOT_PERMITTED));
            }
            return Some(match self.control.description_write(event.data()) {
                Ok(change) => {
                    self.pending.merge(change);
                    Ok(())
                }
                Err(code) => Err(att_error(code)),
            });
        }
        if event.handle() == self.state.handle
            || event.handle() == self.gain_settings.handle
            || event.handle() == self.input_type.handle
            || event.handle() == self.status.handle
        {
            return Some(Err(AttErrorCode::WRITE_NOT_PERMITTED));
        }
        None
    }
}
