//! AICS GATT client: a per-instance mirror of the remote input state
//! with subscription dispatch and counter-aware control-point writes.

use bt_hci::uuid::characteristic;
use heapless::String;
use trouble_host::{prelude::*, types::gatt_traits::*, BleHostError, Controller};

use crate::aics::{GainOpcode, GainSettings, InputState};
use crate::client::{run_control_write, ControlMirror};
use crate::control_point::WriteTransaction;
use crate::error::Error;
use crate::generic_audio::{AudioInputType, RawBytes, MAX_DESCRIPTION_SIZE};

/// Value handles of one remote instance.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy)]
pub struct AicsHandles {
    pub state: u16,
    pub gain_settings: u16,
    pub input_type: u16,
    pub status: u16,
    pub control: u16,
    pub description: u16,
}

/// An observed change on the remote instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AicsEvent {
    State(InputState),
    Status(u8),
    Description,
}

/// Cached view of a remote AICS instance plus the single outstanding
/// control-point transaction.
pub struct AicsMirror {
    handles: AicsHandles,
    state: Option<InputState>,
    settings: Option<GainSettings>,
    input_type: Option<AudioInputType>,
    status: Option<u8>,
    description: String<MAX_DESCRIPTION_SIZE>,
    pub(crate) tx: WriteTransaction<3>,
}

impl AicsMirror {
    pub fn new(handles: AicsHandles) -> Self {
        Self {
            handles,
            state: None,
            settings: None,
            input_type: None,
            status: None,
            description: String::new(),
            tx: WriteTransaction::new(),
        }
    }

    pub fn handles(&self) -> &AicsHandles {
        &self.handles
    }

    pub fn state(&self) -> Option<InputState> {
        self.state
    }

    pub fn settings(&self) -> Option<GainSettings> {
        self.settings
    }

    pub fn input_type(&self) -> Option<AudioInputType> {
        self.input_type
    }

    pub fn status(&self) -> Option<u8> {
        self.status
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_busy(&self) -> bool {
        self.tx.is_busy()
    }

    pub(crate) fn counter(&self) -> u8 {
        self.state.map(|s| s.change_counter).unwrap_or_default()
    }

    pub(crate) fn update_settings(&mut self, settings: GainSettings) {
        self.settings = Some(settings);
    }

    pub(crate) fn update_input_type(&mut self, input_type: AudioInputType) {
        self.input_type = Some(input_type);
    }

    /// Dispatches a notification by value handle; payloads whose length
    /// does not match the characteristic are dropped.
    pub fn on_notification(&mut self, handle: u16, data: &[u8]) -> Option<AicsEvent> {
        if handle == self.handles.state {
            let state = InputState::from_gatt(data).ok()?;
            self.state = Some(state);
            return Some(AicsEvent::State(state));
        }
        if handle == self.handles.status {
            if data.len() != 1 {
                return None;
            }
            self.status = Some(data[0]);
            return Some(AicsEvent::Status(data[0]));
        }
        if handle == self.handles.description {
            let text = core::str::from_utf8(data).ok()?;
            self.description = crate::vocs::clip_description(text);
            return Some(AicsEvent::Description);
        }
        None
    }
}

impl ControlMirror<3> for AicsMirror {
    fn transaction(&mut self) -> &mut WriteTransaction<3> {
        &mut self.tx
    }

    fn absorb_state(&mut self, data: &[u8]) -> Option<u8> {
        let state = InputState::from_gatt(data).ok()?;
        self.state = Some(state);
        Some(state.change_counter)
    }
}

/// A connected remote AICS instance.
pub struct AicsClient {
    pub(crate) mirror: AicsMirror,
    state: Characteristic<InputState>,
    gain_settings: Characteristic<GainSettings>,
    input_type: Characteristic<u8>,
    status: Characteristic<u8>,
    control: Characteristic<RawBytes<3>>,
    description: Characteristic<RawBytes<MAX_DESCRIPTION_SIZE>>,
}

impl AicsClient {
    /// Resolves the instance's characteristics inside an already
    /// discovered service.
    pub async fn discover<'a, C: Controller, const MAX: usize, const MTU: usize>(
        client: &GattClient<'a, C, MAX, MTU>,
        service: &ServiceHandle,
    ) -> Result<Self, Error> {
        let state: Characteristic<InputState> = client
            .characteristic_by_uuid(service, &Uuid::from(characteristic::AUDIO_INPUT_STATE))
            .await
            .map_err(|_| Error::NotSupported)?;
        let gain_settings: Characteristic<GainSettings> = client
            .characteristic_by_uuid(service, &Uuid::from(characteristic::GAIN_SETTINGS_ATTRIBUTE))
            .await
            .map_err(|_| Error::NotSupported)?;
        let input_type: Characteristic<u8> = client
            .characteristic_by_uuid(service, &Uuid::from(characteristic::AUDIO_INPUT_TYPE))
            .await
            .map_err(|_| Error::NotSupported)?;
        let status: Characteristic<u8> = client
            .characteristic_by_uuid(service, &Uuid::from(characteristic::AUDIO_INPUT_STATUS))
            .await
            .map_err(|_| Error::NotSupported)?;
        let control: Characteristic<RawBytes<3>> = client
            .characteristic_by_uuid(
                service,
                &Uuid::from(characteristic::AUDIO_INPUT_CONTROL_POINT),
            )
            .await
            .map_err(|_| Error::NotSupported)?;
        let description: Characteristic<RawBytes<MAX_DESCRIPTION_SIZE>> = client
            .characteristic_by_uuid(
                service,
                &Uuid::from(characteristic::AUDIO_INPUT_DESCRIPTION),
            )
            .await
            .map_err(|_| Error::NotSupported)?;

        let handles = AicsHandles {
            state: state.handle,
            gain_settings: gain_settings.handle,
            input_type: input_type.handle,
            status: status.handle,
            control: control.handle,
            description: description.handle,
        };
        Ok(Self {
            mirror: AicsMirror::new(handles),
            state,
            gain_settings,
            input_type,
            status,
            control,
            description,
        })
    }

    pub fn mirror(&self) -> &AicsMirror {
        &self.mirror
    }

    /// Feeds a notification into the mirror.
    pub fn on_notification(&mut self, handle: u16, data: &[u8]) -> Option<AicsEvent> {
        self.mirror.on_notification(handle, data)
    }

    /// Subscribes to every notifying characteristic of the instance.
    /// The listeners must be polled by the caller's task.
    pub async fn subscribe<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &self,
        client: &'a GattClient<'a, C, MAX, MTU>,
    ) -> Result<
        [trouble_host::gatt::NotificationListener<'a, MTU>; 3],
        BleHostError<C::Error>,
    > {
        Ok([
            client.subscribe(&self.state, false).await?,
            client.subscribe(&self.status, false).await?,
            client.subscribe(&self.description, false).await?,
        ])
    }

    /// Reads the remote input state into the mirror.
    pub async fn read_state<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<InputState, Error> {
        let mut data = [0u8; 4];
        client
            .read_characteristic(&self.state, &mut data)
            .await
            .map_err(|_| Error::NotConnected)?;
        let state = InputState::from_gatt(&data).map_err(|_| Error::InvalidParam)?;
        self.mirror.absorb_state(&data);
        Ok(state)
    }

    /// Reads the immutable gain settings into the mirror.
    pub async fn read_gain_settings<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<GainSettings, Error> {
        let mut data = [0u8; 3];
        client
            .read_characteristic(&self.gain_settings, &mut data)
            .await
            .map_err(|_| Error::NotConnected)?;
        let settings = GainSettings::from_gatt(&data).map_err(|_| Error::InvalidParam)?;
        self.mirror.update_settings(settings);
        Ok(settings)
    }

    /// Reads the immutable input type into the mirror.
    pub async fn read_input_type<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<AudioInputType, Error> {
        let mut data = [0u8; 1];
        client
            .read_characteristic(&self.input_type, &mut data)
            .await
            .map_err(|_| Error::NotConnected)?;
        let input_type = AudioInputType::from_raw(data[0]).ok_or(Error::InvalidParam)?;
        self.mirror.update_input_type(input_type);
        Ok(input_type)
    }

    async fn control_write<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
        opcode: GainOpcode,
        operand: &[u8],
    ) -> Result<(), Error> {
        let pdu = RawBytes::<3>::from_slice(self.mirror.tx.begin(
            opcode as u8,
            self.mirror.counter(),
            operand,
        )?);
        run_control_write(client, &self.control, &self.state, &mut self.mirror, pdu).await
    }

    /// Sets the remote gain, retrying once on a counter collision.
    pub async fn set_gain<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
        gain: i8,
    ) -> Result<(), Error> {
        self.control_write(client, GainOpcode::SetGain, &[gain as u8])
            .await
    }

    pub async fn mute<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<(), Error> {
        self.control_write(client, GainOpcode::Mute, &[]).await
    }

    pub async fn unmute<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<(), Error> {
        self.control_write(client, GainOpcode::Unmute, &[]).await
    }

    pub async fn set_manual_mode<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<(), Error> {
        self.control_write(client, GainOpcode::SetManualMode, &[])
            .await
    }

    pub async fn set_auto_mode<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<(), Error> {
        self.control_write(client, GainOpcode::SetAutoMode, &[])
            .await
    }
}
