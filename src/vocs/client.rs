//! VOCS GATT client: a per-instance mirror of the remote state with
//! subscription dispatch and counter-aware control-point writes.

use bt_hci::uuid::characteristic;
use heapless::String;
use trouble_host::{prelude::*, types::gatt_traits::*, BleHostError, Controller};

use crate::client::{run_control_write, ControlMirror};
use crate::control_point::WriteTransaction;
use crate::error::Error;
use crate::generic_audio::{AudioLocation, RawBytes, MAX_DESCRIPTION_SIZE};
use crate::vocs::{OffsetOpcode, OffsetState, OFFSET_MAX, OFFSET_MIN};

/// Value handles of one remote instance.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy)]
pub struct VocsHandles {
    pub state: u16,
    pub location: u16,
    pub control: u16,
    pub description: u16,
}

/// An observed change on the remote instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocsEvent {
    State(OffsetState),
    Location(AudioLocation),
    Description,
}

/// Cached view of a remote VOCS instance plus the single outstanding
/// control-point transaction.
pub struct VocsMirror {
    handles: VocsHandles,
    state: Option<OffsetState>,
    location: Option<AudioLocation>,
    description: String<MAX_DESCRIPTION_SIZE>,
    pub(crate) tx: WriteTransaction<4>,
}

impl VocsMirror {
    pub fn new(handles: VocsHandles) -> Self {
        Self {
            handles,
            state: None,
            location: None,
            description: String::new(),
            tx: WriteTransaction::new(),
        }
    }

    pub fn handles(&self) -> &VocsHandles {
        &self.handles
    }

    pub fn state(&self) -> Option<OffsetState> {
        self.state
    }

    pub fn location(&self) -> Option<AudioLocation> {
        self.location
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_busy(&self) -> bool {
        self.tx.is_busy()
    }

    /// Last change counter seen from the peer.
    pub(crate) fn counter(&self) -> u8 {
        self.state.map(|s| s.change_counter).unwrap_or_default()
    }

    pub(crate) fn update_state(&mut self, state: OffsetState) {
        self.state = Some(state);
    }

    /// Dispatches a notification by value handle. Payloads whose length
    /// does not match the characteristic are dropped; descriptions are
    /// clipped into the local bound.
    pub fn on_notification(&mut self, handle: u16, data: &[u8]) -> Option<VocsEvent> {
        if handle == self.handles.state {
            let state = OffsetState::from_gatt(data).ok()?;
            self.state = Some(state);
            return Some(VocsEvent::State(state));
        }
        if handle == self.handles.location {
            let location = AudioLocation::from_gatt(data).ok()?;
            self.location = Some(location);
            return Some(VocsEvent::Location(location));
        }
        if handle == self.handles.description {
            let text = core::str::from_utf8(data).ok()?;
            self.description = crate::vocs::clip_description(text);
            return Some(VocsEvent::Description);
        }
        None
    }
}

impl ControlMirror<4> for VocsMirror {
    fn transaction(&mut self) -> &mut WriteTransaction<4> {
        &mut self.tx
    }

    fn absorb_state(&mut self, data: &[u8]) -> Option<u8> {
        let state = OffsetState::from_gatt(data).ok()?;
        self.state = Some(state);
        Some(state.change_counter)
    }
}

/// A connected remote VOCS instance.
pub struct VocsClient {
    pub(crate) mirror: VocsMirror,
    state: Characteristic<OffsetState>,
    location: Characteristic<AudioLocation>,
    control: Characteristic<RawBytes<4>>,
    description: Characteristic<RawBytes<MAX_DESCRIPTION_SIZE>>,
}

impl VocsClient {
    /// Resolves the instance's characteristics inside an already
    /// discovered service.
    pub async fn discover<'a, C: Controller, const MAX: usize, const MTU: usize>(
        client: &GattClient<'a, C, MAX, MTU>,
        service: &ServiceHandle,
    ) -> Result<Self, Error> {
        let state: Characteristic<OffsetState> = client
            .characteristic_by_uuid(service, &Uuid::from(characteristic::VOLUME_OFFSET_STATE))
            .await
            .map_err(|_| Error::NotSupported)?;
        let location: Characteristic<AudioLocation> = client
            .characteristic_by_uuid(service, &Uuid::from(characteristic::AUDIO_LOCATION))
            .await
            .map_err(|_| Error::NotSupported)?;
        let control: Characteristic<RawBytes<4>> = client
            .characteristic_by_uuid(
                service,
                &Uuid::from(characteristic::VOLUME_OFFSET_CONTROL_POINT),
            )
            .await
            .map_err(|_| Error::NotSupported)?;
        let description: Characteristic<RawBytes<MAX_DESCRIPTION_SIZE>> = client
            .characteristic_by_uuid(
                service,
                &Uuid::from(characteristic::AUDIO_OUTPUT_DESCRIPTION),
            )
            .await
            .map_err(|_| Error::NotSupported)?;

        let handles = VocsHandles {
            state: state.handle,
            location: location.handle,
            control: control.handle,
            description: description.handle,
        };
        Ok(Self {
            mirror: VocsMirror::new(handles),
            state,
            location,
            control,
            description,
        })
    }

    pub fn mirror(&self) -> &VocsMirror {
        &self.mirror
    }

    /// Feeds a notification into the mirror.
    pub fn on_notification(&mut self, handle: u16, data: &[u8]) -> Option<VocsEvent> {
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
            client.subscribe(&self.location, false).await?,
            client.subscribe(&self.description, false).await?,
        ])
    }

    /// Reads the remote state into the mirror.
    pub async fn read_state<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<OffsetState, Error> {
        let mut data = [0u8; 3];
        client
            .read_characteristic(&self.state, &mut data)
            .await
            .map_err(|_| Error::NotConnected)?;
        let state = OffsetState::from_gatt(&data).map_err(|_| Error::InvalidParam)?;
        self.mirror.update_state(state);
        Ok(state)
    }

    /// Writes the offset through the control point. A change-counter
    /// collision re-reads the state and retries once, transparently.
    pub async fn set_offset<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
        offset: i16,
    ) -> Result<(), Error> {
        if !(OFFSET_MIN..=OFFSET_MAX).contains(&offset) {
            return Err(Error::InvalidParam);
        }
        let le = offset.to_le_bytes();
        let operand = [le[0], le[1]];
        let pdu = RawBytes::<4>::from_slice(self.mirror.tx.begin(
            OffsetOpcode::SetOffset as u8,
            self.mirror.counter(),
            &operand,
        )?);
        run_control_write(client, &self.control, &self.state, &mut self.mirror, pdu).await
    }
}
