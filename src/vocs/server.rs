//! VOCS GATT server glue: attribute registration, handle dispatch and
//! notification flush for a pool of instances.

use bt_hci::uuid::{characteristic, service};
use embassy_sync::blocking_mutex::raw::RawMutex;
use trouble_host::prelude::*;

use crate::error::{att_error, Error};
use crate::generic_audio::{AudioLocation, Description, MAX_DESCRIPTION_SIZE};
use crate::server::{
    push_event, AudioControlService, EventContext, EventQueue, ServerEvent, MAX_ATTRIBUTES,
};
use crate::vocs::{OffsetChange, OffsetControl, OffsetState};

/// Attribute slots one instance occupies in the table.
pub const VOCS_ATTRIBUTES: usize = 12;
/// Value storage one instance needs: state, location, control point,
/// description.
pub(crate) const VOCS_STORAGE: usize = 3 + 1 + 4 + MAX_DESCRIPTION_SIZE;

/// Bounded instance pool. Instances are acquired at init time and never
/// reclaimed for the lifetime of the process.
pub struct VocsPool<const N: usize> {
    used: usize,
}

impl<const N: usize> Default for VocsPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> VocsPool<N> {
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
pub struct VocsConfig<'a> {
    pub offset: i16,
    pub location: AudioLocation,
    /// Let peers rewrite the audio location.
    pub location_writable: bool,
    pub description: &'a str,
    /// Let peers rewrite the description (writes clip, never fail).
    pub description_writable: bool,
}

impl Default for VocsConfig<'_> {
    fn default() -> Self {
        Self {
            offset: 0,
            location: AudioLocation::empty(),
            location_writable: false,
            description: "",
            description_writable: false,
        }
    }
}

/// One registered VOCS instance.
pub struct VocsServer {
    index: u8,
    control: OffsetControl,
    location_writable: bool,
    description_writable: bool,
    state: Characteristic<OffsetState>,
    location: Characteristic<AudioLocation>,
    control_point: Characteristic<u8>,
    description: Characteristic<Description>,
    pending: OffsetChange,
}

impl VocsServer {
    pub(crate) fn new<'a, M: RawMutex>(
        table: &mut AttributeTable<'a, M, MAX_ATTRIBUTES>,
        index: u8,
        config: &VocsConfig<'_>,
        storage: &'a mut [u8],
    ) -> Result<Self, Error> {
        if storage.len() < VOCS_STORAGE {
            return Err(Error::NoMemory);
        }
        let mut control = OffsetControl::new(config.offset, config.location)?;
        control.set_description(config.description);

        let (state_store, storage) = storage.split_at_mut(3);
        let (location_store, storage) = storage.split_at_mut(1);
        let (cp_store, desc_store) = storage.split_at_mut(4);

        let mut service = table.add_service(Service::new(service::VOLUME_OFFSET_CONTROL));

        let state = service
            .add_characteristic(
                characteristic::VOLUME_OFFSET_STATE,
                &[CharacteristicProp::Read, CharacteristicProp::Notify],
                control.state(),
                state_store,
            )
            .build();

        let mut location_props = heapless::Vec::<CharacteristicProp, 3>::new();
        let _ = location_props.push(CharacteristicProp::Read);
        let _ = location_props.push(CharacteristicProp::Notify);
        if config.location_writable {
            let _ = location_props.push(CharacteristicProp::Write);
        }
        let location = service
            .add_characteristic(
                characteristic::AUDIO_LOCATION,
                &location_props,
                control.location(),
                location_store,
            )
            .build();

        let control_point = service
            .add_characteristic(
                characteristic::VOLUME_OFFSET_CONTROL_POINT,
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
                characteristic::AUDIO_OUTPUT_DESCRIPTION,
                &desc_props,
                Description::new(config.description),
                desc_store,
            )
            .build();

        service.build();

        Ok(Self {
            index,
            control,
            location_writable: config.location_writable,
            description_writable: config.description_writable,
            state,
            location,
            control_point,
            description,
            pending: OffsetChange::default(),
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn state(&self) -> OffsetState {
        self.control.state()
    }

    pub fn location(&self) -> AudioLocation {
        self.control.location()
    }

    pub fn description(&self) -> &str {
        self.control.description()
    }

    pub fn set_offset(&mut self, offset: i16) -> Result<(), Error> {
        let change = self.control.set_offset(offset)?;
        self.pending.merge(change);
        Ok(())
    }

    pub fn set_location(&mut self, location: AudioLocation) {
        let change = self.control.set_location(location);
        self.pending.merge(change);
    }

    pub fn set_description(&mut self, text: &str) {
        let change = self.control.set_description(text);
        self.pending.merge(change);
    }

    /// Pushes committed values into the attribute table and notifies the
    /// peer whose transaction triggered them.
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
            push_event(events, ServerEvent::VocsOffset(self.index, state));
        }
        if pending.location {
            let location = self.control.location();
            let _ = server.set(&self.location, &location);
            let _ = server.notify(&self.location, conn, &location).await;
            push_event(events, ServerEvent::VocsLocation(self.index, location));
        }
        if pending.description {
            let description = Description::new(self.control.description());
            let _ = server.set(&self.description, &description);
            let _ = server.notify(&self.description, conn, &description).await;
            push_event(events, ServerEvent::VocsDescription(self.index));
        }
    }
}

impl AudioControlService for VocsServer {
    fn handle_read_event(&self, event: &ReadEvent) -> Option<Result<(), AttErrorCode>> {
        if event.handle() == self.state.handle
            || event.handle() == self.location.handle
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
        if event.handle() == self.location.handle {
            if !self.location_writable {
                return Some(Err(AttErrorCode::WRITE_NOT_PERMITTED));
            }
            return Some(match self.control.location_write(event.data()) {
                Ok(change) => {
                    self.pending.merge(change);
                    Ok(())
                }
                Err(code) => Err(att_error(code)),
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
        None
    }
}
