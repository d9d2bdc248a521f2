//! VCS GATT server glue.
//!
//! The primary service owns its included VOCS and AICS instances: init
//! pulls one free instance from each pool per requested include,
//! registers the secondary service tables first and the VCS table after
//! them, and dispatches events to whichever instance claims the handle.

use bt_hci::uuid::{characteristic, service};
use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Vec;
use trouble_host::prelude::*;

use crate::aics::server::{AicsConfig, AicsPool, AicsServer, AICS_STORAGE};
use crate::error::{att_error, Error};
use crate::server::{
    push_event, AudioControlService, EventContext, EventQueue, ServerEvent, MAX_AICS_INSTANCES,
    MAX_ATTRIBUTES, MAX_VOCS_INSTANCES,
};
use crate::vcs::{Mute, VolumeChange, VolumeControl, VolumeFlags, VolumeState};
use crate::vocs::server::{VocsConfig, VocsPool, VocsServer, VOCS_STORAGE};

/// Attribute slots the primary service itself occupies.
pub const VCS_ATTRIBUTES: usize = 10;
/// Value storage the primary service itself needs: state, control
/// point, flags.
pub(crate) const VCS_STORAGE: usize = 3 + 4 + 1;

/// Init-time configuration: initial volume state plus one entry per
/// included secondary service instance.
pub struct VcsConfig<'a> {
    pub volume: u8,
    pub mute: Mute,
    pub step: u8,
    pub vocs: &'a [VocsConfig<'a>],
    pub aics: &'a [AicsConfig<'a>],
}

impl Default for VcsConfig<'_> {
    fn default() -> Self {
        Self {
            volume: 100,
            mute: Mute::Unmuted,
            step: 1,
            vocs: &[],
            aics: &[],
        }
    }
}

/// The registered Volume Control Service with its included instances.
pub struct VcsServer {
    control: VolumeControl,
    state: Characteristic<VolumeState>,
    control_point: Characteristic<u8>,
    flags: Characteristic<VolumeFlags>,
    vocs: Vec<VocsServer, MAX_VOCS_INSTANCES>,
    aics: Vec<AicsServer, MAX_AICS_INSTANCES>,
    pending: VolumeChange,
}

impl VcsServer {
    pub(crate) fn new<'a, M: RawMutex>(
        table: &mut AttributeTable<'a, M, MAX_ATTRIBUTES>,
        config: &VcsConfig<'_>,
        vocs_pool: &mut VocsPool<MAX_VOCS_INSTANCES>,
        aics_pool: &mut AicsPool<MAX_AICS_INSTANCES>,
        mut storage: &'a mut [u8],
    ) -> Result<Self, Error> {
        let needed =
            VCS_STORAGE + config.vocs.len() * VOCS_STORAGE + config.aics.len() * AICS_STORAGE;
        if storage.len() < needed {
            return Err(Error::NoMemory);
        }
        let control = VolumeControl::new(config.volume, config.mute, config.step)?;

        // Secondary services first so the primary can refer to them.
        let mut vocs = Vec::new();
        for instance in config.vocs {
            let index = vocs_pool.acquire()?;
            let (chunk, rest) = storage.split_at_mut(VOCS_STORAGE);
            storage = rest;
            vocs.push(VocsServer::new(table, index, instance, chunk)?)
                .map_err(|_| Error::NoMemory)?;
        }
        let mut aics = Vec::new();
        for instance in config.aics {
            let index = aics_pool.acquire()?;
            let (chunk, rest) = storage.split_at_mut(AICS_STORAGE);
            storage = rest;
            aics.push(AicsServer::new(table, index, instance, chunk)?)
                .map_err(|_| Error::NoMemory)?;
        }

        let (state_store, storage) = storage.split_at_mut(3);
        let (cp_store, flags_store) = storage.split_at_mut(4);

        let mut service = table.add_service(Service::new(service::VOLUME_CONTROL));

        let state = service
            .add_characteristic(
                characteristic::VOLUME_STATE,
                &[CharacteristicProp::Read, CharacteristicProp::Notify],
                control.state(),
                state_store,
            )
            .build();

        let control_point = service
            .add_characteristic(
                characteristic::VOLUME_CONTROL_POINT,
                &[CharacteristicProp::Write],
                0u8,
                cp_store,
            )
            .build();

        let flags = service
            .add_characteristic(
                characteristic::VOLUME_FLAGS,
                &[CharacteristicProp::Read, CharacteristicProp::Notify],
                control.flags(),
                flags_store,
            )
            .build();

        service.build();

        Ok(Self {
            control,
            state,
            control_point,
            flags,
            vocs,
            aics,
            pending: VolumeChange::default(),
        })
    }

    pub fn state(&self) -> VolumeState {
        self.control.state()
    }

    pub fn flags(&self) -> VolumeFlags {
        self.control.flags()
    }

    pub fn vocs_count(&self) -> usize {
        self.vocs.len()
    }

    pub fn aics_count(&self) -> usize {
        self.aics.len()
    }

    pub fn vocs(&self, index: usize) -> Option<&VocsServer> {
        self.vocs.get(index)
    }

    pub fn vocs_mut(&mut self, index: usize) -> Option<&mut VocsServer> {
        self.vocs.get_mut(index)
    }

    pub fn aics(&self, index: usize) -> Option<&AicsServer> {
        self.aics.get(index)
    }

    pub fn aics_mut(&mut self, index: usize) -> Option<&mut AicsServer> {
        self.aics.get_mut(index)
    }

    pub fn volume_up(&mut self) -> Result<(), Error> {
        let change = self.control.volume_up()?;
        self.pending.merge(change);
        Ok(())
    }

    pub fn volume_down(&mut self) -> Result<(), Error> {
        let change = self.control.volume_down()?;
        self.pending.merge(change);
        Ok(())
    }

    pub fn unmute_volume_up(&mut self) -> Result<(), Error> {
        let change = self.control.unmute_volume_up()?;
        self.pending.merge(change);
        Ok(())
    }

    pub fn unmute_volume_down(&mut self) -> Result<(), Error> {
        let change = self.control.unmute_volume_down()?;
        self.pending.merge(change);
        Ok(())
    }

    pub fn set_volume(&mut self, volume: u8) -> Result<(), Error> {
        let change = self.control.set_volume(volume)?;
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

    pub fn set_step(&mut self, step: u8) -> Result<(), Error> {
        self.control.set_step(step)
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
            push_event(events, ServerEvent::Volume(state));
        }
        if pending.flags {
            let flags = self.control.flags();
            let _ = server.set(&self.flags, &flags);
            let _ = server.notify(&self.flags, conn, &flags).await;
            push_event(events, ServerEvent::VolumeFlags(flags));
        }
        for vocs in self.vocs.iter_mut() {
            vocs.flush(server, conn, events).await;
        }
        for aics in self.aics.iter_mut() {
            aics.flush(server, conn, events).await;
        }
    }
}

impl AudioControlService for VcsServer {
    fn handle_read_event(&self, event: &ReadEvent) -> Option<Result<(), AttErrorCode>> {
        if event.handle() == self.state.handle || event.handle() == self.flags.handle {
            return Some(Ok(()));
        }
        if event.handle() == self.control_point.handle {
            return Some(Err(AttErrorCode::READ_NOT_PERMITTED));
        }
        for vocs in self.vocs.iter() {
            if let Some(res) = vocs.handle_read_event(event) {
                return Some(res);
            }
        }
        for aics in self.aics.iter() {
            if let Some(res) = aics.handle_read_event(event) {
                return Some(res);
            }
        }
        None
    }

    fn handle_write_event(
        &mut self,
        ctx: &EventContext,
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
        if event.handle() == self.state.handle || event.handle() == self.flags.handle {
            return Some(Err(AttErrorCode::WRITE_NOT_PERMITTED));
        }
        for vocs in self.vocs.iter_mut() {
            if let Some(res) = vocs.handle_write_event(ctx, event) {
                return Some(res);
            }
        }
        for aics in self.aics.iter_mut() {
            if let Some(res) = aics.handle_write_event(ctx, event) {
                return Some(res);
            }
        }
        None
    }
}
