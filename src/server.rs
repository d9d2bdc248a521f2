//! Composite GATT server for the audio control services.
//!
//! One attribute table carries GAP/GATT plus whichever of VCS (with its
//! included VOCS/AICS instances), CSIS and ASCS the builder was given.
//! Events are dispatched by attribute handle to the service that owns
//! it; committed changes are flushed as notifications after the write
//! response.

#[cfg(feature = "defmt")]
use defmt::*;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Instant;
use trouble_host::{
    gatt::{GattData, GattEvent, ReadEvent, WriteEvent},
    prelude::*,
};

use heapless::Deque;

use crate::aics::server::{AicsPool, AICS_ATTRIBUTES, AICS_STORAGE};
use crate::aics::{InputState, InputStatus};
use crate::ascs::server::{AscsConfig, AscsServer, ASCS_ATTRIBUTES, ASCS_STORAGE};
use crate::csis::server::{CsisConfig, CsisServer, CSIS_ATTRIBUTES, CSIS_STORAGE};
use crate::csis::{LockUpdate, SetLock};
use crate::error::Error;
use crate::generic_audio::AudioLocation;
use crate::vcs::server::{VcsConfig, VcsServer, VCS_ATTRIBUTES, VCS_STORAGE};
use crate::vcs::{VolumeFlags, VolumeState};
use crate::vocs::server::{VocsPool, VOCS_ATTRIBUTES, VOCS_STORAGE};
use crate::vocs::OffsetState;

/// VOCS instances available to the include pool.
pub const MAX_VOCS_INSTANCES: usize = 2;
/// AICS instances available to the include pool.
pub const MAX_AICS_INSTANCES: usize = 2;
/// ASEs in the stream endpoint bank.
pub const MAX_ASES: usize = 4;
/// Bonded peers tracked for set-lock notifications.
pub const MAX_BONDED_PEERS: usize = 4;

pub const MAX_ATTRIBUTES: usize = 4 // GAP + GATT
    + VCS_ATTRIBUTES
    + MAX_VOCS_INSTANCES * VOCS_ATTRIBUTES
    + MAX_AICS_INSTANCES * AICS_ATTRIBUTES
    + CSIS_ATTRIBUTES
    + ASCS_ATTRIBUTES;

/// Value storage the full server needs.
pub const SERVER_STORAGE: usize = VCS_STORAGE
    + MAX_VOCS_INSTANCES * VOCS_STORAGE
    + MAX_AICS_INSTANCES * AICS_STORAGE
    + CSIS_STORAGE
    + ASCS_STORAGE;

pub const MAX_EVENTS: usize = 16;

/// Observed changes the server queues for the application, one per
/// committed change (GATT writes and local calls alike). Drain with
/// [`Server::take_event`] after `process`/`flush`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerEvent {
    Volume(VolumeState),
    VolumeFlags(VolumeFlags),
    VocsOffset(u8, OffsetState),
    VocsLocation(u8, AudioLocation),
    VocsDescription(u8),
    AicsState(u8, InputState),
    AicsStatus(u8, InputStatus),
    AicsDescription(u8),
    Lock(SetLock),
    /// ASE id and its new state value.
    AseState(u8, u8),
}

pub(crate) type EventQueue = Deque<ServerEvent, MAX_EVENTS>;

pub(crate) fn push_event(events: &mut EventQueue, event: ServerEvent) {
    if events.is_full() {
        let _ = events.pop_front();
    }
    let _ = events.push_back(event);
}

/// Connection-scoped context handed to write handlers.
pub struct EventContext {
    pub peer: BdAddr,
    pub now_ms: u64,
}

pub trait AudioControlService {
    fn handle_read_event(&self, event: &ReadEvent) -> Option<Result<(), AttErrorCode>>;
    fn handle_write_event(
        &mut self,
        ctx: &EventContext,
        event: &WriteEvent,
    ) -> Option<Result<(), AttErrorCode>>;
}

pub struct ServerBuilder<'a, M: RawMutex> {
    table: AttributeTable<'a, M, MAX_ATTRIBUTES>,
    storage: &'a mut [u8],
    vocs_pool: VocsPool<MAX_VOCS_INSTANCES>,
    aics_pool: AicsPool<MAX_AICS_INSTANCES>,
    vcs: Option<VcsServer>,
    csis: Option<CsisServer<MAX_BONDED_PEERS>>,
    ascs: Option<AscsServer>,
}

impl<'a, M: RawMutex> ServerBuilder<'a, M> {
    pub fn new(
        name_id: &'a impl AsGatt,
        appearance: &'a impl AsGatt,
        storage: &'a mut [u8],
    ) -> Self {
        let mut table: AttributeTable<'_, M, MAX_ATTRIBUTES> = AttributeTable::new();
        let mut svc = table.add_service(Service::new(0x1800u16));
        let _ = svc.add_characteristic_ro(0x2a00u16, name_id);
        let _ = svc.add_characteristic_ro(0x2a01u16, appearance);
        svc.build();

        // Generic attribute service (mandatory)
        table.add_service(Service::new(0x1801u16));

        Self {
            table,
            storage,
            vocs_pool: VocsPool::new(),
            aics_pool: AicsPool::new(),
            vcs: None,
            csis: None,
            ascs: None,
        }
    }

    fn carve(&mut self, len: usize) -> Result<&'a mut [u8], Error> {
        if self.storage.len() < len {
            return Err(Error::NoMemory);
        }
        let storage = core::mem::take(&mut self.storage);
        let (chunk, rest) = storage.split_at_mut(len);
        self.storage = rest;
        Ok(chunk)
    }

    pub fn add_vcs(mut self, config: &VcsConfig<'_>) -> Result<Self, Error> {
        if self.vcs.is_some() {
            return Err(Error::Already);
        }
        let len =
            VCS_STORAGE + config.vocs.len() * VOCS_STORAGE + config.aics.len() * AICS_STORAGE;
        let chunk = self.carve(len)?;
        let vcs = VcsServer::new(
            &mut self.table,
            config,
            &mut self.vocs_pool,
            &mut self.aics_pool,
            chunk,
        )?;
        self.vcs = Some(vcs);
        Ok(self)
    }

    pub fn add_csis(mut self, config: CsisConfig) -> Result<Self, Error> {
        if self.csis.is_some() {
            return Err(Error::Already);
        }
        let chunk = self.carve(CSIS_STORAGE)?;
        self.csis = Some(CsisServer::new(&mut self.table, config, chunk)?);
        Ok(self)
    }

    pub fn add_ascs(mut self, config: &AscsConfig<'_>) -> Result<Self, Error> {
        if self.ascs.is_some() {
            return Err(Error::Already);
        }
        let chunk = self.carve(ASCS_STORAGE)?;
        self.ascs = Some(AscsServer::new(&mut self.table, config, chunk)?);
        Ok(self)
    }

    pub fn build(self) -> Server<'a, M> {
        Server {
            server: AttributeServer::<M, MAX_ATTRIBUTES>::new(self.table),
            vcs: self.vcs,
            csis: self.csis,
            ascs: self.ascs,
            events: EventQueue::new(),
        }
    }
}

pub struct Server<'a, M: RawMutex> {
    server: AttributeServer<'a, M, MAX_ATTRIBUTES>,
    vcs: Option<VcsServer>,
    csis: Option<CsisServer<MAX_BONDED_PEERS>>,
    ascs: Option<AscsServer>,
    events: EventQueue,
}

impl<M: RawMutex> Server<'_, M> {
    pub fn vcs(&self) -> Option<&VcsServer> {
        self.vcs.as_ref()
    }

    pub fn vcs_mut(&mut self) -> Option<&mut VcsServer> {
        self.vcs.as_mut()
    }

    pub fn csis(&self) -> Option<&CsisServer<MAX_BONDED_PEERS>> {
        self.csis.as_ref()
    }

    pub fn csis_mut(&mut self) -> Option<&mut CsisServer<MAX_BONDED_PEERS>> {
        self.csis.as_mut()
    }

    pub fn ascs(&self) -> Option<&AscsServer> {
        self.ascs.as_ref()
    }

    pub fn ascs_mut(&mut self) -> Option<&mut AscsServer> {
        self.ascs.as_mut()
    }

    pub async fn process(&mut self, gatt_data: GattData<'_>, conn: &Connection<'_>) {
        match gatt_data.process(&self.server).await {
            Ok(data) => {
                if let Some(event) = data {
                    let ctx = EventContext {
                        peer: conn.peer_address(),
                        now_ms: Instant::now().as_millis(),
                    };
                    if let Some(resp) = match event {
                        GattEvent::Read(ref event) => {
                            Self::handle_read(&self.vcs, &self.csis, &self.ascs, event)
                        }
                        GattEvent::Write(ref event) => Self::handle_write(
                            &mut self.vcs,
                            &mut self.csis,
                            &mut self.ascs,
                            &ctx,
                            event,
                        ),
                    } {
                        if let Err(err) = resp {
                            event.reject(err).unwrap().send().await
                        } else {
                            event.accept().unwrap().send().await
                        };
                    } else {
                        #[cfg(feature = "defmt")]
                        warn!("[audio control] no handler claimed this event");
                        event
                            .reject(AttErrorCode::INVALID_HANDLE)
                            .unwrap()
                            .send()
                            .await;
                    }
                    self.flush(conn).await;
                }
            }
            Err(e) => {
                #[cfg(feature = "defmt")]
                warn!("[audio control] error processing event: {:?}", e);
            }
        }
    }

    fn handle_read(
        vcs: &Option<VcsServer>,
        csis: &Option<CsisServer<MAX_BONDED_PEERS>>,
        ascs: &Option<AscsServer>,
        event: &ReadEvent,
    ) -> Option<Result<(), AttErrorCode>> {
        if let Some(res) = vcs.as_ref().and_then(|s| s.handle_read_event(event)) {
            return Some(res);
        }
        if let Some(res) = csis.as_ref().and_then(|s| s.handle_read_event(event)) {
            return Some(res);
        }
        ascs.as_ref().and_then(|s| s.handle_read_event(event))
    }

    fn handle_write(
        vcs: &mut Option<VcsServer>,
        csis: &mut Option<CsisServer<MAX_BONDED_PEERS>>,
        ascs: &mut Option<AscsServer>,
        ctx: &EventContext,
        event: &WriteEvent,
    ) -> Option<Result<(), AttErrorCode>> {
        if let Some(res) = vcs.as_mut().and_then(|s| s.handle_write_event(ctx, event)) {
            return Some(res);
        }
        if let Some(res) = csis.as_mut().and_then(|s| s.handle_write_event(ctx, event)) {
            return Some(res);
        }
        ascs.as_mut().and_then(|s| s.handle_write_event(ctx, event))
    }

    /// Sends the notifications of every committed change to one
    /// connection. `process` runs this after the write response; call
    /// it directly after local (application) state changes.
    pub async fn flush(&mut self, conn: &Connection<'_>) {
        let peer = conn.peer_address();
        if let Some(vcs) = self.vcs.as_mut() {
            vcs.flush(&self.server, conn, &mut self.events).await;
        }
        if let Some(csis) = self.csis.as_mut() {
            csis.flush(&self.server, conn, peer, &mut self.events).await;
        }
        if let Some(ascs) = self.ascs.as_mut() {
            ascs.flush(&self.server, conn, &mut self.events).await;
        }
    }

    /// Pops the next observed-change event queued for the application.
    pub fn take_event(&mut self) -> Option<ServerEvent> {
        self.events.pop_front()
    }

    /// Sends the current set-lock value to one connection; used for
    /// lock fan-out and deferred (pending) deliveries.
    pub async fn notify_lock(&mut self, conn: &Connection<'_>) {
        let peer = conn.peer_address();
        if let Some(csis) = self.csis.as_mut() {
            csis.notify_lock(&self.server, conn, peer).await;
        }
    }

    /// Drives the set-lock timeout. On expiry the returned update must
    /// be fanned out to every connected coordinator with
    /// [`Self::notify_lock`].
    pub fn poll_lock_timeout(&mut self, now_ms: u64) -> Option<LockUpdate> {
        self.csis.as_mut().and_then(|c| c.poll_timeout(now_ms))
    }

    /// Connection teardown hook for all services.
    pub fn disconnected(&mut self, peer: BdAddr, bonded: bool) -> Option<LockUpdate> {
        if let Some(ascs) = self.ascs.as_mut() {
            ascs.disconnected(bonded);
        }
        self.csis.as_mut().and_then(|c| c.disconnected(peer, bonded))
    }

    /// Pairing-complete hook.
    pub fn pairing_complete(&mut self, peer: BdAddr, bonded: bool) {
        if bonded {
            if let Some(csis) = self.csis.as_mut() {
                csis.bond_added(peer);
            }
        }
    }

    /// Security-changed hook: delivers a deferred set-lock notification
    /// if one is outstanding for this peer.
    pub async fn security_changed(&mut self, conn: &Connection<'_>) {
        let peer = conn.peer_address();
        let resume = self
            .csis
            .as_mut()
            .map(|c| c.security_resumed(peer))
            .unwrap_or(false);
        if resume {
            if let Some(csis) = self.csis.as_mut() {
                csis.notify_lock(&self.server, conn, peer).await;
            }
        }
    }
}
