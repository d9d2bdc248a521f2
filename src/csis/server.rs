//! CSIS GATT server glue.
//!
//! Wraps the set member engine with the attribute table: SIRK, set
//! size, set member lock and rank characteristics. Lock notifications
//! exclude the writer; fan-out to the other connected set coordinators
//! and delivery of deferred notifications go through [`CsisServer::notify_lock`].

use bt_hci::uuid::{characteristic, service};
use embassy_sync::blocking_mutex::raw::RawMutex;
use trouble_host::prelude::*;

use crate::csis::{CsisEngine, LockUpdate, SetLock, Sirk, SirkAccess};
use crate::error::{att_error, Error};
use crate::server::{
    push_event, AudioControlService, EventContext, EventQueue, ServerEvent, MAX_ATTRIBUTES,
};

/// Attribute slots the service occupies in the table.
pub const CSIS_ATTRIBUTES: usize = 12;
/// Value storage: SIRK, set size, lock, rank.
pub(crate) const CSIS_STORAGE: usize = 16 + 1 + 1 + 1;

/// Init-time configuration of the set member.
pub struct CsisConfig {
    pub sirk: Sirk,
    pub sirk_access: SirkAccess,
    pub set_size: u8,
    pub rank: u8,
}

/// The registered Coordinated Set Identification Service.
pub struct CsisServer<const PEERS: usize> {
    engine: CsisEngine<PEERS>,
    sirk: Characteristic<Sirk>,
    set_size: Characteristic<u8>,
    lock: Characteristic<u8>,
    rank: Characteristic<u8>,
    last_update: Option<LockUpdate>,
    unfanned: Option<LockUpdate>,
}

impl<const PEERS: usize> CsisServer<PEERS> {
    pub(crate) fn new<'a, M: RawMutex>(
        table: &mut AttributeTable<'a, M, MAX_ATTRIBUTES>,
        config: CsisConfig,
        storage: &'a mut [u8],
    ) -> Result<Self, Error> {
        if storage.len() < CSIS_STORAGE {
            return Err(Error::NoMemory);
        }
        let engine = CsisEngine::new(
            config.sirk,
            config.sirk_access,
            config.set_size,
            config.rank,
        )?;

        let (sirk_store, storage) = storage.split_at_mut(16);
        let (size_store, storage) = storage.split_at_mut(1);
        let (lock_store, rank_store) = storage.split_at_mut(1);

        let mut service = table.add_service(Service::new(service::COORDINATED_SET_IDENTIFICATION));

        let sirk = service
            .add_characteristic(
                characteristic::SET_IDENTITY_RESOLVING_KEY,
                &[CharacteristicProp::Read, CharacteristicProp::Notify],
                config.sirk,
                sirk_store,
            )
            .build();

        let set_size = service
            .add_characteristic(
                characteristic::COORDINATED_SET_SIZE,
                &[CharacteristicProp::Read, CharacteristicProp::Notify],
                config.set_size,
                size_store,
            )
            .build();

        let lock = service
            .add_characteristic(
                characteristic::SET_MEMBER_LOCK,
                &[
                    CharacteristicProp::Read,
                    CharacteristicProp::Write,
                    CharacteristicProp::Notify,
                ],
                SetLock::Released as u8,
                lock_store,
            )
            .build();

        let rank = service
            .add_characteristic(
                characteristic::SET_MEMBER_RANK,
                &[CharacteristicProp::Read],
                config.rank,
                rank_store,
            )
            .build();

        service.build();

        Ok(Self {
            engine,
            sirk,
            set_size,
            lock,
            rank,
            last_update: None,
            unfanned: None,
        })
    }

    pub fn engine(&self) -> &CsisEngine<PEERS> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut CsisEngine<PEERS> {
        &mut self.engine
    }

    /// The lock change committed by the last processed write; the
    /// application fans it out to the other connected coordinators with
    /// [`Self::notify_lock`], honouring `exclude`.
    pub fn take_lock_update(&mut self) -> Option<LockUpdate> {
        self.unfanned.take()
    }

    /// Drives the lock timeout; on expiry the application must fan the
    /// returned update out to every connected set coordinator.
    pub fn poll_timeout(&mut self, now_ms: u64) -> Option<LockUpdate> {
        self.engine.poll_timeout(now_ms)
    }

    /// Connection teardown hook.
    pub fn disconnected(&mut self, peer: BdAddr, bonded: bool) -> Option<LockUpdate> {
        self.engine.disconnected(peer, bonded)
    }

    /// Pairing-complete hook.
    pub fn bond_added(&mut self, peer: BdAddr) {
        self.engine.bond_added(peer);
    }

    /// Bond-deleted hook.
    pub fn bond_removed(&mut self, peer: BdAddr) {
        self.engine.bond_removed(peer);
    }

    /// Security-changed hook: whether a deferred lock notification must
    /// be delivered to this peer now (via [`Self::notify_lock`]).
    pub fn security_resumed(&mut self, peer: BdAddr) -> bool {
        self.engine.security_resumed(peer)
    }

    /// Sends the current lock value to one connection and clears the
    /// peer's pending slot on success.
    pub async fn notify_lock<M: RawMutex, const MAX: usize>(
        &mut self,
        server: &AttributeServer<'_, M, MAX>,
        conn: &Connection<'_>,
        peer: BdAddr,
    ) {
        let value = self.engine.lock() as u8;
        let _ = server.set(&self.lock, &value);
        if server.notify(&self.lock, conn, &value).await.is_ok() {
            self.engine.mark_notified(peer);
        }
    }

    pub(crate) async fn flush<M: RawMutex, const MAX: usize>(
        &mut self,
        server: &AttributeServer<'_, M, MAX>,
        conn: &Connection<'_>,
        peer: BdAddr,
        events: &mut EventQueue,
    ) {
        // The event's own connection is served here; the application
        // fans out to the other connections with `notify_lock`.
        if let Some(update) = self.last_update.take() {
            let value = update.value as u8;
            let _ = server.set(&self.lock, &value);
            if update.exclude != Some(peer) {
                if server.notify(&self.lock, conn, &value).await.is_ok() {
                    self.engine.mark_notified(peer);
                }
            }
            push_event(events, ServerEvent::Lock(update.value));
        }
    }
}

impl<const PEERS: usize> AudioControlService for CsisServer<PEERS> {
    fn handle_read_event(&self, event: &ReadEvent) -> Option<Result<(), AttErrorCode>> {
        if event.handle() == self.sirk.handle {
            return Some(match self.engine.sirk_read() {
                Ok(_) => Ok(()),
                Err(code) => Err(att_error(code)),
            });
        }
        if event.handle() == self.set_size.handle
            || event.handle() == self.lock.handle
            || event.handle() == self.rank.handle
        {
            return Some(Ok(()));
        }
        None
    }

    fn handle_write_event(
        &mut self,
        ctx: &EventContext,
        event: &WriteEvent,
    ) -> Option<Result<(), AttErrorCode>> {
        if event.handle() == self.lock.handle {
            return Some(
                match self
                    .engine
                    .handle_lock_write(ctx.peer, event.data(), 0, ctx.now_ms)
                {
                    Ok(update) => {
                        if update.is_some() {
                            self.last_update = update;
                            self.unfanned = update;
                        }
                        Ok(())
                    }
                    Err(code) => Err(att_error(code)),
                },
            );
        }
        if event.handle() == self.sirk.handle
            || event.handle() == self.set_size.handle
            || event.handle() == self.rank.handle
        {
            return Some(Err(AttErrorCode::WRITE_NOT_PERMITTED));
        }
        None
    }
}
