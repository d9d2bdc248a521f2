//! ASCS GATT server glue.
//!
//! One ASE bank per peer session: sink/source ASE characteristics plus
//! the ASE control point. Control-point writes are always accepted at
//! the ATT layer; per-ASE results travel in the control-point
//! notification, followed by a status notification per changed ASE.

use bt_hci::uuid::{characteristic, service};
use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Vec;
use trouble_host::{prelude::*, types::gatt_traits::*};

use crate::ascs::{AseBank, Direction, QosPreferences, ASE_BUF_SIZE, RSP_BUF_SIZE};
use crate::error::Error;
use crate::generic_audio::RawBytes;
use crate::server::{
    push_event, AudioControlService, EventContext, EventQueue, ServerEvent, MAX_ASES,
    MAX_ATTRIBUTES,
};

/// Attribute slots the service occupies in the table.
pub const ASCS_ATTRIBUTES: usize = 4 + 3 * MAX_ASES;
/// Value storage: control point plus one status slot per ASE.
pub(crate) const ASCS_STORAGE: usize = RSP_BUF_SIZE + MAX_ASES * ASE_BUF_SIZE;

/// Init-time configuration: one ASE per direction entry, plus the QoS
/// capabilities reported in the Codec Configured state.
pub struct AscsConfig<'a> {
    pub directions: &'a [Direction],
    pub prefs: QosPreferences,
}

/// The registered Audio Stream Control Service.
pub struct AscsServer {
    bank: AseBank<MAX_ASES>,
    control_point: Characteristic<RawBytes<RSP_BUF_SIZE>>,
    ases: Vec<Characteristic<RawBytes<ASE_BUF_SIZE>>, MAX_ASES>,
    response_pending: bool,
    changed: Vec<u8, MAX_ASES>,
}

impl AscsServer {
    pub(crate) fn new<'a, M: RawMutex>(
        table: &mut AttributeTable<'a, M, MAX_ATTRIBUTES>,
        config: &AscsConfig<'_>,
        storage: &'a mut [u8],
    ) -> Result<Self, Error> {
        if storage.len() < ASCS_STORAGE || config.directions.len() > MAX_ASES {
            return Err(Error::NoMemory);
        }
        let mut bank: AseBank<MAX_ASES> = AseBank::new(config.directions, config.prefs)?;

        let (cp_store, mut storage) = storage.split_at_mut(RSP_BUF_SIZE);

        let mut service = table.add_service(Service::new(service::AUDIO_STREAM_CONTROL));

        let control_point = service
            .add_characteristic(
                characteristic::ASE_CONTROL_POINT,
                &[
                    CharacteristicProp::Write,
                    CharacteristicProp::WriteWithoutResponse,
                    CharacteristicProp::Notify,
                ],
                RawBytes::default(),
                cp_store,
            )
            .build();

        let mut ases = Vec::new();
        for (index, direction) in config.directions.iter().enumerate() {
            let (store, rest) = storage.split_at_mut(ASE_BUF_SIZE);
            storage = rest;
            let id = index as u8 + 1;
            let uuid = match direction {
                Direction::Sink => characteristic::SINK_ASE,
                Direction::Source => characteristic::SOURCE_ASE,
            };
            let initial = bank
                .status_payload(id)
                .map(RawBytes::from_slice)
                .unwrap_or_default();
            let ase = service
                .add_characteristic(
                    uuid,
                    &[CharacteristicProp::Read, CharacteristicProp::Notify],
                    initial,
                    store,
                )
                .build();
            ases.push(ase).map_err(|_| Error::NoMemory)?;
        }

        service.build();

        Ok(Self {
            bank,
            control_point,
            ases,
            response_pending: false,
            changed: Vec::new(),
        })
    }

    pub fn bank(&self) -> &AseBank<MAX_ASES> {
        &self.bank
    }

    /// Server-side start of a sink stream; the status notification goes
    /// out on the next flush.
    pub fn receiver_start_ready(&mut self, id: u8) -> Result<(), Error> {
        self.bank.receiver_start_ready(id)?;
        self.mark_changed(id);
        Ok(())
    }

    /// Server-side completion of a release.
    pub fn released(&mut self, id: u8, cache: bool) -> Result<(), Error> {
        self.bank.released(id, cache)?;
        self.mark_changed(id);
        Ok(())
    }

    fn mark_changed(&mut self, id: u8) {
        if !self.changed.contains(&id) {
            let _ = self.changed.push(id);
        }
    }

    /// Peer session teardown: bonded peers keep their codec
    /// configuration cached, everyone else is cleared.
    pub fn disconnected(&mut self, bonded: bool) {
        if bonded {
            self.bank.detach();
        } else {
            self.bank.clear();
        }
        self.changed.clear();
        self.response_pending = false;
    }

    pub(crate) async fn flush<M: RawMutex, const MAX: usize>(
        &mut self,
        server: &AttributeServer<'_, M, MAX>,
        conn: &Connection<'_>,
        events: &mut EventQueue,
    ) {
        if self.response_pending {
            self.response_pending = false;
            let response = RawBytes::from_slice(self.bank.control_point_response());
            let _ = server.notify(&self.control_point, conn, &response).await;
        }
        let changed = core::mem::take(&mut self.changed);
        for id in changed {
            let Some(index) = id.checked_sub(1).map(usize::from) else {
                continue;
            };
            let Some(characteristic) = self.ases.get(index) else {
                continue;
            };
            let Some(payload) = self.bank.status_payload(id).map(RawBytes::from_slice) else {
                continue;
            };
            let _ = server.set(characteristic, &payload);
            let _ = server.notify(characteristic, conn, &payload).await;
            if let Some(ase) = self.bank.ase(id) {
                push_event(events, ServerEvent::AseState(id, ase.state.id()));
            }
        }
    }
}

impl AudioControlService for AscsServer {
    fn handle_read_event(&self, event: &ReadEvent) -> Option<Result<(), AttErrorCode>> {
        if event.handle() == self.control_point.handle {
            return Some(Err(AttErrorCode::READ_NOT_PERMITTED));
        }
        for ase in self.ases.iter() {
            if event.handle() == ase.handle {
                return Some(Ok(()));
            }
        }
        None
    }

    fn handle_write_event(
        &mut self,
        _ctx: &EventContext,
        event: &WriteEvent,
    ) -> Option<Result<(), AttErrorCode>> {
        if event.handle() == self.control_point.handle {
            // Per-ASE results travel in the response notification; the
            // ATT write itself always succeeds.
            let changed = self.bank.handle_control_point(event.data());
            for id in changed {
                self.mark_changed(id);
            }
            self.response_pending = true;
            return Some(Ok(()));
        }
        for ase in self.ases.iter() {
            if event.handle() == ase.handle {
                return Some(Err(AttErrorCode::WRITE_NOT_PERMITTED));
            }
        }
        None
    }
}
