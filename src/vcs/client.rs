//! VCS GATT client.
//!
//! Discovery runs as a chain: the primary service, its own
//! characteristics, then the included VOCS and AICS services and their
//! characteristics, each wrapped in its own client. Notifications are
//! dispatched down the same tree; control-point writes retry once on a
//! change-counter collision.

use bt_hci::uuid::{characteristic, service};
use embassy_futures::select::{select, Either};
use heapless::Vec;
use trouble_host::{prelude::*, types::gatt_traits::*, BleHostError, Controller};

use crate::aics::client::{AicsClient, AicsEvent};
use crate::client::{run_control_write, ControlMirror, MAX_INSTANCES};
use crate::control_point::WriteTransaction;
use crate::error::Error;
use crate::generic_audio::RawBytes;
use crate::vcs::{VolumeFlags, VolumeOpcode, VolumeState};
use crate::vocs::client::{VocsClient, VocsEvent};

/// Value handles of the remote service.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy)]
pub struct VcsHandles {
    pub state: u16,
    pub control: u16,
    pub flags: u16,
}

/// An observed change on the remote peer, either on the service itself
/// or on one of its included instances (carried with its index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcsEvent {
    State(VolumeState),
    Flags(VolumeFlags),
    Vocs(u8, VocsEvent),
    Aics(u8, AicsEvent),
}

/// Cached view of the remote volume state plus the single outstanding
/// control-point transaction.
pub struct VcsMirror {
    handles: VcsHandles,
    state: Option<VolumeState>,
    flags: Option<VolumeFlags>,
    pub(crate) tx: WriteTransaction<3>,
}

impl VcsMirror {
    pub fn new(handles: VcsHandles) -> Self {
        Self {
            handles,
            state: None,
            flags: None,
            tx: WriteTransaction::new(),
        }
    }

    pub fn handles(&self) -> &VcsHandles {
        &self.handles
    }

    pub fn state(&self) -> Option<VolumeState> {
        self.state
    }

    pub fn flags(&self) -> Option<VolumeFlags> {
        self.flags
    }

    pub fn is_busy(&self) -> bool {
        self.tx.is_busy()
    }

    pub(crate) fn counter(&self) -> u8 {
        self.state.map(|s| s.change_counter).unwrap_or_default()
    }

    /// Dispatches a notification on one of the service's own
    /// characteristics; length mismatches are dropped.
    pub fn on_notification(&mut self, handle: u16, data: &[u8]) -> Option<VcsEvent> {
        if handle == self.handles.state {
            let state = VolumeState::from_gatt(data).ok()?;
            self.state = Some(state);
            return Some(VcsEvent::State(state));
        }
        if handle == self.handles.flags {
            let flags = VolumeFlags::from_gatt(data).ok()?;
            self.flags = Some(flags);
            return Some(VcsEvent::Flags(flags));
        }
        None
    }
}

impl ControlMirror<3> for VcsMirror {
    fn transaction(&mut self) -> &mut WriteTransaction<3> {
        &mut self.tx
    }

    fn absorb_state(&mut self, data: &[u8]) -> Option<u8> {
        let state = VolumeState::from_gatt(data).ok()?;
        self.state = Some(state);
        Some(state.change_counter)
    }
}

/// A connected remote Volume Control Service with its included
/// secondary service instances.
pub struct VcsClient {
    pub(crate) mirror: VcsMirror,
    state: Characteristic<VolumeState>,
    control: Characteristic<RawBytes<3>>,
    flags: Characteristic<VolumeFlags>,
    vocs: Vec<VocsClient, MAX_INSTANCES>,
    aics: Vec<AicsClient, MAX_INSTANCES>,
}

impl VcsClient {
    /// Runs the discovery chain. Completion reports how many included
    /// instances of each kind were found via [`Self::vocs_count`] and
    /// [`Self::aics_count`].
    pub async fn discover<'a, C: Controller, const MAX: usize, const MTU: usize>(
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<Self, Error> {
        let services = client
            .services_by_uuid(&Uuid::from(service::VOLUME_CONTROL))
            .await
            .map_err(|_| Error::NotSupported)?;
        let service_handle = services.first().ok_or(Error::NotSupported)?.clone();

        let state: Characteristic<VolumeState> = client
            .characteristic_by_uuid(&service_handle, &Uuid::from(characteristic::VOLUME_STATE))
            .await
            .map_err(|_| Error::NotSupported)?;
        let control: Characteristic<RawBytes<3>> = client
            .characteristic_by_uuid(
                &service_handle,
                &Uuid::from(characteristic::VOLUME_CONTROL_POINT),
            )
            .await
            .map_err(|_| Error::NotSupported)?;
        let flags: Characteristic<VolumeFlags> = client
            .characteristic_by_uuid(&service_handle, &Uuid::from(characteristic::VOLUME_FLAGS))
            .await
            .map_err(|_| Error::NotSupported)?;

        // Included secondary services, one chain phase per kind.
        let mut vocs = Vec::new();
        if let Ok(included) = client
            .services_by_uuid(&Uuid::from(service::VOLUME_OFFSET_CONTROL))
            .await
        {
            for handle in included.iter().take(MAX_INSTANCES) {
                let _ = vocs.push(VocsClient::discover(client, handle).await?);
            }
        }
        let mut aics = Vec::new();
        if let Ok(included) = client
            .services_by_uuid(&Uuid::from(service::AUDIO_INPUT_CONTROL))
            .await
        {
            for handle in included.iter().take(MAX_INSTANCES) {
                let _ = aics.push(AicsClient::discover(client, handle).await?);
            }
        }

        let handles = VcsHandles {
            state: state.handle,
            control: control.handle,
            flags: flags.handle,
        };
        Ok(Self {
            mirror: VcsMirror::new(handles),
            state,
            control,
            flags,
            vocs,
            aics,
        })
    }

    pub fn mirror(&self) -> &VcsMirror {
        &self.mirror
    }

    pub fn vocs_count(&self) -> usize {
        self.vocs.len()
    }

    pub fn aics_count(&self) -> usize {
        self.aics.len()
    }

    pub fn vocs(&mut self, index: usize) -> Option<&mut VocsClient> {
        self.vocs.get_mut(index)
    }

    pub fn aics(&mut self, index: usize) -> Option<&mut AicsClient> {
        self.aics.get_mut(index)
    }

    /// Dispatches a notification down the service tree.
    pub fn on_notification(&mut self, handle: u16, data: &[u8]) -> Option<VcsEvent> {
        if let Some(event) = self.mirror.on_notification(handle, data) {
            return Some(event);
        }
        for (index, vocs) in self.vocs.iter_mut().enumerate() {
            if let Some(event) = vocs.on_notification(handle, data) {
                return Some(VcsEvent::Vocs(index as u8, event));
            }
        }
        for (index, aics) in self.aics.iter_mut().enumerate() {
            if let Some(event) = aics.on_notification(handle, data) {
                return Some(VcsEvent::Aics(index as u8, event));
            }
        }
        None
    }

    /// Subscribes to the service's own notifying characteristics. The
    /// included instances subscribe through their own clients.
    pub async fn subscribe<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &self,
        client: &'a GattClient<'a, C, MAX, MTU>,
    ) -> Result<
        [trouble_host::gatt::NotificationListener<'a, MTU>; 2],
        BleHostError<C::Error>,
    > {
        Ok([
            client.subscribe(&self.state, false).await?,
            client.subscribe(&self.flags, false).await?,
        ])
    }

    /// Subscribes to the service's own characteristics and pumps their
    /// notifications into the mirror, handing each observed change to
    /// `on_event`. Runs until the connection drops the listeners.
    pub async fn run<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &'a GattClient<'a, C, MAX, MTU>,
        mut on_event: impl FnMut(VcsEvent),
    ) -> Result<(), BleHostError<C::Error>> {
        let state_handle = self.mirror.handles.state;
        let flags_handle = self.mirror.handles.flags;
        let [mut state_listener, mut flags_listener] = self.subscribe(client).await?;
        loop {
            let (handle, event) =
                match select(state_listener.next(), flags_listener.next()).await {
                    Either::First(data) => {
                        (state_handle, self.mirror.on_notification(state_handle, data.as_ref()))
                    }
                    Either::Second(data) => {
                        (flags_handle, self.mirror.on_notification(flags_handle, data.as_ref()))
                    }
                };
            if let Some(event) = event {
                on_event(event);
            } else {
                #[cfg(feature = "defmt")]
                defmt::warn!("[vcs] dropped malformed notification on {}", handle);
                #[cfg(not(feature = "defmt"))]
                let _ = handle;
            }
        }
    }

    /// Reads the remote volume state into the mirror.
    pub async fn read_state<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<VolumeState, Error> {
        let mut data = [0u8; 3];
        client
            .read_characteristic(&self.state, &mut data)
            .await
            .map_err(|_| Error::NotConnected)?;
        let state = VolumeState::from_gatt(&data).map_err(|_| Error::InvalidParam)?;
        self.mirror.absorb_state(&data);
        Ok(state)
    }

    /// Reads the remote volume flags into the mirror.
    pub async fn read_flags<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<VolumeFlags, Error> {
        let mut data = [0u8; 1];
        client
            .read_characteristic(&self.flags, &mut data)
            .await
            .map_err(|_| Error::NotConnected)?;
        let flags = VolumeFlags::from_gatt(&data).map_err(|_| Error::InvalidParam)?;
        self.mirror.flags = Some(flags);
        Ok(flags)
    }

    async fn control_write<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
        opcode: VolumeOpcode,
        operand: &[u8],
    ) -> Result<(), Error> {
        let pdu = RawBytes::<3>::from_slice(self.mirror.tx.begin(
            opcode as u8,
            self.mirror.counter(),
            operand,
        )?);
        run_control_write(client, &self.control, &self.state, &mut self.mirror, pdu).await
    }

    pub async fn volume_down<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<(), Error> {
        self.control_write(client, VolumeOpcode::RelativeVolumeDown, &[])
            .await
    }

    pub async fn volume_up<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<(), Error> {
        self.control_write(client, VolumeOpcode::RelativeVolumeUp, &[])
            .await
    }

    pub async fn unmute_volume_down<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<(), Error> {
        self.control_write(client, VolumeOpcode::UnmuteRelativeVolumeDown, &[])
            .await
    }

    pub async fn unmute_volume_up<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<(), Error> {
        self.control_write(client, VolumeOpcode::UnmuteRelativeVolumeUp, &[])
            .await
    }

    pub async fn set_volume<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
        volume: u8,
    ) -> Result<(), Error> {
        self.control_write(client, VolumeOpcode::SetAbsoluteVolume, &[volume])
            .await
    }

    pub async fn unmute<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<(), Error> {
        self.control_write(client, VolumeOpcode::Unmute, &[]).await
    }

    pub async fn mute<'a, C: Controller, const MAX: usize, const MTU: usize>(
        &mut self,
        client: &GattClient<'a, C, MAX, MTU>,
    ) -> Result<(), Error> {
        self.control_write(client, VolumeOpcode::Mute, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_point::{WriteOutcome, INVALID_CHANGE_COUNTER};

    fn mirror() -> VcsMirror {
        VcsMirror::new(VcsHandles {
            state: 0x03,
            control: 0x05,
            flags: 0x07,
        })
    }

    #[test]
    fn notifications_update_the_cache() {
        let mut m = mirror();
        let event = m.on_notification(0x03, &[100, 0, 1]).unwrap();
        assert_eq!(
            event,
            VcsEvent::State(VolumeState { volume: 100, mute: 0, change_counter: 1 })
        );
        assert_eq!(m.counter(), 1);

        let event = m.on_notification(0x07, &[0x01]).unwrap();
        assert_eq!(event, VcsEvent::Flags(VolumeFlags::VolumeSettingPersisted));
    }

    #[test]
    fn length_mismatches_are_silently_dropped() {
        let mut m = mirror();
        assert!(m.on_notification(0x03, &[100, 0]).is_none());
        assert!(m.on_notification(0x07, &[]).is_none());
        assert!(m.on_notification(0x09, &[1, 2, 3]).is_none());
    }

    #[test]
    fn stale_client_converges_against_a_live_server() {
        use crate::vcs::{Mute, VolumeControl};

        // Server has moved on; the mirror still carries counter 0.
        let mut server = VolumeControl::new(100, Mute::Unmuted, 1).unwrap();
        server.set_volume(120).unwrap();
        server.set_volume(130).unwrap();

        let mut m = mirror();
        m.on_notification(0x03, &[100, 0, 0]).unwrap();

        let pdu: heapless::Vec<u8, 3> = heapless::Vec::from_slice(
            m.tx.begin(VolumeOpcode::SetAbsoluteVolume as u8, m.counter(), &[200])
                .unwrap(),
        )
        .unwrap();
        // First write collides on the counter.
        let reject = server.control_write(&pdu, 0).unwrap_err();
        assert_eq!(m.tx.write_result(Err(reject.as_att())), WriteOutcome::Reread);

        // Re-read the state, patch the counter, retry once.
        let state = server.state();
        assert_eq!(m.absorb_state(state.as_gatt()), Some(2));
        let pdu: heapless::Vec<u8, 3> = match m.tx.state_read_result(Ok(state.change_counter)) {
            WriteOutcome::Retry(bytes) => heapless::Vec::from_slice(bytes).unwrap(),
            outcome => panic!("expected retry, got {:?}", outcome),
        };
        let change = server.control_write(&pdu, 0).unwrap();
        assert!(change.state);
        assert_eq!(m.tx.write_result(Ok(())), WriteOutcome::Complete(Ok(())));

        // Server-write then client-read returns the value and counter.
        let state = server.state();
        assert_eq!(state.volume, 200);
        assert_eq!(m.absorb_state(state.as_gatt()), Some(3));
        assert_eq!(m.state().unwrap(), state);
        assert!(!m.is_busy());
    }

    #[test]
    fn write_uses_cached_counter_and_retries_once() {
        let mut m = mirror();
        m.on_notification(0x03, &[100, 0, 4]).unwrap();
        let pdu = m.tx.begin(VolumeOpcode::SetAbsoluteVolume as u8, m.counter(), &[200]).unwrap();
        assert_eq!(pdu, &[0x04, 0x04, 200]);
        assert_eq!(m.tx.write_result(Err(INVALID_CHANGE_COUNTER)), WriteOutcome::Reread);
        assert_eq!(m.absorb_state(&[100, 0, 5]), Some(5));
        assert_eq!(
            m.tx.state_read_result(Ok(5)),
            WriteOutcome::Retry(&[0x04, 0x05, 200])
        );
    }
}
