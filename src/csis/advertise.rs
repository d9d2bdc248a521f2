//! PSRI advertising for set members.
//!
//! Each advertising round carries a freshly generated PSRI in the
//! Resolvable Set Identifier AD structure, so only peers holding the
//! set's SIRK can recognise the member. The PSRI rotates in lockstep
//! with the resolvable private address: one round lasts 90 % of the RPA
//! timeout, then advertising restarts with a new identifier.

use embassy_time::{with_timeout, Duration, TimeoutError};
use rand_core::RngCore;
use trouble_host::{
    prelude::{
        AdStructure, Advertisement, Connection, Peripheral, BR_EDR_NOT_SUPPORTED,
        LE_GENERAL_DISCOVERABLE,
    },
    BleHostError, Controller,
};

#[cfg(feature = "defmt")]
use defmt::*;

use super::{CsisEngine, Psri};

/// Resolvable Set Identifier AD type.
pub const RSI_AD_TYPE: u8 = 0x2E;

/// Encodes the advertising payload for one round.
pub fn advertising_data(psri: &Psri, buf: &mut [u8]) -> Result<usize, trouble_host::Error> {
    AdStructure::encode_slice(
        &[
            AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
            AdStructure::Unknown {
                ty: RSI_AD_TYPE,
                data: psri.as_bytes(),
            },
        ],
        buf,
    )
}

/// Advertises as a set member until a central connects, regenerating
/// the PSRI whenever a round times out. `rpa_timeout` is the host's RPA
/// rotation period; rounds last 90 % of it so the identifier always
/// changes together with the address.
pub async fn advertise<'a, C: Controller, const PEERS: usize>(
    engine: &CsisEngine<PEERS>,
    rng: &mut impl RngCore,
    rpa_timeout: Duration,
    peripheral: &mut Peripheral<'a, C>,
) -> Result<Connection<'a>, BleHostError<C::Error>> {
    let round = rpa_timeout * 9 / 10;
    loop {
        let psri = engine.generate_psri(rng);
        let mut adv_data = [0; 31];
        let len = advertising_data(&psri, &mut adv_data)?;

        let advertiser = peripheral
            .advertise(
                &Default::default(),
                Advertisement::ConnectableScannableUndirected {
                    adv_data: &adv_data[..len],
                    scan_data: &[],
                },
            )
            .await?;
        #[cfg(feature = "defmt")]
        info!("[csis] advertising as set member");

        match with_timeout(round, advertiser.accept()).await {
            Ok(conn) => {
                let conn = conn?;
                #[cfg(feature = "defmt")]
                info!("[csis] connection established");
                return Ok(conn);
            }
            // Round over: rotate the PSRI with the address.
            Err(TimeoutError) => continue,
        }
    }
}
