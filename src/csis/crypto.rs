//! Set identity cryptography.
//!
//! Everything here reduces to one AES-128-ECB block encryption: SIRK
//! derivation from a device seed under the set master key, and the set
//! identity hash `sih` used to build and resolve PSRIs.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

use super::Sirk;

/// Key shared at build time by every member of the set; SIRKs are
/// derived from it so members can recognise each other's advertising.
pub const SET_MASTER_KEY: [u8; 16] = [
    0x45, 0xd2, 0x8b, 0x0f, 0x6e, 0x41, 0xbb, 0x03, 0x9c, 0x5a, 0xf0, 0x27, 0x14, 0xc8, 0x77, 0xe6,
];

/// One AES-128-ECB block encryption.
pub fn encrypt_block(key: &[u8; 16], input: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(input);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// Derives a SIRK by encrypting the zero-padded seed under the set
/// master key. Seeds longer than one block are clipped.
pub fn derive_sirk(seed: &[u8]) -> Sirk {
    let mut block = [0u8; 16];
    let len = seed.len().min(16);
    block[..len].copy_from_slice(&seed[..len]);
    Sirk(encrypt_block(&SET_MASTER_KEY, &block))
}

/// Set identity hash: 24-bit `prand` in, 24-bit hash out.
pub fn sih(sirk: &Sirk, prand: u32) -> u32 {
    let mut block = [0u8; 16];
    let be = prand.to_be_bytes();
    block[13..].copy_from_slice(&be[1..]);
    let out = encrypt_block(&sirk.0, &block);
    u32::from_be_bytes([0, out[13], out[14], out[15]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_block_is_deterministic_and_keyed() {
        let a = encrypt_block(&SET_MASTER_KEY, &[0; 16]);
        let b = encrypt_block(&SET_MASTER_KEY, &[0; 16]);
        assert_eq!(a, b);
        let mut other = SET_MASTER_KEY;
        other[0] ^= 1;
        assert_ne!(encrypt_block(&other, &[0; 16]), a);
    }

    #[test]
    fn sirk_derivation_depends_on_the_seed() {
        let a = derive_sirk(b"hearing-aid-left");
        let b = derive_sirk(b"hearing-aid-righ");
        assert_ne!(a.0, b.0);
        assert_eq!(a.0, derive_sirk(b"hearing-aid-left").0);
        // Short seeds are zero padded, long ones clipped to a block.
        assert_eq!(
            derive_sirk(b"hearing-aid-leftXYZ").0,
            derive_sirk(b"hearing-aid-left").0
        );
    }

    #[test]
    fn sih_is_24_bit() {
        let sirk = derive_sirk(b"seed");
        let hash = sih(&sirk, 0x4a_b2_c1);
        assert!(hash <= 0x00FF_FFFF);
        assert_eq!(hash, sih(&sirk, 0x4a_b2_c1));
        assert_ne!(hash, sih(&sirk, 0x4a_b2_c2));
    }
}
