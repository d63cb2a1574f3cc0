//! Wire codec for the burrow tunnel.
//!
//! Provides:
//! - [`TunnelKey`] — the shared symmetric key (AES-128 block primitive)
//! - In-place payload encryption / decryption
//! - The 64-byte challenge/proof pair used by the carrier handshake
//!
//! # Security
//!
//! **This codec is deliberately weak and must not be mistaken for real
//! transport security.** It reproduces, bit for bit, the scheme used by
//! existing deployments of this protocol so that both ends interoperate:
//!
//! * the **first 16-byte block of every payload travels in cleartext**;
//! * the trailing partial block (when the payload length is not a multiple
//!   of 16) also travels in cleartext;
//! * every other block is AES-128 encrypted *independently* (ECB-style),
//!   so equal plaintext blocks produce equal ciphertext blocks;
//! * there is no nonce, no IV and no authentication tag — ciphertext can be
//!   replayed or flipped without detection;
//! * the raw shared secret doubles as the block-cipher key.
//!
//! Changing any of this would break the wire format, so it stays. Treat the
//! tunnel as obfuscation, and run sensitive traffic through it end-to-end
//! encrypted.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Block};

/// Cipher block size in bytes. The wire format is defined in terms of it.
pub const BLOCK_SIZE: usize = 16;

/// Number of key bytes consumed from the shared secret.
pub const KEY_LEN: usize = 16;

/// Length of the handshake challenge and of its proof.
pub const CHALLENGE_LEN: usize = 64;

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Errors raised when deriving a [`TunnelKey`] from the configured secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyError {
    /// The configured secret is shorter than [`KEY_LEN`] bytes.
    SecretTooShort(usize),
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SecretTooShort(n) => {
                write!(f, "shared secret is {n} bytes, need at least {KEY_LEN}")
            }
        }
    }
}
impl std::error::Error for KeyError {}

// ─── TunnelKey ────────────────────────────────────────────────────────────────

/// The shared symmetric key both endpoints are configured with.
///
/// Built from the first [`KEY_LEN`] bytes of the configured secret; a longer
/// secret is truncated, a shorter one is a configuration error.
#[derive(Clone)]
pub struct TunnelKey {
    cipher: Aes128,
}

impl TunnelKey {
    /// Derive the key from the configured shared secret.
    pub fn from_secret(secret: &[u8]) -> Result<Self, KeyError> {
        if secret.len() < KEY_LEN {
            return Err(KeyError::SecretTooShort(secret.len()));
        }
        let mut key_bytes = [0u8; KEY_LEN];
        key_bytes.copy_from_slice(&secret[..KEY_LEN]);
        Ok(Self {
            cipher: Aes128::new(&GenericArray::from(key_bytes)),
        })
    }

    /// Encrypt `data` in place.
    ///
    /// Every full 16-byte block **from offset 16 onwards** is replaced by its
    /// AES-128 encryption. The leading block and any trailing partial block
    /// are left untouched (see the crate-level security note).
    pub fn encrypt_payload(&self, data: &mut [u8]) {
        let mut off = BLOCK_SIZE;
        while off + BLOCK_SIZE <= data.len() {
            let block = Block::from_mut_slice(&mut data[off..off + BLOCK_SIZE]);
            self.cipher.encrypt_block(block);
            off += BLOCK_SIZE;
        }
    }

    /// Decrypt `data` in place. Exact inverse of [`TunnelKey::encrypt_payload`].
    pub fn decrypt_payload(&self, data: &mut [u8]) {
        let mut off = BLOCK_SIZE;
        while off + BLOCK_SIZE <= data.len() {
            let block = Block::from_mut_slice(&mut data[off..off + BLOCK_SIZE]);
            self.cipher.decrypt_block(block);
            off += BLOCK_SIZE;
        }
    }

    /// Compute the handshake proof for a challenge.
    ///
    /// The proof is simply the payload transform applied to the challenge
    /// bytes; the responder recomputes it and compares all 64 bytes.
    pub fn prove(&self, challenge: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
        let mut proof = *challenge;
        self.encrypt_payload(&mut proof);
        proof
    }
}

impl std::fmt::Debug for TunnelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("TunnelKey(..)")
    }
}

/// Generate a fresh 64-byte handshake challenge.
pub fn challenge() -> [u8; CHALLENGE_LEN] {
    let mut c = [0u8; CHALLENGE_LEN];
    getrandom::getrandom(&mut c).expect("getrandom");
    c
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"foo bar foo bar foo bar ";

    fn key() -> TunnelKey {
        TunnelKey::from_secret(SECRET).unwrap()
    }

    #[test]
    fn round_trip_various_lengths() {
        let key = key();
        for len in [0usize, 1, 15, 16, 17, 31, 32, 33, 48, 100, 1280] {
            let original: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let mut data = original.clone();
            key.encrypt_payload(&mut data);
            key.decrypt_payload(&mut data);
            assert_eq!(data, original, "len {len}");
        }
    }

    #[test]
    fn leading_block_stays_cleartext() {
        let key = key();
        let original: Vec<u8> = (0..48).map(|i| i as u8).collect();
        let mut data = original.clone();
        key.encrypt_payload(&mut data);
        assert_eq!(&data[..BLOCK_SIZE], &original[..BLOCK_SIZE]);
        assert_ne!(&data[BLOCK_SIZE..2 * BLOCK_SIZE], &original[BLOCK_SIZE..2 * BLOCK_SIZE]);
    }

    #[test]
    fn trailing_partial_block_stays_cleartext() {
        let key = key();
        let original: Vec<u8> = (0..40).map(|i| i as u8).collect();
        let mut data = original.clone();
        key.encrypt_payload(&mut data);
        // blocks: [0..16) leading, [16..32) encrypted, [32..40) partial
        assert_ne!(&data[16..32], &original[16..32]);
        assert_eq!(&data[32..], &original[32..]);
    }

    #[test]
    fn short_payload_is_untouched() {
        let key = key();
        let original: Vec<u8> = (0..20).map(|i| i as u8).collect();
        let mut data = original[..12].to_vec();
        key.encrypt_payload(&mut data);
        assert_eq!(data, &original[..12]);
    }

    #[test]
    fn secret_is_truncated_to_key_len() {
        let short = TunnelKey::from_secret(&SECRET[..KEY_LEN]).unwrap();
        let long = TunnelKey::from_secret(SECRET).unwrap();
        let mut a: Vec<u8> = (0..64).map(|i| i as u8).collect();
        let mut b = a.clone();
        short.encrypt_payload(&mut a);
        long.encrypt_payload(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn short_secret_rejected() {
        assert_eq!(
            TunnelKey::from_secret(b"too short").unwrap_err(),
            KeyError::SecretTooShort(9)
        );
    }

    #[test]
    fn proof_matches_between_peers() {
        let c = challenge();
        let ours = key().prove(&c);
        let theirs = key().prove(&c);
        assert_eq!(ours, theirs);
        // Beyond the cleartext leading block the proof must differ from the
        // challenge.
        assert_ne!(&ours[BLOCK_SIZE..], &c[BLOCK_SIZE..]);
    }

    #[test]
    fn proof_differs_across_keys() {
        let other = TunnelKey::from_secret(b"wrong key wrong key").unwrap();
        let c = challenge();
        assert_ne!(key().prove(&c), other.prove(&c));
    }
}
