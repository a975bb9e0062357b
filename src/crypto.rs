//! Symmetric packet and stream encryption.
//!
//! Frame layout: `[version: u32 BE][nonce: 12][ciphertext || tag: 16]`.
//! The message is sealed with the primary (first) key; decryption tries every
//! installed key so the cluster keeps working mid key-rotation. The caller
//! passes the packet label as associated data, which cryptographically binds
//! frames to their cluster.

use crate::error::{Error, Result};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, KeyInit, Nonce};
use rand::RngCore;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Current encryption frame version.
pub const ENCRYPT_VERSION: u32 = 1;

const VERSION_LEN: usize = 4;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes added to a plaintext by `encrypt_payload`.
pub const ENCRYPT_OVERHEAD: usize = VERSION_LEN + NONCE_LEN + TAG_LEN;

/// Check a key length before installing it.
pub fn validate_key(key: &[u8]) -> Result<()> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        n => Err(Error::InvalidKey(n)),
    }
}

fn seal(key: &[u8], nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let nonce = Nonce::from_slice(nonce);
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let out = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| Error::Encrypt)?
            .encrypt(nonce, payload),
        24 => Aes192Gcm::new_from_slice(key)
            .map_err(|_| Error::Encrypt)?
            .encrypt(nonce, payload),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Encrypt)?
            .encrypt(nonce, payload),
        n => return Err(Error::InvalidKey(n)),
    };
    out.map_err(|_| Error::Encrypt)
}

fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let nonce = Nonce::from_slice(nonce);
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    let out = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| Error::Decrypt)?
            .decrypt(nonce, payload),
        24 => Aes192Gcm::new_from_slice(key)
            .map_err(|_| Error::Decrypt)?
            .decrypt(nonce, payload),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Decrypt)?
            .decrypt(nonce, payload),
        n => return Err(Error::InvalidKey(n)),
    };
    out.map_err(|_| Error::Decrypt)
}

/// Seal `plaintext` with the first key in `keys`.
pub fn encrypt_payload(keys: &[Vec<u8>], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let key = keys.first().ok_or(Error::NoKeyring)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ct = seal(key, &nonce, plaintext, aad)?;

    let mut out = Vec::with_capacity(VERSION_LEN + NONCE_LEN + ct.len());
    out.extend_from_slice(&ENCRYPT_VERSION.to_be_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a frame, trying every installed key in order.
pub fn decrypt_payload(keys: &[Vec<u8>], data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if keys.is_empty() {
        return Err(Error::NoKeyring);
    }
    if data.len() < ENCRYPT_OVERHEAD {
        return Err(Error::Decrypt);
    }

    let version = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if version != ENCRYPT_VERSION {
        return Err(Error::Decrypt);
    }
    let nonce = &data[VERSION_LEN..VERSION_LEN + NONCE_LEN];
    let ciphertext = &data[VERSION_LEN + NONCE_LEN..];

    for key in keys {
        if let Ok(pt) = open(key, nonce, ciphertext, aad) {
            return Ok(pt);
        }
    }
    Err(Error::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8, len: usize) -> Vec<u8> {
        vec![n; len]
    }

    #[test]
    fn test_round_trip_all_key_sizes() {
        for len in [16, 24, 32] {
            let keys = vec![key(1, len)];
            let sealed = encrypt_payload(&keys, b"hello", b"label").unwrap();
            assert_eq!(sealed.len(), 5 + ENCRYPT_OVERHEAD);
            let opened = decrypt_payload(&keys, &sealed, b"label").unwrap();
            assert_eq!(opened, b"hello");
        }
    }

    #[test]
    fn test_secondary_key_still_decrypts() {
        let old = vec![key(1, 32)];
        let sealed = encrypt_payload(&old, b"payload", b"").unwrap();

        // After rotation the old key is secondary but must still open
        // in-flight frames.
        let rotated = vec![key(2, 32), key(1, 32)];
        assert_eq!(decrypt_payload(&rotated, &sealed, b"").unwrap(), b"payload");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt_payload(&[key(1, 32)], b"x", b"").unwrap();
        assert!(matches!(
            decrypt_payload(&[key(9, 32)], &sealed, b""),
            Err(Error::Decrypt)
        ));
    }

    #[test]
    fn test_aad_mismatch_fails() {
        let keys = vec![key(1, 16)];
        let sealed = encrypt_payload(&keys, b"x", b"cluster-a").unwrap();
        assert!(decrypt_payload(&keys, &sealed, b"cluster-b").is_err());
    }

    #[test]
    fn test_tampered_frame_fails() {
        let keys = vec![key(1, 16)];
        let mut sealed = encrypt_payload(&keys, b"x", b"").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(decrypt_payload(&keys, &sealed, b"").is_err());
    }

    #[test]
    fn test_short_frame_fails() {
        assert!(decrypt_payload(&[key(1, 16)], &[0u8; 8], b"").is_err());
    }
}
