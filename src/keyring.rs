//! Keyring: the set of symmetric keys used for packet and stream encryption.
//!
//! Persisted as a JSON array of base64 keys; the first entry is the primary
//! (encryption) key, the rest are accepted for decryption only. Cluster-wide
//! changes arrive through the key-management internal queries.

use crate::crypto::validate_key;
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Reject keyring files larger than this before parsing.
const MAX_KEYRING_FILE_SIZE: u64 = 64 * 1024;

pub struct Keyring {
    keys: Mutex<Vec<Vec<u8>>>,
    /// Changes are written back here when set.
    file: Option<PathBuf>,
}

impl Keyring {
    /// Keyring with a single primary key and no backing file.
    pub fn new(primary: Vec<u8>) -> Result<Self> {
        validate_key(&primary)?;
        Ok(Self {
            keys: Mutex::new(vec![primary]),
            file: None,
        })
    }

    /// Load a keyring file. The file must hold at least one key; changes are
    /// persisted back to the same path.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let meta = std::fs::metadata(&path)?;
        if meta.len() > MAX_KEYRING_FILE_SIZE {
            return Err(Error::Keyring(format!(
                "keyring file too large: {} bytes",
                meta.len()
            )));
        }

        let data = std::fs::read(&path)?;
        let encoded: Vec<String> = serde_json::from_slice(&data)
            .map_err(|e| Error::Keyring(format!("malformed keyring file: {}", e)))?;
        if encoded.is_empty() {
            return Err(Error::Keyring("keyring file holds no keys".to_string()));
        }

        let mut keys = Vec::with_capacity(encoded.len());
        for k in &encoded {
            let raw = BASE64
                .decode(k)
                .map_err(|e| Error::Keyring(format!("bad base64 key: {}", e)))?;
            validate_key(&raw)?;
            keys.push(raw);
        }

        Ok(Self {
            keys: Mutex::new(keys),
            file: Some(path.as_ref().to_path_buf()),
        })
    }

    /// Snapshot of all keys, primary first. Handed to the crypto layer per
    /// packet.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.keys.lock().unwrap().clone()
    }

    pub fn primary(&self) -> Vec<u8> {
        self.keys.lock().unwrap()[0].clone()
    }

    /// Add a key as a secondary. Installing an existing key is a no-op.
    pub fn install(&self, key: Vec<u8>) -> Result<()> {
        validate_key(&key)?;
        let mut keys = self.keys.lock().unwrap();
        if !keys.contains(&key) {
            keys.push(key);
        }
        self.persist(&keys)
    }

    /// Promote an installed key to primary.
    pub fn use_key(&self, key: &[u8]) -> Result<()> {
        let mut keys = self.keys.lock().unwrap();
        let idx = keys
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| Error::Keyring("key is not installed".to_string()))?;
        let k = keys.remove(idx);
        keys.insert(0, k);
        self.persist(&keys)
    }

    /// Remove an installed key. The primary cannot be removed.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let mut keys = self.keys.lock().unwrap();
        let idx = keys
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| Error::Keyring("key is not installed".to_string()))?;
        if idx == 0 {
            return Err(Error::Keyring(
                "removing the primary key would break the cluster".to_string(),
            ));
        }
        keys.remove(idx);
        self.persist(&keys)
    }

    /// All keys base64-encoded, plus the primary.
    pub fn list(&self) -> (Vec<String>, String) {
        let keys = self.keys.lock().unwrap();
        let encoded: Vec<String> = keys.iter().map(|k| BASE64.encode(k)).collect();
        let primary = encoded[0].clone();
        (encoded, primary)
    }

    fn persist(&self, keys: &[Vec<u8>]) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let encoded: Vec<String> = keys.iter().map(|k| BASE64.encode(k)).collect();
        let data = serde_json::to_vec_pretty(&encoded)
            .map_err(|e| Error::Keyring(format!("encode keyring: {}", e)))?;

        // Write-then-rename so a crash never leaves a truncated keyring.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Decode a user-supplied base64 key.
pub fn decode_key(encoded: &str) -> Result<Vec<u8>> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| Error::Keyring(format!("bad base64 key: {}", e)))?;
    validate_key(&raw)?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_valid_key() {
        assert!(Keyring::new(vec![0u8; 16]).is_ok());
        assert!(Keyring::new(vec![0u8; 5]).is_err());
    }

    #[test]
    fn test_install_use_remove() {
        let ring = Keyring::new(vec![1u8; 16]).unwrap();
        ring.install(vec![2u8; 16]).unwrap();
        assert_eq!(ring.keys().len(), 2);

        // Double install is a no-op.
        ring.install(vec![2u8; 16]).unwrap();
        assert_eq!(ring.keys().len(), 2);

        ring.use_key(&[2u8; 16]).unwrap();
        assert_eq!(ring.primary(), vec![2u8; 16]);

        // The primary can never be removed.
        assert!(ring.remove(&[2u8; 16]).is_err());
        ring.remove(&[1u8; 16]).unwrap();
        assert_eq!(ring.keys().len(), 1);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.json");

        let encoded: Vec<String> = vec![BASE64.encode([7u8; 32])];
        std::fs::write(&path, serde_json::to_vec(&encoded).unwrap()).unwrap();

        let ring = Keyring::load(&path).unwrap();
        assert_eq!(ring.primary(), vec![7u8; 32]);

        ring.install(vec![8u8; 32]).unwrap();
        let reloaded = Keyring::load(&path).unwrap();
        assert_eq!(reloaded.keys().len(), 2);
        assert_eq!(reloaded.primary(), vec![7u8; 32]);
    }

    #[test]
    fn test_empty_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.json");
        std::fs::write(&path, b"[]").unwrap();
        assert!(Keyring::load(&path).is_err());
    }
}
