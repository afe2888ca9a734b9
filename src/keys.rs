//! # Key Store
//!
//! Finds or creates the router's long-lived keys under `data-dir`:
//!
//! | file | key |
//! |---|---|
//! | `identity.private` | Ed25519 signing identity |
//! | `encryption.private` | X25519 onion/link encryption key |
//! | `transport.private` | link-layer transport key |
//!
//! A key file is either a raw seed (32 or 64 bytes, discriminated by file
//! size) or an encoded record for anything else. Both forms load; saves write
//! the encoded form. This polymorphism is kept for migration compatibility.
//!
//! Missing files are regenerated lazily at startup rather than aborting; real
//! I/O failures surface as [`RouterError::KeyIoError`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::Crypto;
use crate::error::RouterError;
use crate::identity::SecretKey;

/// File names under `data-dir`.
pub const IDENTITY_KEY_FILE: &str = "identity.private";
pub const ENCRYPTION_KEY_FILE: &str = "encryption.private";
pub const TRANSPORT_KEY_FILE: &str = "transport.private";
pub const SELF_RC_FILE: &str = "self.signed";
pub const NETDB_DIR: &str = "netdb";
pub const PROFILES_FILE: &str = "profiles.dat";

/// Encoded on-disk form for key files whose size differs from a raw seed.
#[derive(Serialize, Deserialize)]
struct EncodedKey {
    bytes: Vec<u8>,
}

/// The router's persistent key material and data-dir layout.
pub struct KeyManager {
    data_dir: PathBuf,
    identity: SecretKey,
    encryption: SecretKey,
    transport: SecretKey,
}

impl KeyManager {
    /// Load every key under `data_dir`, generating and persisting any that do
    /// not exist yet. The directory itself must already exist; config
    /// validation rejects a missing one before we get here.
    pub fn ensure(data_dir: &Path, crypto: &Crypto) -> Result<Self, RouterError> {
        if !data_dir.is_dir() {
            return Err(RouterError::KeyIoError(format!(
                "{} does not exist",
                data_dir.display()
            )));
        }
        fs::create_dir_all(data_dir.join(NETDB_DIR))
            .map_err(|e| RouterError::KeyIoError(format!("netdb: {e}")))?;

        let identity =
            find_or_create(&data_dir.join(IDENTITY_KEY_FILE), || crypto.identity_keygen())?;
        let mut encryption =
            find_or_create(&data_dir.join(ENCRYPTION_KEY_FILE), || crypto.encryption_keygen())?;
        // The cached public half of an encryption key is X25519, not Ed25519,
        // so a raw-seed load needs its own recalculation.
        crypto.recalc_encryption(&mut encryption);
        let mut transport =
            find_or_create(&data_dir.join(TRANSPORT_KEY_FILE), || crypto.encryption_keygen())?;
        crypto.recalc_encryption(&mut transport);

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            identity,
            encryption,
            transport,
        })
    }

    pub fn identity(&self) -> &SecretKey {
        &self.identity
    }

    pub fn encryption(&self) -> &SecretKey {
        &self.encryption
    }

    pub fn transport(&self) -> &SecretKey {
        &self.transport
    }

    /// Install a newly rotated encryption key and persist it.
    pub fn rotate_encryption(&mut self, key: SecretKey) -> Result<(), RouterError> {
        save_key(&self.data_dir.join(ENCRYPTION_KEY_FILE), &key)?;
        self.encryption = key;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn self_rc_path(&self) -> PathBuf {
        self.data_dir.join(SELF_RC_FILE)
    }

    pub fn netdb_dir(&self) -> PathBuf {
        self.data_dir.join(NETDB_DIR)
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.data_dir.join(PROFILES_FILE)
    }
}

fn find_or_create(
    path: &Path,
    generate: impl FnOnce() -> SecretKey,
) -> Result<SecretKey, RouterError> {
    if !path.exists() {
        info!(file = %path.display(), "generating new key");
        let key = generate();
        save_key(path, &key)?;
        return Ok(key);
    }
    load_key(path)
}

/// Load a key file: raw 64-byte blob, raw 32-byte seed, or encoded record,
/// discriminated by file size.
pub fn load_key(path: &Path) -> Result<SecretKey, RouterError> {
    let bytes = fs::read(path)
        .map_err(|e| RouterError::KeyIoError(format!("{}: {e}", path.display())))?;

    match bytes.len() {
        SecretKey::SIZE => {
            let mut arr = [0u8; 64];
            arr.copy_from_slice(&bytes);
            let mut key = SecretKey::from_bytes(arr);
            key.recalculate();
            Ok(key)
        }
        32 => {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            Ok(SecretKey::from_seed(seed))
        }
        _ => {
            let encoded: EncodedKey = crate::messages::deserialize_bounded(&bytes)
                .map_err(|e| RouterError::KeyIoError(format!("{}: {e}", path.display())))?;
            if encoded.bytes.len() != SecretKey::SIZE {
                return Err(RouterError::KeyIoError(format!(
                    "{}: encoded key has {} bytes, expected {}",
                    path.display(),
                    encoded.bytes.len(),
                    SecretKey::SIZE
                )));
            }
            let mut arr = [0u8; 64];
            arr.copy_from_slice(&encoded.bytes);
            let mut key = SecretKey::from_bytes(arr);
            key.recalculate();
            Ok(key)
        }
    }
}

/// Write a key in the encoded form.
pub fn save_key(path: &Path, key: &SecretKey) -> Result<(), RouterError> {
    let encoded = EncodedKey {
        bytes: key.as_bytes().to_vec(),
    };
    let bytes = bincode::serialize(&encoded)
        .map_err(|e| RouterError::KeyIoError(format!("encode: {e}")))?;
    fs::write(path, bytes)
        .map_err(|e| RouterError::KeyIoError(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ensure_generates_and_reloads_same_keys() {
        let dir = tempdir().unwrap();
        let crypto = Crypto::new();

        let first = KeyManager::ensure(dir.path(), &crypto).unwrap();
        let second = KeyManager::ensure(dir.path(), &crypto).unwrap();

        assert_eq!(first.identity().public_key(), second.identity().public_key());
        assert_eq!(
            first.encryption().public_key(),
            second.encryption().public_key()
        );
        assert_eq!(
            first.transport().public_key(),
            second.transport().public_key()
        );
    }

    #[test]
    fn raw_64_byte_file_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("k");
        let key = SecretKey::generate();
        fs::write(&path, key.as_bytes()).unwrap();

        let loaded = load_key(&path).unwrap();
        assert_eq!(loaded.public_key(), key.public_key());
    }

    #[test]
    fn raw_32_byte_seed_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("k");
        let key = SecretKey::generate();
        fs::write(&path, &key.as_bytes()[..32]).unwrap();

        let loaded = load_key(&path).unwrap();
        assert_eq!(loaded.public_key(), key.public_key());
    }

    #[test]
    fn encoded_file_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("k");
        let key = SecretKey::generate();
        save_key(&path, &key).unwrap();

        // Encoded form is neither 32 nor 64 bytes on disk.
        let size = fs::metadata(&path).unwrap().len();
        assert_ne!(size, 32);
        assert_ne!(size, 64);

        let loaded = load_key(&path).unwrap();
        assert_eq!(loaded.as_bytes(), key.as_bytes());
    }

    #[test]
    fn loaded_key_recalculates_to_itself() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("k");
        let key = SecretKey::generate();
        save_key(&path, &key).unwrap();

        let mut loaded = load_key(&path).unwrap();
        let before = *loaded.as_bytes();
        loaded.recalculate();
        assert_eq!(*loaded.as_bytes(), before);
    }

    #[test]
    fn garbage_file_is_key_io_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("k");
        fs::write(&path, b"not a key at all, wrong length").unwrap();

        assert!(matches!(load_key(&path), Err(RouterError::KeyIoError(_))));
    }

    #[test]
    fn missing_file_is_key_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_key(&dir.path().join("absent")),
            Err(RouterError::KeyIoError(_))
        ));
    }
}
