//! Envelope key management.
//!
//! A 256-bit data-encryption key (DEK) encrypts ballots. The DEK itself is only ever
//! persisted wrapped under a key-encryption key (KEK) with AES-GCM, using the stable
//! data-key identifier as additional authenticated data:
//!
//! ```text
//! nonce (12 bytes) || ciphertext (32 bytes) || tag (16 bytes)
//! ```
//!
//! This simulates a KMS / HSM. The plaintext DEK is unwrapped per operation and never
//! written anywhere.

use crate::*;
use aes_gcm::aead::generic_array::typenum::U12;
use aes_gcm::aead::{self, generic_array::GenericArray, Aead, NewAead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

type Aes192Gcm = AesGcm<aes::Aes192, U12>;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const DATA_KEY_LEN: usize = 32;
pub const WRAPPED_KEY_LEN: usize = NONCE_LEN + DATA_KEY_LEN + TAG_LEN;

/// Key-encryption key. 128, 192 or 256 bits.
#[derive(Clone)]
pub struct Kek(Zeroizing<Vec<u8>>);

impl Kek {
    /// Accepts exactly 16, 24 or 32 bytes of key material.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            16 | 24 | 32 => Ok(Kek(Zeroizing::new(bytes.to_vec()))),
            n => Err(Error::Configuration(format!(
                "KEK must be 16, 24 or 32 bytes (got {})",
                n
            ))),
        }
    }

    /// Parse a KEK from 32, 48 or 64 hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(hex_str.trim())
                .map_err(|_| Error::Configuration("KEK is not valid hex".to_owned()))?,
        );
        Kek::from_bytes(&bytes)
    }

    /// Generate a fresh 256-bit KEK
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new(vec![0u8; 32]);
        OsRng.fill_bytes(&mut bytes);
        Kek(bytes)
    }

    pub fn bits(&self) -> usize {
        self.0.len() * 8
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&*self.0))
    }

    fn seal(&self, nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, aead::Error> {
        let payload = Payload { msg, aad };
        match self.0.len() {
            16 => seal_with::<Aes128Gcm>(&self.0, nonce, payload),
            24 => seal_with::<Aes192Gcm>(&self.0, nonce, payload),
            _ => seal_with::<Aes256Gcm>(&self.0, nonce, payload),
        }
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, aead::Error> {
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match self.0.len() {
            16 => open_with::<Aes128Gcm>(&self.0, nonce, payload),
            24 => open_with::<Aes192Gcm>(&self.0, nonce, payload),
            _ => open_with::<Aes256Gcm>(&self.0, nonce, payload),
        }
    }
}

impl std::fmt::Debug for Kek {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Kek(AES-{})", self.bits())
    }
}

fn seal_with<C: NewAead + Aead>(
    key: &[u8],
    nonce: &[u8],
    payload: Payload,
) -> Result<Vec<u8>, aead::Error> {
    let cipher = C::new(GenericArray::from_slice(key));
    cipher.encrypt(GenericArray::from_slice(nonce), payload)
}

fn open_with<C: NewAead + Aead>(
    key: &[u8],
    nonce: &[u8],
    payload: Payload,
) -> Result<Vec<u8>, aead::Error> {
    let cipher = C::new(GenericArray::from_slice(key));
    cipher.decrypt(GenericArray::from_slice(nonce), payload)
}

/// 256-bit data-encryption key. Zeroed on drop.
pub struct DataKey(Zeroizing<[u8; DATA_KEY_LEN]>);

impl DataKey {
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; DATA_KEY_LEN]);
        OsRng.fill_bytes(&mut *key);
        DataKey(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != DATA_KEY_LEN {
            return Err(Error::MalformedKey(format!(
                "data key must be {} bytes (got {})",
                DATA_KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; DATA_KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(DataKey(key))
    }

    pub fn as_bytes(&self) -> &[u8; DATA_KEY_LEN] {
        &self.0
    }
}

impl PartialEq for DataKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "DataKey(..)")
    }
}

/// A data key wrapped under a KEK: `nonce || ciphertext || tag`
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedKey([u8; WRAPPED_KEY_LEN]);

impl WrappedKey {
    /// Any blob that is not exactly 60 bytes is rejected as unwrappable.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != WRAPPED_KEY_LEN {
            return Err(Error::KeyUnwrap);
        }
        let mut blob = [0u8; WRAPPED_KEY_LEN];
        blob.copy_from_slice(bytes);
        Ok(WrappedKey(blob))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| Error::KeyUnwrap)?;
        WrappedKey::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn nonce(&self) -> &[u8] {
        &self.0[..NONCE_LEN]
    }

    /// Ciphertext with the trailing tag (the layout AES-GCM decrypt expects)
    fn sealed(&self) -> &[u8] {
        &self.0[NONCE_LEN..]
    }

    pub fn tag(&self) -> &[u8] {
        &self.0[WRAPPED_KEY_LEN - TAG_LEN..]
    }
}

impl std::fmt::Display for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..]))
    }
}

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "WrappedKey({})", self)
    }
}

/// KMS facade
///
/// Holds the KEK for the lifetime of the process and hands out the active data key.
/// Only the *wrapped* form of the active key is ever cached.
pub struct KeyManager {
    kek: Kek,
    key_id: String,
    wrapped_key_path: Option<PathBuf>,
    active: Mutex<Option<WrappedKey>>,
}

impl KeyManager {
    pub fn new(kek: Kek, key_id: &str) -> Self {
        KeyManager {
            kek,
            key_id: key_id.to_owned(),
            wrapped_key_path: None,
            active: Mutex::new(None),
        }
    }

    /// Persist (and look for) the active wrapped data key at `path`
    pub fn with_wrapped_key_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.wrapped_key_path = Some(path.into());
        self
    }

    pub fn from_config(config: &Config) -> Self {
        KeyManager::new(config.kek.clone(), &config.data_key_id)
            .with_wrapped_key_path(config.wrapped_key_path.clone())
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn wrapped_key_path(&self) -> Option<&Path> {
        self.wrapped_key_path.as_deref()
    }

    /// Wrap a data key under the KEK, with the key id as AAD
    pub fn wrap_key(&self, dek: &DataKey) -> Result<WrappedKey> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .kek
            .seal(&nonce, dek.as_bytes(), self.key_id.as_bytes())
            .map_err(|_| Error::Encryption)?;

        let mut blob = Vec::with_capacity(WRAPPED_KEY_LEN);
        blob.extend_from_slice(&nonce);
        blob.extend(sealed);
        WrappedKey::from_bytes(&blob)
    }

    /// Unwrap a 60-byte blob. Fails closed with `KeyUnwrap` on any authentication failure.
    pub fn unwrap_key(&self, blob: &[u8]) -> Result<DataKey> {
        let wrapped = WrappedKey::from_bytes(blob)?;
        let plain = Zeroizing::new(
            self.kek
                .open(wrapped.nonce(), wrapped.sealed(), self.key_id.as_bytes())
                .map_err(|_| Error::KeyUnwrap)?,
        );
        DataKey::from_bytes(&plain).map_err(|_| Error::KeyUnwrap)
    }

    /// Returns a fresh plaintext DEK and its wrapped form
    pub fn generate_data_key(&self) -> Result<(DataKey, WrappedKey)> {
        let dek = DataKey::generate();
        let wrapped = self.wrap_key(&dek)?;
        Ok((dek, wrapped))
    }

    /// Get the active data key, creating and persisting it on first use.
    ///
    /// The persisted blob is re-unwrapped on every call. An existing blob that fails to
    /// unwrap is an error; it is never silently replaced.
    pub fn get_or_create_active_key(&self) -> Result<DataKey> {
        // Lock held across creation so concurrent callers agree on one key
        let mut active = self
            .active
            .lock()
            .map_err(|_| Error::Corrupt("key manager lock poisoned".to_owned()))?;

        if let Some(wrapped) = active.as_ref() {
            return self.unwrap_key(wrapped.as_bytes());
        }

        if let Some(path) = &self.wrapped_key_path {
            if path.exists() {
                let blob = fs::read(path)?;
                let wrapped = WrappedKey::from_bytes(&blob)?;
                let dek = self.unwrap_key(wrapped.as_bytes())?;
                debug!("loaded wrapped data key {} from {}", self.key_id, path.display());
                *active = Some(wrapped);
                return Ok(dek);
            }
        }

        let (dek, wrapped) = self.generate_data_key()?;
        if let Some(path) = &self.wrapped_key_path {
            write_secret_file(path, wrapped.as_bytes())?;
            info!("created wrapped data key {} at {}", self.key_id, path.display());
        } else {
            info!("created in-memory wrapped data key {}", self.key_id);
        }
        *active = Some(wrapped);

        Ok(dek)
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("kek", &self.kek)
            .field("key_id", &self.key_id)
            .field("wrapped_key_path", &self.wrapped_key_path)
            .finish()
    }
}

/// Atomically write `bytes` to `path` with owner-only permissions
pub(crate) fn write_secret_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(bytes)?;
    temp.as_file_mut().flush()?;
    #[cfg(unix)]
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;

    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
