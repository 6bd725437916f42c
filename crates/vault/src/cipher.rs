//! Field-level encryption for token material at rest.
//!
//! Sealed values have the form `v{version}:{base64(nonce || ciphertext)}`
//! using XChaCha20-Poly1305 with a fresh random 192-bit nonce per call, so
//! sealing the same token twice never yields the same ciphertext. The version
//! tag lets old keys keep opening data after the active key rotates.

use std::{collections::BTreeMap, fmt};

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    chacha20poly1305::{
        XChaCha20Poly1305, XNonce,
        aead::{Aead, AeadCore, KeyInit, OsRng},
    },
    credvault_config::CipherConfig,
    secrecy::{ExposeSecret, Secret},
    zeroize::Zeroizing,
};

use crate::error::CipherError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// Keyring of XChaCha20-Poly1305 keys indexed by version.
pub struct Cipher {
    keys: BTreeMap<u32, XChaCha20Poly1305>,
    active: u32,
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("active", &self.active)
            .field("versions", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Cipher {
    /// Build from raw 32-byte keys. The active version must be present.
    pub fn new(
        keys: impl IntoIterator<Item = (u32, Secret<[u8; KEY_LEN]>)>,
        active: u32,
    ) -> Result<Self, CipherError> {
        let keys: BTreeMap<u32, XChaCha20Poly1305> = keys
            .into_iter()
            .map(|(version, key)| {
                let aead = XChaCha20Poly1305::new_from_slice(key.expose_secret()).map_err(|_| {
                    CipherError::InvalidKey {
                        version: version.to_string(),
                        reason: "wrong length".into(),
                    }
                })?;
                Ok((version, aead))
            })
            .collect::<Result<BTreeMap<_, _>, CipherError>>()?;

        if !keys.contains_key(&active) {
            return Err(CipherError::MissingActiveKey(active));
        }
        Ok(Self { keys, active })
    }

    /// Build from configuration: every key is base64 of exactly 32 bytes.
    pub fn from_config(config: &CipherConfig) -> Result<Self, CipherError> {
        let mut keys = Vec::with_capacity(config.keys.len());
        for (version, encoded) in &config.keys {
            let parsed: u32 = version.trim().parse().map_err(|_| CipherError::InvalidKey {
                version: version.clone(),
                reason: "version is not an integer".into(),
            })?;
            keys.push((parsed, decode_key(version, encoded)?));
        }
        Self::new(keys, config.active_key_version)
    }

    pub fn active_version(&self) -> u32 {
        self.active
    }

    /// Encrypt under the active key.
    pub fn seal(&self, plaintext: &str) -> Result<String, CipherError> {
        let aead = self
            .keys
            .get(&self.active)
            .ok_or(CipherError::MissingActiveKey(self.active))?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = aead
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(format!("v{}:{}", self.active, STANDARD.encode(blob)))
    }

    /// Decrypt a value produced by [`Cipher::seal`] under any held key version.
    pub fn open(&self, sealed: &str) -> Result<Secret<String>, CipherError> {
        let (version, body) = split_sealed(sealed)?;
        let aead = self
            .keys
            .get(&version)
            .ok_or(CipherError::KeyNotFound(version))?;

        let blob = STANDARD
            .decode(body)
            .map_err(|e| CipherError::Malformed(e.to_string()))?;
        if blob.len() < NONCE_LEN {
            return Err(CipherError::Malformed("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            aead.decrypt(XNonce::from_slice(nonce), ciphertext)
                .map_err(|_| CipherError::Decrypt)?,
        );
        let text = String::from_utf8(plaintext.to_vec())
            .map_err(|_| CipherError::Malformed("plaintext is not utf-8".into()))?;
        Ok(Secret::new(text))
    }

    /// Whether `sealed` was produced under a key other than the active one.
    pub fn needs_reseal(&self, sealed: &str) -> bool {
        split_sealed(sealed).is_ok_and(|(version, _)| version != self.active)
    }
}

fn split_sealed(sealed: &str) -> Result<(u32, &str), CipherError> {
    let (tag, body) = sealed
        .split_once(':')
        .ok_or_else(|| CipherError::Malformed("missing version tag".into()))?;
    let version = tag
        .strip_prefix('v')
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| CipherError::Malformed(format!("bad version tag {tag:?}")))?;
    Ok((version, body))
}

fn decode_key(version: &str, encoded: &Secret<String>) -> Result<Secret<[u8; KEY_LEN]>, CipherError> {
    let invalid = |reason: &str| CipherError::InvalidKey {
        version: version.to_string(),
        reason: reason.to_string(),
    };
    let bytes = Zeroizing::new(
        STANDARD
            .decode(encoded.expose_secret().trim())
            .map_err(|_| invalid("not valid base64"))?,
    );
    let key: [u8; KEY_LEN] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| invalid("expected 32 bytes"))?;
    Ok(Secret::new(key))
}

/// Generate a fresh random key, base64-encoded for the config file.
pub fn generate_key() -> String {
    STANDARD.encode(XChaCha20Poly1305::generate_key(&mut OsRng))
}
