//! Durable persistence of vault entries.
//!
//! A [`StoreBackend`] only ever sees [`SealedRecord`]s: token fields are
//! ciphertext. [`TokenStore`] sits on top, sealing on write and opening on
//! read, so plaintext exists only inside the call that asked for it.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
};

use crate::{
    cipher::Cipher,
    error::{Result, StoreError},
    types::{SecureToken, VaultEntry, VaultKey},
};

pub use {memory::MemoryStore, sqlite::SqliteStore};

/// A vault entry with its token fields sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedRecord {
    pub entry: VaultEntry,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

/// Storage backend for sealed records.
///
/// Every write is atomic: readers observe either the previous record or the
/// new one, never a mix.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Insert or overwrite the record at `record.entry.key`. `created_at` of an
    /// existing row is preserved and the revision is bumped. Returns the
    /// revision now stored.
    async fn put(&self, record: SealedRecord) -> Result<u64, StoreError>;

    /// Overwrite only if the stored revision still equals `expected_revision`.
    /// Returns `false` when the row changed or vanished in the meantime.
    async fn replace(
        &self,
        record: SealedRecord,
        expected_revision: u64,
    ) -> Result<bool, StoreError>;

    async fn get(&self, key: &VaultKey) -> Result<Option<SealedRecord>, StoreError>;

    /// Returns whether a row was removed.
    async fn delete(&self, key: &VaultKey) -> Result<bool, StoreError>;

    /// Flag the entry as needing re-authorization if its revision is still
    /// `expected_revision`. Bumps the revision.
    async fn mark_invalid(
        &self,
        key: &VaultKey,
        expected_revision: u64,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Record a successful hand-off. Does not bump the revision.
    async fn touch(&self, key: &VaultKey, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Entries (without token material) belonging to a user.
    async fn list_user(&self, user_id: &str) -> Result<Vec<VaultEntry>, StoreError>;

    /// Every record; used for key rotation.
    async fn scan(&self) -> Result<Vec<SealedRecord>, StoreError>;
}

/// Encrypting store composed of a backend and a cipher.
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn StoreBackend>,
    cipher: Arc<Cipher>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn StoreBackend>, cipher: Arc<Cipher>) -> Self {
        Self { backend, cipher }
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    fn seal(&self, entry: VaultEntry, token: &SecureToken) -> Result<SealedRecord> {
        Ok(SealedRecord {
            entry,
            access_token: self.cipher.seal(token.access_token())?,
            refresh_token: token
                .refresh_token()
                .map(|rt| self.cipher.seal(rt))
                .transpose()?,
            token_type: token.token_type().map(str::to_string),
            scope: token.scope().map(str::to_string),
        })
    }

    fn open(&self, record: SealedRecord) -> Result<(VaultEntry, SecureToken)> {
        let access = self.cipher.open(&record.access_token)?;
        let refresh = record
            .refresh_token
            .as_deref()
            .map(|rt| self.cipher.open(rt))
            .transpose()?;
        let token = SecureToken::from_secret(access)
            .with_refresh_token(refresh)
            .with_token_type(record.token_type)
            .with_scope(record.scope)
            .with_expires_at(record.entry.expires_at);
        Ok((record.entry, token))
    }

    /// Seal and write, overwriting any existing entry. Returns the stored entry.
    pub async fn put(&self, mut entry: VaultEntry, token: &SecureToken) -> Result<VaultEntry> {
        let record = self.seal(entry.clone(), token)?;
        entry.revision = self.backend.put(record).await?;
        Ok(entry)
    }

    /// Conditional overwrite; see [`StoreBackend::replace`].
    pub async fn replace(
        &self,
        entry: VaultEntry,
        token: &SecureToken,
        expected_revision: u64,
    ) -> Result<bool> {
        let record = self.seal(entry, token)?;
        Ok(self.backend.replace(record, expected_revision).await?)
    }

    /// Read and open an entry. `None` means not connected.
    pub async fn get(&self, key: &VaultKey) -> Result<Option<(VaultEntry, SecureToken)>> {
        match self.backend.get(key).await? {
            Some(record) => self.open(record).map(Some),
            None => Ok(None),
        }
    }

    /// Entry metadata only; nothing is decrypted.
    pub async fn entry(&self, key: &VaultKey) -> Result<Option<VaultEntry>> {
        Ok(self.backend.get(key).await?.map(|r| r.entry))
    }

    pub async fn delete(&self, key: &VaultKey) -> Result<bool> {
        Ok(self.backend.delete(key).await?)
    }

    pub async fn mark_invalid(
        &self,
        key: &VaultKey,
        expected_revision: u64,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.backend.mark_invalid(key, expected_revision, at).await?)
    }

    pub async fn touch(&self, key: &VaultKey, at: DateTime<Utc>) -> Result<()> {
        Ok(self.backend.touch(key, at).await?)
    }

    pub async fn list_user(&self, user_id: &str) -> Result<Vec<VaultEntry>> {
        Ok(self.backend.list_user(user_id).await?)
    }

    /// Re-seal every record not sealed under the active key. Returns how many
    /// records were rewritten. Records that changed concurrently are skipped
    /// and picked up by the next run.
    pub async fn reseal_all(&self) -> Result<usize> {
        let mut rewritten = 0;
        for record in self.backend.scan().await? {
            let stale = self.cipher.needs_reseal(&record.access_token)
                || record
                    .refresh_token
                    .as_deref()
                    .is_some_and(|rt| self.cipher.needs_reseal(rt));
            if !stale {
                continue;
            }
            let revision = record.entry.revision;
            let key = record.entry.key.clone();
            let (entry, token) = self.open(record)?;
            if self.replace(entry, &token, revision).await? {
                rewritten += 1;
            } else {
                tracing::debug!(key = %key, "entry changed during reseal, skipping");
            }
        }
        Ok(rewritten)
    }
}
