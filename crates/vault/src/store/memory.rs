//! In-process backend. Not durable; used in tests and for ephemeral vaults.

use std::collections::HashMap;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    tokio::sync::RwLock,
};

use {
    super::{SealedRecord, StoreBackend},
    crate::{
        error::StoreError,
        types::{VaultEntry, VaultKey},
    },
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<VaultKey, SealedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn put(&self, mut record: SealedRecord) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let key = record.entry.key.clone();
        if let Some(existing) = records.get(&key) {
            record.entry.created_at = existing.entry.created_at;
            record.entry.revision = existing.entry.revision + 1;
        } else {
            record.entry.revision = 1;
        }
        let revision = record.entry.revision;
        records.insert(key, record);
        Ok(revision)
    }

    async fn replace(
        &self,
        mut record: SealedRecord,
        expected_revision: u64,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let Some(existing) = records.get_mut(&record.entry.key) else {
            return Ok(false);
        };
        if existing.entry.revision != expected_revision {
            return Ok(false);
        }
        record.entry.created_at = existing.entry.created_at;
        record.entry.revision = expected_revision + 1;
        *existing = record;
        Ok(true)
    }

    async fn get(&self, key: &VaultKey) -> Result<Option<SealedRecord>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &VaultKey) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn mark_invalid(
        &self,
        key: &VaultKey,
        expected_revision: u64,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        Ok(match records.get_mut(key) {
            Some(record) if record.entry.revision == expected_revision => {
                record.entry.invalid = true;
                record.entry.updated_at = at;
                record.entry.revision += 1;
                true
            },
            _ => false,
        })
    }

    async fn touch(&self, key: &VaultKey, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(record) = self.records.write().await.get_mut(key) {
            record.entry.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn list_user(&self, user_id: &str) -> Result<Vec<VaultEntry>, StoreError> {
        let mut entries: Vec<VaultEntry> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.entry.key.user_id == user_id)
            .map(|r| r.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn scan(&self) -> Result<Vec<SealedRecord>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::TokenKind;

    fn record(key: &VaultKey, access: &str) -> SealedRecord {
        SealedRecord {
            entry: VaultEntry::new(key.clone(), TokenKind::OAuth, Utc::now()),
            access_token: access.into(),
            refresh_token: None,
            token_type: None,
            scope: None,
        }
    }

    #[tokio::test]
    async fn put_bumps_revision_and_keeps_created_at() {
        let store = MemoryStore::new();
        let key = VaultKey::new("u1", "slack", None);

        assert_eq!(store.put(record(&key, "a")).await.unwrap(), 1);
        let created = store.get(&key).await.unwrap().unwrap().entry.created_at;

        let mut later = record(&key, "b");
        later.entry.created_at = created + chrono::Duration::hours(1);
        assert_eq!(store.put(later).await.unwrap(), 2);

        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "b");
        assert_eq!(stored.entry.created_at, created);
    }

    #[tokio::test]
    async fn replace_requires_matching_revision() {
        let store = MemoryStore::new();
        let key = VaultKey::new("u1", "slack", None);
        store.put(record(&key, "a")).await.unwrap();

        assert!(!store.replace(record(&key, "stale"), 0).await.unwrap());
        assert!(store.replace(record(&key, "b"), 1).await.unwrap());
        assert!(!store.replace(record(&key, "c"), 1).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().unwrap().access_token, "b");

        let other = VaultKey::new("u2", "slack", None);
        assert!(!store.replace(record(&other, "x"), 0).await.unwrap());
        assert!(store.get(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn touch_does_not_bump_revision() {
        let store = MemoryStore::new();
        let key = VaultKey::new("u1", "slack", None);
        store.put(record(&key, "a")).await.unwrap();

        let at = Utc::now();
        store.touch(&key, at).await.unwrap();
        let entry = store.get(&key).await.unwrap().unwrap().entry;
        assert_eq!(entry.last_used_at, Some(at));
        assert_eq!(entry.revision, 1);

        assert!(!store.mark_invalid(&key, 0, at).await.unwrap());
        assert!(store.mark_invalid(&key, 1, at).await.unwrap());
        let entry = store.get(&key).await.unwrap().unwrap().entry;
        assert!(entry.invalid);
        assert_eq!(entry.revision, 2);
    }

    #[tokio::test]
    async fn list_is_scoped_to_user() {
        let store = MemoryStore::new();
        for (user, service) in [("u1", "slack"), ("u1", "gmail"), ("u2", "slack")] {
            store
                .put(record(&VaultKey::new(user, service, None), "t"))
                .await
                .unwrap();
        }
        let services: Vec<String> = store
            .list_user("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key.service)
            .collect();
        assert_eq!(services, ["gmail", "slack"]);
        assert!(store.delete(&VaultKey::new("u2", "slack", None)).await.unwrap());
        assert!(!store.delete(&VaultKey::new("u2", "slack", None)).await.unwrap());
        assert_eq!(store.scan().await.unwrap().len(), 2);
    }
}
