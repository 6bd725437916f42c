//! SQLite backend. Timestamps are stored as unix milliseconds; an absent
//! agent id is stored as the empty string so it can take part in the
//! primary key.

use std::{collections::BTreeSet, path::Path};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
};

use {
    super::{SealedRecord, StoreBackend},
    crate::{
        error::StoreError,
        types::{TokenKind, VaultEntry, VaultKey},
    },
};

pub struct SqliteStore {
    pool: sqlx::SqlitePool,
}

#[derive(sqlx::FromRow)]
struct VaultRow {
    user_id: String,
    service: String,
    agent_id: String,
    kind: String,
    access_token: String,
    refresh_token: Option<String>,
    token_type: Option<String>,
    scope: Option<String>,
    scopes: String,
    expires_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    last_used_at: Option<i64>,
    invalid: i32,
    revision: i64,
    metadata: String,
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

impl TryFrom<VaultRow> for SealedRecord {
    type Error = StoreError;

    fn try_from(r: VaultRow) -> Result<Self, StoreError> {
        let key = VaultKey::new(&r.user_id, &r.service, Some(&r.agent_id));
        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.to_string(),
            reason,
        };
        let at = |ms: i64| {
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| corrupt(format!("timestamp {ms} out of range")))
        };

        let kind = TokenKind::parse(&r.kind).ok_or_else(|| corrupt(format!("kind {:?}", r.kind)))?;
        let scopes: BTreeSet<String> =
            serde_json::from_str(&r.scopes).map_err(|e| corrupt(format!("scopes: {e}")))?;
        let metadata = serde_json::from_str(&r.metadata)
            .map_err(|e| corrupt(format!("metadata: {e}")))?;

        let entry = VaultEntry {
            kind,
            scopes,
            expires_at: r.expires_at.map(at).transpose()?,
            created_at: at(r.created_at)?,
            updated_at: at(r.updated_at)?,
            last_used_at: r.last_used_at.map(at).transpose()?,
            invalid: r.invalid != 0,
            revision: r.revision as u64,
            metadata,
            key: key.clone(),
        };
        Ok(Self {
            entry,
            access_token: r.access_token,
            refresh_token: r.refresh_token,
            token_type: r.token_type,
            scope: r.scope,
        })
    }
}

fn agent_column(key: &VaultKey) -> &str {
    key.agent_id.as_deref().unwrap_or("")
}

fn json_columns(entry: &VaultEntry) -> Result<(String, String), StoreError> {
    let encode = |what: &str, result: serde_json::Result<String>| {
        result.map_err(|e| StoreError::Corrupt {
            key: entry.key.to_string(),
            reason: format!("{what}: {e}"),
        })
    };
    Ok((
        encode("scopes", serde_json::to_string(&entry.scopes))?,
        encode("metadata", serde_json::to_string(&entry.metadata))?,
    ))
}

impl SqliteStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and ensure the schema exists.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = sqlx::SqlitePool::connect(&url).await?;
        Self::init(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Create the `vault_entries` table if it doesn't exist.
    pub async fn init(pool: &sqlx::SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS vault_entries (
                user_id       TEXT NOT NULL,
                service       TEXT NOT NULL,
                agent_id      TEXT NOT NULL DEFAULT '',
                kind          TEXT NOT NULL,
                access_token  TEXT NOT NULL,
                refresh_token TEXT,
                token_type    TEXT,
                scope         TEXT,
                scopes        TEXT NOT NULL DEFAULT '[]',
                expires_at    INTEGER,
                created_at    INTEGER NOT NULL,
                updated_at    INTEGER NOT NULL,
                last_used_at  INTEGER,
                invalid       INTEGER NOT NULL DEFAULT 0,
                revision      INTEGER NOT NULL DEFAULT 1,
                metadata      TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (user_id, service, agent_id)
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vault_entries_user ON vault_entries(user_id)")
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for SqliteStore {
    async fn put(&self, record: SealedRecord) -> Result<u64, StoreError> {
        let entry = &record.entry;
        let (scopes, metadata) = json_columns(entry)?;
        let revision: i64 = sqlx::query_scalar(
            r#"INSERT INTO vault_entries (
                   user_id, service, agent_id, kind, access_token, refresh_token,
                   token_type, scope, scopes, expires_at, created_at, updated_at,
                   last_used_at, invalid, revision, metadata)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
               ON CONFLICT(user_id, service, agent_id) DO UPDATE SET
                 kind = excluded.kind,
                 access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 token_type = excluded.token_type,
                 scope = excluded.scope,
                 scopes = excluded.scopes,
                 expires_at = excluded.expires_at,
                 updated_at = excluded.updated_at,
                 last_used_at = excluded.last_used_at,
                 invalid = excluded.invalid,
                 revision = vault_entries.revision + 1,
                 metadata = excluded.metadata
               RETURNING revision"#,
        )
        .bind(&entry.key.user_id)
        .bind(&entry.key.service)
        .bind(agent_column(&entry.key))
        .bind(entry.kind.as_str())
        .bind(&record.access_token)
        .bind(&record.refresh_token)
        .bind(&record.token_type)
        .bind(&record.scope)
        .bind(scopes)
        .bind(entry.expires_at.map(to_ms))
        .bind(to_ms(entry.created_at))
        .bind(to_ms(entry.updated_at))
        .bind(entry.last_used_at.map(to_ms))
        .bind(i32::from(entry.invalid))
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(revision as u64)
    }

    async fn replace(
        &self,
        record: SealedRecord,
        expected_revision: u64,
    ) -> Result<bool, StoreError> {
        let entry = &record.entry;
        let (scopes, metadata) = json_columns(entry)?;
        let result = sqlx::query(
            r#"UPDATE vault_entries SET
                 kind = ?, access_token = ?, refresh_token = ?, token_type = ?,
                 scope = ?, scopes = ?, expires_at = ?, updated_at = ?,
                 last_used_at = ?, invalid = ?, metadata = ?,
                 revision = revision + 1
               WHERE user_id = ? AND service = ? AND agent_id = ? AND revision = ?"#,
        )
        .bind(entry.kind.as_str())
        .bind(&record.access_token)
        .bind(&record.refresh_token)
        .bind(&record.token_type)
        .bind(&record.scope)
        .bind(scopes)
        .bind(entry.expires_at.map(to_ms))
        .bind(to_ms(entry.updated_at))
        .bind(entry.last_used_at.map(to_ms))
        .bind(i32::from(entry.invalid))
        .bind(metadata)
        .bind(&entry.key.user_id)
        .bind(&entry.key.service)
        .bind(agent_column(&entry.key))
        .bind(expected_revision as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: &VaultKey) -> Result<Option<SealedRecord>, StoreError> {
        sqlx::query_as::<_, VaultRow>(
            "SELECT * FROM vault_entries WHERE user_id = ? AND service = ? AND agent_id = ?",
        )
        .bind(&key.user_id)
        .bind(&key.service)
        .bind(agent_column(key))
        .fetch_optional(&self.pool)
        .await?
        .map(SealedRecord::try_from)
        .transpose()
    }

    async fn delete(&self, key: &VaultKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM vault_entries WHERE user_id = ? AND service = ? AND agent_id = ?",
        )
        .bind(&key.user_id)
        .bind(&key.service)
        .bind(agent_column(key))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_invalid(
        &self,
        key: &VaultKey,
        expected_revision: u64,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE vault_entries SET invalid = 1, updated_at = ?, revision = revision + 1
               WHERE user_id = ? AND service = ? AND agent_id = ? AND revision = ?"#,
        )
        .bind(to_ms(at))
        .bind(&key.user_id)
        .bind(&key.service)
        .bind(agent_column(key))
        .bind(expected_revision as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, key: &VaultKey, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE vault_entries SET last_used_at = ?
               WHERE user_id = ? AND service = ? AND agent_id = ?"#,
        )
        .bind(to_ms(at))
        .bind(&key.user_id)
        .bind(&key.service)
        .bind(agent_column(key))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_user(&self, user_id: &str) -> Result<Vec<VaultEntry>, StoreError> {
        sqlx::query_as::<_, VaultRow>(
            "SELECT * FROM vault_entries WHERE user_id = ? ORDER BY service ASC, agent_id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| SealedRecord::try_from(row).map(|r| r.entry))
        .collect()
    }

    async fn scan(&self) -> Result<Vec<SealedRecord>, StoreError> {
        sqlx::query_as::<_, VaultRow>("SELECT * FROM vault_entries")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SealedRecord::try_from)
            .collect()
    }
}
