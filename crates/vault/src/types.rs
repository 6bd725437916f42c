use std::{collections::BTreeSet, fmt};

use {
    chrono::{DateTime, Utc},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::error::VaultError;

/// Identity of a vault entry: one per `(user, service, agent?)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VaultKey {
    pub user_id: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl VaultKey {
    pub fn new(user_id: &str, service: &str, agent_id: Option<&str>) -> Self {
        Self {
            user_id: user_id.to_string(),
            service: service.to_string(),
            agent_id: agent_id.filter(|a| !a.is_empty()).map(str::to_string),
        }
    }
}

impl fmt::Display for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.service)?;
        if let Some(agent) = &self.agent_id {
            write!(f, "@{agent}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    #[serde(rename = "oauth")]
    OAuth,
    ApiKey,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OAuth => "oauth",
            Self::ApiKey => "api_key",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "oauth" => Some(Self::OAuth),
            "api_key" => Some(Self::ApiKey),
            _ => None,
        }
    }
}

/// Live credential material. Only ever held for the duration of one call.
#[derive(Clone)]
pub struct SecureToken {
    access_token: Secret<String>,
    refresh_token: Option<Secret<String>>,
    expires_in: Option<u64>,
    token_type: Option<String>,
    scope: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl SecureToken {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self::from_secret(Secret::new(access_token.into()))
    }

    pub fn from_secret(access_token: Secret<String>) -> Self {
        Self {
            access_token,
            refresh_token: None,
            expires_in: None,
            token_type: None,
            scope: None,
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: Option<Secret<String>>) -> Self {
        self.refresh_token = refresh_token;
        self
    }

    #[must_use]
    pub fn with_expires_in(mut self, expires_in: Option<u64>) -> Self {
        self.expires_in = expires_in;
        self
    }

    #[must_use]
    pub fn with_token_type(mut self, token_type: Option<String>) -> Self {
        self.token_type = token_type;
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_ref().map(|s| s.expose_secret().as_str())
    }

    pub(crate) fn refresh_secret(&self) -> Option<&Secret<String>> {
        self.refresh_token.as_ref()
    }

    /// Lifetime in seconds as reported at issuance.
    pub fn expires_in(&self) -> Option<u64> {
        self.expires_in
    }

    pub fn token_type(&self) -> Option<&str> {
        self.token_type.as_deref()
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

impl fmt::Debug for SecureToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureToken")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Raw token payload pushed by the authorization-code exchange.
#[derive(Clone, Deserialize)]
pub struct TokenPayload {
    pub access_token: Secret<String>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default, alias = "lifetime_seconds")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Provider-specific extras (team ids, id tokens, ...), kept as entry metadata.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenPayload {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: None,
            expires_in: None,
            token_type: None,
            scope: None,
            extra: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(refresh_token.into()));
        self
    }

    #[must_use]
    pub fn expires_in(mut self, secs: u64) -> Self {
        self.expires_in = Some(secs);
        self
    }

    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

impl fmt::Debug for TokenPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPayload")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("extra_keys", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Persisted, non-secret description of a stored credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultEntry {
    pub key: VaultKey,
    pub kind: TokenKind,
    pub scopes: BTreeSet<String>,
    /// Absolute UTC expiry. `None` means unknown.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Set when a refresh terminally failed; the entry needs re-authorization.
    pub invalid: bool,
    /// Bumped by the store on every write; used for conditional replacement.
    pub revision: u64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl VaultEntry {
    pub fn new(key: VaultKey, kind: TokenKind, now: DateTime<Utc>) -> Self {
        Self {
            key,
            kind,
            scopes: BTreeSet::new(),
            expires_at: None,
            created_at: now,
            updated_at: now,
            last_used_at: None,
            invalid: false,
            revision: 0,
            metadata: serde_json::Map::new(),
        }
    }
}

/// Split a granted-scope string on whitespace or commas (Slack uses commas).
pub fn parse_scopes(scope: &str) -> BTreeSet<String> {
    scope
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Result of one refresh attempt, shared verbatim with every waiter.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Refreshed(SecureToken),
    Failed(VaultError),
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Refreshed(_))
    }

    pub fn into_result(self) -> Result<SecureToken, VaultError> {
        match self {
            Self::Refreshed(token) => Ok(token),
            Self::Failed(err) => Err(err),
        }
    }
}
