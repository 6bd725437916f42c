//! Error taxonomy shared by every vault component.
//!
//! Callers need to tell three situations apart: the integration was never
//! connected, it is connected but needs the user to re-authorize, or the
//! failure is temporary. [`VaultError::requires_reauthorization`] and
//! [`VaultError::is_retryable`] answer those questions without matching on
//! individual variants.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the vault.
pub type Result<T, E = VaultError> = std::result::Result<T, E>;

/// Errors surfaced by the vault facade and the refresh coordinator.
///
/// `Clone` so a single refresh outcome can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    /// No entry exists for the key.
    #[error("{0} is not connected")]
    NotConnected(String),

    /// The entry exists but holds no refresh token, so it cannot self-refresh.
    #[error("{0} has no refresh token; re-authorization required")]
    RefreshTokenMissing(String),

    /// The provider terminally rejected the refresh token, or the entry was
    /// already marked invalid by an earlier rejection.
    #[error("{0} must be re-authorized")]
    ReauthorizationRequired(String),

    /// Network failure or rate limiting. The entry is unchanged.
    #[error("temporary refresh failure: {message}")]
    RefreshTransient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The provider answered, but with something the vault cannot use
    /// (unexpected status or a malformed body). The entry is unchanged.
    #[error("provider error for {service}: {message}")]
    Provider { service: String, message: String },

    /// No refresh strategy is registered for the service.
    #[error("no refresh provider registered for service {0}")]
    UnknownProvider(String),

    /// Backing store unavailable or failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Key material is absent or invalid, or ciphertext failed to open.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Ciphertext is tagged with a key version the cipher does not hold.
    #[error("no key for version {0}")]
    KeyNotFound(u32),
}

impl VaultError {
    /// Transient failures the caller may retry later with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RefreshTransient { .. } | Self::Storage(_))
    }

    /// Failures only a new authorization by the user can fix.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            Self::RefreshTokenMissing(_) | Self::ReauthorizationRequired(_)
        )
    }
}

/// Failure classes reported by a provider refresh or revoke call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    /// Connection, TLS, timeout or 5xx. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP 429 or a provider-specific rate-limit signal. Retryable.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The refresh token is revoked, expired or otherwise invalid. Terminal.
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    /// Any other non-success answer (e.g. `invalid_client`). Terminal for
    /// this call but says nothing about the stored token.
    #[error("provider rejected request ({status}): {code}")]
    Rejected { status: u16, code: String },

    /// The response did not match the provider's documented contract.
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl RefreshError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited { .. })
    }

    /// Whether the stored credential itself is dead.
    pub fn invalidates_token(&self) -> bool {
        matches!(self, Self::InvalidGrant(_))
    }
}

/// Errors from sealing or opening token material.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("active key version {0} is not configured")]
    MissingActiveKey(u32),
    #[error("key version {version} is invalid: {reason}")]
    InvalidKey { version: String, reason: String },
    #[error("no key for version {0}")]
    KeyNotFound(u32),
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
    #[error("ciphertext failed authentication")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

impl From<CipherError> for VaultError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::KeyNotFound(v) => Self::KeyNotFound(v),
            other => Self::Encryption(other.to_string()),
        }
    }
}

/// Errors from a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<StoreError> for VaultError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}
