//! Encrypted credential vault for third-party OAuth tokens and API keys.
//!
//! Tokens are sealed with a versioned XChaCha20-Poly1305 [`Cipher`] before
//! they reach a [`StoreBackend`]. Reads go through the [`Vault`] facade, which
//! hands out a token only if it stays valid for the configured skew; stale
//! tokens are refreshed through the [`RefreshCoordinator`] so that concurrent
//! callers for the same key share a single upstream request.

pub mod cipher;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod expiry;
pub mod provider;
pub mod store;
pub mod types;
pub mod vault;

pub use {
    cipher::{Cipher, generate_key},
    clock::{Clock, ManualClock, SystemClock},
    coordinator::RefreshCoordinator,
    error::{CipherError, RefreshError, Result, StoreError, VaultError},
    expiry::{DEFAULT_SKEW_SECS, ExpiryPolicy, compute_expiry, is_refresh_needed},
    provider::{ProviderRegistry, TokenProvider},
    store::{MemoryStore, SealedRecord, SqliteStore, StoreBackend, TokenStore},
    types::{
        RefreshOutcome, SecureToken, TokenKind, TokenPayload, VaultEntry, VaultKey, parse_scopes,
    },
    vault::{Vault, VaultBuilder},
};
