//! Public facade: look up, store and revoke credentials by `(user, service, agent?)`.

use std::sync::Arc;

use secrecy::Secret;

use crate::{
    cipher::Cipher,
    clock::{Clock, SystemClock},
    coordinator::{RefreshCoordinator, check_usable},
    error::{Result, VaultError},
    expiry::{ExpiryPolicy, compute_expiry},
    provider::ProviderRegistry,
    store::{StoreBackend, TokenStore},
    types::{SecureToken, TokenKind, TokenPayload, VaultEntry, VaultKey, parse_scopes},
};

/// Credential vault. Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Vault {
    store: TokenStore,
    providers: Arc<ProviderRegistry>,
    coordinator: RefreshCoordinator,
    policy: ExpiryPolicy,
    clock: Arc<dyn Clock>,
}

pub struct VaultBuilder {
    backend: Arc<dyn StoreBackend>,
    cipher: Arc<Cipher>,
    providers: ProviderRegistry,
    policy: ExpiryPolicy,
    clock: Arc<dyn Clock>,
}

impl VaultBuilder {
    #[must_use]
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    #[must_use]
    pub fn expiry_policy(mut self, policy: ExpiryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Vault {
        let store = TokenStore::new(self.backend, self.cipher);
        let providers = Arc::new(self.providers);
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            Arc::clone(&providers),
            self.policy,
            Arc::clone(&self.clock),
        );
        Vault {
            store,
            providers,
            coordinator,
            policy: self.policy,
            clock: self.clock,
        }
    }
}

impl Vault {
    pub fn builder(backend: Arc<dyn StoreBackend>, cipher: Arc<Cipher>) -> VaultBuilder {
        VaultBuilder {
            backend,
            cipher,
            providers: ProviderRegistry::new(),
            policy: ExpiryPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn expiry_policy(&self) -> ExpiryPolicy {
        self.policy
    }

    /// Return a token that stays valid for at least the configured skew,
    /// refreshing it first if needed.
    ///
    /// `Ok(None)` means the integration is not connected. A connected but
    /// broken integration is an error (see [`VaultError::requires_reauthorization`]).
    pub async fn get_token(
        &self,
        user_id: &str,
        service: &str,
        agent_id: Option<&str>,
    ) -> Result<Option<SecureToken>> {
        let key = VaultKey::new(user_id, service, agent_id);
        let Some((entry, token)) = self.store.get(&key).await? else {
            tracing::debug!(key = %key, "no credential stored");
            return Ok(None);
        };
        check_usable(&entry, &token)?;

        let token = if self.policy.is_refresh_needed(&entry, self.clock.now()) {
            match self.coordinator.refresh(&key).await {
                Ok(token) => token,
                Err(VaultError::NotConnected(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        } else {
            token
        };

        if let Err(e) = self.store.touch(&key, self.clock.now()).await {
            tracing::warn!(key = %key, error = %e, "failed to record last use");
        }
        Ok(Some(token))
    }

    /// Store the result of an authorization-code exchange, replacing any
    /// existing credential for the key.
    pub async fn store_token(
        &self,
        user_id: &str,
        service: &str,
        payload: TokenPayload,
        agent_id: Option<&str>,
    ) -> Result<VaultEntry> {
        let key = VaultKey::new(user_id, service, agent_id);
        let now = self.clock.now();

        let lifetime = payload.expires_in.or_else(|| {
            self.providers
                .get(service)
                .and_then(|p| p.default_lifetime_secs())
        });
        let mut entry = VaultEntry::new(key, TokenKind::OAuth, now);
        entry.expires_at = lifetime.map(|secs| compute_expiry(now, secs));
        entry.scopes = payload.scope.as_deref().map(parse_scopes).unwrap_or_default();
        entry.metadata = payload.extra;

        let token = SecureToken::from_secret(payload.access_token)
            .with_refresh_token(payload.refresh_token)
            .with_expires_in(payload.expires_in)
            .with_token_type(payload.token_type)
            .with_scope(payload.scope)
            .with_expires_at(entry.expires_at);

        let stored = self.store.put(entry, &token).await?;
        tracing::info!(
            key = %stored.key,
            expires_at = ?stored.expires_at,
            refreshable = token.refresh_token().is_some(),
            "stored oauth credential"
        );
        Ok(stored)
    }

    /// Store a static API key. API keys never expire and are never refreshed.
    pub async fn store_api_key(
        &self,
        user_id: &str,
        service: &str,
        api_key: Secret<String>,
        agent_id: Option<&str>,
    ) -> Result<VaultEntry> {
        let key = VaultKey::new(user_id, service, agent_id);
        let entry = VaultEntry::new(key, TokenKind::ApiKey, self.clock.now());
        let stored = self
            .store
            .put(entry, &SecureToken::from_secret(api_key))
            .await?;
        tracing::info!(key = %stored.key, "stored api key");
        Ok(stored)
    }

    /// Delete the credential and, where supported, ask the provider to revoke
    /// it. Returns whether anything was stored.
    ///
    /// Provider notification is best effort and never blocks local deletion.
    pub async fn revoke(
        &self,
        user_id: &str,
        service: &str,
        agent_id: Option<&str>,
    ) -> Result<bool> {
        let key = VaultKey::new(user_id, service, agent_id);

        // Read first so the provider can be told which token to revoke; an
        // unreadable entry is still deleted.
        let material = match self.store.get(&key).await {
            Ok(found) => found.map(|(_, token)| token),
            Err(e @ (VaultError::Encryption(_) | VaultError::KeyNotFound(_))) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "cannot open credential; deleting without provider revoke"
                );
                None
            },
            Err(e) => return Err(e),
        };

        let removed = self.store.delete(&key).await?;
        if !removed {
            return Ok(false);
        }
        tracing::info!(key = %key, "credential revoked locally");

        if let (Some(token), Some(provider)) = (material, self.providers.get(service))
            && let Err(e) = provider.revoke(&token).await
        {
            tracing::warn!(key = %key, error = %e, "provider revoke failed");
        }
        Ok(true)
    }

    /// Stored connections for a user, without any token material.
    pub async fn list_connections(&self, user_id: &str) -> Result<Vec<VaultEntry>> {
        self.store.list_user(user_id).await
    }

    /// Whether a usable (not invalidated) credential is stored for the key.
    pub async fn is_connected(
        &self,
        user_id: &str,
        service: &str,
        agent_id: Option<&str>,
    ) -> Result<bool> {
        let key = VaultKey::new(user_id, service, agent_id);
        Ok(self
            .store
            .entry(&key)
            .await?
            .is_some_and(|entry| !entry.invalid))
    }

    /// Rewrite every credential sealed under a retired key version.
    pub async fn reseal_all(&self) -> Result<usize> {
        let count = self.store.reseal_all().await?;
        tracing::info!(
            count,
            key_version = self.store.cipher().active_version(),
            "resealed credentials"
        );
        Ok(count)
    }
}
