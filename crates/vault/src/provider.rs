//! Per-service refresh strategies and the registry that resolves them.

use std::{collections::HashMap, fmt, sync::Arc};

use {async_trait::async_trait, secrecy::Secret};

use crate::{error::RefreshError, types::SecureToken};

/// Refresh strategy for one upstream service.
///
/// Implementations perform exactly one network exchange per call and never
/// retry internally; retry policy belongs to the caller.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Service identifier this provider answers for (e.g. `"slack"`).
    fn service(&self) -> &str;

    /// Exchange a refresh token for fresh credentials.
    async fn refresh(&self, refresh_token: &Secret<String>) -> Result<SecureToken, RefreshError>;

    /// Tell the upstream the credential is no longer wanted. Best effort.
    ///
    /// Receives the whole stored token; each provider picks the credential
    /// its revocation endpoint expects.
    async fn revoke(&self, _token: &SecureToken) -> Result<(), RefreshError> {
        Ok(())
    }

    /// Whether a refresh response that omits `refresh_token` means the old
    /// one stays valid. When `false` the stored refresh token is dropped.
    fn keeps_refresh_token_when_omitted(&self) -> bool {
        true
    }

    /// Lifetime assumed when neither the response nor the token carries one.
    fn default_lifetime_secs(&self) -> Option<u64> {
        None
    }
}

/// Service name to provider lookup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn TokenProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own service name, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn TokenProvider>) {
        let service = provider.service().to_string();
        if self.providers.insert(service.clone(), provider).is_some() {
            tracing::debug!(service, "replaced refresh provider");
        }
    }

    #[must_use]
    pub fn with(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn TokenProvider>> {
        self.providers.get(service).cloned()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.providers.contains_key(service)
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("services", &self.services())
            .finish()
    }
}
