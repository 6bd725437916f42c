use std::{sync::Arc, time::Duration};

use {
    anyhow::{Context, Result},
    credvault_config::{ProviderEntry, ProviderKind, ProvidersConfig},
    credvault_vault::{ProviderRegistry, TokenProvider},
    tracing::{debug, info},
};

use crate::{
    defaults::resolve_provider_settings, oauth2::OAuth2Provider, slack::SlackProvider,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared HTTP client for every refresh provider.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("credvault/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

/// Build the provider registry from config, applying environment overrides.
pub fn build_registry(config: &ProvidersConfig) -> Result<ProviderRegistry> {
    build_registry_with(config, |name| std::env::var(name).ok())
}

/// Like [`build_registry`] with an explicit environment lookup.
pub fn build_registry_with(
    config: &ProvidersConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ProviderRegistry> {
    let client = http_client()?;
    let mut registry = ProviderRegistry::new();

    let mut names: Vec<&String> = config.providers.keys().collect();
    names.sort();
    for name in names {
        if !config.is_enabled(name) {
            debug!(service = %name, "provider disabled, skipping");
            continue;
        }
        let Some(entry) = config.get(name) else {
            continue;
        };
        registry.register(build_provider(name, entry, client.clone(), &env)?);
    }

    info!(providers = ?registry.services(), "refresh providers registered");
    Ok(registry)
}

fn build_provider(
    name: &str,
    entry: &ProviderEntry,
    client: reqwest::Client,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<Arc<dyn TokenProvider>> {
    let settings = resolve_provider_settings(name, entry, env)?;
    Ok(match entry.kind {
        ProviderKind::Google | ProviderKind::Oauth2 => {
            Arc::new(OAuth2Provider::new(settings, client))
        },
        ProviderKind::Slack => Arc::new(SlackProvider::new(settings, client)),
    })
}
