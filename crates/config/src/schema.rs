/// Config schema types (vault, cipher keys, refresh providers).
use std::collections::HashMap;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, Serializer},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredvaultConfig {
    pub vault: VaultConfig,
    pub cipher: CipherConfig,
    pub providers: ProvidersConfig,
}

/// Storage and expiry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Safety margin before the real expiry at which a token is refreshed.
    pub refresh_skew_secs: u64,
    /// SQLite database path, or `:memory:`. A leading `~` is expanded and missing
    /// parent directories are created. Defaults to `~/.credvault/vault.db`.
    pub db_path: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            refresh_skew_secs: 300,
            db_path: None,
        }
    }
}

/// Encryption keys for token material at rest.
///
/// Keys are base64-encoded 32-byte values indexed by version. Only the active
/// version is used to seal; every listed version can still open.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    pub active_key_version: u32,
    #[serde(serialize_with = "serialize_secret_map")]
    pub keys: HashMap<String, Secret<String>>,
}

/// Refresh providers keyed by service identifier (e.g. "google", "slack").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    #[serde(flatten)]
    pub providers: HashMap<String, ProviderEntry>,
}

/// Which refresh protocol a provider speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Slack,
    #[default]
    Oauth2,
}

/// How client credentials are presented to the token endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    /// `client_id` / `client_secret` as form fields.
    #[default]
    Body,
    /// HTTP basic authentication.
    Basic,
}

/// Configuration for a single refresh provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEntry {
    pub enabled: bool,
    pub kind: ProviderKind,
    pub client_id: String,
    #[serde(serialize_with = "serialize_option_secret")]
    pub client_secret: Option<Secret<String>>,
    /// Override the token endpoint. Required for the generic `oauth2` kind.
    pub token_url: Option<String>,
    /// Override the revocation endpoint.
    pub revoke_url: Option<String>,
    pub client_auth: ClientAuth,
    /// When a refresh response carries no refresh token, keep the old one.
    /// Set to `false` for providers that signal revocation that way.
    pub keep_refresh_token_when_omitted: bool,
    /// Lifetime assumed when the provider omits `expires_in`.
    pub default_lifetime_secs: Option<u64>,
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ProviderKind::default(),
            client_id: String::new(),
            client_secret: None,
            token_url: None,
            revoke_url: None,
            client_auth: ClientAuth::default(),
            keep_refresh_token_when_omitted: true,
            default_lifetime_secs: None,
        }
    }
}

impl ProvidersConfig {
    /// Check if a provider is enabled (defaults to true if not configured).
    pub fn is_enabled(&self, name: &str) -> bool {
        self.providers.get(name).is_none_or(|e| e.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.get(name)
    }
}

fn serialize_secret_map<S: Serializer>(
    map: &HashMap<String, Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(map.iter().map(|(k, v)| (k, v.expose_secret())))
}

fn serialize_option_secret<S: Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
