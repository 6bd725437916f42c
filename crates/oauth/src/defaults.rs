use {
    anyhow::{Context, Result, bail},
    credvault_config::{ClientAuth, ProviderEntry, ProviderKind},
    secrecy::Secret,
    url::Url,
};

/// Built-in endpoints for a provider kind.
struct Endpoints {
    token_url: &'static str,
    revoke_url: Option<&'static str>,
    default_lifetime_secs: Option<u64>,
}

fn builtin_endpoints(kind: ProviderKind) -> Option<Endpoints> {
    match kind {
        ProviderKind::Google => Some(Endpoints {
            token_url: "https://oauth2.googleapis.com/token",
            revoke_url: Some("https://oauth2.googleapis.com/revoke"),
            default_lifetime_secs: Some(3600),
        }),
        ProviderKind::Slack => Some(Endpoints {
            token_url: "https://slack.com/api/oauth.v2.access",
            revoke_url: Some("https://slack.com/api/auth.revoke"),
            default_lifetime_secs: None,
        }),
        ProviderKind::Oauth2 => None,
    }
}

/// Fully resolved settings for one provider.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub service: String,
    pub kind: ProviderKind,
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
    pub token_url: Url,
    pub revoke_url: Option<Url>,
    pub client_auth: ClientAuth,
    pub keep_refresh_token_when_omitted: bool,
    pub default_lifetime_secs: Option<u64>,
}

/// Prefix of the environment overrides for a provider, e.g.
/// `CREDVAULT_PROVIDER_GOOGLE_WORK_` for `google-work`.
pub fn env_prefix(service: &str) -> String {
    format!(
        "CREDVAULT_PROVIDER_{}_",
        service.to_uppercase().replace(['-', '.'], "_")
    )
}

/// Resolve a provider's settings.
///
/// Priority:
/// 1. Environment variables (`CREDVAULT_PROVIDER_{NAME}_CLIENT_ID`,
///    `_CLIENT_SECRET`, `_TOKEN_URL`, `_REVOKE_URL`), looked up through `env`
/// 2. The config entry
/// 3. Built-in defaults for the provider kind
pub fn resolve_provider_settings(
    service: &str,
    entry: &ProviderEntry,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ProviderSettings> {
    let prefix = env_prefix(service);
    let var = |suffix: &str| env(&format!("{prefix}{suffix}")).filter(|v| !v.is_empty());
    let builtin = builtin_endpoints(entry.kind);

    let client_id = var("CLIENT_ID").unwrap_or_else(|| entry.client_id.clone());
    if client_id.is_empty() {
        bail!("provider {service}: client_id is required (config or {prefix}CLIENT_ID)");
    }
    let client_secret = var("CLIENT_SECRET")
        .map(Secret::new)
        .or_else(|| entry.client_secret.clone());

    let token_url = var("TOKEN_URL")
        .or_else(|| entry.token_url.clone())
        .or_else(|| builtin.as_ref().map(|b| b.token_url.to_string()));
    let Some(token_url) = token_url else {
        bail!("provider {service}: token_url is required for kind oauth2");
    };
    let token_url = Url::parse(&token_url)
        .with_context(|| format!("provider {service}: invalid token_url {token_url:?}"))?;

    let revoke_url = var("REVOKE_URL")
        .or_else(|| entry.revoke_url.clone())
        .or_else(|| builtin.as_ref().and_then(|b| b.revoke_url.map(str::to_string)))
        .map(|raw| {
            Url::parse(&raw)
                .with_context(|| format!("provider {service}: invalid revoke_url {raw:?}"))
        })
        .transpose()?;

    Ok(ProviderSettings {
        service: service.to_string(),
        kind: entry.kind,
        client_id,
        client_secret,
        token_url,
        revoke_url,
        client_auth: entry.client_auth,
        keep_refresh_token_when_omitted: entry.keep_refresh_token_when_omitted,
        default_lifetime_secs: entry
            .default_lifetime_secs
            .or_else(|| builtin.and_then(|b| b.default_lifetime_secs)),
    })
}
