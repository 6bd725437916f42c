//! Slack token rotation (`oauth.v2.access` with `grant_type=refresh_token`).
//!
//! Slack answers most failures with HTTP 200 and `{"ok": false, "error": ...}`,
//! so the body has to be inspected even on success statuses.

use {
    async_trait::async_trait,
    credvault_vault::{RefreshError, SecureToken, TokenProvider},
    reqwest::{StatusCode, header::HeaderMap},
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
};

use crate::{
    defaults::ProviderSettings,
    response::{error_for_status, retry_after, transport_error},
};

/// Slack error codes meaning the refresh token will never work again.
const TERMINAL_ERRORS: &[&str] = &[
    "invalid_refresh_token",
    "invalid_grant",
    "token_revoked",
    "token_expired",
    "invalid_auth",
    "account_inactive",
];

#[derive(Debug, Default, Deserialize)]
struct SlackTokens {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    tokens: SlackTokens,
    /// User-token installs nest the rotated credentials here.
    #[serde(default)]
    authed_user: Option<SlackTokens>,
}

impl SlackResponse {
    fn into_token(self) -> Result<SecureToken, RefreshError> {
        let has_top_level = self
            .tokens
            .access_token
            .as_deref()
            .is_some_and(|t| !t.is_empty());
        let tokens = match self.authed_user {
            Some(user) if !has_top_level => user,
            _ => self.tokens,
        };
        let access = tokens
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RefreshError::MalformedResponse("missing access_token".into()))?;
        Ok(SecureToken::new(access)
            .with_refresh_token(tokens.refresh_token.filter(|t| !t.is_empty()).map(Secret::new))
            .with_expires_in(tokens.expires_in)
            .with_token_type(tokens.token_type)
            .with_scope(tokens.scope))
    }
}

fn classify_slack_error(status: StatusCode, headers: &HeaderMap, code: String) -> RefreshError {
    if TERMINAL_ERRORS.contains(&code.as_str()) {
        return RefreshError::InvalidGrant(code);
    }
    if code == "ratelimited" {
        return RefreshError::RateLimited {
            retry_after: retry_after(headers),
        };
    }
    RefreshError::Rejected {
        status: status.as_u16(),
        code,
    }
}

pub struct SlackProvider {
    settings: ProviderSettings,
    client: reqwest::Client,
}

impl SlackProvider {
    pub fn new(settings: ProviderSettings, client: reqwest::Client) -> Self {
        Self { settings, client }
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }
}

#[async_trait]
impl TokenProvider for SlackProvider {
    fn service(&self) -> &str {
        &self.settings.service
    }

    async fn refresh(&self, refresh_token: &Secret<String>) -> Result<SecureToken, RefreshError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret().as_str()),
            ("client_id", self.settings.client_id.as_str()),
        ];
        if let Some(secret) = &self.settings.client_secret {
            form.push(("client_secret", secret.expose_secret().as_str()));
        }

        let resp = self
            .client
            .post(self.settings.token_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await.map_err(|e| transport_error(&e))?;

        if !status.is_success() {
            return Err(error_for_status(status, &headers, &body));
        }

        let parsed: SlackResponse = serde_json::from_str(&body)
            .map_err(|e| RefreshError::MalformedResponse(e.to_string()))?;
        if !parsed.ok {
            let code = parsed.error.unwrap_or_else(|| "unknown_error".into());
            return Err(classify_slack_error(status, &headers, code));
        }
        parsed.into_token()
    }

    /// `auth.revoke` authenticates with the token being revoked, and only
    /// accepts an access token as the bearer.
    async fn revoke(&self, token: &SecureToken) -> Result<(), RefreshError> {
        let Some(url) = &self.settings.revoke_url else {
            tracing::debug!(service = %self.settings.service, "no revocation endpoint configured");
            return Ok(());
        };

        let resp = self
            .client
            .post(url.clone())
            .bearer_auth(token.access_token())
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(error_for_status(status, &headers, &body));
        }

        let parsed: SlackResponse = serde_json::from_str(&body).unwrap_or_default();
        if parsed.ok {
            Ok(())
        } else {
            let code = parsed.error.unwrap_or_else(|| "unknown_error".into());
            Err(classify_slack_error(status, &headers, code))
        }
    }

    fn keeps_refresh_token_when_omitted(&self) -> bool {
        self.settings.keep_refresh_token_when_omitted
    }

    fn default_lifetime_secs(&self) -> Option<u64> {
        self.settings.default_lifetime_secs
    }
}
