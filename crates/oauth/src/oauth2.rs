//! Standard OAuth 2.0 refresh (RFC 6749 §6) and revocation (RFC 7009).
//!
//! Used for Google and any provider that follows the RFCs.

use {
    async_trait::async_trait,
    credvault_config::ClientAuth,
    credvault_vault::{RefreshError, SecureToken, TokenProvider},
    secrecy::{ExposeSecret, Secret},
};

use crate::{
    defaults::ProviderSettings,
    response::{error_for_status, parse_success, transport_error},
};

pub struct OAuth2Provider {
    settings: ProviderSettings,
    client: reqwest::Client,
}

impl OAuth2Provider {
    pub fn new(settings: ProviderSettings, client: reqwest::Client) -> Self {
        Self { settings, client }
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// POST a form with client authentication applied as configured.
    fn post_form<'a>(
        &'a self,
        url: &url::Url,
        mut form: Vec<(&'a str, &'a str)>,
        secret: Option<&'a str>,
    ) -> reqwest::RequestBuilder {
        let request = self.client.post(url.clone());
        match self.settings.client_auth {
            ClientAuth::Basic => request
                .basic_auth(&self.settings.client_id, secret)
                .form(&form),
            ClientAuth::Body => {
                form.push(("client_id", self.settings.client_id.as_str()));
                if let Some(secret) = secret {
                    form.push(("client_secret", secret));
                }
                request.form(&form)
            },
        }
    }
}

#[async_trait]
impl TokenProvider for OAuth2Provider {
    fn service(&self) -> &str {
        &self.settings.service
    }

    async fn refresh(&self, refresh_token: &Secret<String>) -> Result<SecureToken, RefreshError> {
        let secret = self
            .settings
            .client_secret
            .as_ref()
            .map(|s| s.expose_secret().as_str());
        let form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret().as_str()),
        ];

        let resp = self
            .post_form(&self.settings.token_url, form, secret)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await.map_err(|e| transport_error(&e))?;

        if !status.is_success() {
            return Err(error_for_status(status, &headers, &body));
        }
        parse_success(&body)?.into_token()
    }

    /// RFC 7009: revoking the refresh token also invalidates the access
    /// tokens issued from it, so it is preferred when stored.
    async fn revoke(&self, token: &SecureToken) -> Result<(), RefreshError> {
        let Some(url) = &self.settings.revoke_url else {
            tracing::debug!(service = %self.settings.service, "no revocation endpoint configured");
            return Ok(());
        };
        let secret = self
            .settings
            .client_secret
            .as_ref()
            .map(|s| s.expose_secret().as_str());
        let form = match token.refresh_token() {
            Some(refresh) => vec![("token", refresh), ("token_type_hint", "refresh_token")],
            None => vec![
                ("token", token.access_token()),
                ("token_type_hint", "access_token"),
            ],
        };

        let resp = self
            .post_form(url, form, secret)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        Err(error_for_status(status, &headers, &body))
    }

    fn keeps_refresh_token_when_omitted(&self) -> bool {
        self.settings.keep_refresh_token_when_omitted
    }

    fn default_lifetime_secs(&self) -> Option<u64> {
        self.settings.default_lifetime_secs
    }
}
