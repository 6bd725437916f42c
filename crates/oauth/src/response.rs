//! Shared parsing and failure classification for token endpoint responses.

use std::time::Duration;

use {
    credvault_vault::{RefreshError, SecureToken},
    reqwest::{
        StatusCode,
        header::{HeaderMap, RETRY_AFTER},
    },
    secrecy::Secret,
    serde::{Deserialize, Deserializer},
};

/// RFC 6749 §5.1 success body. Every field is optional so a missing
/// `access_token` can be reported as a contract violation instead of a
/// parse error.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    pub fn into_token(self) -> Result<SecureToken, RefreshError> {
        let access = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RefreshError::MalformedResponse("missing access_token".into()))?;
        Ok(SecureToken::new(access)
            .with_refresh_token(self.refresh_token.filter(|t| !t.is_empty()).map(Secret::new))
            .with_expires_in(self.expires_in)
            .with_token_type(self.token_type)
            .with_scope(self.scope))
    }
}

/// RFC 6749 §5.2 error body.
#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Some providers send `expires_in` as a string.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }
    Ok(match Option::<NumOrString>::deserialize(deserializer)? {
        Some(NumOrString::Num(n)) => Some(n),
        Some(NumOrString::Str(s)) => s.trim().parse().ok(),
        None => None,
    })
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) fn transport_error(err: &reqwest::Error) -> RefreshError {
    RefreshError::Transport(err.to_string())
}

/// Classify a non-success response from a token or revocation endpoint.
pub(crate) fn error_for_status(status: StatusCode, headers: &HeaderMap, body: &str) -> RefreshError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return RefreshError::RateLimited {
            retry_after: retry_after(headers),
        };
    }
    if status.is_server_error() {
        return RefreshError::Transport(format!("HTTP {status}"));
    }

    let parsed: ErrorResponse = serde_json::from_str(body).unwrap_or_default();
    let code = parsed
        .error
        .unwrap_or_else(|| format!("http_{}", status.as_u16()));
    match code.as_str() {
        "invalid_grant" | "invalid_token" => RefreshError::InvalidGrant(
            parsed
                .error_description
                .unwrap_or_else(|| code.clone()),
        ),
        "slow_down" | "temporarily_unavailable" => RefreshError::RateLimited {
            retry_after: retry_after(headers),
        },
        _ => RefreshError::Rejected {
            status: status.as_u16(),
            code,
        },
    }
}

/// Parse a 2xx token endpoint body.
pub(crate) fn parse_success(body: &str) -> Result<TokenResponse, RefreshError> {
    serde_json::from_str(body).map_err(|e| RefreshError::MalformedResponse(e.to_string()))
}
