//! Upstream refresh providers for the credential vault.
//!
//! [`OAuth2Provider`] speaks plain RFC 6749 refresh and RFC 7009 revocation
//! and covers Google as well as any standards-compliant service.
//! [`SlackProvider`] handles Slack's `ok`/`error` envelope and token rotation.
//! [`build_registry`] turns the `[providers]` config table into a
//! [`credvault_vault::ProviderRegistry`].

pub mod defaults;
pub mod oauth2;
mod response;
pub mod registry;
pub mod slack;

pub use {
    defaults::{ProviderSettings, resolve_provider_settings},
    oauth2::OAuth2Provider,
    registry::{build_registry, build_registry_with, http_client},
    slack::SlackProvider,
};
