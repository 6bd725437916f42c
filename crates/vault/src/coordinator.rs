//! Single-flight token refresh.
//!
//! At most one upstream refresh runs per [`VaultKey`] at a time. The first
//! caller to find a stale token becomes the owner and spawns the refresh as a
//! detached task; everyone arriving while it runs awaits the same shared
//! future and receives the same [`RefreshOutcome`]. Because the work lives in
//! its own task, an owner that gives up waiting does not abort the refresh:
//! it still completes and persists its result for the next caller.
//!
//! The in-flight map is sharded and never held across an await, so refreshes
//! for different keys proceed independently.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    futures::{
        FutureExt,
        future::{BoxFuture, Shared},
    },
    secrecy::Secret,
};

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

use crate::{
    clock::Clock,
    error::{RefreshError, Result, VaultError},
    expiry::{ExpiryPolicy, compute_expiry},
    provider::{ProviderRegistry, TokenProvider},
    store::TokenStore,
    types::{RefreshOutcome, SecureToken, VaultEntry, VaultKey, parse_scopes},
};

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

#[derive(Clone)]
struct InFlight {
    id: u64,
    outcome: SharedRefresh,
}

/// De-duplicates concurrent refreshes and applies their results to the store.
pub struct RefreshCoordinator {
    ctx: Arc<RefreshContext>,
    in_flight: Arc<DashMap<VaultKey, InFlight>>,
    next_id: AtomicU64,
}

/// Everything a detached refresh task needs.
struct RefreshContext {
    store: TokenStore,
    providers: Arc<ProviderRegistry>,
    policy: ExpiryPolicy,
    clock: Arc<dyn Clock>,
}

impl RefreshCoordinator {
    pub fn new(
        store: TokenStore,
        providers: Arc<ProviderRegistry>,
        policy: ExpiryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ctx: Arc::new(RefreshContext {
                store,
                providers,
                policy,
                clock,
            }),
            in_flight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of keys with a refresh currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Refresh `key` if it is still stale, joining any refresh already running.
    ///
    /// Every caller that joins the same flight sees the same outcome.
    pub async fn refresh(&self, key: &VaultKey) -> Result<SecureToken> {
        let outcome = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(flight) => {
                tracing::debug!(key = %key, "joining in-flight refresh");
                #[cfg(feature = "metrics")]
                counter!("credvault_refresh_joined_total", "service" => key.service.clone())
                    .increment(1);
                flight.get().outcome.clone()
            },
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let outcome = self.spawn(key.clone(), id);
                slot.insert(InFlight {
                    id,
                    outcome: outcome.clone(),
                });
                outcome
            },
        };
        outcome.await.into_result()
    }

    fn spawn(&self, key: VaultKey, id: u64) -> SharedRefresh {
        let ctx = Arc::clone(&self.ctx);
        let in_flight = Arc::clone(&self.in_flight);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let outcome = ctx.run(&task_key).await;
            in_flight.remove_if(&task_key, |_, flight| flight.id == id);
            outcome
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "refresh task did not complete");
                    RefreshOutcome::Failed(VaultError::RefreshTransient {
                        message: format!("refresh task did not complete: {e}"),
                        retry_after: None,
                    })
                },
            }
        }
        .boxed()
        .shared()
    }
}

impl RefreshContext {
    async fn run(&self, key: &VaultKey) -> RefreshOutcome {
        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        let result = self.refresh_once(key).await;

        #[cfg(feature = "metrics")]
        {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) if e.is_retryable() => "transient",
                Err(e) if e.requires_reauthorization() => "reauth",
                Err(_) => "error",
            };
            counter!(
                "credvault_refresh_total",
                "service" => key.service.clone(),
                "outcome" => outcome
            )
            .increment(1);
            histogram!("credvault_refresh_duration_seconds", "service" => key.service.clone())
                .record(start.elapsed().as_secs_f64());
        }

        match result {
            Ok(token) => RefreshOutcome::Refreshed(token),
            Err(err) => RefreshOutcome::Failed(err),
        }
    }

    async fn refresh_once(&self, key: &VaultKey) -> Result<SecureToken> {
        let Some((entry, current)) = self.store.get(key).await? else {
            return Err(VaultError::NotConnected(key.to_string()));
        };
        check_usable(&entry, &current)?;

        // Another flight may have finished between the caller's read and ours.
        if !self.policy.is_refresh_needed(&entry, self.clock.now()) {
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_secret().cloned() else {
            tracing::warn!(key = %key, "token expired and no refresh token is stored");
            if self
                .store
                .mark_invalid(key, entry.revision, self.clock.now())
                .await?
            {
                return Err(VaultError::RefreshTokenMissing(key.to_string()));
            }
            return self.newer_write(key).await;
        };

        let provider = self
            .providers
            .get(&key.service)
            .ok_or_else(|| VaultError::UnknownProvider(key.service.clone()))?;

        tracing::info!(key = %key, "refreshing access token");
        match provider.refresh(&refresh_token).await {
            Ok(fresh) => {
                self.commit(key, entry, current, refresh_token, fresh, provider.as_ref())
                    .await
            },
            Err(err) => self.fail(key, &entry, err).await,
        }
    }

    async fn commit(
        &self,
        key: &VaultKey,
        entry: VaultEntry,
        current: SecureToken,
        used_refresh: Secret<String>,
        fresh: SecureToken,
        provider: &dyn TokenProvider,
    ) -> Result<SecureToken> {
        let now = self.clock.now();
        let expires_at = fresh
            .expires_in()
            .map(|secs| compute_expiry(now, secs))
            .or(fresh.expires_at())
            .or_else(|| {
                provider
                    .default_lifetime_secs()
                    .map(|secs| compute_expiry(now, secs))
            });

        let refresh_token = match fresh.refresh_secret() {
            Some(rotated) => Some(rotated.clone()),
            None if provider.keeps_refresh_token_when_omitted() => Some(used_refresh),
            None => {
                tracing::info!(key = %key, "provider omitted refresh token; dropping stored one");
                None
            },
        };
        let token_type = fresh
            .token_type()
            .or(current.token_type())
            .map(str::to_string);
        let scope = fresh.scope().or(current.scope()).map(str::to_string);

        let token = fresh
            .with_refresh_token(refresh_token)
            .with_token_type(token_type)
            .with_scope(scope)
            .with_expires_at(expires_at);

        let expected_revision = entry.revision;
        let mut updated = entry;
        updated.expires_at = expires_at;
        updated.updated_at = now;
        updated.invalid = false;
        if let Some(scope) = token.scope() {
            updated.scopes = parse_scopes(scope);
        }

        if self
            .store
            .replace(updated, &token, expected_revision)
            .await?
        {
            tracing::info!(key = %key, expires_at = ?expires_at, "token refreshed");
            return Ok(token);
        }

        self.newer_write(key).await
    }

    /// Outcome once a store or revoke landed while the flight was running:
    /// the newer write wins and whatever the flight concluded is discarded.
    async fn newer_write(&self, key: &VaultKey) -> Result<SecureToken> {
        tracing::info!(key = %key, "entry changed during refresh; keeping the newer write");
        match self.store.get(key).await? {
            Some((entry, stored)) => {
                check_usable(&entry, &stored)?;
                Ok(stored)
            },
            None => Err(VaultError::NotConnected(key.to_string())),
        }
    }

    async fn fail(
        &self,
        key: &VaultKey,
        entry: &VaultEntry,
        err: RefreshError,
    ) -> Result<SecureToken> {
        Err(match err {
            RefreshError::InvalidGrant(reason) => {
                tracing::warn!(
                    key = %key,
                    reason = %reason,
                    "refresh token rejected; marking entry invalid"
                );
                if !self
                    .store
                    .mark_invalid(key, entry.revision, self.clock.now())
                    .await?
                {
                    return self.newer_write(key).await;
                }
                VaultError::ReauthorizationRequired(key.to_string())
            },
            RefreshError::Transport(message) => {
                tracing::warn!(key = %key, error = %message, "refresh transport failure");
                VaultError::RefreshTransient {
                    message,
                    retry_after: None,
                }
            },
            RefreshError::RateLimited { retry_after } => {
                tracing::warn!(key = %key, ?retry_after, "refresh rate limited");
                VaultError::RefreshTransient {
                    message: "rate limited by provider".into(),
                    retry_after,
                }
            },
            RefreshError::Rejected { status, code } => {
                tracing::warn!(key = %key, status, code = %code, "provider rejected refresh");
                VaultError::Provider {
                    service: key.service.clone(),
                    message: format!("rejected ({status}): {code}"),
                }
            },
            RefreshError::MalformedResponse(detail) => {
                tracing::error!(
                    key = %key,
                    detail = %detail,
                    "provider contract violation: malformed refresh response"
                );
                VaultError::Provider {
                    service: key.service.clone(),
                    message: format!("malformed response: {detail}"),
                }
            },
        })
    }
}

/// Fail fast on entries a previous refresh already gave up on.
pub(crate) fn check_usable(entry: &VaultEntry, token: &SecureToken) -> Result<()> {
    if !entry.invalid {
        return Ok(());
    }
    if token.refresh_token().is_none() {
        Err(VaultError::RefreshTokenMissing(entry.key.to_string()))
    } else {
        Err(VaultError::ReauthorizationRequired(entry.key.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use {
        async_trait::async_trait,
        chrono::{Duration, Utc},
        secrecy::ExposeSecret,
    };

    use super::*;
    use crate::{
        cipher::Cipher,
        clock::ManualClock,
        store::MemoryStore,
        types::TokenKind,
    };

    struct Counting {
        calls: AtomicUsize,
        result: Result<SecureToken, RefreshError>,
        keep: bool,
    }

    #[async_trait]
    impl TokenProvider for Counting {
        fn service(&self) -> &str {
            "slack"
        }

        async fn refresh(&self, token: &Secret<String>) -> Result<SecureToken, RefreshError> {
            assert_eq!(token.expose_secret(), "R1");
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.result.clone()
        }

        fn keeps_refresh_token_when_omitted(&self) -> bool {
            self.keep
        }
    }

    struct Harness {
        coordinator: RefreshCoordinator,
        store: TokenStore,
        provider: Arc<Counting>,
        key: VaultKey,
    }

    async fn harness(result: Result<SecureToken, RefreshError>, keep: bool) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cipher = Arc::new(Cipher::new([(1, Secret::new([9; 32]))], 1).unwrap());
        let store = TokenStore::new(Arc::new(MemoryStore::new()), cipher);
        let key = VaultKey::new("u1", "slack", None);

        let mut entry = VaultEntry::new(key.clone(), TokenKind::OAuth, clock.now());
        entry.expires_at = Some(clock.now() + Duration::seconds(30));
        let token = SecureToken::new("A1")
            .with_refresh_token(Some(Secret::new("R1".into())))
            .with_scope(Some("chat:write".into()));
        store.put(entry, &token).await.unwrap();

        let provider = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            result,
            keep,
        });
        let registry = Arc::new(ProviderRegistry::new().with(provider.clone()));
        let coordinator =
            RefreshCoordinator::new(store.clone(), registry, ExpiryPolicy::default(), clock);
        Harness {
            coordinator,
            store,
            provider,
            key,
        }
    }

    #[tokio::test]
    async fn keeps_old_refresh_token_when_omitted() {
        let h = harness(Ok(SecureToken::new("A2").with_expires_in(Some(3600))), true).await;
        let token = h.coordinator.refresh(&h.key).await.unwrap();
        assert_eq!(token.access_token(), "A2");
        assert_eq!(token.refresh_token(), Some("R1"));
        assert_eq!(token.scope(), Some("chat:write"));

        let (entry, stored) = h.store.get(&h.key).await.unwrap().unwrap();
        assert_eq!(stored.access_token(), "A2");
        assert_eq!(stored.refresh_token(), Some("R1"));
        assert_eq!(entry.revision, 2);
        assert_eq!(h.coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn drops_refresh_token_when_provider_says_so() {
        let h = harness(Ok(SecureToken::new("A2").with_expires_in(Some(3600))), false).await;
        let token = h.coordinator.refresh(&h.key).await.unwrap();
        assert_eq!(token.refresh_token(), None);
    }

    #[tokio::test]
    async fn rotated_refresh_token_replaces_old() {
        let fresh = SecureToken::new("A2")
            .with_expires_in(Some(3600))
            .with_refresh_token(Some(Secret::new("R2".into())));
        let h = harness(Ok(fresh), true).await;
        h.coordinator.refresh(&h.key).await.unwrap();
        let (_, stored) = h.store.get(&h.key).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token(), Some("R2"));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let h = Arc::new(
            harness(Ok(SecureToken::new("A2").with_expires_in(Some(3600))), true).await,
        );
        let calls = (0..16).map(|_| {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.coordinator.refresh(&h.key).await })
        });
        for result in futures::future::join_all(calls).await {
            assert_eq!(result.unwrap().unwrap().access_token(), "A2");
        }
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_leaves_entry_untouched() {
        let h = harness(Err(RefreshError::Transport("reset".into())), true).await;
        let err = h.coordinator.refresh(&h.key).await.unwrap_err();
        assert!(err.is_retryable());

        let (entry, stored) = h.store.get(&h.key).await.unwrap().unwrap();
        assert_eq!(stored.access_token(), "A1");
        assert!(!entry.invalid);
        assert_eq!(entry.revision, 1);
    }

    #[tokio::test]
    async fn invalid_grant_marks_entry_and_fails_fast() {
        let h = harness(Err(RefreshError::InvalidGrant("revoked".into())), true).await;
        assert_eq!(
            h.coordinator.refresh(&h.key).await.unwrap_err(),
            VaultError::ReauthorizationRequired("u1/slack".into())
        );
        assert_eq!(
            h.coordinator.refresh(&h.key).await.unwrap_err(),
            VaultError::ReauthorizationRequired("u1/slack".into())
        );
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_response_is_a_provider_error() {
        let h = harness(Err(RefreshError::MalformedResponse("no token".into())), true).await;
        let err = h.coordinator.refresh(&h.key).await.unwrap_err();
        assert!(matches!(err, VaultError::Provider { ref service, .. } if service == "slack"));
        assert!(!h.store.entry(&h.key).await.unwrap().unwrap().invalid);
    }

    #[tokio::test]
    async fn concurrent_store_wins_over_refresh_result() {
        let h = Arc::new(
            harness(Ok(SecureToken::new("A2").with_expires_in(Some(3600))), true).await,
        );
        let refreshing = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.coordinator.refresh(&h.key).await })
        };
        // Let the refresh read the entry and reach the provider.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut entry = h.store.entry(&h.key).await.unwrap().unwrap();
        entry.expires_at = Some(Utc::now() + Duration::hours(2));
        let replacement =
            SecureToken::new("A-new").with_refresh_token(Some(Secret::new("R-new".into())));
        h.store.put(entry, &replacement).await.unwrap();

        let token = refreshing.await.unwrap().unwrap();
        assert_eq!(token.access_token(), "A-new");
        let (_, stored) = h.store.get(&h.key).await.unwrap().unwrap();
        assert_eq!(stored.access_token(), "A-new");
    }
    #[tokio::test]
    async fn reconnect_during_rejected_refresh_is_not_reported_as_broken() {
        let h = Arc::new(harness(Err(RefreshError::InvalidGrant("revoked".into())), true).await);
        let refreshing = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.coordinator.refresh(&h.key).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut entry = h.store.entry(&h.key).await.unwrap().unwrap();
        entry.expires_at = Some(Utc::now() + Duration::hours(2));
        let reconnected =
            SecureToken::new("A-new").with_refresh_token(Some(Secret::new("R-new".into())));
        h.store.put(entry, &reconnected).await.unwrap();

        let token = refreshing.await.unwrap().unwrap();
        assert_eq!(token.access_token(), "A-new");
        let (entry, stored) = h.store.get(&h.key).await.unwrap().unwrap();
        assert!(!entry.invalid);
        assert_eq!(stored.refresh_token(), Some("R-new"));
    }

    #[tokio::test]
    async fn revoke_during_rejected_refresh_reports_not_connected() {
        let h = Arc::new(harness(Err(RefreshError::InvalidGrant("revoked".into())), true).await);
        let refreshing = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.coordinator.refresh(&h.key).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(h.store.delete(&h.key).await.unwrap());

        assert_eq!(
            refreshing.await.unwrap().unwrap_err(),
            VaultError::NotConnected("u1/slack".into())
        );
        assert!(h.store.entry(&h.key).await.unwrap().is_none());
    }
}
