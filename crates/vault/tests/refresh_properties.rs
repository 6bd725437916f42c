//! End-to-end behaviour of the vault facade over a scripted provider.
//!
//! Run with:
//!   cargo test -p credvault-vault --test refresh_properties

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration as StdDuration,
};

use {
    async_trait::async_trait,
    chrono::{Duration, SubsecRound, Utc},
    credvault_vault::{
        Cipher, Clock, ExpiryPolicy, ManualClock, MemoryStore, ProviderRegistry, RefreshError,
        SecureToken, SqliteStore, StoreBackend, TokenPayload, TokenProvider, Vault, VaultError,
        VaultKey,
    },
    secrecy::{ExposeSecret, Secret},
    tokio::sync::Notify,
};

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Provider that replays queued responses and counts upstream calls.
struct Scripted {
    service: &'static str,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    queue: Mutex<VecDeque<Result<SecureToken, RefreshError>>>,
    started: Notify,
    gate: Option<Notify>,
    delay: StdDuration,
}

impl Scripted {
    fn new(service: &'static str) -> Self {
        Self {
            service,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            started: Notify::new(),
            gate: None,
            delay: StdDuration::from_millis(25),
        }
    }

    fn gated(mut self) -> Self {
        self.gate = Some(Notify::new());
        self
    }

    fn then(self, response: Result<SecureToken, RefreshError>) -> Self {
        self.queue.lock().unwrap().push_back(response);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for Scripted {
    fn service(&self) -> &str {
        self.service
    }

    async fn refresh(&self, refresh_token: &Secret<String>) -> Result<SecureToken, RefreshError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen
            .lock()
            .unwrap()
            .push(refresh_token.expose_secret().clone());
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        tokio::time::sleep(self.delay).await;
        let next = self.queue.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(SecureToken::new(format!("A{}", n + 1)).with_expires_in(Some(3600)))
        })
    }
}

fn cipher() -> Arc<Cipher> {
    Arc::new(Cipher::new([(1, Secret::new([42; 32]))], 1).unwrap())
}

fn vault_with(
    backend: Arc<dyn StoreBackend>,
    provider: Arc<Scripted>,
    clock: Arc<ManualClock>,
) -> Vault {
    Vault::builder(backend, cipher())
        .providers(ProviderRegistry::new().with(provider))
        .expiry_policy(ExpiryPolicy::from_secs(300))
        .clock(clock)
        .build()
}

fn slack_payload() -> TokenPayload {
    TokenPayload::new("A").refresh_token("R").expires_in(3600)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_token_round_trips_without_upstream_call() {
    let provider = Arc::new(Scripted::new("slack"));
    let vault = vault_with(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        Arc::default(),
    );

    vault
        .store_token("u1", "slack", slack_payload(), None)
        .await
        .unwrap();
    let token = vault.get_token("u1", "slack", None).await.unwrap().unwrap();
    assert_eq!(token.access_token(), "A");
    assert_eq!(token.refresh_token(), Some("R"));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stale_reads_share_one_refresh() {
    let clock = Arc::new(ManualClock::default());
    let provider = Arc::new(Scripted::new("slack"));
    let vault = Arc::new(vault_with(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        clock.clone(),
    ));
    vault
        .store_token("u1", "slack", slack_payload(), None)
        .await
        .unwrap();
    clock.advance(Duration::seconds(3600));

    let callers = (0..32).map(|_| {
        let vault = Arc::clone(&vault);
        tokio::spawn(async move { vault.get_token("u1", "slack", None).await })
    });
    let tokens: Vec<String> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap().unwrap().access_token().to_string())
        .collect();

    assert_eq!(provider.calls(), 1);
    assert!(tokens.iter().all(|t| t == "A2"), "{tokens:?}");
}

#[tokio::test]
async fn different_keys_refresh_independently() {
    let clock = Arc::new(ManualClock::default());
    let provider = Arc::new(Scripted::new("slack"));
    let vault = Arc::new(vault_with(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        clock.clone(),
    ));
    for user in ["u1", "u2"] {
        vault
            .store_token(user, "slack", slack_payload(), None)
            .await
            .unwrap();
    }
    clock.advance(Duration::hours(2));

    let (a, b) = tokio::join!(
        vault.get_token("u1", "slack", None),
        vault.get_token("u2", "slack", None)
    );
    assert!(a.unwrap().is_some());
    assert!(b.unwrap().is_some());
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn token_inside_skew_window_is_refreshed_early() {
    let clock = Arc::new(ManualClock::default());
    let provider = Arc::new(Scripted::new("slack"));
    let vault = vault_with(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        clock.clone(),
    );
    vault
        .store_token("u1", "slack", slack_payload(), None)
        .await
        .unwrap();

    // 4 minutes left: not expired, but inside the 5 minute skew.
    clock.advance(Duration::seconds(3600 - 240));
    let token = vault.get_token("u1", "slack", None).await.unwrap().unwrap();
    assert_eq!(token.access_token(), "A2");
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn revoked_refresh_token_fails_fast_afterwards() {
    let clock = Arc::new(ManualClock::default());
    let revoked = RefreshError::InvalidGrant("invalid_refresh_token".into());
    let provider = Arc::new(Scripted::new("slack").then(Err(revoked)));
    let vault = vault_with(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        clock.clone(),
    );
    vault
        .store_token("u1", "slack", slack_payload(), None)
        .await
        .unwrap();
    clock.advance(Duration::hours(2));

    for _ in 0..3 {
        let err = vault.get_token("u1", "slack", None).await.unwrap_err();
        assert_eq!(err, VaultError::ReauthorizationRequired("u1/slack".into()));
        assert!(err.requires_reauthorization());
    }
    assert_eq!(provider.calls(), 1);
    assert!(!vault.is_connected("u1", "slack", None).await.unwrap());

    // Reconnecting clears the invalid state.
    vault
        .store_token("u1", "slack", slack_payload(), None)
        .await
        .unwrap();
    assert!(vault.is_connected("u1", "slack", None).await.unwrap());
    let token = vault.get_token("u1", "slack", None).await.unwrap().unwrap();
    assert_eq!(token.access_token(), "A");
}

#[tokio::test]
async fn expired_token_without_refresh_token_reports_missing() {
    let clock = Arc::new(ManualClock::default());
    let provider = Arc::new(Scripted::new("slack"));
    let vault = vault_with(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        clock.clone(),
    );
    vault
        .store_token("u1", "slack", TokenPayload::new("A").expires_in(60), None)
        .await
        .unwrap();

    for _ in 0..2 {
        assert_eq!(
            vault.get_token("u1", "slack", None).await.unwrap_err(),
            VaultError::RefreshTokenMissing("u1/slack".into())
        );
    }
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn transient_failure_is_returned_and_retry_succeeds() {
    let clock = Arc::new(ManualClock::default());
    let provider = Arc::new(
        Scripted::new("slack")
            .then(Err(RefreshError::RateLimited {
                retry_after: Some(StdDuration::from_secs(30)),
            }))
            .then(Ok(SecureToken::new("A-retry").with_expires_in(Some(3600)))),
    );
    let vault = vault_with(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        clock.clone(),
    );
    vault
        .store_token("u1", "slack", slack_payload(), None)
        .await
        .unwrap();
    clock.advance(Duration::hours(2));

    match vault.get_token("u1", "slack", None).await {
        Err(VaultError::RefreshTransient { retry_after, .. }) => {
            assert_eq!(retry_after, Some(StdDuration::from_secs(30)));
        },
        other => panic!("expected transient failure, got {other:?}"),
    }
    let token = vault.get_token("u1", "slack", None).await.unwrap().unwrap();
    assert_eq!(token.access_token(), "A-retry");
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn unknown_service_is_reported_not_panicked() {
    let clock = Arc::new(ManualClock::default());
    let vault = vault_with(
        Arc::new(MemoryStore::new()),
        Arc::new(Scripted::new("slack")),
        clock.clone(),
    );
    vault
        .store_token("u1", "jira", slack_payload(), None)
        .await
        .unwrap();
    clock.advance(Duration::hours(2));
    assert_eq!(
        vault.get_token("u1", "jira", None).await.unwrap_err(),
        VaultError::UnknownProvider("jira".into())
    );
}

#[tokio::test]
async fn slack_scenario_with_simulated_time() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let provider = Arc::new(Scripted::new("slack"));
    let vault = vault_with(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        clock.clone(),
    );

    let connected = vault
        .store_token("u1", "slack", slack_payload(), None)
        .await
        .unwrap();
    let first_expiry = connected.expires_at.unwrap();
    assert_eq!(first_expiry, start + Duration::seconds(3600));

    let token = vault.get_token("u1", "slack", None).await.unwrap().unwrap();
    assert_eq!(token.access_token(), "A");
    assert_eq!(provider.calls(), 0);

    clock.advance(Duration::seconds(3600 - 300 + 1));
    let refreshed = vault.get_token("u1", "slack", None).await.unwrap().unwrap();
    assert_eq!(provider.calls(), 1);
    assert_ne!(refreshed.access_token(), "A");
    assert!(refreshed.expires_at().unwrap() > first_expiry);
    assert_eq!(*provider.seen.lock().unwrap(), ["R"]);

    // The old refresh token is retained when the provider does not rotate it.
    assert_eq!(refreshed.refresh_token(), Some("R"));

    let again = vault.get_token("u1", "slack", None).await.unwrap().unwrap();
    assert_eq!(again.access_token(), refreshed.access_token());
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn abandoned_caller_does_not_abort_refresh() {
    let clock = Arc::new(ManualClock::default());
    let provider = Arc::new(Scripted::new("slack").gated());
    let backend = Arc::new(MemoryStore::new());
    let vault = Arc::new(vault_with(backend.clone(), provider.clone(), clock.clone()));
    vault
        .store_token("u1", "slack", slack_payload(), None)
        .await
        .unwrap();
    clock.advance(Duration::hours(2));

    let caller = {
        let vault = Arc::clone(&vault);
        tokio::spawn(async move { vault.get_token("u1", "slack", None).await })
    };
    provider.started.notified().await;
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    if let Some(gate) = &provider.gate {
        gate.notify_one();
    }
    let key = VaultKey::new("u1", "slack", None);
    let mut persisted = false;
    for _ in 0..100 {
        if backend.get(&key).await.unwrap().unwrap().entry.revision == 2 {
            persisted = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(persisted, "refresh result was not written back");

    let token = vault.get_token("u1", "slack", None).await.unwrap().unwrap();
    assert_eq!(token.access_token(), "A2");
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn revoke_during_refresh_is_not_undone() {
    let clock = Arc::new(ManualClock::default());
    let provider = Arc::new(Scripted::new("slack").gated());
    let vault = Arc::new(vault_with(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        clock.clone(),
    ));
    vault
        .store_token("u1", "slack", slack_payload(), None)
        .await
        .unwrap();
    clock.advance(Duration::hours(2));

    let caller = {
        let vault = Arc::clone(&vault);
        tokio::spawn(async move { vault.get_token("u1", "slack", None).await })
    };
    provider.started.notified().await;
    assert!(vault.revoke("u1", "slack", None).await.unwrap());
    if let Some(gate) = &provider.gate {
        gate.notify_one();
    }

    assert!(caller.await.unwrap().unwrap().is_none());
    assert!(vault.get_token("u1", "slack", None).await.unwrap().is_none());
}

#[tokio::test]
async fn sqlite_backend_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.db");
    // The SQLite backend keeps millisecond precision.
    let clock = Arc::new(ManualClock::new(Utc::now().trunc_subsecs(3)));
    let provider = Arc::new(Scripted::new("slack"));

    {
        let backend = Arc::new(SqliteStore::open(&path).await.unwrap());
        let vault = vault_with(backend, provider.clone(), clock.clone());
        vault
            .store_token("u1", "slack", slack_payload(), None)
            .await
            .unwrap();
    }

    let backend = Arc::new(SqliteStore::open(&path).await.unwrap());
    let vault = vault_with(backend, provider.clone(), clock.clone());
    let token = vault.get_token("u1", "slack", None).await.unwrap().unwrap();
    assert_eq!(token.access_token(), "A");

    clock.advance(Duration::hours(2));
    let refreshed = vault.get_token("u1", "slack", None).await.unwrap().unwrap();
    assert_eq!(refreshed.access_token(), "A2");
    assert_eq!(refreshed.refresh_token(), Some("R"));

    let listed = vault.list_connections("u1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].revision, 2);
    assert_eq!(listed[0].expires_at, Some(clock.now() + Duration::hours(1)));
}
