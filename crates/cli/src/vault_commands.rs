use std::{io::Read, sync::Arc};

use {
    anyhow::{Context, Result, bail},
    chrono::Utc,
    clap::{Args, Subcommand},
    credvault_config::{CredvaultConfig, config_dir, data_dir, discover_and_load, expand_home},
    credvault_oauth::build_registry,
    credvault_vault::{
        Cipher, ExpiryPolicy, MemoryStore, SqliteStore, StoreBackend, TokenPayload, Vault,
        VaultEntry, generate_key,
    },
    secrecy::Secret,
};

/// Identifies one stored credential.
#[derive(Args)]
pub struct KeyArgs {
    /// User the credential belongs to.
    #[arg(long)]
    user: String,
    /// Service identifier (e.g. "gmail", "slack").
    #[arg(long)]
    service: String,
    /// Optional agent scope.
    #[arg(long)]
    agent: Option<String>,
}

#[derive(Subcommand)]
pub enum VaultAction {
    /// Store the result of an OAuth authorization-code exchange.
    Connect {
        #[command(flatten)]
        key: KeyArgs,
        /// Access token.
        #[arg(long, env = "CREDVAULT_ACCESS_TOKEN", conflicts_with = "from_json")]
        access_token: Option<String>,
        /// Refresh token.
        #[arg(long, env = "CREDVAULT_REFRESH_TOKEN")]
        refresh_token: Option<String>,
        /// Access token lifetime in seconds.
        #[arg(long)]
        expires_in: Option<u64>,
        /// Space-separated granted scopes.
        #[arg(long)]
        scope: Option<String>,
        /// Read the raw token endpoint response from a file ("-" for stdin).
        #[arg(long)]
        from_json: Option<String>,
    },
    /// Store a static API key that never expires.
    ApiKey {
        #[command(flatten)]
        key: KeyArgs,
        /// The API key.
        #[arg(long, env = "CREDVAULT_API_KEY")]
        value: String,
    },
    /// Print a valid access token, refreshing it first if needed.
    Token {
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Delete a credential and revoke it with the provider.
    Revoke {
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Show stored connections for a user.
    Status {
        #[arg(long)]
        user: String,
    },
    /// Re-encrypt every credential under the active key version.
    Reseal,
    /// Generate a new base64 encryption key.
    Keygen,
}

pub async fn handle_vault(action: VaultAction) -> Result<()> {
    if matches!(action, VaultAction::Keygen) {
        println!("{}", generate_key());
        if let Some(dir) = config_dir() {
            eprintln!(
                "Add it under [cipher.keys] in {}",
                dir.join("credvault.toml").display()
            );
        }
        return Ok(());
    }

    let config = discover_and_load()?;
    let vault = open_vault(&config).await?;
    match action {
        VaultAction::Connect {
            key,
            access_token,
            refresh_token,
            expires_in,
            scope,
            from_json,
        } => {
            let payload = match (from_json, access_token) {
                (Some(source), _) => read_payload(&source)?,
                (None, Some(access)) => {
                    let mut payload = TokenPayload::new(access);
                    payload.refresh_token = refresh_token.map(Secret::new);
                    payload.expires_in = expires_in;
                    payload.scope = scope;
                    payload
                },
                (None, None) => bail!("either --access-token or --from-json is required"),
            };
            let entry = vault
                .store_token(&key.user, &key.service, payload, key.agent.as_deref())
                .await?;
            println!("Connected {} ({})", entry.key, describe_expiry(&entry));
        },
        VaultAction::ApiKey { key, value } => {
            let entry = vault
                .store_api_key(
                    &key.user,
                    &key.service,
                    Secret::new(value),
                    key.agent.as_deref(),
                )
                .await?;
            println!("Stored API key for {}", entry.key);
        },
        VaultAction::Token { key } => {
            match vault
                .get_token(&key.user, &key.service, key.agent.as_deref())
                .await?
            {
                Some(token) => println!("{}", token.access_token()),
                None => bail!("{} is not connected for {}", key.service, key.user),
            }
        },
        VaultAction::Revoke { key } => {
            if vault
                .revoke(&key.user, &key.service, key.agent.as_deref())
                .await?
            {
                println!("Revoked {} for {}", key.service, key.user);
            } else {
                println!("Nothing stored for {} / {}", key.user, key.service);
            }
        },
        VaultAction::Status { user } => status(&vault, &user).await?,
        VaultAction::Reseal => {
            let count = vault.reseal_all().await?;
            println!("Resealed {count} credential(s)");
        },
        VaultAction::Keygen => {},
    }
    Ok(())
}

/// Open the vault described by config.
///
/// Cipher misconfiguration is fatal here rather than at first use.
pub async fn open_vault(config: &CredvaultConfig) -> Result<Vault> {
    let cipher = Cipher::from_config(&config.cipher).context("invalid [cipher] configuration")?;
    let backend: Arc<dyn StoreBackend> = match config.vault.db_path.as_deref() {
        Some(":memory:") => Arc::new(MemoryStore::new()),
        configured => {
            let path = configured
                .map(expand_home)
                .unwrap_or_else(|| data_dir().join("vault.db"));
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            Arc::new(SqliteStore::open(&path).await?)
        },
    };
    let providers = build_registry(&config.providers)?;

    Ok(Vault::builder(backend, Arc::new(cipher))
        .providers(providers)
        .expiry_policy(ExpiryPolicy::from_secs(config.vault.refresh_skew_secs))
        .build())
}

fn read_payload(source: &str) -> Result<TokenPayload> {
    let raw = if source == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("failed to read token response from stdin")?;
        raw
    } else {
        std::fs::read_to_string(source).with_context(|| format!("failed to read {source}"))?
    };
    serde_json::from_str(&raw).context("token response is not valid JSON")
}

async fn status(vault: &Vault, user: &str) -> Result<()> {
    let entries = vault.list_connections(user).await?;
    if entries.is_empty() {
        println!("No connections for {user}.");
        return Ok(());
    }
    for entry in entries {
        let agent = entry
            .key
            .agent_id
            .as_deref()
            .map(|a| format!(" agent={a}"))
            .unwrap_or_default();
        println!(
            "{}{agent} [{}] {}",
            entry.key.service,
            entry.kind.as_str(),
            describe_expiry(&entry)
        );
    }
    Ok(())
}

fn describe_expiry(entry: &VaultEntry) -> String {
    if entry.invalid {
        return "needs re-authorization".to_string();
    }
    match entry.expires_at {
        None => "no expiry".to_string(),
        Some(at) => {
            let remaining = (at - Utc::now()).num_seconds();
            if remaining > 0 {
                let hours = remaining / 3600;
                let mins = (remaining % 3600) / 60;
                format!("valid ({hours}h {mins}m remaining)")
            } else {
                "expired".to_string()
            }
        },
    }
}
