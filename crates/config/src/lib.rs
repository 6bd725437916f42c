//! Configuration for the credential vault.
//!
//! Config files are discovered in the working directory and then in
//! `~/.config/credvault/`, with `${ENV_VAR}` placeholders expanded before
//! parsing so key material never has to live in the file itself.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, data_dir, discover_and_load, expand_home, find_config_file,
        load_config, set_config_dir,
    },
    schema::{
        CipherConfig, ClientAuth, CredvaultConfig, ProviderEntry, ProviderKind, ProvidersConfig,
        VaultConfig,
    },
};
