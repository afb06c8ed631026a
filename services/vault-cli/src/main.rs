//! vaultctl
//!
//! Command-line client for the secrets vault. This binary only wires
//! configuration, the credential store and the authenticator together:
//! 1. Parse flags and resolve the profile (file, env, flags)
//! 2. Open the configured credential store once
//! 3. Run the command against `vault_auth::Authenticator`

mod cli;
mod config;
mod error;
mod prompt;

use anyhow::{Context, Result};
use credential_store::StoreSelector;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vault_auth::{Authenticator, Browser, SecretCipher, VaultClient, subject_from_token};

use crate::cli::{Cli, Command, USAGE};
use crate::config::Config;
use crate::prompt::read_secret;

/// Logs go to stderr so command output on stdout stays parseable.
/// `--verbose` forces debug; otherwise LOG_LEVEL, then RUST_LOG, then warn.
/// LOG_FORMAT=json switches to JSON lines.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("LOG_LEVEL")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = Cli::parse(&args).map_err(|e| anyhow::anyhow!("{e}\n\n{USAGE}"))?;
    init_tracing(cli.verbose);

    if cli.command == Command::Help {
        print!("{USAGE}");
        return Ok(());
    }

    let config_path = Config::resolve_path(cli.config.as_deref())?;
    let config = if cli.config.is_some() || config_path.exists() {
        debug!(path = %config_path.display(), "loading configuration");
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        debug!(path = %config_path.display(), "no config file, using defaults");
        Config::default()
    };

    let profile_name = Config::resolve_profile(cli.profile.as_deref());
    let mut profile = config.profile(&profile_name)?;
    profile.apply_env();
    profile.apply_overrides(&cli.overrides);
    profile
        .validate()
        .with_context(|| format!("invalid profile '{profile_name}'"))?;

    let store_options = profile.store_options()?;
    let selector = StoreSelector::new();
    let store = selector
        .open(&store_options)
        .await
        .context("failed to open credential store")?;
    let cipher = SecretCipher::new(
        store_options
            .dir()
            .context("failed to resolve store directory")?,
    );

    let endpoint = profile.endpoint();
    info!(
        profile = %profile_name,
        tenant = %profile.tenant,
        store = %store_options.kind,
        "configuration loaded"
    );

    let browser = if cli.overrides.no_browser {
        Browser::Disabled
    } else {
        Browser::System
    };
    let client = VaultClient::new(reqwest::Client::new(), endpoint);
    let auth = Authenticator::new(
        client,
        store,
        cipher,
        profile.auth_settings(&profile_name, browser)?,
    );

    match cli.command {
        Command::Auth => {
            let token = auth.get_token().await.context("authentication failed")?;
            println!("{}", serde_json::to_string_pretty(&token)?);
        }
        Command::AuthClear => {
            let removed = auth
                .wipe_cached_tokens()
                .await
                .context("failed to clear cached tokens")?;
            eprintln!("Removed {removed} cached token(s) for profile '{profile_name}'");
        }
        Command::AuthList => {
            for key in auth
                .list_cached_tokens()
                .await
                .context("failed to list cached tokens")?
            {
                println!("{key}");
            }
        }
        Command::AuthSetPassword => {
            let password = read_secret("Password: ")?;
            auth.save_password(&password)
                .await
                .context("failed to store password")?;
            eprintln!("Password stored for profile '{profile_name}'");
        }
        Command::AuthSetSecret(setting) => {
            let value = read_secret(&format!("{setting}: "))?;
            auth.save_secure_setting(&setting, &value)
                .await
                .with_context(|| format!("failed to store {setting}"))?;
            eprintln!("Stored {setting} for profile '{profile_name}'");
        }
        Command::WhoAmI => {
            let token = auth.get_token().await.context("authentication failed")?;
            let subject = subject_from_token(&token.access_token)?;
            println!("{subject}");
        }
        Command::Help => print!("{USAGE}"),
    }

    Ok(())
}
