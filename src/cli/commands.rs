//! CLI command implementations

use anyhow::{Context, Result};
use dialoguer::Confirm;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::keyring::{FileKeyring, Keyring};
use crate::service::AutoStaker;
use crate::types::{Amount, Cadence};

/// Name of the key file `init` generates
const OPERATOR_KEY_NAME: &str = "operator";

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Token cancelled on Ctrl-C, for one-shot commands
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling chain calls");
            child.cancel();
        }
    });
    token
}

/// Write a default configuration and generate the operator key
pub async fn init(config_path: &Path, home: Option<PathBuf>) -> Result<()> {
    if config_path.exists() {
        warn!("Configuration {} already exists, leaving it untouched", config_path.display());
    } else {
        let home = home.unwrap_or_else(|| Config::default().home_dir);
        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(config_path, Config::default_template(&home))
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        info!("Wrote configuration to {}", config_path.display());
    }

    let config = Config::load(config_path)?;
    let keyring_dir = config.keyring_dir();
    let keys = FileKeyring::load(&keyring_dir)?.list_keys()?;
    if keys.is_empty() {
        FileKeyring::generate(&keyring_dir, OPERATOR_KEY_NAME)?;
    } else {
        info!("Keyring {} already holds {} key(s)", keyring_dir.display(), keys.len());
    }

    address(&config, None).await
}

/// Run the scheduler until Ctrl-C
pub async fn serve(config: &Config, reset_jobs: bool) -> Result<()> {
    let service = AutoStaker::open(config)?;

    if reset_jobs {
        let cleared = service.reset_active_jobs()?;
        info!("Cleared {} recorded active job(s)", cleared);
    }

    info!("Starting autostaker with {} chain(s)", config.chains.len());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let abort = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt received");
        } else {
            std::future::pending::<()>().await;
        }
    };

    let result = service.run(shutdown, abort).await;
    service.close()?;
    result?;
    Ok(())
}

/// Register an account for automatic restaking
pub async fn register(
    config: &Config,
    address: &str,
    cadence: Option<String>,
    tolerance: Option<Amount>,
) -> Result<()> {
    let cadence = cadence.map(|c| c.parse::<Cadence>()).transpose()?;
    let service = AutoStaker::open(config)?;

    let result = service
        .control()
        .register(address, cadence, tolerance, &interrupt_token())
        .await;
    service.close()?;

    print_json(&result?)
}

/// Show the record of an account
pub async fn status(config: &Config, address: &str) -> Result<()> {
    let service = AutoStaker::open(config)?;
    let record = service.control().status(address)?;
    print_json(&record)
}

/// Restake an account now
pub async fn restake(config: &Config, address: &str, tolerance: Option<Amount>) -> Result<()> {
    let service = AutoStaker::open(config)?;

    let result = service
        .control()
        .restake(address, tolerance, &interrupt_token())
        .await;
    service.close()?;

    print_json(&result?)
}

/// Remove an account's record
pub async fn remove(config: &Config, address: &str, force: bool) -> Result<()> {
    if !force {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Stop restaking {}? Its history will be deleted.",
                address
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Removal cancelled by user");
            return Ok(());
        }
    }

    let service = AutoStaker::open(config)?;
    let removed = service.control().remove(address)?;
    service.close()?;

    if !removed {
        anyhow::bail!("No record for {}", address);
    }
    println!("Removed {}", address);
    Ok(())
}

/// List configured chains, or show one
pub async fn chains(config: &Config, id: Option<&str>) -> Result<()> {
    let registry = config.registry();
    match id {
        Some(id) => print_json(registry.lookup_by_id(id)?),
        None => print_json(&registry.chains()),
    }
}

/// Show the operator's address on one or every chain
pub async fn address(config: &Config, chain_id: Option<&str>) -> Result<()> {
    let service = AutoStaker::open(config)?;
    let addresses = service.control().operator_address(chain_id)?;
    service.close()?;
    print_json(&addresses)
}

/// Show current configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}
