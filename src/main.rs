//! Autostaker - compounds Cosmos staking rewards through authz grants
//!
//! Accounts grant the operator key permission to withdraw rewards and
//! delegate; `serve` restakes every registered account at its cadence.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use autostaker::cli::commands;
use autostaker::config::Config;

/// Autostaker - periodic restaking of Cosmos staking rewards
#[derive(Parser)]
#[command(name = "autostaker")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "AUTOSTAKER_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and generate the operator key
    Init {
        /// Data directory for the record store and keyring
        #[arg(long)]
        home: Option<PathBuf>,
    },

    /// Run the scheduler
    Serve {
        /// Clear active jobs left by an unclean shutdown
        #[arg(long)]
        reset_jobs: bool,
    },

    /// Register an account for automatic restaking
    Register {
        /// Delegator address
        address: String,

        /// quarter_day, daily, weekly or monthly (default: chain default)
        #[arg(long)]
        cadence: Option<String>,

        /// Balance left liquid, in base units (default: chain default)
        #[arg(long)]
        tolerance: Option<u128>,
    },

    /// Show an account's record
    Status {
        /// Delegator address
        address: String,
    },

    /// Restake an account now
    Restake {
        /// Delegator address
        address: String,

        /// Balance left liquid, in base units
        #[arg(long)]
        tolerance: Option<u128>,
    },

    /// Stop restaking an account
    Remove {
        /// Delegator address
        address: String,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// List configured chains
    Chains {
        /// Show a single chain
        id: Option<String>,
    },

    /// Show the operator address per chain
    Address {
        /// Only this chain
        #[arg(long)]
        chain: Option<String>,
    },

    /// Show current configuration (endpoint credentials masked)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("autostaker=info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // init has to run before a config exists
    if let Commands::Init { home } = &cli.command {
        if let Err(e) = commands::init(&cli.config, home.clone()).await {
            error!("Init failed: {:#}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Perform startup checks
    if let Err(e) = startup_checks(&config) {
        error!("Startup checks failed: {:#}", e);
        std::process::exit(1);
    }

    // Execute command
    let result = match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Serve { reset_jobs } => commands::serve(&config, reset_jobs).await,
        Commands::Register {
            address,
            cadence,
            tolerance,
        } => commands::register(&config, &address, cadence, tolerance).await,
        Commands::Status { address } => commands::status(&config, &address).await,
        Commands::Restake { address, tolerance } => {
            commands::restake(&config, &address, tolerance).await
        }
        Commands::Remove { address, force } => commands::remove(&config, &address, force).await,
        Commands::Chains { id } => commands::chains(&config, id.as_deref()).await,
        Commands::Address { chain } => commands::address(&config, chain.as_deref()).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Perform startup safety checks
fn startup_checks(config: &Config) -> Result<()> {
    let keyring_dir = config.keyring_dir();
    if !keyring_dir.exists() {
        return Err(anyhow::anyhow!(
            "Keyring directory {} not found. Run 'autostaker init' first.",
            keyring_dir.display()
        ));
    }

    // Key files are checked individually on load; the directory should be private too
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&keyring_dir)?.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                "Keyring directory {} has permissions {:o}. Consider 'chmod 700 {}'.",
                keyring_dir.display(),
                mode & 0o777,
                keyring_dir.display()
            );
        }
    }

    for chain in &config.chains {
        info!(
            "Chain {} ({}): default cadence {}, tolerance {} {}",
            chain.id, chain.prefix, chain.default_cadence, chain.default_tolerance, chain.native_denom
        );
    }
    Ok(())
}
