//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chain::{address, default_chains, Chain, ChainRegistry};
use crate::scheduler::TierPeriods;
use crate::tx::BroadcastSettings;
use crate::types::Cadence;

/// Name of the configuration file inside the home directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory holding the record store
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,
    #[serde(default)]
    pub keyring: KeyringConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_chains")]
    pub chains: Vec<Chain>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyringConfig {
    /// Directory of operator key files; `<home_dir>/keys` when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_retry_elapsed_ms")]
    pub max_retry_elapsed_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            gas_limit: default_gas_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_retry_elapsed_ms: default_max_retry_elapsed_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Optional tier period overrides, in seconds
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub quarter_day_secs: Option<u64>,
    #[serde(default)]
    pub daily_secs: Option<u64>,
    #[serde(default)]
    pub weekly_secs: Option<u64>,
    #[serde(default)]
    pub monthly_secs: Option<u64>,
}

impl SchedulerConfig {
    fn overrides(&self) -> [(Cadence, Option<u64>); 4] {
        [
            (Cadence::QuarterDay, self.quarter_day_secs),
            (Cadence::Daily, self.daily_secs),
            (Cadence::Weekly, self.weekly_secs),
            (Cadence::Monthly, self.monthly_secs),
        ]
    }
}

// Default value functions
fn default_home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".autostaker"))
        .unwrap_or_else(|_| PathBuf::from(".autostaker"))
}

fn default_gas_limit() -> u64 {
    2_000_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_confirm_timeout_secs() -> u64 {
    60
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_max_retry_elapsed_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("home_dir", default_home_dir().to_string_lossy().to_string())?
            .set_default("broadcast.gas_limit", default_gas_limit() as i64)?
            .set_default("broadcast.poll_interval_ms", default_poll_interval_ms() as i64)?
            .set_default("broadcast.confirm_timeout_secs", default_confirm_timeout_secs() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix AUTOSTAKER__)
            .add_source(
                config::Environment::with_prefix("AUTOSTAKER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            anyhow::bail!("At least one chain must be configured");
        }

        let mut ids = HashSet::new();
        let mut prefixes = HashSet::new();
        for chain in &self.chains {
            if chain.id.is_empty() {
                anyhow::bail!("Chain id cannot be empty");
            }
            if !ids.insert(chain.id.as_str()) {
                anyhow::bail!("Duplicate chain id: {}", chain.id);
            }
            if !prefixes.insert(chain.prefix.as_str()) {
                anyhow::bail!("Duplicate address prefix: {}", chain.prefix);
            }
            address::encode(&chain.prefix, &[0u8; address::ACCOUNT_ID_LEN])
                .with_context(|| format!("Invalid prefix for chain {}", chain.id))?;
            if chain.native_denom.is_empty() {
                anyhow::bail!("Chain {} has no native_denom", chain.id);
            }
            url::Url::parse(&chain.rpc)
                .with_context(|| format!("Invalid rpc endpoint for chain {}: {}", chain.id, chain.rpc))?;
            if chain.gas_limit == Some(0) {
                anyhow::bail!("Chain {} gas_limit must be positive", chain.id);
            }
            if chain.default_cadence == Cadence::Unset {
                anyhow::bail!("Chain {} default_cadence cannot be unset", chain.id);
            }
        }

        if self.broadcast.gas_limit == 0 {
            anyhow::bail!("broadcast.gas_limit must be positive");
        }
        if self.broadcast.poll_interval_ms == 0 {
            anyhow::bail!("broadcast.poll_interval_ms must be positive");
        }
        if self.broadcast.confirm_timeout_secs == 0 {
            anyhow::bail!("broadcast.confirm_timeout_secs must be positive");
        }
        if self.broadcast.request_timeout_ms == 0 {
            anyhow::bail!("broadcast.request_timeout_ms must be positive");
        }

        for (cadence, secs) in self.scheduler.overrides() {
            if secs == Some(0) {
                anyhow::bail!("scheduler period for {} must be positive", cadence);
            }
        }

        Ok(())
    }

    pub fn keyring_dir(&self) -> PathBuf {
        self.keyring
            .dir
            .clone()
            .unwrap_or_else(|| self.home_dir.join("keys"))
    }

    pub fn registry(&self) -> ChainRegistry {
        ChainRegistry::new(self.chains.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast.request_timeout_ms)
    }

    pub fn broadcast_settings(&self) -> BroadcastSettings {
        BroadcastSettings {
            gas_limit: self.broadcast.gas_limit,
            poll_interval: Duration::from_millis(self.broadcast.poll_interval_ms),
            confirm_timeout: Duration::from_secs(self.broadcast.confirm_timeout_secs),
            retry_base_delay: Duration::from_millis(self.broadcast.retry_base_delay_ms),
            max_retry_elapsed: Duration::from_millis(self.broadcast.max_retry_elapsed_ms),
        }
    }

    pub fn tier_periods(&self) -> TierPeriods {
        self.scheduler
            .overrides()
            .into_iter()
            .fold(TierPeriods::default(), |periods, (cadence, secs)| match secs {
                Some(secs) => periods.with_override(cadence, Duration::from_secs(secs)),
                None => periods,
            })
    }

    /// Configuration summary for display
    pub fn masked_display(&self) -> String {
        let mut out = format!(
            r#"Configuration:
  Home: {}
  Keyring: {}
  Broadcast:
    gas_limit: {}
    poll_interval: {}ms
    confirm_timeout: {}s
    request_timeout: {}ms
  Chains:
"#,
            self.home_dir.display(),
            self.keyring_dir().display(),
            self.broadcast.gas_limit,
            self.broadcast.poll_interval_ms,
            self.broadcast.confirm_timeout_secs,
            self.broadcast.request_timeout_ms,
        );
        for chain in &self.chains {
            out.push_str(&format!(
                "    {} ({}): {} {} cadence={} tolerance={}\n",
                chain.id,
                chain.prefix,
                mask_url(&chain.rpc),
                chain.native_denom,
                chain.default_cadence,
                chain.default_tolerance,
            ));
        }
        out
    }

    /// Commented configuration file written by `init`
    pub fn default_template(home_dir: &Path) -> String {
        let home = home_dir.to_string_lossy();
        let mut out = format!(
            r#"# autostaker configuration
# Any value can be overridden from the environment, e.g.
#   AUTOSTAKER__BROADCAST__GAS_LIMIT=400000

home_dir = '{home}'

[keyring]
dir = '{home}/keys'

[broadcast]
gas_limit = {gas_limit}
poll_interval_ms = {poll}
confirm_timeout_secs = {confirm}
retry_base_delay_ms = {retry}
max_retry_elapsed_ms = {retry_elapsed}
request_timeout_ms = {request}

[scheduler]
# Tier periods in seconds; defaults are 6h, 24h, 7d and 30d
# quarter_day_secs = 21600
# daily_secs = 86400
"#,
            home = home,
            gas_limit = default_gas_limit(),
            poll = default_poll_interval_ms(),
            confirm = default_confirm_timeout_secs(),
            retry = default_retry_base_delay_ms(),
            retry_elapsed = default_max_retry_elapsed_ms(),
            request = default_request_timeout_ms(),
        );

        for chain in default_chains() {
            out.push_str(&format!(
                r#"
[[chains]]
id = "{}"
rpc = "{}"
prefix = "{}"
native_denom = "{}"
default_cadence = "{}"
default_tolerance = {}
# fee_amount = 5000
# gas_limit = 400000
app_name = "{}"
"#,
                chain.id,
                chain.rpc,
                chain.prefix,
                chain.native_denom,
                chain.default_cadence,
                chain.default_tolerance,
                chain.app_name,
            ));
        }
        out
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            keyring: KeyringConfig::default(),
            broadcast: BroadcastConfig::default(),
            scheduler: SchedulerConfig::default(),
            chains: default_chains(),
        }
    }
}
