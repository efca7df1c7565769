//! Chain directory
//!
//! Static registry of supported chains, resolved from an account's bech32
//! prefix or from a chain id.

pub mod address;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Amount, Cadence};

pub use address::Bech32Address;

/// Connection parameters of a supported chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    /// Chain id used in sign docs, e.g. `cosmoshub-4`
    pub id: String,
    /// REST (gRPC gateway) endpoint
    pub rpc: String,
    /// Bech32 account prefix
    pub prefix: String,
    pub native_denom: String,
    #[serde(default = "default_cadence")]
    pub default_cadence: Cadence,
    #[serde(default)]
    pub default_tolerance: u64,
    /// Explicit fee attached to restake transactions, in the native denom
    #[serde(default)]
    pub fee_amount: Option<u64>,
    /// Overrides the broadcast gas limit for this chain
    #[serde(default)]
    pub gas_limit: Option<u64>,
    #[serde(default)]
    pub app_name: String,
}

fn default_cadence() -> Cadence {
    Cadence::Daily
}

impl Chain {
    pub fn default_tolerance(&self) -> Amount {
        Amount::from(self.default_tolerance)
    }
}

/// Lookup table of configured chains
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: Vec<Chain>,
}

impl ChainRegistry {
    pub fn new(chains: Vec<Chain>) -> Self {
        Self { chains }
    }

    /// Resolve the chain an address belongs to by its exact bech32 prefix
    pub fn lookup_by_address(&self, address: &str) -> Result<&Chain> {
        let decoded = Bech32Address::parse(address)?;
        self.chains
            .iter()
            .find(|chain| chain.prefix == decoded.prefix)
            .ok_or_else(|| Error::ChainNotFound(format!("address {}", address)))
    }

    pub fn lookup_by_id(&self, id: &str) -> Result<&Chain> {
        self.chains
            .iter()
            .find(|chain| chain.id == id)
            .ok_or_else(|| Error::ChainNotFound(format!("id {}", id)))
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// The chain written into a fresh configuration
pub fn default_chains() -> Vec<Chain> {
    vec![Chain {
        id: "cosmoshub-4".to_string(),
        rpc: "http://localhost:1317".to_string(),
        prefix: "cosmos".to_string(),
        native_denom: "uatom".to_string(),
        default_cadence: Cadence::Daily,
        default_tolerance: 1_000_000,
        fee_amount: None,
        gas_limit: None,
        app_name: "gaia".to_string(),
    }]
}

#[cfg(test)]
pub(crate) fn test_chain(id: &str, prefix: &str, denom: &str) -> Chain {
    Chain {
        id: id.to_string(),
        rpc: "http://localhost:1317".to_string(),
        prefix: prefix.to_string(),
        native_denom: denom.to_string(),
        default_cadence: Cadence::Daily,
        default_tolerance: 1_000,
        fee_amount: Some(5_000),
        gas_limit: None,
        app_name: String::new(),
    }
}
