//! Chain RPC
//!
//! [`ChainClient`] is the read/broadcast surface the restake engine, the
//! authorization validator and the broadcaster need from a Cosmos SDK node.
//! [`rest::RestClient`] implements it over the node's REST gateway and
//! [`pool::ClientPool`] caches one client per chain.

pub mod pool;
pub mod rest;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub use pool::ClientPool;

/// Result code the SDK returns for a wrong account sequence
pub const CODE_WRONG_SEQUENCE: u32 = 32;

/// Decimal coin as returned by the distribution module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecCoin {
    pub denom: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorReward {
    pub validator_address: String,
    #[serde(default)]
    pub reward: Vec<DecCoin>,
}

/// Pending rewards of a delegator, per validator and in total
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRewards {
    #[serde(default)]
    pub rewards: Vec<ValidatorReward>,
    #[serde(default)]
    pub total: Vec<DecCoin>,
}

/// Signing state of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountState {
    pub account_number: u64,
    pub sequence: u64,
}

/// Outcome of a transaction, at check time or after inclusion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    #[serde(default, deserialize_with = "de_i64")]
    pub height: i64,
    #[serde(default)]
    pub txhash: String,
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub codespace: String,
    #[serde(default)]
    pub raw_log: String,
    #[serde(default, deserialize_with = "de_i64")]
    pub gas_wanted: i64,
    #[serde(default, deserialize_with = "de_i64")]
    pub gas_used: i64,
}

impl TxResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// A fee allowance granted by an account, flattened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeAllowance {
    /// Message type urls the allowance is restricted to; `None` when unrestricted
    pub allowed_messages: Option<Vec<String>>,
    pub expiration: Option<DateTime<Utc>>,
}

impl FeeAllowance {
    /// Flatten the JSON form of a basic, periodic or allowed-message allowance
    pub fn from_value(value: &Value) -> Result<Self> {
        let kind = value.get("@type").and_then(Value::as_str).unwrap_or_default();

        if kind.ends_with("AllowedMsgAllowance") {
            let inner = value
                .get("allowance")
                .ok_or_else(|| Error::Deserialization("allowed msg allowance without inner allowance".into()))?;
            let inner = Self::from_value(inner)?;
            let allowed = value
                .get("allowed_messages")
                .and_then(Value::as_array)
                .map(|msgs| {
                    msgs.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            return Ok(Self {
                allowed_messages: Some(allowed),
                expiration: inner.expiration,
            });
        }

        let expiration = if kind.ends_with("PeriodicAllowance") {
            value.get("basic").and_then(|b| b.get("expiration"))
        } else {
            value.get("expiration")
        };

        Ok(Self {
            allowed_messages: None,
            expiration: parse_expiration(expiration)?,
        })
    }

    pub fn covers(&self, type_url: &str) -> bool {
        match &self.allowed_messages {
            Some(allowed) => allowed.iter().any(|m| m == type_url),
            None => true,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|exp| exp <= now)
    }
}

/// An authz grant from a granter to a grantee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthzGrant {
    /// `@type` of the authorization
    pub authorization: String,
    pub expiration: Option<DateTime<Utc>>,
}

impl AuthzGrant {
    pub fn from_value(value: &Value) -> Result<Self> {
        let authorization = value
            .get("authorization")
            .and_then(|a| a.get("@type"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            authorization,
            expiration: parse_expiration(value.get("expiration"))?,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|exp| exp <= now)
    }
}

fn parse_expiration(value: Option<&Value>) -> Result<Option<DateTime<Utc>>> {
    match value.and_then(Value::as_str) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| Error::Deserialization(format!("bad expiration {}: {}", s, e))),
    }
}

/// Integers arrive as JSON strings from the gateway and as numbers elsewhere
fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(i64),
        Str(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) if s.is_empty() => Ok(0),
        Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Everything the restaker needs from a chain node. Every call honours the
/// caller's cancellation token and returns [`Error::Cancelled`] when it fires.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Pending rewards of `delegator`
    async fn delegation_rewards(
        &self,
        delegator: &str,
        cancel: &CancellationToken,
    ) -> Result<DelegationRewards>;

    /// Raw balance amount of `denom`; `None` when the node returns no balance
    async fn balance(
        &self,
        address: &str,
        denom: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>>;

    async fn account(&self, address: &str, cancel: &CancellationToken) -> Result<AccountState>;

    /// Submit signed tx bytes, returning after the node's check
    async fn broadcast_sync(&self, tx_bytes: &[u8], cancel: &CancellationToken) -> Result<TxResponse>;

    /// Look up an included transaction; `None` while it is not in a block
    async fn get_tx(&self, hash: &str, cancel: &CancellationToken) -> Result<Option<TxResponse>>;

    async fn fee_allowance(
        &self,
        granter: &str,
        grantee: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<FeeAllowance>>;

    async fn grants(
        &self,
        granter: &str,
        grantee: &str,
        msg_type_url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<AuthzGrant>>;
}
