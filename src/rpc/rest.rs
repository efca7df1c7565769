//! REST gateway client for Cosmos SDK nodes

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::{AccountState, AuthzGrant, ChainClient, DelegationRewards, FeeAllowance, TxResponse};
use crate::chain::Chain;
use crate::error::{Error, Result};

/// Client for one chain's REST endpoint
pub struct RestClient {
    client: Client,
    base: Url,
    chain_id: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Option<BalanceCoin>,
}

#[derive(Debug, Deserialize)]
struct BalanceCoin {
    amount: String,
}

#[derive(Debug, Deserialize)]
struct TxEnvelope {
    tx_response: TxResponse,
}

#[derive(Debug, Serialize)]
struct BroadcastRequest {
    tx_bytes: String,
    mode: &'static str,
}

/// Run `fut` unless `cancel` fires first
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

impl RestClient {
    pub fn new(chain: &Chain, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(&chain.rpc)
            .map_err(|e| Error::Config(format!("Invalid endpoint {} for {}: {}", chain.rpc, chain.id, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base,
            chain_id: chain.id.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Rpc(format!("Bad path {}: {}", path, e)))
    }

    /// GET a JSON document. Not-found answers map to `None`.
    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<Option<T>> {
        let url = self.endpoint(path)?;
        debug!(chain = %self.chain_id, %url, "GET");

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::RpcConnection(format!("{}: {}", self.chain_id, e)))?;

        Self::decode(response, path).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<Option<T>> {
        let url = self.endpoint(path)?;
        debug!(chain = %self.chain_id, %url, "POST");

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::RpcConnection(format!("{}: {}", self.chain_id, e)))?;

        Self::decode(response, path).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response, path: &str) -> Result<Option<T>> {
        let status = response.status();
        if status.is_success() {
            let body = response
                .json()
                .await
                .map_err(|e| Error::Deserialization(format!("Failed to parse {} response: {}", path, e)))?;
            return Ok(Some(body));
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND || body.contains("not found") {
            return Ok(None);
        }
        match status {
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                Err(Error::RpcConnection(format!("{} {}: {}", status, path, body)))
            }
            _ => Err(Error::Rpc(format!("{} {}: {}", status, path, body))),
        }
    }
}

/// Find the object carrying `account_number`, looking through vesting wrappers
fn find_base_account(value: &Value) -> Option<&Value> {
    if value.get("account_number").is_some() {
        return Some(value);
    }
    value.as_object()?.values().find_map(find_base_account)
}

fn parse_u64_field(value: &Value, field: &str) -> Result<u64> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| Error::Deserialization(format!("{} is not a u64", field))),
        Some(Value::String(s)) => s
            .parse()
            .map_err(|e| Error::Deserialization(format!("{} {:?}: {}", field, s, e))),
        Some(other) => Err(Error::Deserialization(format!("unexpected {} value {}", field, other))),
    }
}

pub(crate) fn parse_account(value: &Value) -> Result<AccountState> {
    let base = value
        .get("account")
        .and_then(find_base_account)
        .ok_or_else(|| Error::Deserialization("account response without base account".into()))?;
    Ok(AccountState {
        account_number: parse_u64_field(base, "account_number")?,
        sequence: parse_u64_field(base, "sequence")?,
    })
}

#[async_trait]
impl ChainClient for RestClient {
    async fn delegation_rewards(&self, delegator: &str, cancel: &CancellationToken) -> Result<DelegationRewards> {
        let path = format!("cosmos/distribution/v1beta1/delegators/{}/rewards", delegator);
        cancellable(cancel, async {
            Ok(self.get_json(&path, &[]).await?.unwrap_or_default())
        })
        .await
    }

    async fn balance(&self, address: &str, denom: &str, cancel: &CancellationToken) -> Result<Option<String>> {
        let path = format!("cosmos/bank/v1beta1/balances/{}/by_denom", address);
        cancellable(cancel, async {
            let response: Option<BalanceResponse> = self.get_json(&path, &[("denom", denom)]).await?;
            Ok(response.and_then(|r| r.balance).map(|b| b.amount))
        })
        .await
    }

    async fn account(&self, address: &str, cancel: &CancellationToken) -> Result<AccountState> {
        let path = format!("cosmos/auth/v1beta1/accounts/{}", address);
        cancellable(cancel, async {
            let value: Value = self
                .get_json(&path, &[])
                .await?
                .ok_or_else(|| Error::Rpc(format!("account {} not found on {}", address, self.chain_id)))?;
            parse_account(&value)
        })
        .await
    }

    async fn broadcast_sync(&self, tx_bytes: &[u8], cancel: &CancellationToken) -> Result<TxResponse> {
        let request = BroadcastRequest {
            tx_bytes: base64::engine::general_purpose::STANDARD.encode(tx_bytes),
            mode: "BROADCAST_MODE_SYNC",
        };
        cancellable(cancel, async {
            let envelope: TxEnvelope = self
                .post_json("cosmos/tx/v1beta1/txs", &request)
                .await?
                .ok_or_else(|| Error::Rpc(format!("broadcast endpoint missing on {}", self.chain_id)))?;
            Ok(envelope.tx_response)
        })
        .await
    }

    async fn get_tx(&self, hash: &str, cancel: &CancellationToken) -> Result<Option<TxResponse>> {
        let path = format!("cosmos/tx/v1beta1/txs/{}", hash);
        cancellable(cancel, async {
            let envelope: Option<TxEnvelope> = self.get_json(&path, &[]).await?;
            Ok(envelope.map(|e| e.tx_response))
        })
        .await
    }

    async fn fee_allowance(
        &self,
        granter: &str,
        grantee: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<FeeAllowance>> {
        let path = format!("cosmos/feegrant/v1beta1/allowance/{}/{}", granter, grantee);
        cancellable(cancel, async {
            let value: Option<Value> = self.get_json(&path, &[]).await?;
            match value.as_ref().and_then(|v| v.get("allowance")).and_then(|g| g.get("allowance")) {
                Some(allowance) => Ok(Some(FeeAllowance::from_value(allowance)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn grants(
        &self,
        granter: &str,
        grantee: &str,
        msg_type_url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<AuthzGrant>> {
        let query = [
            ("granter", granter),
            ("grantee", grantee),
            ("msg_type_url", msg_type_url),
        ];
        cancellable(cancel, async {
            let value: Option<Value> = self.get_json("cosmos/authz/v1beta1/grants", &query).await?;
            value
                .as_ref()
                .and_then(|v| v.get("grants"))
                .and_then(Value::as_array)
                .map(|grants| grants.iter().map(AuthzGrant::from_value).collect())
                .unwrap_or_else(|| Ok(Vec::new()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::test_chain;
    use serde_json::json;

    #[test]
    fn test_endpoint_keeps_base_path() {
        let mut chain = test_chain("cosmoshub-4", "cosmos", "uatom");
        chain.rpc = "https://rest.example.com/cosmoshub".to_string();
        let client = RestClient::new(&chain, Duration::from_secs(5)).unwrap();
        let url = client.endpoint("/cosmos/tx/v1beta1/txs").unwrap();
        assert_eq!(url.as_str(), "https://rest.example.com/cosmoshub/cosmos/tx/v1beta1/txs");
    }

    #[test]
    fn test_invalid_endpoint_is_config_error() {
        let mut chain = test_chain("cosmoshub-4", "cosmos", "uatom");
        chain.rpc = "not a url".to_string();
        assert!(matches!(
            RestClient::new(&chain, Duration::from_secs(5)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_parse_base_and_vesting_accounts() {
        let base = json!({"account": {
            "@type": "/cosmos.auth.v1beta1.BaseAccount",
            "address": "cosmos1...",
            "account_number": "42",
            "sequence": "7"
        }});
        assert_eq!(
            parse_account(&base).unwrap(),
            AccountState { account_number: 42, sequence: 7 }
        );

        let vesting = json!({"account": {
            "@type": "/cosmos.vesting.v1beta1.ContinuousVestingAccount",
            "base_vesting_account": {
                "base_account": {"account_number": "3", "sequence": "0"}
            }
        }});
        assert_eq!(
            parse_account(&vesting).unwrap(),
            AccountState { account_number: 3, sequence: 0 }
        );

        assert!(parse_account(&json!({"account": {}})).is_err());
    }
}
