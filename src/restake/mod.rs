//! Restake engine
//!
//! Claims an account's pending rewards and re-delegates them, together with
//! any liquid balance above the account's tolerance, across the validators
//! that produced them. Everything goes out as one `MsgExec` signed by the
//! operator, with the fee drawn from the account's allowance.

pub mod plan;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{Chain, ChainRegistry};
use crate::error::{Error, Result};
use crate::keyring::Operator;
use crate::rpc::{ChainClient, ClientPool};
use crate::store::RecordStore;
use crate::tx::{Broadcaster, Coin, Fee};
use crate::types::{Amount, PendingTx, Record};

pub use plan::RestakePlan;

/// A committed restake
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestakeReport {
    pub address: String,
    pub chain_id: String,
    pub tx_hash: String,
    pub height: i64,
    /// Rewards claimed; this is the amount booked as restaked
    pub claimed: Amount,
    pub delegated: Amount,
    pub validators: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RestakeOutcome {
    /// No pending rewards; nothing was sent
    NoRewards,
    Committed(RestakeReport),
    /// Submitted, but inclusion could not be confirmed
    Pending(PendingTx),
}

impl RestakeOutcome {
    /// Amount to book now. Pending transactions book nothing until reconciled.
    pub fn restaked(&self) -> Amount {
        match self {
            RestakeOutcome::Committed(report) => report.claimed,
            RestakeOutcome::NoRewards | RestakeOutcome::Pending(_) => 0,
        }
    }

    /// Book the outcome on the account's record
    pub fn apply(&self, record: &mut Record, now: DateTime<Utc>) {
        match self {
            RestakeOutcome::Pending(pending) => record.record_pending(pending.clone(), now),
            outcome => record.record_success(outcome.restaked(), now),
        }
    }
}

/// What became of a previously pending transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Included successfully; carries the amount to credit
    Committed(Amount),
    /// Included with a failure code; carries the description
    Failed(String),
    /// Not known to the chain
    Missing,
}

impl Reconciliation {
    /// Error note for a transaction that did not land
    pub fn note(&self, tx_hash: &str) -> Option<String> {
        match self {
            Reconciliation::Committed(_) => None,
            Reconciliation::Failed(reason) => Some(reason.clone()),
            Reconciliation::Missing => Some(format!(
                "Transaction {} was never included and has been dropped",
                tx_hash
            )),
        }
    }
}

/// Apply the outcome of a pending transaction, if it is still the one on record
pub fn settle(record: &mut Record, tx_hash: &str, reconciliation: &Reconciliation) {
    if record.pending_tx.as_ref().map(|p| p.tx_hash.as_str()) != Some(tx_hash) {
        return;
    }
    record.pending_tx = None;
    match reconciliation {
        Reconciliation::Committed(amount) => {
            record.cumulative_restaked = record.cumulative_restaked.saturating_add(*amount);
            record.last_error = None;
        }
        failed => record.last_error = failed.note(tx_hash),
    }
}

pub struct RestakeEngine {
    registry: Arc<ChainRegistry>,
    pool: Arc<ClientPool>,
    broadcaster: Arc<Broadcaster>,
    operator: Operator,
}

impl RestakeEngine {
    pub fn new(
        registry: Arc<ChainRegistry>,
        pool: Arc<ClientPool>,
        broadcaster: Arc<Broadcaster>,
        operator: Operator,
    ) -> Self {
        Self {
            registry,
            pool,
            broadcaster,
            operator,
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    /// Pooled client for `chain`
    pub fn client(&self, chain: &Chain) -> Result<Arc<dyn ChainClient>> {
        self.pool.get(chain)
    }

    /// Claim and re-delegate the rewards of `address`, keeping `tolerance`
    /// liquid.
    pub async fn restake(
        &self,
        address: &str,
        tolerance: Amount,
        cancel: &CancellationToken,
    ) -> Result<RestakeOutcome> {
        let chain = self.registry.lookup_by_address(address)?;
        let client = self.pool.get(chain)?;

        let rewards = client.delegation_rewards(address, cancel).await?;
        let claims = plan::reward_shares(&rewards, &chain.native_denom)?;
        if claims.is_empty() {
            debug!(%address, chain = %chain.id, "No pending rewards");
            return Ok(RestakeOutcome::NoRewards);
        }

        let balance = client.balance(address, &chain.native_denom, cancel).await?;
        let balance = plan::parse_balance(address, balance)?;

        let plan = RestakePlan::build(address, claims, balance, tolerance)?;
        info!(
            %address,
            chain = %chain.id,
            rewards = %plan.total_rewards,
            stakable = %plan.stakable,
            delegated = %plan.delegated(),
            dust = %plan.dust(),
            "Restake plan ready"
        );

        self.submit(client.as_ref(), chain, &plan, cancel).await
    }

    async fn submit(
        &self,
        client: &dyn ChainClient,
        chain: &Chain,
        plan: &RestakePlan,
        cancel: &CancellationToken,
    ) -> Result<RestakeOutcome> {
        let grantee = self.operator.address(&chain.prefix)?;
        let exec = plan.exec(&grantee, &chain.native_denom);
        let fee = self.fee(chain, &plan.delegator);

        match self
            .broadcaster
            .send(client, &chain.id, std::slice::from_ref(&exec), &fee, cancel)
            .await
        {
            Ok(response) => Ok(RestakeOutcome::Committed(RestakeReport {
                address: plan.delegator.clone(),
                chain_id: chain.id.clone(),
                tx_hash: response.txhash,
                height: response.height,
                claimed: plan.total_rewards,
                delegated: plan.delegated(),
                validators: plan.claims.len(),
            })),
            Err(Error::ConfirmationIndeterminate { tx_hash }) => {
                warn!(address = %plan.delegator, chain = %chain.id, %tx_hash, "Restake outcome indeterminate");
                Ok(RestakeOutcome::Pending(PendingTx {
                    chain_id: chain.id.clone(),
                    tx_hash,
                    amount: plan.total_rewards,
                    submitted_at: Utc::now().timestamp(),
                }))
            }
            Err(e) => Err(e),
        }
    }

    /// Fee paid out of the account's own allowance to the operator
    fn fee(&self, chain: &Chain, account: &str) -> Fee {
        Fee {
            amount: chain
                .fee_amount
                .map(|amount| vec![Coin::new(chain.native_denom.as_str(), Amount::from(amount))])
                .unwrap_or_default(),
            gas_limit: chain
                .gas_limit
                .unwrap_or(self.broadcaster.settings().gas_limit),
            granter: Some(account.to_string()),
        }
    }

    /// Look up a transaction left pending by an earlier run
    pub async fn reconcile(&self, pending: &PendingTx, cancel: &CancellationToken) -> Result<Reconciliation> {
        let chain = self.registry.lookup_by_id(&pending.chain_id)?;
        let client = self.pool.get(chain)?;

        let reconciliation = match client.get_tx(&pending.tx_hash, cancel).await? {
            Some(response) if response.is_ok() => Reconciliation::Committed(pending.amount),
            Some(response) => Reconciliation::Failed(format!(
                "Transaction {} failed with code {}: {}",
                pending.tx_hash, response.code, response.raw_log
            )),
            None => Reconciliation::Missing,
        };
        info!(chain = %chain.id, tx_hash = %pending.tx_hash, ?reconciliation, "Reconciled pending transaction");
        Ok(reconciliation)
    }

    /// Resolve the transaction an earlier run left pending on `record` and
    /// book the result in `store`. Returns `None` when nothing was pending.
    /// Call this before sending anything new for the account.
    pub async fn settle_pending(
        &self,
        store: &RecordStore,
        record: &Record,
        cancel: &CancellationToken,
    ) -> Result<Option<Reconciliation>> {
        let Some(pending) = &record.pending_tx else {
            return Ok(None);
        };
        let reconciliation = self.reconcile(pending, cancel).await?;
        let tx_hash = pending.tx_hash.as_str();

        match store.update(&record.address, |r| settle(r, tx_hash, &reconciliation)) {
            Ok(_) | Err(Error::RecordNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        // A restake later in the same run clears last_error
        if let Some(note) = reconciliation.note(tx_hash) {
            warn!(address = %record.address, %tx_hash, "Earlier restake did not land: {}", note);
        }
        Ok(Some(reconciliation))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::{address, test_chain};
    use crate::keyring::tests::test_keyring;
    use crate::rpc::mock::{Inclusion, MockChainClient};
    use crate::rpc::TxResponse;
    use crate::tx::tests::fast_settings;
    use crate::tx::BroadcastSettings;
    use crate::types::Cadence;
    use tempfile::tempdir;

    pub(crate) fn account(fill: u8) -> String {
        address::encode("cosmos", &[fill; 20]).unwrap()
    }

    pub(crate) fn validator(fill: u8) -> String {
        address::encode("cosmosvaloper", &[fill; 20]).unwrap()
    }

    /// Engine over a single cosmoshub chain backed by `client`
    pub(crate) fn engine_with(client: Arc<MockChainClient>) -> RestakeEngine {
        engine_with_settings(client, fast_settings())
    }

    pub(crate) fn engine_with_settings(client: Arc<MockChainClient>, settings: BroadcastSettings) -> RestakeEngine {
        let keyring = Arc::new(test_keyring());
        let operator = Operator::from_keyring(keyring.as_ref()).unwrap();
        let registry = Arc::new(ChainRegistry::new(vec![test_chain("cosmoshub-4", "cosmos", "uatom")]));
        let pool = Arc::new(ClientPool::new(Arc::new(move |_chain: &Chain| {
            let client: Arc<dyn ChainClient> = client.clone();
            Ok(client)
        })));
        let broadcaster = Arc::new(Broadcaster::new(keyring, settings));
        RestakeEngine::new(registry, pool, broadcaster, operator)
    }

    #[tokio::test]
    async fn test_two_validator_restake() {
        let (v1, v2) = (validator(1), validator(2));
        let client = Arc::new(
            MockChainClient::new()
                .with_rewards("uatom", &[(v1.as_str(), "30.4"), (v2.as_str(), "70")])
                .with_balance(Some("0")),
        );
        let engine = engine_with(client.clone());

        let outcome = engine
            .restake(&account(9), 10, &CancellationToken::new())
            .await
            .unwrap();
        let RestakeOutcome::Committed(report) = &outcome else {
            panic!("expected commit, got {:?}", outcome);
        };
        assert_eq!(report.claimed, 100);
        assert_eq!(report.delegated, 90);
        assert_eq!(report.validators, 2);
        assert_eq!(outcome.restaked(), 100);
        assert_eq!(client.broadcast_count(), 1);

        // the signed transaction carries the fee granter and both amounts
        let tx = String::from_utf8_lossy(&client.broadcasts.lock()[0]).to_string();
        assert!(tx.contains(&account(9)));
        assert!(tx.contains("27") && tx.contains("63"));
    }

    #[tokio::test]
    async fn test_zero_rewards_is_noop() {
        let client = Arc::new(MockChainClient::new().with_rewards("uatom", &[]));
        let engine = engine_with(client.clone());

        let outcome = engine
            .restake(&account(9), 10, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RestakeOutcome::NoRewards);
        assert_eq!(outcome.restaked(), 0);
        assert_eq!(client.broadcast_count(), 0);
        // the balance is never queried
        assert!(!client.queries.lock().iter().any(|q| q.starts_with("balance")));
    }

    #[tokio::test]
    async fn test_absent_balance_is_error() {
        let v1 = validator(1);
        let client = Arc::new(
            MockChainClient::new()
                .with_rewards("uatom", &[(v1.as_str(), "30")])
                .with_balance(None),
        );
        let engine = engine_with(client.clone());

        let err = engine
            .restake(&account(9), 0, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBalance { .. }));
        assert_eq!(client.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_chain_and_malformed_address() {
        let engine = engine_with(Arc::new(MockChainClient::new()));
        let osmo = address::encode("osmo", &[1; 20]).unwrap();
        let cancel = CancellationToken::new();

        assert!(matches!(
            engine.restake(&osmo, 0, &cancel).await,
            Err(Error::ChainNotFound(_))
        ));
        assert!(matches!(
            engine.restake("not-an-address", 0, &cancel).await,
            Err(Error::MalformedAddress { .. })
        ));
    }

    #[tokio::test]
    async fn test_indeterminate_becomes_pending() {
        let v1 = validator(1);
        let client = Arc::new(
            MockChainClient::new()
                .with_rewards("uatom", &[(v1.as_str(), "50")])
                .with_balance(Some("0")),
        );
        client.set_inclusion(Inclusion::Never);
        let engine = engine_with(client.clone());

        let outcome = engine
            .restake(&account(9), 0, &CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            RestakeOutcome::Pending(pending) => {
                assert_eq!(pending.tx_hash, "TX1");
                assert_eq!(pending.amount, 50);
                assert_eq!(pending.chain_id, "cosmoshub-4");
            }
            other => panic!("expected pending, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconcile() {
        let client = Arc::new(MockChainClient::new());
        client.set_inclusion(Inclusion::Never);
        client.known_txs.lock().insert(
            "GOOD".into(),
            TxResponse { txhash: "GOOD".into(), ..Default::default() },
        );
        client.known_txs.lock().insert(
            "BAD".into(),
            TxResponse {
                txhash: "BAD".into(),
                code: 11,
                raw_log: "out of gas".into(),
                ..Default::default()
            },
        );
        let engine = engine_with(client);
        let cancel = CancellationToken::new();
        let pending = |hash: &str| PendingTx {
            chain_id: "cosmoshub-4".into(),
            tx_hash: hash.into(),
            amount: 40,
            submitted_at: 0,
        };

        assert_eq!(
            engine.reconcile(&pending("GOOD"), &cancel).await.unwrap(),
            Reconciliation::Committed(40)
        );
        match engine.reconcile(&pending("BAD"), &cancel).await.unwrap() {
            Reconciliation::Failed(reason) => assert!(reason.contains("out of gas")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            engine.reconcile(&pending("GONE"), &cancel).await.unwrap(),
            Reconciliation::Missing
        );
    }

    #[test]
    fn test_settle_ignores_other_transactions() {
        let mut record = Record::new(account(1), Cadence::Daily, 0);
        settle(&mut record, "AA", &Reconciliation::Committed(10));
        assert_eq!(record.cumulative_restaked, 0);

        record.pending_tx = Some(PendingTx {
            chain_id: "cosmoshub-4".into(),
            tx_hash: "AA".into(),
            amount: 10,
            submitted_at: 0,
        });
        settle(&mut record, "AA", &Reconciliation::Missing);
        assert!(record.pending_tx.is_none());
        assert!(record.last_error.as_deref().unwrap().contains("AA"));
    }

    #[tokio::test]
    async fn test_settle_pending_books_the_result() {
        let client = Arc::new(MockChainClient::new());
        client.known_txs.lock().insert(
            "EARLIER".into(),
            TxResponse { txhash: "EARLIER".into(), ..Default::default() },
        );
        let engine = engine_with(client.clone());
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        let cancel = CancellationToken::new();

        let mut record = Record::new(account(1), Cadence::Daily, 0);
        assert_eq!(engine.settle_pending(&store, &record, &cancel).await.unwrap(), None);

        record.pending_tx = Some(PendingTx {
            chain_id: "cosmoshub-4".into(),
            tx_hash: "EARLIER".into(),
            amount: 40,
            submitted_at: 0,
        });
        store.put(&record).unwrap();

        let settled = engine.settle_pending(&store, &record, &cancel).await.unwrap();
        assert_eq!(settled, Some(Reconciliation::Committed(40)));
        let stored = store.get(&record.address).unwrap();
        assert!(stored.pending_tx.is_none());
        assert_eq!(stored.cumulative_restaked, 40);
        assert_eq!(client.broadcast_count(), 0);
    }
}
