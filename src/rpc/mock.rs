//! Scriptable in-memory chain used by unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

use super::{
    AccountState, AuthzGrant, ChainClient, DecCoin, DelegationRewards, FeeAllowance, TxResponse,
    ValidatorReward,
};
use crate::error::{Error, Result};

/// What `get_tx` reports for broadcast transactions
#[derive(Debug, Clone)]
pub(crate) enum Inclusion {
    /// Found after `after_polls` empty lookups, with the given result code
    Included { code: u32, raw_log: String, after_polls: usize },
    Never,
}

pub(crate) struct MockChainClient {
    pub rewards: Mutex<DelegationRewards>,
    pub rewards_failure: Mutex<Option<String>>,
    pub balance: Mutex<Option<String>>,
    pub accounts: Mutex<HashMap<String, AccountState>>,
    pub broadcast_script: Mutex<VecDeque<TxResponse>>,
    pub broadcasts: Mutex<Vec<Vec<u8>>>,
    pub inclusion: Mutex<Inclusion>,
    pub known_txs: Mutex<HashMap<String, TxResponse>>,
    pub fee_allowance: Mutex<Option<FeeAllowance>>,
    pub grants: Mutex<HashMap<String, Vec<AuthzGrant>>>,
    pub queries: Mutex<Vec<String>>,
    pub account_fetches: AtomicUsize,
    /// Take the bytes, then cancel the caller's token and fail like an interrupted call
    pub cancel_in_broadcast: AtomicBool,
    /// Cancel the caller's token on the n-th `get_tx` call
    pub cancel_on_poll: Mutex<Option<usize>>,
    /// Hashes handed out by `broadcast_sync`; `inclusion` applies to these only
    issued: Mutex<HashSet<String>>,
    polls: AtomicUsize,
    lookups: AtomicUsize,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            rewards: Mutex::new(DelegationRewards::default()),
            rewards_failure: Mutex::new(None),
            balance: Mutex::new(Some("0".to_string())),
            accounts: Mutex::new(HashMap::new()),
            broadcast_script: Mutex::new(VecDeque::new()),
            broadcasts: Mutex::new(Vec::new()),
            inclusion: Mutex::new(Inclusion::Included {
                code: 0,
                raw_log: String::new(),
                after_polls: 0,
            }),
            known_txs: Mutex::new(HashMap::new()),
            fee_allowance: Mutex::new(None),
            grants: Mutex::new(HashMap::new()),
            queries: Mutex::new(Vec::new()),
            account_fetches: AtomicUsize::new(0),
            cancel_in_broadcast: AtomicBool::new(false),
            cancel_on_poll: Mutex::new(None),
            issued: Mutex::new(HashSet::new()),
            polls: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Set per-validator rewards in `denom`
    pub fn with_rewards(self, denom: &str, rewards: &[(&str, &str)]) -> Self {
        *self.rewards.lock() = DelegationRewards {
            rewards: rewards
                .iter()
                .map(|(validator, amount)| ValidatorReward {
                    validator_address: validator.to_string(),
                    reward: vec![DecCoin {
                        denom: denom.to_string(),
                        amount: amount.to_string(),
                    }],
                })
                .collect(),
            total: Vec::new(),
        };
        self
    }

    pub fn with_balance(self, amount: Option<&str>) -> Self {
        *self.balance.lock() = amount.map(str::to_string);
        self
    }

    /// Queue a check-time response for the next broadcast
    pub fn push_broadcast(&self, code: u32, raw_log: &str) {
        let mut script = self.broadcast_script.lock();
        let txhash = format!("SCRIPTED{}", script.len());
        script.push_back(TxResponse {
            txhash,
            code,
            raw_log: raw_log.to_string(),
            ..Default::default()
        });
    }

    pub fn set_inclusion(&self, inclusion: Inclusion) {
        *self.inclusion.lock() = inclusion;
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().len()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn delegation_rewards(&self, delegator: &str, _cancel: &CancellationToken) -> Result<DelegationRewards> {
        self.queries.lock().push(format!("rewards:{}", delegator));
        if let Some(reason) = self.rewards_failure.lock().clone() {
            return Err(Error::RpcConnection(reason));
        }
        Ok(self.rewards.lock().clone())
    }

    async fn balance(&self, address: &str, denom: &str, _cancel: &CancellationToken) -> Result<Option<String>> {
        self.queries.lock().push(format!("balance:{}:{}", address, denom));
        Ok(self.balance.lock().clone())
    }

    async fn account(&self, address: &str, _cancel: &CancellationToken) -> Result<AccountState> {
        self.account_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .accounts
            .lock()
            .get(address)
            .copied()
            .unwrap_or(AccountState {
                account_number: 1,
                sequence: 0,
            }))
    }

    async fn broadcast_sync(&self, tx_bytes: &[u8], cancel: &CancellationToken) -> Result<TxResponse> {
        let mut broadcasts = self.broadcasts.lock();
        broadcasts.push(tx_bytes.to_vec());
        if self.cancel_in_broadcast.load(Ordering::SeqCst) {
            cancel.cancel();
            return Err(Error::Cancelled);
        }
        let scripted = self.broadcast_script.lock().pop_front();
        let response = scripted.unwrap_or_else(|| TxResponse {
            txhash: format!("TX{}", broadcasts.len()),
            ..Default::default()
        });
        self.issued.lock().insert(response.txhash.clone());
        Ok(response)
    }

    async fn get_tx(&self, hash: &str, cancel: &CancellationToken) -> Result<Option<TxResponse>> {
        let lookup = self.lookups.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.cancel_on_poll.lock() == Some(lookup) {
            cancel.cancel();
            return Ok(None);
        }
        if let Some(known) = self.known_txs.lock().get(hash) {
            return Ok(Some(known.clone()));
        }
        if !self.issued.lock().contains(hash) {
            return Ok(None);
        }
        match self.inclusion.lock().clone() {
            Inclusion::Never => Ok(None),
            Inclusion::Included { code, raw_log, after_polls } => {
                let polls = self.polls.fetch_add(1, Ordering::SeqCst);
                if polls < after_polls {
                    return Ok(None);
                }
                Ok(Some(TxResponse {
                    height: 100,
                    txhash: hash.to_string(),
                    code,
                    raw_log,
                    ..Default::default()
                }))
            }
        }
    }

    async fn fee_allowance(
        &self,
        granter: &str,
        grantee: &str,
        _cancel: &CancellationToken,
    ) -> Result<Option<FeeAllowance>> {
        self.queries.lock().push(format!("feegrant:{}:{}", granter, grantee));
        Ok(self.fee_allowance.lock().clone())
    }

    async fn grants(
        &self,
        granter: &str,
        grantee: &str,
        msg_type_url: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<AuthzGrant>> {
        self.queries
            .lock()
            .push(format!("grants:{}:{}:{}", granter, grantee, msg_type_url));
        Ok(self.grants.lock().get(msg_type_url).cloned().unwrap_or_default())
    }
}
