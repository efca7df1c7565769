//! Transaction broadcaster
//!
//! Builds, signs and submits transactions through a [`ChainClient`], then polls
//! until the transaction is included or the confirmation window closes.
//! Submission is retried on stale account sequences and transient connection
//! failures, re-reading account state and re-signing on every attempt.

pub mod envelope;
pub mod msgs;
pub mod proto;

use backoff::{future::retry, ExponentialBackoff};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::Bech32Address;
use crate::error::{Error, Result};
use crate::keyring::{KeyInfo, Keyring};
use crate::rpc::{ChainClient, TxResponse, CODE_WRONG_SEQUENCE};

pub use envelope::Fee;
pub use msgs::{Coin, Msg};

/// Broadcast and confirmation tuning
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    pub gas_limit: u64,
    pub poll_interval: Duration,
    pub confirm_timeout: Duration,
    pub retry_base_delay: Duration,
    pub max_retry_elapsed: Duration,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            gas_limit: 2_000_000,
            poll_interval: Duration::from_millis(100),
            confirm_timeout: Duration::from_secs(60),
            retry_base_delay: Duration::from_millis(200),
            max_retry_elapsed: Duration::from_secs(5),
        }
    }
}

struct Signer<'a> {
    address: &'a str,
    key: KeyInfo,
}

/// Signs and submits transactions with keys from a [`Keyring`]
pub struct Broadcaster {
    keyring: Arc<dyn Keyring>,
    settings: BroadcastSettings,
}

impl Broadcaster {
    pub fn new(keyring: Arc<dyn Keyring>, settings: BroadcastSettings) -> Self {
        Self { keyring, settings }
    }

    pub fn settings(&self) -> &BroadcastSettings {
        &self.settings
    }

    /// Sign `msgs` with every signer they require, submit them in a single
    /// transaction and wait for inclusion.
    ///
    /// Returns the included transaction on success. A transaction the node
    /// refuses or includes with a non-zero code is [`Error::TxRejected`]; one
    /// that was submitted but not seen in time is
    /// [`Error::ConfirmationIndeterminate`].
    pub async fn send(
        &self,
        client: &dyn ChainClient,
        chain_id: &str,
        msgs: &[Msg],
        fee: &Fee,
        cancel: &CancellationToken,
    ) -> Result<TxResponse> {
        if msgs.is_empty() {
            return Err(Error::InvalidMessage("transaction without messages".into()));
        }
        for msg in msgs {
            msg.validate_basic()?;
        }
        let signers = self.resolve_signers(msgs)?;
        let body = envelope::encode_body(msgs, "");

        let backoff = ExponentialBackoff {
            initial_interval: self.settings.retry_base_delay,
            max_interval: self.settings.retry_base_delay * 4,
            max_elapsed_time: Some(self.settings.max_retry_elapsed),
            ..Default::default()
        };

        let body = body.as_slice();
        let signers = signers.as_slice();
        // Cancellation is checked per attempt, before signing. Once bytes have
        // gone out the attempt runs to completion so its outcome is not lost.
        let submitted = retry(backoff, move || async move {
            if cancel.is_cancelled() {
                return Err(backoff::Error::permanent(Error::Cancelled));
            }
            match self.submit_once(client, chain_id, body, signers, fee, cancel).await {
                Ok(response) => Ok(response),
                Err(e) if e.is_retryable() => {
                    warn!(chain = %chain_id, "Retryable broadcast error: {}", e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => {
                    error!(chain = %chain_id, "Permanent broadcast error: {}", e);
                    Err(backoff::Error::permanent(e))
                }
            }
        })
        .await?;

        info!(chain = %chain_id, tx_hash = %submitted.txhash, "Transaction accepted, awaiting inclusion");
        self.confirm(client, &submitted.txhash, cancel).await
    }

    /// Distinct signers in message order, each mapped to a keyring key
    fn resolve_signers<'a>(&self, msgs: &'a [Msg]) -> Result<Vec<Signer<'a>>> {
        let keys = self.keyring.list_keys()?;
        let mut signers: Vec<Signer<'a>> = Vec::new();

        for address in msgs.iter().flat_map(Msg::signers) {
            if signers.iter().any(|s| s.address == address) {
                continue;
            }
            let decoded = Bech32Address::parse(address)?;
            let key = keys
                .iter()
                .find(|k| k.account_id.as_slice() == decoded.bytes.as_slice())
                .cloned()
                .ok_or_else(|| {
                    Error::InvalidMessage(format!("signer {} is not held by the keyring", address))
                })?;
            signers.push(Signer { address, key });
        }
        Ok(signers)
    }

    /// One attempt: fetch account state, sign, broadcast
    async fn submit_once(
        &self,
        client: &dyn ChainClient,
        chain_id: &str,
        body: &[u8],
        signers: &[Signer<'_>],
        fee: &Fee,
        cancel: &CancellationToken,
    ) -> Result<TxResponse> {
        let mut accounts = Vec::with_capacity(signers.len());
        for signer in signers {
            accounts.push(client.account(signer.address, cancel).await?);
        }

        let signer_data: Vec<envelope::SignerData> = signers
            .iter()
            .zip(&accounts)
            .map(|(signer, account)| envelope::SignerData {
                public_key: signer.key.public_key.clone(),
                sequence: account.sequence,
            })
            .collect();
        let auth_info = envelope::encode_auth_info(&signer_data, fee);

        let mut signatures = Vec::with_capacity(signers.len());
        for (signer, account) in signers.iter().zip(&accounts) {
            let doc = envelope::sign_doc(body, &auth_info, chain_id, account.account_number);
            let signature = self
                .keyring
                .sign(&signer.key.account_id, &doc)
                .map_err(|e| Error::Signing(format!("{}: {}", signer.address, e)))?;
            signatures.push(signature);
        }

        let raw = envelope::tx_raw(body, &auth_info, &signatures);
        let local_hash = envelope::tx_hash(&raw);
        debug!(chain = %chain_id, tx_hash = %local_hash, bytes = raw.len(), "Broadcasting");

        let mut response = match client.broadcast_sync(&raw, cancel).await {
            Ok(response) => response,
            // The node may have taken the bytes before the call ended
            Err(Error::RpcConnection(e)) => {
                warn!(chain = %chain_id, tx_hash = %local_hash, "Broadcast connection lost: {}", e);
                return Err(Error::ConfirmationIndeterminate { tx_hash: local_hash });
            }
            Err(Error::Cancelled) => {
                warn!(chain = %chain_id, tx_hash = %local_hash, "Broadcast cancelled in flight");
                return Err(Error::ConfirmationIndeterminate { tx_hash: local_hash });
            }
            Err(e) => return Err(e),
        };
        if response.txhash.is_empty() {
            response.txhash = local_hash;
        }

        match response.code {
            0 => Ok(response),
            CODE_WRONG_SEQUENCE => Err(Error::StaleSequence(response.raw_log)),
            code => Err(Error::TxRejected {
                tx_hash: response.txhash,
                code,
                raw_log: response.raw_log,
            }),
        }
    }

    /// Poll for inclusion until found, timed out or cancelled
    async fn confirm(
        &self,
        client: &dyn ChainClient,
        tx_hash: &str,
        cancel: &CancellationToken,
    ) -> Result<TxResponse> {
        let indeterminate = || Error::ConfirmationIndeterminate {
            tx_hash: tx_hash.to_string(),
        };
        let deadline = tokio::time::sleep(self.settings.confirm_timeout);
        tokio::pin!(deadline);

        let poll = self.settings.poll_interval;
        let mut ticker = interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(indeterminate()),
                _ = &mut deadline => {
                    warn!(%tx_hash, "Confirmation timed out");
                    return Err(indeterminate());
                }
                _ = ticker.tick() => {
                    match client.get_tx(tx_hash, cancel).await {
                        Ok(Some(response)) if response.is_ok() => {
                            info!(%tx_hash, height = response.height, "Transaction included");
                            return Ok(response);
                        }
                        Ok(Some(response)) => {
                            return Err(Error::TxRejected {
                                tx_hash: tx_hash.to_string(),
                                code: response.code,
                                raw_log: response.raw_log,
                            });
                        }
                        Ok(None) => {}
                        Err(Error::Cancelled) => return Err(indeterminate()),
                        Err(e) => debug!(%tx_hash, "Inclusion poll failed: {}", e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::address;
    use crate::keyring::tests::test_keyring;
    use crate::keyring::Operator;
    use crate::rpc::mock::{Inclusion, MockChainClient};
    use std::sync::atomic::Ordering;

    pub(crate) fn fast_settings() -> BroadcastSettings {
        BroadcastSettings {
            gas_limit: 200_000,
            poll_interval: Duration::from_millis(5),
            confirm_timeout: Duration::from_millis(200),
            retry_base_delay: Duration::from_millis(1),
            max_retry_elapsed: Duration::from_secs(2),
        }
    }

    fn setup() -> (Broadcaster, String) {
        let keyring = Arc::new(test_keyring());
        let operator = Operator::from_keyring(keyring.as_ref()).unwrap();
        let grantee = operator.address("cosmos").unwrap();
        (Broadcaster::new(keyring, fast_settings()), grantee)
    }

    fn exec(grantee: &str) -> Vec<Msg> {
        vec![Msg::Exec {
            grantee: grantee.to_string(),
            msgs: vec![Msg::WithdrawDelegatorReward {
                delegator: address::encode("cosmos", &[7; 20]).unwrap(),
                validator: address::encode("cosmosvaloper", &[8; 20]).unwrap(),
            }],
        }]
    }

    fn fee() -> Fee {
        Fee {
            amount: vec![Coin::new("uatom", 5000)],
            gas_limit: 200_000,
            granter: None,
        }
    }

    #[tokio::test]
    async fn test_send_confirms() {
        let (broadcaster, grantee) = setup();
        let client = MockChainClient::new();
        client.set_inclusion(Inclusion::Included {
            code: 0,
            raw_log: String::new(),
            after_polls: 2,
        });

        let response = broadcaster
            .send(&client, "cosmoshub-4", &exec(&grantee), &fee(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.is_ok());
        assert_eq!(client.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_sequence_is_retried() {
        let (broadcaster, grantee) = setup();
        let client = MockChainClient::new();
        client.push_broadcast(CODE_WRONG_SEQUENCE, "account sequence mismatch");

        broadcaster
            .send(&client, "cosmoshub-4", &exec(&grantee), &fee(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(client.broadcast_count(), 2);
        assert_eq!(client.account_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_check_failure_is_rejection() {
        let (broadcaster, grantee) = setup();
        let client = MockChainClient::new();
        client.push_broadcast(13, "insufficient fee");

        let err = broadcaster
            .send(&client, "cosmoshub-4", &exec(&grantee), &fee(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::TxRejected { code, raw_log, .. } => {
                assert_eq!(code, 13);
                assert_eq!(raw_log, "insufficient fee");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_deliver_failure_is_rejection() {
        let (broadcaster, grantee) = setup();
        let client = MockChainClient::new();
        client.set_inclusion(Inclusion::Included {
            code: 5,
            raw_log: "failed to execute message".into(),
            after_polls: 0,
        });

        let err = broadcaster
            .send(&client, "cosmoshub-4", &exec(&grantee), &fee(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TxRejected { code: 5, .. }));
    }

    #[tokio::test]
    async fn test_unconfirmed_is_indeterminate() {
        let (broadcaster, grantee) = setup();
        let client = MockChainClient::new();
        client.set_inclusion(Inclusion::Never);

        let err = broadcaster
            .send(&client, "cosmoshub-4", &exec(&grantee), &fee(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::ConfirmationIndeterminate { tx_hash } => assert_eq!(tx_hash, "TX1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_during_broadcast_is_indeterminate() {
        let (broadcaster, grantee) = setup();
        let client = MockChainClient::new();
        client.cancel_in_broadcast.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let err = broadcaster
            .send(&client, "cosmoshub-4", &exec(&grantee), &fee(), &cancel)
            .await
            .unwrap_err();
        assert!(cancel.is_cancelled());
        assert!(err.is_indeterminate());
        assert_eq!(client.broadcast_count(), 1);

        let sent = envelope::tx_hash(&client.broadcasts.lock()[0]);
        match err {
            Error::ConfirmationIndeterminate { tx_hash } => assert_eq!(tx_hash, sent),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_during_confirmation_is_indeterminate() {
        let (broadcaster, grantee) = setup();
        let client = MockChainClient::new();
        client.set_inclusion(Inclusion::Never);
        *client.cancel_on_poll.lock() = Some(2);
        let cancel = CancellationToken::new();

        let started = std::time::Instant::now();
        let err = broadcaster
            .send(&client, "cosmoshub-4", &exec(&grantee), &fee(), &cancel)
            .await
            .unwrap_err();
        // well inside the confirmation timeout
        assert!(started.elapsed() < fast_settings().confirm_timeout);
        match err {
            Error::ConfirmationIndeterminate { tx_hash } => assert_eq!(tx_hash, "TX1"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_foreign_signer_refused() {
        let (broadcaster, _) = setup();
        let client = MockChainClient::new();
        let stranger = address::encode("cosmos", &[9; 20]).unwrap();

        let err = broadcaster
            .send(&client, "cosmoshub-4", &exec(&stranger), &fee(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
        assert_eq!(client.broadcast_count(), 0);

        let err = broadcaster
            .send(&client, "cosmoshub-4", &[], &fee(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_submit() {
        let (broadcaster, grantee) = setup();
        let client = MockChainClient::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = broadcaster
            .send(&client, "cosmoshub-4", &exec(&grantee), &fee(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(client.broadcast_count(), 0);
    }
}
