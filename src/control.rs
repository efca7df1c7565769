//! Control operations
//!
//! The request surface used by the CLI: register an account after checking
//! its grants, read its record, trigger an on-demand restake, remove it, and
//! inspect the chain directory and the operator's addresses.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::authz::{self, AuthzStatus};
use crate::chain::{address, Chain};
use crate::error::{Error, Result};
use crate::restake::{RestakeEngine, RestakeOutcome};
use crate::store::RecordStore;
use crate::types::{Amount, Cadence, Record};

/// The operator's address on one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorAddress {
    pub chain_id: String,
    pub address: String,
}

pub struct Control {
    store: Arc<RecordStore>,
    engine: Arc<RestakeEngine>,
}

impl Control {
    pub fn new(store: Arc<RecordStore>, engine: Arc<RestakeEngine>) -> Self {
        Self { store, engine }
    }

    /// Validate the account's grants and file a fresh record for it. Missing
    /// cadence or tolerance fall back to the chain defaults. Registering an
    /// address again, in any letter case, replaces its record.
    pub async fn register(
        &self,
        address: &str,
        cadence: Option<Cadence>,
        tolerance: Option<Amount>,
        cancel: &CancellationToken,
    ) -> Result<Record> {
        let address = address::normalize(address)?;
        let address = address.as_str();
        let chain = self.engine.registry().lookup_by_address(address)?;
        let cadence = match cadence {
            None | Some(Cadence::Unset) => chain.default_cadence,
            Some(cadence) => cadence,
        };
        let tolerance = tolerance.unwrap_or_else(|| chain.default_tolerance());

        let client = self.engine.client(chain)?;
        let operator = self.engine.operator().address(&chain.prefix)?;
        if let AuthzStatus::Missing(missing) = authz::validate(client.as_ref(), address, &operator, cancel).await? {
            return Err(Error::MissingAuthorization(missing.to_string()));
        }

        let record = Record::new(address, cadence, tolerance);
        self.store.put(&record)?;
        info!(%address, chain = %chain.id, %cadence, %tolerance, "Registered account");
        Ok(record)
    }

    pub fn status(&self, address: &str) -> Result<Record> {
        self.store.get(&address::normalize(address)?)
    }

    /// Restake now, outside the schedule. The tolerance defaults to the
    /// account's registered one, then to the chain's. A registered account's
    /// record is updated with the outcome; a failure is returned, not stored.
    /// A transaction still pending from an earlier run is settled first.
    pub async fn restake(
        &self,
        address: &str,
        tolerance: Option<Amount>,
        cancel: &CancellationToken,
    ) -> Result<RestakeOutcome> {
        let address = address::normalize(address)?;
        let address = address.as_str();
        let registered = match self.store.get(address) {
            Ok(record) => Some(record),
            Err(Error::RecordNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let tolerance = match (tolerance, &registered) {
            (Some(tolerance), _) => tolerance,
            (None, Some(record)) => record.tolerance,
            (None, None) => self.engine.registry().lookup_by_address(address)?.default_tolerance(),
        };

        if let Some(record) = &registered {
            self.engine.settle_pending(&self.store, record, cancel).await?;
        }

        let outcome = self.engine.restake(address, tolerance, cancel).await?;
        if registered.is_some() {
            let now = Utc::now();
            match self.store.update(address, |r| outcome.apply(r, now)) {
                Ok(_) | Err(Error::RecordNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Returns whether a record existed
    pub fn remove(&self, address: &str) -> Result<bool> {
        let address = address::normalize(address)?;
        let address = address.as_str();
        let removed = self.store.delete(address)?;
        if removed {
            info!(%address, "Removed account");
        }
        Ok(removed)
    }

    pub fn chains(&self) -> &[Chain] {
        self.engine.registry().chains()
    }

    pub fn chain(&self, id: &str) -> Result<&Chain> {
        self.engine.registry().lookup_by_id(id)
    }

    /// Operator address on one chain, or on every configured chain
    pub fn operator_address(&self, chain_id: Option<&str>) -> Result<Vec<OperatorAddress>> {
        let chains: Vec<&Chain> = match chain_id {
            Some(id) => vec![self.chain(id)?],
            None => self.chains().iter().collect(),
        };
        chains
            .into_iter()
            .map(|chain| {
                Ok(OperatorAddress {
                    chain_id: chain.id.clone(),
                    address: self.engine.operator().address(&chain.prefix)?,
                })
            })
            .collect()
    }
}
