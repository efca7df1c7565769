//! Authorization validator
//!
//! Checks, read-only against chain state, that an account has given the
//! operator everything a restake needs: a fee allowance usable for `MsgExec`
//! and authz grants for claiming rewards and delegating.

use chrono::{DateTime, Utc};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::rpc::ChainClient;
use crate::tx::msgs::{MSG_DELEGATE, MSG_EXEC, MSG_WITHDRAW_DELEGATOR_REWARD};

/// The first grant found missing, in check order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingGrant {
    FeeAllowance,
    FeeAllowanceExcludesExec,
    FeeAllowanceExpired,
    ClaimGrant,
    DelegateGrant,
}

impl fmt::Display for MissingGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingGrant::FeeAllowance => write!(f, "no fee allowance granted to the operator"),
            MissingGrant::FeeAllowanceExcludesExec => {
                write!(f, "fee allowance does not cover {}", MSG_EXEC)
            }
            MissingGrant::FeeAllowanceExpired => write!(f, "fee allowance has expired"),
            MissingGrant::ClaimGrant => write!(
                f,
                "no active authorization for {}",
                MSG_WITHDRAW_DELEGATOR_REWARD
            ),
            MissingGrant::DelegateGrant => {
                write!(f, "no active authorization for {}", MSG_DELEGATE)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthzStatus {
    Granted,
    Missing(MissingGrant),
}

impl AuthzStatus {
    pub fn is_granted(&self) -> bool {
        matches!(self, AuthzStatus::Granted)
    }

    /// Human readable reason when something is missing
    pub fn reason(&self) -> Option<String> {
        match self {
            AuthzStatus::Granted => None,
            AuthzStatus::Missing(missing) => Some(missing.to_string()),
        }
    }
}

/// Validate the grants `granter` has given `operator`. Stops at the first
/// missing grant. RPC failures are errors, never a missing grant.
pub async fn validate(
    client: &dyn ChainClient,
    granter: &str,
    operator: &str,
    cancel: &CancellationToken,
) -> Result<AuthzStatus> {
    validate_at(client, granter, operator, Utc::now(), cancel).await
}

async fn validate_at(
    client: &dyn ChainClient,
    granter: &str,
    operator: &str,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<AuthzStatus> {
    let Some(allowance) = client.fee_allowance(granter, operator, cancel).await? else {
        return Ok(AuthzStatus::Missing(MissingGrant::FeeAllowance));
    };
    if !allowance.covers(MSG_EXEC) {
        return Ok(AuthzStatus::Missing(MissingGrant::FeeAllowanceExcludesExec));
    }
    if allowance.is_expired(now) {
        return Ok(AuthzStatus::Missing(MissingGrant::FeeAllowanceExpired));
    }

    for (type_url, missing) in [
        (MSG_WITHDRAW_DELEGATOR_REWARD, MissingGrant::ClaimGrant),
        (MSG_DELEGATE, MissingGrant::DelegateGrant),
    ] {
        let grants = client.grants(granter, operator, type_url, cancel).await?;
        if !grants.iter().any(|g| !g.is_expired(now)) {
            debug!(%granter, type_url, "Grant missing or expired");
            return Ok(AuthzStatus::Missing(missing));
        }
    }

    Ok(AuthzStatus::Granted)
}
