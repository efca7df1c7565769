//! Proportional re-delegation planning
//!
//! Pure arithmetic over a rewards snapshot: no I/O, no chain access.
//! Every validator with a non-zero reward gets a claim message and a delegation
//! of `floor(stakable * reward / total_rewards)`. Flooring dust stays liquid.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::rpc::DelegationRewards;
use crate::tx::{Coin, Msg};
use crate::types::Amount;

/// Claimable reward of one validator, floored to whole native units
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatorShare {
    pub validator: String,
    pub reward: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delegation {
    pub validator: String,
    pub amount: Amount,
}

/// Claim and re-delegation plan for one account in one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestakePlan {
    pub delegator: String,
    pub claims: Vec<ValidatorShare>,
    pub delegations: Vec<Delegation>,
    pub total_rewards: Amount,
    /// Balance plus rewards minus tolerance, zero when negative
    pub stakable: Amount,
}

impl RestakePlan {
    pub fn build(
        delegator: &str,
        claims: Vec<ValidatorShare>,
        balance: Amount,
        tolerance: Amount,
    ) -> Result<Self> {
        let total_rewards = total(&claims)?;
        let stakable = balance
            .checked_add(total_rewards)
            .ok_or(Error::AmountOverflow("balance plus rewards"))?
            .saturating_sub(tolerance);

        let delegations = if stakable == 0 || total_rewards == 0 {
            Vec::new()
        } else {
            split(stakable, &claims, total_rewards)?
        };

        Ok(Self {
            delegator: delegator.to_string(),
            claims,
            delegations,
            total_rewards,
            stakable,
        })
    }

    pub fn delegated(&self) -> Amount {
        self.delegations.iter().map(|d| d.amount).sum()
    }

    /// Flooring remainder left liquid
    pub fn dust(&self) -> Amount {
        self.stakable - self.delegated()
    }

    /// Claims first, then delegations, in validator order
    pub fn messages(&self, denom: &str) -> Vec<Msg> {
        let claims = self.claims.iter().map(|c| Msg::WithdrawDelegatorReward {
            delegator: self.delegator.clone(),
            validator: c.validator.clone(),
        });
        let delegations = self.delegations.iter().map(|d| Msg::Delegate {
            delegator: self.delegator.clone(),
            validator: d.validator.clone(),
            amount: Coin::new(denom, d.amount),
        });
        claims.chain(delegations).collect()
    }

    /// The whole plan wrapped in one exec for `grantee` to sign
    pub fn exec(&self, grantee: &str, denom: &str) -> Msg {
        Msg::Exec {
            grantee: grantee.to_string(),
            msgs: self.messages(denom),
        }
    }
}

fn total(claims: &[ValidatorShare]) -> Result<Amount> {
    claims.iter().try_fold(0u128, |acc, c| {
        acc.checked_add(c.reward)
            .ok_or(Error::AmountOverflow("total rewards"))
    })
}

fn split(stakable: Amount, claims: &[ValidatorShare], total_rewards: Amount) -> Result<Vec<Delegation>> {
    let mut delegations = Vec::with_capacity(claims.len());
    for claim in claims {
        let amount = mul_div_floor(stakable, claim.reward, total_rewards)
            .ok_or(Error::AmountOverflow("delegation share"))?;
        if amount > 0 {
            delegations.push(Delegation {
                validator: claim.validator.clone(),
                amount,
            });
        }
    }
    Ok(delegations)
}

/// Per-validator rewards in `denom`, floored, zero rewards dropped
pub fn reward_shares(rewards: &DelegationRewards, denom: &str) -> Result<Vec<ValidatorShare>> {
    let mut shares = Vec::new();
    for entry in &rewards.rewards {
        let mut reward: Amount = 0;
        for coin in entry.reward.iter().filter(|c| c.denom == denom) {
            let amount = floor_decimal(&coin.amount)?;
            reward = reward
                .checked_add(amount)
                .ok_or(Error::AmountOverflow("validator reward"))?;
        }
        if reward > 0 {
            shares.push(ValidatorShare {
                validator: entry.validator_address.clone(),
                reward,
            });
        }
    }
    Ok(shares)
}

/// Integer part of a non-negative decimal string such as `"1234.5678"`
pub fn floor_decimal(value: &str) -> Result<Amount> {
    let value = value.trim();
    if value.starts_with('-') {
        return Err(Error::Deserialization(format!("negative amount {}", value)));
    }
    let integer = value.split('.').next().unwrap_or_default();
    if integer.is_empty() {
        return Ok(0);
    }
    integer
        .parse()
        .map_err(|e| Error::Deserialization(format!("bad amount {:?}: {}", value, e)))
}

/// Liquid balance from a balance query. Absent or negative balances are errors.
pub fn parse_balance(address: &str, balance: Option<String>) -> Result<Amount> {
    let invalid = |reason: String| Error::InvalidBalance {
        address: address.to_string(),
        reason,
    };
    let raw = balance.ok_or_else(|| invalid("no balance returned".to_string()))?;
    let raw = raw.trim();
    if raw.starts_with('-') {
        return Err(invalid(format!("negative balance {}", raw)));
    }
    raw.parse()
        .map_err(|e| invalid(format!("unparseable balance {:?}: {}", raw, e)))
}

/// `floor(a * b / d)` without intermediate overflow. `None` when `d` is zero
/// or the quotient does not fit.
fn mul_div_floor(a: u128, b: u128, d: u128) -> Option<u128> {
    if d == 0 {
        return None;
    }
    if let Some(product) = a.checked_mul(b) {
        return Some(product / d);
    }

    let (hi, lo) = widening_mul(a, b);
    if hi >= d {
        return None;
    }
    let mut rem = hi;
    let mut quot: u128 = 0;
    for i in (0..128).rev() {
        let carry = rem >> 127;
        rem = (rem << 1) | ((lo >> i) & 1);
        quot <<= 1;
        if carry == 1 || rem >= d {
            rem = rem.wrapping_sub(d);
            quot |= 1;
        }
    }
    Some(quot)
}

/// Full 256 bit product as (high, low) halves
fn widening_mul(a: u128, b: u128) -> (u128, u128) {
    const MASK: u128 = u64::MAX as u128;
    let (a1, a0) = (a >> 64, a & MASK);
    let (b1, b0) = (b >> 64, b & MASK);

    let p00 = a0 * b0;
    let p01 = a0 * b1;
    let p10 = a1 * b0;
    let p11 = a1 * b1;

    let mid = (p00 >> 64) + (p01 & MASK) + (p10 & MASK);
    let lo = (p00 & MASK) | (mid << 64);
    let hi = p11 + (p01 >> 64) + (p10 >> 64) + (mid >> 64);
    (hi, lo)
}
