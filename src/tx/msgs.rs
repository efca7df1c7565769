//! Staking, distribution and authz messages the restaker submits

use serde::Serialize;

use super::proto::ProtoWriter;
use crate::chain::address;
use crate::error::{Error, Result};
use crate::types::Amount;

pub const MSG_WITHDRAW_DELEGATOR_REWARD: &str = "/cosmos.distribution.v1beta1.MsgWithdrawDelegatorReward";
pub const MSG_DELEGATE: &str = "/cosmos.staking.v1beta1.MsgDelegate";
pub const MSG_EXEC: &str = "/cosmos.authz.v1beta1.MsgExec";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Coin {
    pub denom: String,
    pub amount: Amount,
}

impl Coin {
    pub fn new(denom: impl Into<String>, amount: Amount) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        ProtoWriter::new()
            .string(1, &self.denom)
            .string(2, &self.amount.to_string())
            .finish()
    }
}

/// Protobuf `Any`: a type url and the encoded message
pub(crate) fn encode_any(type_url: &str, value: &[u8]) -> Vec<u8> {
    ProtoWriter::new().string(1, type_url).bytes(2, value).finish()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Msg {
    WithdrawDelegatorReward {
        delegator: String,
        validator: String,
    },
    Delegate {
        delegator: String,
        validator: String,
        amount: Coin,
    },
    /// Executes `msgs` on behalf of their signers using authz grants held by `grantee`
    Exec { grantee: String, msgs: Vec<Msg> },
}

impl Msg {
    pub fn type_url(&self) -> &'static str {
        match self {
            Msg::WithdrawDelegatorReward { .. } => MSG_WITHDRAW_DELEGATOR_REWARD,
            Msg::Delegate { .. } => MSG_DELEGATE,
            Msg::Exec { .. } => MSG_EXEC,
        }
    }

    /// Stateless checks, run before anything is signed
    pub fn validate_basic(&self) -> Result<()> {
        match self {
            Msg::WithdrawDelegatorReward { delegator, validator } => {
                check_address("delegator", delegator)?;
                check_address("validator", validator)
            }
            Msg::Delegate {
                delegator,
                validator,
                amount,
            } => {
                check_address("delegator", delegator)?;
                check_address("validator", validator)?;
                if amount.denom.is_empty() {
                    return Err(Error::InvalidMessage("delegation without denom".into()));
                }
                if amount.amount == 0 {
                    return Err(Error::InvalidMessage(format!(
                        "zero delegation to {}",
                        validator
                    )));
                }
                Ok(())
            }
            Msg::Exec { grantee, msgs } => {
                check_address("grantee", grantee)?;
                if msgs.is_empty() {
                    return Err(Error::InvalidMessage("exec without messages".into()));
                }
                for msg in msgs {
                    if matches!(msg, Msg::Exec { .. }) {
                        return Err(Error::InvalidMessage("nested exec".into()));
                    }
                    msg.validate_basic()?;
                }
                Ok(())
            }
        }
    }

    /// Addresses that must sign a transaction carrying this message
    pub fn signers(&self) -> Vec<&str> {
        match self {
            Msg::WithdrawDelegatorReward { delegator, .. } | Msg::Delegate { delegator, .. } => {
                vec![delegator.as_str()]
            }
            Msg::Exec { grantee, .. } => vec![grantee.as_str()],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Msg::WithdrawDelegatorReward { delegator, validator } => ProtoWriter::new()
                .string(1, delegator)
                .string(2, validator)
                .finish(),
            Msg::Delegate {
                delegator,
                validator,
                amount,
            } => ProtoWriter::new()
                .string(1, delegator)
                .string(2, validator)
                .message(3, &amount.encode())
                .finish(),
            Msg::Exec { grantee, msgs } => msgs
                .iter()
                .fold(ProtoWriter::new().string(1, grantee), |w, msg| {
                    w.message(2, &msg.to_any())
                })
                .finish(),
        }
    }

    pub fn to_any(&self) -> Vec<u8> {
        encode_any(self.type_url(), &self.encode())
    }
}

fn check_address(role: &str, value: &str) -> Result<()> {
    address::validate(value)
        .map_err(|e| Error::InvalidMessage(format!("bad {} address: {}", role, e)))
}
