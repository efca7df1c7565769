//! Autostaker Library
//!
//! Periodic compounding of Cosmos SDK staking rewards. Registered accounts
//! grant an operator key authz permission to claim and delegate on their
//! behalf; the scheduler restakes each account at its cadence.

pub mod authz;
pub mod chain;
pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod keyring;
pub mod restake;
pub mod rpc;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod tx;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use service::AutoStaker;
pub use types::{Cadence, Record};
