//! Shared domain types: cadence tiers, automation records and scheduler jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Token amount in the chain's smallest native unit
pub type Amount = u128;

/// How often an account is restaked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Cadence {
    Unset = 0,
    QuarterDay = 1,
    Daily = 2,
    Weekly = 3,
    Monthly = 4,
}

impl Default for Cadence {
    fn default() -> Self {
        Cadence::Unset
    }
}

impl Cadence {
    /// Tiers that get a recurring timer
    pub const SCHEDULED: [Cadence; 4] = [
        Cadence::QuarterDay,
        Cadence::Daily,
        Cadence::Weekly,
        Cadence::Monthly,
    ];

    /// Discriminator used in store keys
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Cadence::Unset),
            1 => Ok(Cadence::QuarterDay),
            2 => Ok(Cadence::Daily),
            3 => Ok(Cadence::Weekly),
            4 => Ok(Cadence::Monthly),
            other => Err(Error::Deserialization(format!(
                "unknown cadence discriminator {}",
                other
            ))),
        }
    }

    /// Default timer period for the tier. Months are counted as 30 days.
    pub fn period(self) -> Option<Duration> {
        const HOUR: u64 = 60 * 60;
        match self {
            Cadence::Unset => None,
            Cadence::QuarterDay => Some(Duration::from_secs(6 * HOUR)),
            Cadence::Daily => Some(Duration::from_secs(24 * HOUR)),
            Cadence::Weekly => Some(Duration::from_secs(7 * 24 * HOUR)),
            Cadence::Monthly => Some(Duration::from_secs(30 * 24 * HOUR)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Cadence::Unset => "unset",
            Cadence::QuarterDay => "quarter_day",
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect();

        match normalized.as_str() {
            "unset" | "unknown" => Ok(Cadence::Unset),
            "quarterday" | "6h" => Ok(Cadence::QuarterDay),
            "daily" | "day" => Ok(Cadence::Daily),
            "weekly" | "week" => Ok(Cadence::Weekly),
            "monthly" | "month" => Ok(Cadence::Monthly),
            _ => Err(Error::Config(format!("Unknown cadence: {}", s))),
        }
    }
}

/// A restake transaction whose inclusion could not be confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTx {
    pub chain_id: String,
    pub tx_hash: String,
    /// Rewards the transaction claims, credited once it is confirmed
    pub amount: Amount,
    pub submitted_at: i64,
}

/// Automation record, one per registered account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub address: String,
    pub cadence: Cadence,
    /// Native balance to keep liquid after restaking
    pub tolerance: Amount,
    /// Unix time of the last processed attempt, successful or not
    pub last_run_unix: Option<i64>,
    pub cumulative_restaked: Amount,
    pub last_error: Option<String>,
    #[serde(default)]
    pub pending_tx: Option<PendingTx>,
}

impl Record {
    pub fn new(address: impl Into<String>, cadence: Cadence, tolerance: Amount) -> Self {
        Self {
            address: address.into(),
            cadence,
            tolerance,
            last_run_unix: None,
            cumulative_restaked: 0,
            last_error: None,
            pending_tx: None,
        }
    }

    /// Book a successful run
    pub fn record_success(&mut self, restaked: Amount, now: DateTime<Utc>) {
        self.last_run_unix = Some(now.timestamp());
        self.cumulative_restaked = self.cumulative_restaked.saturating_add(restaked);
        self.last_error = None;
    }

    /// Book a failed run. The running total is left alone.
    pub fn record_failure(&mut self, error: &Error, now: DateTime<Utc>) {
        self.last_run_unix = Some(now.timestamp());
        self.last_error = Some(error.to_string());
    }

    /// Book a run whose transaction outcome is not known yet
    pub fn record_pending(&mut self, pending: PendingTx, now: DateTime<Utc>) {
        self.last_run_unix = Some(now.timestamp());
        self.pending_tx = Some(pending);
    }
}

/// A recurring timer installed by the scheduler for one cadence tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveJob {
    pub cadence: Cadence,
    pub handle: Uuid,
    pub started_at: i64,
}

impl ActiveJob {
    pub fn new(cadence: Cadence) -> Self {
        Self {
            cadence,
            handle: Uuid::new_v4(),
            started_at: Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence_parsing() {
        assert_eq!("daily".parse::<Cadence>().unwrap(), Cadence::Daily);
        assert_eq!("QUARTERDAY".parse::<Cadence>().unwrap(), Cadence::QuarterDay);
        assert_eq!("quarter-day".parse::<Cadence>().unwrap(), Cadence::QuarterDay);
        assert_eq!("Monthly".parse::<Cadence>().unwrap(), Cadence::Monthly);
        assert!("hourly".parse::<Cadence>().is_err());
    }

    #[test]
    fn test_cadence_byte_roundtrip_and_order() {
        for cadence in Cadence::SCHEDULED {
            assert_eq!(Cadence::from_byte(cadence.as_byte()).unwrap(), cadence);
        }
        assert!(Cadence::from_byte(9).is_err());
        assert!(Cadence::QuarterDay.period() < Cadence::Daily.period());
        assert!(Cadence::Weekly.period() < Cadence::Monthly.period());
        assert!(Cadence::Unset.period().is_none());
    }

    #[test]
    fn test_record_bookkeeping() {
        let now = Utc::now();
        let mut record = Record::new("cosmos1abc", Cadence::Daily, 10);

        record.record_failure(&Error::Rpc("unavailable".into()), now);
        assert_eq!(record.cumulative_restaked, 0);
        assert!(record.last_error.as_deref().unwrap().contains("unavailable"));

        record.record_success(100, now);
        record.record_success(50, now);
        assert_eq!(record.cumulative_restaked, 150);
        assert!(record.last_error.is_none());
        assert_eq!(record.last_run_unix, Some(now.timestamp()));
    }
}
