//! Key layout of the record store
//!
//! All entries share one ordered tree. The first byte separates entry kinds so
//! that every scan is a contiguous prefix range:
//!
//! ```text
//! 0x00 | cadence | address   -> Record        (tier partition)
//! 0x01 | cadence             -> ActiveJob
//! 0x02 | address             -> cadence byte  (partition index)
//! ```

use crate::types::Cadence;

pub const RECORD_PREFIX: u8 = 0x00;
pub const JOB_PREFIX: u8 = 0x01;
pub const INDEX_PREFIX: u8 = 0x02;

pub fn record_key(cadence: Cadence, address: &str) -> Vec<u8> {
    record_key_raw(cadence.as_byte(), address)
}

pub(crate) fn record_key_raw(cadence: u8, address: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + address.len());
    key.push(RECORD_PREFIX);
    key.push(cadence);
    key.extend_from_slice(address.as_bytes());
    key
}

/// Prefix covering every record filed under a tier
pub fn record_prefix(cadence: Cadence) -> [u8; 2] {
    [RECORD_PREFIX, cadence.as_byte()]
}

pub fn job_key(cadence: Cadence) -> [u8; 2] {
    [JOB_PREFIX, cadence.as_byte()]
}

pub fn job_prefix() -> [u8; 1] {
    [JOB_PREFIX]
}

pub fn index_key(address: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + address.len());
    key.push(INDEX_PREFIX);
    key.extend_from_slice(address.as_bytes());
    key
}
