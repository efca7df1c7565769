//! Error types for the autostaker

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the autostaker
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Insecure key permissions: {0}")]
    InsecureKey(String),

    #[error("Key not found for address {0}")]
    KeyNotFound(String),

    #[error("Expected exactly one operator key, found {0}")]
    OperatorKeyCount(usize),

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // Chain directory errors
    #[error("Malformed address {address}: {reason}")]
    MalformedAddress { address: String, reason: String },

    #[error("No chain found for {0}")]
    ChainNotFound(String),

    // RPC errors
    #[error("RPC connection failed: {0}")]
    RpcConnection(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Request cancelled")]
    Cancelled,

    // Transaction errors
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Account sequence mismatch: {0}")]
    StaleSequence(String),

    #[error("Transaction {tx_hash} rejected with code {code}: {raw_log}")]
    TxRejected {
        tx_hash: String,
        code: u32,
        raw_log: String,
    },

    #[error("Transaction {tx_hash} submitted but confirmation is indeterminate")]
    ConfirmationIndeterminate { tx_hash: String },

    // Restake errors
    #[error("Invalid balance for {address}: {reason}")]
    InvalidBalance { address: String, reason: String },

    #[error("Amount overflow while computing {0}")]
    AmountOverflow(&'static str),

    #[error("Missing authorization: {0}")]
    MissingAuthorization(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RpcConnection(_) | Error::StaleSequence(_))
    }

    /// Check if the outcome of the operation is unknown: the transaction may or
    /// may not have been included and must be reconciled later.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Error::ConfirmationIndeterminate { .. })
    }

    pub(crate) fn malformed_address(address: &str, reason: impl ToString) -> Self {
        Error::MalformedAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}

// Conversion from sled errors
impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Store(e.to_string())
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::RpcConnection(e.to_string())
        } else if e.is_decode() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Rpc(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
