//! Bech32 account addresses

use bech32::{Bech32, Hrp};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of a Cosmos SDK account id
pub const ACCOUNT_ID_LEN: usize = 20;

/// A decoded bech32 address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bech32Address {
    pub prefix: String,
    pub bytes: Vec<u8>,
}

impl Bech32Address {
    /// Decode an address, rejecting anything that is not valid bech32
    pub fn parse(address: &str) -> Result<Self> {
        if address.is_empty() {
            return Err(Error::malformed_address(address, "empty address"));
        }
        let (hrp, bytes) =
            bech32::decode(address).map_err(|e| Error::malformed_address(address, e))?;
        if bytes.is_empty() {
            return Err(Error::malformed_address(address, "empty payload"));
        }
        Ok(Self {
            prefix: hrp.to_lowercase(),
            bytes,
        })
    }
}

/// Encode raw account bytes with the given human-readable prefix
pub fn encode(prefix: &str, bytes: &[u8]) -> Result<String> {
    let hrp = Hrp::parse(prefix)
        .map_err(|e| Error::Config(format!("Invalid bech32 prefix {}: {}", prefix, e)))?;
    bech32::encode::<Bech32>(hrp, bytes)
        .map_err(|e| Error::Config(format!("Cannot encode address with {}: {}", prefix, e)))
}

/// Check that an address is well formed bech32 without resolving its chain
pub fn validate(address: &str) -> Result<()> {
    Bech32Address::parse(address).map(|_| ())
}

/// Canonical lower-case form of an address. Bech32 is case-insensitive, so
/// `COSMOS1...` and `cosmos1...` name the same account.
pub fn normalize(address: &str) -> Result<String> {
    validate(address)?;
    Ok(address.to_ascii_lowercase())
}

/// Accept only addresses already in canonical form
pub fn require_canonical(address: &str) -> Result<()> {
    if normalize(address)? != address {
        return Err(Error::malformed_address(address, "address must be lower case"));
    }
    Ok(())
}

/// Derive the account id of a compressed secp256k1 public key
pub fn account_id(public_key: &[u8]) -> [u8; ACCOUNT_ID_LEN] {
    let sha = Sha256::digest(public_key);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; ACCOUNT_ID_LEN];
    out.copy_from_slice(&ripe);
    out
}
