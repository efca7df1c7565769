//! SIGN_MODE_DIRECT transaction envelope

use sha2::{Digest, Sha256};

use super::msgs::{encode_any, Coin, Msg};
use super::proto::ProtoWriter;

pub const SECP256K1_PUBKEY: &str = "/cosmos.crypto.secp256k1.PubKey";

const SIGN_MODE_DIRECT: u64 = 1;

/// Transaction fee. With a granter set, the fee is paid from the granter's
/// feegrant allowance instead of the signer's balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fee {
    pub amount: Vec<Coin>,
    pub gas_limit: u64,
    pub granter: Option<String>,
}

impl Fee {
    fn encode(&self) -> Vec<u8> {
        let writer = self
            .amount
            .iter()
            .fold(ProtoWriter::new(), |w, coin| w.message(1, &coin.encode()));
        writer
            .uint64(2, self.gas_limit)
            .string(4, self.granter.as_deref().unwrap_or_default())
            .finish()
    }
}

/// Public key and current sequence of one signer
#[derive(Debug, Clone)]
pub struct SignerData {
    pub public_key: Vec<u8>,
    pub sequence: u64,
}

impl SignerData {
    fn encode(&self) -> Vec<u8> {
        let public_key = encode_any(
            SECP256K1_PUBKEY,
            &ProtoWriter::new().bytes(1, &self.public_key).finish(),
        );
        let single = ProtoWriter::new().uint64(1, SIGN_MODE_DIRECT).finish();
        let mode_info = ProtoWriter::new().message(1, &single).finish();

        ProtoWriter::new()
            .message(1, &public_key)
            .message(2, &mode_info)
            .uint64(3, self.sequence)
            .finish()
    }
}

pub fn encode_body(msgs: &[Msg], memo: &str) -> Vec<u8> {
    msgs.iter()
        .fold(ProtoWriter::new(), |w, msg| w.message(1, &msg.to_any()))
        .string(2, memo)
        .finish()
}

pub fn encode_auth_info(signers: &[SignerData], fee: &Fee) -> Vec<u8> {
    signers
        .iter()
        .fold(ProtoWriter::new(), |w, signer| w.message(1, &signer.encode()))
        .message(2, &fee.encode())
        .finish()
}

/// Bytes each signer signs
pub fn sign_doc(body: &[u8], auth_info: &[u8], chain_id: &str, account_number: u64) -> Vec<u8> {
    ProtoWriter::new()
        .bytes(1, body)
        .bytes(2, auth_info)
        .string(3, chain_id)
        .uint64(4, account_number)
        .finish()
}

/// Wire form submitted to the node
pub fn tx_raw(body: &[u8], auth_info: &[u8], signatures: &[Vec<u8>]) -> Vec<u8> {
    signatures
        .iter()
        .fold(
            ProtoWriter::new().bytes(1, body).bytes(2, auth_info),
            |w, sig| w.message(3, sig),
        )
        .finish()
}

/// Hash the node reports for a transaction: upper-case hex SHA-256 of its raw bytes
pub fn tx_hash(raw: &[u8]) -> String {
    Sha256::digest(raw).iter().map(|b| format!("{:02X}", b)).collect()
}
