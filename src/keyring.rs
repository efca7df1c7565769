//! Operator key material
//!
//! Keys live in a directory of `<name>.json` files, each holding the 32 byte
//! secp256k1 secret as a JSON byte array. Only the [`Keyring`] trait is used by
//! the transaction broadcaster, so signing can be swapped for a remote signer.

use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::chain::address::{self, ACCOUNT_ID_LEN};
use crate::error::{Error, Result};

const KEY_FILE_EXTENSION: &str = "json";

/// Public half of a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub name: String,
    pub account_id: [u8; ACCOUNT_ID_LEN],
    /// Compressed secp256k1 public key
    pub public_key: Vec<u8>,
}

/// Provider of signing keys
pub trait Keyring: Send + Sync {
    fn list_keys(&self) -> Result<Vec<KeyInfo>>;

    /// Sign `sign_bytes` (SHA-256 then ECDSA) with the key owning `account_id`.
    /// Returns the 64 byte compact signature.
    fn sign(&self, account_id: &[u8], sign_bytes: &[u8]) -> Result<Vec<u8>>;
}

struct LoadedKey {
    info: KeyInfo,
    secret: SecretKey,
}

/// Keyring backed by key files on disk
pub struct FileKeyring {
    secp: Secp256k1<All>,
    keys: Vec<LoadedKey>,
}

impl FileKeyring {
    /// Load every key file in `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        let secp = Secp256k1::new();
        let mut keys = Vec::new();

        if dir.exists() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
                .map_err(|e| Error::Config(format!("Failed to read keyring {}: {}", dir.display(), e)))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(KEY_FILE_EXTENSION))
                .collect();
            paths.sort();

            for path in paths {
                keys.push(load_key_file(&secp, &path)?);
            }
        }

        info!("Loaded {} key(s) from {}", keys.len(), dir.display());
        Ok(Self { secp, keys })
    }

    /// Create a fresh key file named `<name>.json` in `dir`
    pub fn generate(dir: &Path, name: &str) -> Result<KeyInfo> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{}", name, KEY_FILE_EXTENSION));
        if path.exists() {
            return Err(Error::Config(format!("Key {} already exists", path.display())));
        }

        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut rand::thread_rng());
        let json = serde_json::to_string(&secret.secret_bytes().to_vec())?;
        write_private(&path, json.as_bytes())?;

        info!("Generated operator key {}", path.display());
        Ok(key_info(&secp, name, &secret))
    }

    fn find(&self, account_id: &[u8]) -> Result<&LoadedKey> {
        self.keys
            .iter()
            .find(|k| k.info.account_id.as_slice() == account_id)
            .ok_or_else(|| Error::KeyNotFound(hex_id(account_id)))
    }
}

impl Keyring for FileKeyring {
    fn list_keys(&self) -> Result<Vec<KeyInfo>> {
        Ok(self.keys.iter().map(|k| k.info.clone()).collect())
    }

    fn sign(&self, account_id: &[u8], sign_bytes: &[u8]) -> Result<Vec<u8>> {
        let key = self.find(account_id)?;
        let digest: [u8; 32] = Sha256::digest(sign_bytes).into();
        let signature = self
            .secp
            .sign_ecdsa(&Message::from_digest(digest), &key.secret);
        Ok(signature.serialize_compact().to_vec())
    }
}

fn key_info(secp: &Secp256k1<All>, name: &str, secret: &SecretKey) -> KeyInfo {
    let public_key = PublicKey::from_secret_key(secp, secret).serialize();
    KeyInfo {
        name: name.to_string(),
        account_id: address::account_id(&public_key),
        public_key: public_key.to_vec(),
    }
}

fn load_key_file(secp: &Secp256k1<All>, path: &Path) -> Result<LoadedKey> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    // Validate permissions on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(Error::InsecureKey(format!(
                    "Key {} has insecure permissions {:o}. Run 'chmod 600 {}'",
                    name,
                    mode & 0o777,
                    path.display()
                )));
            }
        }
    }

    debug!("Loading key from: {:?}", path);

    let bytes = std::fs::read(path)
        .map_err(|e| Error::InvalidKey(format!("Failed to read key {}: {}", name, e)))?;
    let secret_bytes: Vec<u8> = serde_json::from_slice(&bytes)
        .map_err(|e| Error::InvalidKey(format!("Failed to parse key JSON for {}: {}", name, e)))?;
    let secret = SecretKey::from_slice(&secret_bytes)
        .map_err(|e| Error::InvalidKey(format!("Invalid key bytes for {}: {}", name, e)))?;

    Ok(LoadedKey {
        info: key_info(secp, &name, &secret),
        secret,
    })
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    Ok(())
}

fn hex_id(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// The single identity holding authz grants on behalf of registered accounts
#[derive(Debug, Clone)]
pub struct Operator {
    key: KeyInfo,
}

impl Operator {
    /// Pick the operator from a keyring, which must hold exactly one key
    pub fn from_keyring(keyring: &dyn Keyring) -> Result<Self> {
        let mut keys = keyring.list_keys()?;
        if keys.len() != 1 {
            return Err(Error::OperatorKeyCount(keys.len()));
        }
        Ok(Self { key: keys.remove(0) })
    }

    pub fn key(&self) -> &KeyInfo {
        &self.key
    }

    pub fn account_id(&self) -> &[u8] {
        &self.key.account_id
    }

    /// Hex encoded account id, independent of any chain prefix
    pub fn hex_address(&self) -> String {
        hex_id(&self.key.account_id)
    }

    /// Operator address on a chain with the given bech32 prefix
    pub fn address(&self, prefix: &str) -> Result<String> {
        address::encode(prefix, &self.key.account_id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    /// In-memory keyring holding one deterministic key
    pub(crate) fn test_keyring() -> FileKeyring {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x11; 32]).unwrap();
        FileKeyring {
            keys: vec![LoadedKey {
                info: key_info(&secp, "operator", &secret),
                secret,
            }],
            secp,
        }
    }

    #[test]
    fn test_generate_and_load() {
        let dir = tempdir().unwrap();
        let generated = FileKeyring::generate(dir.path(), "operator").unwrap();
        assert!(FileKeyring::generate(dir.path(), "operator").is_err());

        let keyring = FileKeyring::load(dir.path()).unwrap();
        let keys = keyring.list_keys().unwrap();
        assert_eq!(keys, vec![generated]);
    }

    #[cfg(unix)]
    #[test]
    fn test_insecure_key_file_refused() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        FileKeyring::generate(dir.path(), "operator").unwrap();
        let path = dir.path().join("operator.json");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        assert!(matches!(
            FileKeyring::load(dir.path()),
            Err(Error::InsecureKey(_))
        ));
    }

    #[test]
    fn test_sign_verifies() {
        let keyring = test_keyring();
        let key = keyring.list_keys().unwrap().remove(0);
        let signature = keyring.sign(&key.account_id, b"sign doc").unwrap();
        assert_eq!(signature.len(), 64);

        let secp = Secp256k1::verification_only();
        let digest: [u8; 32] = Sha256::digest(b"sign doc").into();
        let sig = secp256k1::ecdsa::Signature::from_compact(&signature).unwrap();
        let pk = PublicKey::from_slice(&key.public_key).unwrap();
        assert!(secp
            .verify_ecdsa(&Message::from_digest(digest), &sig, &pk)
            .is_ok());

        assert!(matches!(
            keyring.sign(&[0u8; 20], b"sign doc"),
            Err(Error::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_operator_requires_exactly_one_key() {
        let dir = tempdir().unwrap();
        let empty = FileKeyring::load(dir.path()).unwrap();
        assert!(matches!(
            Operator::from_keyring(&empty),
            Err(Error::OperatorKeyCount(0))
        ));

        FileKeyring::generate(dir.path(), "a").unwrap();
        FileKeyring::generate(dir.path(), "b").unwrap();
        let two = FileKeyring::load(dir.path()).unwrap();
        assert!(matches!(
            Operator::from_keyring(&two),
            Err(Error::OperatorKeyCount(2))
        ));

        let operator = Operator::from_keyring(&test_keyring()).unwrap();
        assert!(operator.address("cosmos").unwrap().starts_with("cosmos1"));
        assert_eq!(operator.hex_address().len(), 40);
    }
}
