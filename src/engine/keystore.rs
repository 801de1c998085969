/// Device keys and held group secrets.
///
/// The engine never touches private key bytes directly: it signs digests,
/// runs X25519 agreements and stores group secrets through this trait. On
/// Android the implementation lives in the Keystore-backed layer; tests and
/// embedders use `MemoryKeyStore`.
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crdt::ids::{GroupID, OpID};
use crate::crdt::secrets::GroupSecret;
use crate::crypto::key_exchange::{derive_shared_secret, generate_static_keypair, KeyExchangeError};
use crate::crypto::signing::{DigestSigner, SigningError, SigningKeyPair};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyStoreError {
    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("Key agreement failed: {0}")]
    KeyExchange(#[from] KeyExchangeError),

    #[error("Key storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, KeyStoreError>;

pub trait KeyStore: DigestSigner {
    fn signing_public_key(&self) -> [u8; 32] {
        self.public_key()
    }

    /// X25519 key other members seal group secrets to.
    fn exchange_public_key(&self) -> [u8; 32];

    /// Ed25519 over BLAKE3(bytes).
    fn sign(&self, bytes: &[u8]) -> Result<[u8; 64]> {
        Ok(self.sign_digest(blake3::hash(bytes).as_bytes())?)
    }

    /// X25519 agreement between our exchange key and `their_public`.
    fn key_agreement(&self, their_public: &[u8; 32]) -> Result<[u8; 32]>;

    fn group_secret(&self, group: &GroupID, secret_id: &OpID) -> Option<GroupSecret>;

    /// Every secret held for `group`, by secret id.
    fn group_secrets(&self, group: &GroupID) -> BTreeMap<OpID, GroupSecret>;

    fn store_group_secret(&self, group: &GroupID, secret_id: OpID, secret: GroupSecret) -> Result<()>;

    fn delete_group(&self, group: &GroupID) -> Result<()>;
}

/// Process-memory key store. Secrets are wiped when dropped.
pub struct MemoryKeyStore {
    identity: SigningKeyPair,
    exchange_private: Zeroizing<[u8; 32]>,
    exchange_public: [u8; 32],
    secrets: Mutex<HashMap<GroupID, BTreeMap<OpID, GroupSecret>>>,
}

impl MemoryKeyStore {
    pub fn generate() -> Self {
        Self::from_identity(SigningKeyPair::generate())
    }

    pub fn from_identity(identity: SigningKeyPair) -> Self {
        let (exchange_public, exchange_private) = generate_static_keypair();
        MemoryKeyStore {
            identity,
            exchange_private: Zeroizing::new(exchange_private),
            exchange_public,
            secrets: Mutex::new(HashMap::new()),
        }
    }
}

impl DigestSigner for MemoryKeyStore {
    fn public_key(&self) -> [u8; 32] {
        self.identity.public()
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> std::result::Result<[u8; 64], SigningError> {
        self.identity.sign_digest(digest)
    }
}

impl KeyStore for MemoryKeyStore {
    fn exchange_public_key(&self) -> [u8; 32] {
        self.exchange_public
    }

    fn key_agreement(&self, their_public: &[u8; 32]) -> Result<[u8; 32]> {
        Ok(derive_shared_secret(&self.exchange_private, their_public)?)
    }

    fn group_secret(&self, group: &GroupID, secret_id: &OpID) -> Option<GroupSecret> {
        self.secrets
            .lock()
            .ok()?
            .get(group)
            .and_then(|held| held.get(secret_id).cloned())
    }

    fn group_secrets(&self, group: &GroupID) -> BTreeMap<OpID, GroupSecret> {
        self.secrets
            .lock()
            .map(|s| s.get(group).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn store_group_secret(&self, group: &GroupID, secret_id: OpID, secret: GroupSecret) -> Result<()> {
        let mut secrets = self
            .secrets
            .lock()
            .map_err(|_| KeyStoreError::Storage("lock poisoned".into()))?;
        secrets.entry(*group).or_default().insert(secret_id, secret);
        Ok(())
    }

    fn delete_group(&self, group: &GroupID) -> Result<()> {
        let mut secrets = self
            .secrets
            .lock()
            .map_err(|_| KeyStoreError::Storage("lock poisoned".into()))?;
        secrets.remove(group);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyStore")
            .field("public_key", &hex::encode(self.identity.public()))
            .finish_non_exhaustive()
    }
}
