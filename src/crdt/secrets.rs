/// Group secrets: content sealing and out-of-band secret delivery.
///
/// A group secret is a 32-byte XChaCha20-Poly1305 key identified by the
/// OpID that established it (the GroupCreate, or the MemberRemove that
/// rotated it). Encrypted payloads name their secret id, so a reader knows
/// which key opens which range of history.
///
/// Secrets never enter the op log. They travel as [`SealedSecret`] frames:
/// ephemeral X25519 to the recipient's exchange key, HKDF-SHA256 bound to
/// group, secret id and recipient, XChaCha20-Poly1305, signed by the sender.
use bincode::Options;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crdt::ids::{DeviceID, GroupID, OpID};
use crate::crdt::ops::SealedContent;
use crate::crypto::encryption::{self, EncryptionError};
use crate::crypto::key_exchange::{ephemeral_agreement, KeyExchangeError};
use crate::crypto::signing::{verify_signature, DigestSigner, SigningError};

const CONTENT_CONTEXT: &[u8] = b"SL-GROUP-CONTENT-v1";
const DELIVERY_CONTEXT: &[u8] = b"SL-GROUP-SECRET-v1";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("No group secret held for {0}")]
    Unavailable(OpID),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Key exchange error: {0}")]
    KeyExchange(#[from] KeyExchangeError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Sealed secret encoding failed: {0}")]
    Codec(String),

    #[error("Sealed secret signature invalid")]
    InvalidSignature,

    #[error("Sealed secret is for another device")]
    WrongRecipient,

    #[error("Sealed secret is for another group")]
    WrongGroup,

    #[error("No secret epoch {0} in this group")]
    UnknownEpoch(OpID),
}

// ---------------------------------------------------------------------------
// GroupSecret
// ---------------------------------------------------------------------------

#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct GroupSecret([u8; 32]);

impl GroupSecret {
    pub fn generate() -> Self {
        GroupSecret(encryption::generate_key())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        GroupSecret(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for GroupSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GroupSecret(..)")
    }
}

/// Source of group secrets by id, for decrypting a conversation.
pub trait SecretLookup {
    fn secret(&self, secret_id: &OpID) -> Option<GroupSecret>;
}

impl SecretLookup for BTreeMap<OpID, GroupSecret> {
    fn secret(&self, secret_id: &OpID) -> Option<GroupSecret> {
        self.get(secret_id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Content sealing
// ---------------------------------------------------------------------------

fn content_aad(group_id: &GroupID, secret_id: &OpID) -> Vec<u8> {
    let mut aad = Vec::with_capacity(CONTENT_CONTEXT.len() + 64);
    aad.extend_from_slice(CONTENT_CONTEXT);
    aad.extend_from_slice(group_id.as_bytes());
    aad.extend_from_slice(&secret_id.to_key_bytes());
    aad
}

/// Encrypt message or metadata content under a group secret.
pub fn seal_content(
    secret: &GroupSecret,
    secret_id: OpID,
    group_id: &GroupID,
    plaintext: &[u8],
) -> Result<SealedContent, SecretError> {
    let (nonce, ciphertext) =
        encryption::seal(plaintext, secret.as_bytes(), &content_aad(group_id, &secret_id))?;
    Ok(SealedContent {
        secret_id,
        nonce,
        ciphertext,
    })
}

pub fn open_content(
    secret: &GroupSecret,
    group_id: &GroupID,
    sealed: &SealedContent,
) -> Result<Vec<u8>, SecretError> {
    Ok(encryption::open(
        &sealed.ciphertext,
        &sealed.nonce,
        secret.as_bytes(),
        &content_aad(group_id, &sealed.secret_id),
    )?)
}

// ---------------------------------------------------------------------------
// SealedSecret
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SealedSecret {
    pub group_id: GroupID,
    pub secret_id: OpID,
    pub recipient: DeviceID,
    /// Ed25519 key of the sending member.
    pub sender_pubkey: [u8; 32],
    pub ephemeral_pubkey: [u8; 32],
    pub nonce: [u8; 24],
    pub ciphertext: Vec<u8>,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl SealedSecret {
    /// Seal `secret` to a member's X25519 exchange key.
    pub fn seal<S: DigestSigner + ?Sized>(
        group_id: GroupID,
        secret_id: OpID,
        secret: &GroupSecret,
        recipient: DeviceID,
        recipient_exchange_pubkey: &[u8; 32],
        signer: &S,
    ) -> Result<Self, SecretError> {
        let (ephemeral_pubkey, shared) = ephemeral_agreement(recipient_exchange_pubkey)?;
        let shared = Zeroizing::new(shared);
        let info = delivery_info(&group_id, &secret_id, &recipient);
        let key = Zeroizing::new(encryption::derive_key(
            &shared[..],
            Some(&ephemeral_pubkey),
            &info,
        )?);
        let (nonce, ciphertext) = encryption::seal(secret.as_bytes(), &key, &info)?;

        let mut sealed = SealedSecret {
            group_id,
            secret_id,
            recipient,
            sender_pubkey: signer.public_key(),
            ephemeral_pubkey,
            nonce,
            ciphertext,
            signature: [0u8; 64],
        };
        sealed.signature = signer.sign_digest(&sealed.signing_digest()?)?;
        Ok(sealed)
    }

    pub fn sender(&self) -> DeviceID {
        DeviceID::from_pubkey(&self.sender_pubkey)
    }

    pub fn verify(&self) -> bool {
        match self.signing_digest() {
            Ok(digest) => verify_signature(&digest, &self.signature, &self.sender_pubkey),
            Err(_) => false,
        }
    }

    /// Decrypt with the X25519 shared secret between the recipient's
    /// exchange key and `ephemeral_pubkey`.
    pub fn open(&self, shared_secret: &[u8; 32]) -> Result<GroupSecret, SecretError> {
        if !self.verify() {
            return Err(SecretError::InvalidSignature);
        }
        let info = delivery_info(&self.group_id, &self.secret_id, &self.recipient);
        let key = Zeroizing::new(encryption::derive_key(
            shared_secret,
            Some(&self.ephemeral_pubkey),
            &info,
        )?);
        let plaintext = Zeroizing::new(encryption::open(&self.ciphertext, &self.nonce, &key, &info)?);
        let bytes: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| SecretError::Encryption(EncryptionError::InvalidKeyLength))?;
        Ok(GroupSecret::from_bytes(bytes))
    }

    fn signing_digest(&self) -> Result<[u8; 32], SecretError> {
        let signable = (
            &self.group_id,
            &self.secret_id,
            &self.recipient,
            &self.sender_pubkey,
            &self.ephemeral_pubkey,
            &self.nonce,
            &self.ciphertext,
        );
        let bytes = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .serialize(&signable)
            .map_err(|e| SecretError::Codec(e.to_string()))?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }
}

fn delivery_info(group_id: &GroupID, secret_id: &OpID, recipient: &DeviceID) -> Vec<u8> {
    let mut info = Vec::with_capacity(DELIVERY_CONTEXT.len() + 80);
    info.extend_from_slice(DELIVERY_CONTEXT);
    info.extend_from_slice(group_id.as_bytes());
    info.extend_from_slice(&secret_id.to_key_bytes());
    info.extend_from_slice(recipient.as_bytes());
    info
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_exchange::derive_shared_secret;
    use crate::crdt::testkit::TestDevice;

    fn ids() -> (GroupID, OpID) {
        let gid = GroupID::from_bytes([7; 32]);
        let sid = OpID::new(DeviceID::from_bytes([1; 16]), 1, 5);
        (gid, sid)
    }

    #[test]
    fn test_content_roundtrip() {
        let (gid, sid) = ids();
        let secret = GroupSecret::generate();
        let sealed = seal_content(&secret, sid, &gid, b"hi").unwrap();
        assert_eq!(sealed.secret_id, sid);
        assert_eq!(open_content(&secret, &gid, &sealed).unwrap(), b"hi");
    }

    #[test]
    fn test_content_bound_to_group_and_secret_id() {
        let (gid, sid) = ids();
        let secret = GroupSecret::generate();
        let sealed = seal_content(&secret, sid, &gid, b"hi").unwrap();

        assert!(open_content(&secret, &GroupID::from_bytes([8; 32]), &sealed).is_err());

        let mut relabeled = sealed.clone();
        relabeled.secret_id = OpID::new(DeviceID::from_bytes([1; 16]), 2, 5);
        assert!(open_content(&secret, &gid, &relabeled).is_err());
    }

    #[test]
    fn test_sealed_secret_roundtrip() {
        let (gid, sid) = ids();
        let sender = TestDevice::new();
        let recipient = TestDevice::new();
        let secret = GroupSecret::generate();

        let sealed = SealedSecret::seal(
            gid,
            sid,
            &secret,
            recipient.device(),
            &recipient.exchange_public(),
            &sender.keys,
        )
        .unwrap();
        assert!(sealed.verify());
        assert_eq!(sealed.sender(), sender.device());

        let shared =
            derive_shared_secret(&recipient.exchange_private, &sealed.ephemeral_pubkey).unwrap();
        assert_eq!(sealed.open(&shared).unwrap(), secret);
    }

    #[test]
    fn test_sealed_secret_wrong_key_fails() {
        let (gid, sid) = ids();
        let sender = TestDevice::new();
        let recipient = TestDevice::new();
        let eavesdropper = TestDevice::new();
        let sealed = SealedSecret::seal(
            gid,
            sid,
            &GroupSecret::generate(),
            recipient.device(),
            &recipient.exchange_public(),
            &sender.keys,
        )
        .unwrap();

        let shared =
            derive_shared_secret(&eavesdropper.exchange_private, &sealed.ephemeral_pubkey).unwrap();
        assert!(matches!(
            sealed.open(&shared).unwrap_err(),
            SecretError::Encryption(_)
        ));
    }

    #[test]
    fn test_sealed_secret_tamper_detected() {
        let (gid, sid) = ids();
        let sender = TestDevice::new();
        let recipient = TestDevice::new();
        let mut sealed = SealedSecret::seal(
            gid,
            sid,
            &GroupSecret::generate(),
            recipient.device(),
            &recipient.exchange_public(),
            &sender.keys,
        )
        .unwrap();

        // redirecting to another recipient breaks the signature
        sealed.recipient = DeviceID::from_bytes([0; 16]);
        assert!(!sealed.verify());
        assert_eq!(sealed.open(&[0u8; 32]).unwrap_err(), SecretError::InvalidSignature);
    }

    #[test]
    fn test_lookup_map() {
        let (_, sid) = ids();
        let mut map = BTreeMap::new();
        map.insert(sid, GroupSecret::from_bytes([3; 32]));
        assert!(map.secret(&sid).is_some());
        assert!(map
            .secret(&OpID::new(DeviceID::from_bytes([0; 16]), 0, 0))
            .is_none());
    }
}
