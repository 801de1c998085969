/// Identity types for group ops.
///
/// - `DeviceID`: 16-byte fingerprint of an Ed25519 signing key (the author id)
/// - `GroupID`: 32-byte group identifier bound to its creator
/// - `OpID`: globally unique, totally ordered operation identifier
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdParseError {
    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("OpID must be author:lamport:nonce")]
    OpIdFormat,
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], IdParseError> {
    let bytes = hex::decode(s)?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| IdParseError::Length {
        expected: N,
        actual: bytes.len(),
    })
}

// ---------------------------------------------------------------------------
// DeviceID
// ---------------------------------------------------------------------------

/// BLAKE3(Ed25519 public key)[0..16].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceID(pub [u8; 16]);

impl DeviceID {
    pub fn from_pubkey(pubkey: &[u8; 32]) -> Self {
        let hash = blake3::hash(pubkey);
        let mut id = [0u8; 16];
        id.copy_from_slice(&hash.as_bytes()[..16]);
        DeviceID(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        DeviceID(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdParseError> {
        decode_fixed::<16>(s).map(DeviceID)
    }
}

impl fmt::Debug for DeviceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceID({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for DeviceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// GroupID
// ---------------------------------------------------------------------------

/// BLAKE3("SL-GROUP" || creator_device_id || salt).
///
/// The salt travels in the GroupCreate payload, so any peer can recompute the
/// id and reject a GroupCreate signed by someone other than the creator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupID(pub [u8; 32]);

impl GroupID {
    pub fn derive(creator: &DeviceID, salt: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"SL-GROUP");
        hasher.update(&creator.0);
        hasher.update(salt);
        GroupID(*hasher.finalize().as_bytes())
    }

    /// Fresh id for a new group. Returns the id and the salt to publish.
    pub fn generate(creator: &DeviceID) -> (Self, [u8; 32]) {
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        (GroupID::derive(creator, &salt), salt)
    }

    /// True when this id was derived from `creator` and `salt`.
    pub fn is_bound_to(&self, creator: &DeviceID, salt: &[u8; 32]) -> bool {
        GroupID::derive(creator, salt) == *self
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        GroupID(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdParseError> {
        decode_fixed::<32>(s).map(GroupID)
    }
}

impl fmt::Debug for GroupID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupID({}..)", &self.to_hex()[..12])
    }
}

impl fmt::Display for GroupID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// OpID
// ---------------------------------------------------------------------------

/// Operation identifier, the primary key of the op log.
///
/// **Ordering**: `(lamport, author, nonce)`. Lamport first so causally later
/// ops sort later, author as the deterministic tie-break between concurrent
/// writers, nonce last.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpID {
    pub author: DeviceID,
    pub lamport: u64,
    pub nonce: u64,
}

impl OpID {
    pub fn new(author: DeviceID, lamport: u64, nonce: u64) -> Self {
        OpID {
            author,
            lamport,
            nonce,
        }
    }

    /// `{author_hex}:{lamport:016x}:{nonce:016x}`
    pub fn to_hex(&self) -> String {
        format!(
            "{}:{:016x}:{:016x}",
            self.author.to_hex(),
            self.lamport,
            self.nonce,
        )
    }

    pub fn from_hex(s: &str) -> Result<Self, IdParseError> {
        let mut parts = s.split(':');
        let (Some(author), Some(lamport), Some(nonce), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(IdParseError::OpIdFormat);
        };
        let lamport = u64::from_be_bytes(decode_fixed::<8>(lamport)?);
        let nonce = u64::from_be_bytes(decode_fixed::<8>(nonce)?);
        Ok(OpID::new(DeviceID::from_hex(author)?, lamport, nonce))
    }

    /// Fixed-width binary form used in hashes and AEAD associated data.
    pub fn to_key_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(&self.author.0);
        out[16..24].copy_from_slice(&self.lamport.to_be_bytes());
        out[24..].copy_from_slice(&self.nonce.to_be_bytes());
        out
    }
}

impl Ord for OpID {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.lamport
            .cmp(&other.lamport)
            .then_with(|| self.author.cmp(&other.author))
            .then_with(|| self.nonce.cmp(&other.nonce))
    }
}

impl PartialOrd for OpID {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for OpID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OpID({:?}, L={}, N={:04x})",
            self.author,
            self.lamport,
            self.nonce & 0xFFFF,
        )
    }
}

impl fmt::Display for OpID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
