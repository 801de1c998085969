/// Op envelope and payload types.
///
/// Every group action is an immutable, signed operation, the unit that is
/// stored, replicated and replayed.
///
/// - Envelope: bincode, fixed-int encoding, size limited, version tagged
/// - Payload: CBOR via ciborium
/// - Signature: Ed25519 over BLAKE3(signable_bytes)
use bincode::Options;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;

use crate::crdt::clock::CausalClock;
use crate::crdt::ids::{DeviceID, GroupID, OpID};
use crate::crdt::limits::{
    MAX_DEPS_PER_OP, MAX_ENVELOPE_BYTES, MAX_OPS_PER_BATCH, MAX_OP_PAYLOAD_BYTES,
};
use crate::crypto::signing::{verify_signature, DigestSigner, SigningError};
use crate::persistence::PersistenceError;

/// Envelope wire version.
pub const OP_WIRE_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("Payload exceeds max size ({size} > {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Too many dependencies ({count} > {max})")]
    TooManyDeps { count: usize, max: usize },

    #[error("CBOR encoding failed: {0}")]
    CborEncode(String),

    #[error("CBOR decoding failed: {0}")]
    CborDecode(String),

    #[error("Envelope codec failed: {0}")]
    Codec(String),

    #[error("Unsupported op wire version {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed op batch: {0}")]
    MalformedBatch(String),

    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("Author DeviceID does not match pubkey")]
    AuthorMismatch,

    #[error("Lamport field does not match op id")]
    LamportMismatch,

    #[error("Clock persistence failed: {0}")]
    Clock(#[from] PersistenceError),
}

// ---------------------------------------------------------------------------
// OpType
// ---------------------------------------------------------------------------

/// New variants go at the end: bincode encodes the variant index.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpType {
    GroupCreate,
    MemberInvite,
    MemberAccept,
    MemberRemove,
    RoleSet,
    MemberMute,
    MemberReport,
    MetadataSet,
    MessageSend,
    MessageEdit,
    MessageDelete,
    ReactionSet,
}

impl OpType {
    /// Ops that stay allowed at the hard cap so the group remains governable.
    pub fn is_membership_op(&self) -> bool {
        matches!(
            self,
            OpType::GroupCreate
                | OpType::MemberInvite
                | OpType::MemberAccept
                | OpType::MemberRemove
                | OpType::RoleSet
                | OpType::MemberMute
        )
    }

    /// Ops whose payload carries content sealed under the group secret.
    pub fn is_encrypted(&self) -> bool {
        matches!(
            self,
            OpType::MessageSend | OpType::MessageEdit | OpType::MetadataSet
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::GroupCreate => "GroupCreate",
            OpType::MemberInvite => "MemberInvite",
            OpType::MemberAccept => "MemberAccept",
            OpType::MemberRemove => "MemberRemove",
            OpType::RoleSet => "RoleSet",
            OpType::MemberMute => "MemberMute",
            OpType::MemberReport => "MemberReport",
            OpType::MetadataSet => "MetadataSet",
            OpType::MessageSend => "MessageSend",
            OpType::MessageEdit => "MessageEdit",
            OpType::MessageDelete => "MessageDelete",
            OpType::ReactionSet => "ReactionSet",
        }
    }
}

// ---------------------------------------------------------------------------
// Role, RemoveReason, MetadataKey
// ---------------------------------------------------------------------------

/// Lower discriminant = more privilege.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Role {
    Owner = 0,
    Admin = 1,
    Member = 2,
}

impl Role {
    /// Privilege of `self` is at least that of `other`.
    pub fn at_least(self, other: Role) -> bool {
        self <= other
    }

    pub fn is_moderator(self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "Owner",
            Role::Admin => "Admin",
            Role::Member => "Member",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemoveReason {
    Kick,
    Leave,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MetadataKey {
    Name = 0,
    Icon = 1,
    Topic = 2,
}

impl MetadataKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataKey::Name => "name",
            MetadataKey::Icon => "icon",
            MetadataKey::Topic => "topic",
        }
    }
}

// ---------------------------------------------------------------------------
// Payload types (CBOR-encoded inside OpEnvelope.payload)
// ---------------------------------------------------------------------------

/// Content sealed under one group secret.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SealedContent {
    /// Op id that established the secret (GroupCreate or a rotating MemberRemove).
    pub secret_id: OpID,
    pub nonce: [u8; 24],
    pub ciphertext: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GroupCreatePayload {
    /// Salt the group id was derived from.
    pub salt: [u8; 32],
    /// Creator's X25519 key for secret delivery.
    pub creator_exchange_pubkey: [u8; 32],
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MemberInvitePayload {
    pub invited_device_id: DeviceID,
    pub invited_pubkey: [u8; 32],
    pub role: Role,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MemberAcceptPayload {
    /// The MemberInvite being accepted. Also the op's single dependency.
    pub invite_op_id: OpID,
    /// Invitee's X25519 key; the group secret is sealed to it.
    pub exchange_pubkey: [u8; 32],
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MemberRemovePayload {
    pub target_device_id: DeviceID,
    pub reason: RemoveReason,
    /// On Leave: the member the leaver hands secret rotation to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<DeviceID>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RoleSetPayload {
    pub target_device_id: DeviceID,
    pub new_role: Role,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MemberMutePayload {
    pub target_device_id: DeviceID,
    pub muted: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MemberReportPayload {
    pub target_device_id: DeviceID,
    pub reason: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MetadataSetPayload {
    pub key: MetadataKey,
    pub value: SealedContent,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MessageSendPayload {
    /// BLAKE3(author || lamport || nonce), see `generate_msg_id`.
    pub msg_id: [u8; 32],
    pub content: SealedContent,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MessageEditPayload {
    pub msg_id: [u8; 32],
    pub content: SealedContent,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MessageDeletePayload {
    pub msg_id: [u8; 32],
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ReactionSetPayload {
    pub msg_id: [u8; 32],
    pub emoji: String,
    /// true = add, false = remove.
    pub present: bool,
}

// ---------------------------------------------------------------------------
// OpEnvelope
// ---------------------------------------------------------------------------

/// Immutable, signed group operation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OpEnvelope {
    pub version: u8,
    pub group_id: GroupID,
    pub op_id: OpID,
    /// Ops this one causally depends on. It is never applied before them.
    pub deps: Vec<OpID>,
    /// Same as `op_id.lamport`.
    pub lamport: u64,
    /// Wall clock, display ordering only.
    pub timestamp_ms: u64,
    pub op_type: OpType,
    /// CBOR-encoded payload bytes.
    pub payload: Vec<u8>,
    pub author_pubkey: [u8; 32],
    /// Ed25519 over BLAKE3(signable_bytes).
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_ENVELOPE_BYTES)
}

impl OpEnvelope {
    /// Build and sign an op with an explicit lamport and nonce.
    ///
    /// Callers normally go through [`create_operation`], which draws both
    /// from the causal clock.
    #[allow(clippy::too_many_arguments)]
    pub fn create_signed<P: Serialize, S: DigestSigner + ?Sized>(
        group_id: GroupID,
        op_type: OpType,
        payload: &P,
        deps: Vec<OpID>,
        lamport: u64,
        nonce: u64,
        signer: &S,
    ) -> Result<Self, OpError> {
        let payload_bytes = cbor_encode(payload)?;
        if payload_bytes.len() > MAX_OP_PAYLOAD_BYTES {
            return Err(OpError::PayloadTooLarge {
                size: payload_bytes.len(),
                max: MAX_OP_PAYLOAD_BYTES,
            });
        }
        if deps.len() > MAX_DEPS_PER_OP {
            return Err(OpError::TooManyDeps {
                count: deps.len(),
                max: MAX_DEPS_PER_OP,
            });
        }

        let author_pubkey = signer.public_key();
        let op_id = OpID::new(DeviceID::from_pubkey(&author_pubkey), lamport, nonce);

        let mut envelope = OpEnvelope {
            version: OP_WIRE_VERSION,
            group_id,
            op_id,
            deps,
            lamport,
            timestamp_ms: now_ms(),
            op_type,
            payload: payload_bytes,
            author_pubkey,
            signature: [0u8; 64],
        };

        let digest = envelope.signing_digest()?;
        envelope.signature = signer.sign_digest(&digest)?;
        Ok(envelope)
    }

    /// Check the envelope's author binding and signature.
    ///
    /// `Ok(false)` for a bad signature, `Err` for a structurally invalid
    /// envelope (author/pubkey mismatch, unknown version).
    pub fn verify(&self) -> Result<bool, OpError> {
        if self.version != OP_WIRE_VERSION {
            return Err(OpError::UnsupportedVersion(self.version));
        }
        if DeviceID::from_pubkey(&self.author_pubkey) != self.op_id.author {
            return Err(OpError::AuthorMismatch);
        }
        if self.lamport != self.op_id.lamport {
            return Err(OpError::LamportMismatch);
        }
        if self.deps.len() > MAX_DEPS_PER_OP {
            return Err(OpError::TooManyDeps {
                count: self.deps.len(),
                max: MAX_DEPS_PER_OP,
            });
        }

        let digest = self.signing_digest()?;
        Ok(verify_signature(&digest, &self.signature, &self.author_pubkey))
    }

    pub fn author(&self) -> DeviceID {
        self.op_id.author
    }

    /// All fields except the signature, in declaration order.
    fn signable_bytes(&self) -> Result<Vec<u8>, OpError> {
        let signable = (
            self.version,
            &self.group_id,
            &self.op_id,
            &self.deps,
            self.lamport,
            self.timestamp_ms,
            &self.op_type,
            &self.payload,
            &self.author_pubkey,
        );
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .serialize(&signable)
            .map_err(|e| OpError::Codec(e.to_string()))
    }

    fn signing_digest(&self) -> Result<[u8; 32], OpError> {
        Ok(*blake3::hash(&self.signable_bytes()?).as_bytes())
    }

    /// Hash over signed content and signature. Two envelopes claiming the
    /// same OpID are told apart (and ranked) by this.
    pub fn content_hash(&self) -> Result<[u8; 32], OpError> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.signable_bytes()?);
        hasher.update(&self.signature);
        Ok(*hasher.finalize().as_bytes())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, OpError> {
        wire_options()
            .serialize(self)
            .map_err(|e| OpError::Codec(e.to_string()))
    }

    /// Decode peer-supplied bytes. Oversized, truncated or trailing input and
    /// unknown versions are errors, never panics.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OpError> {
        let op: OpEnvelope = wire_options()
            .deserialize(bytes)
            .map_err(|e| OpError::Codec(e.to_string()))?;
        if op.version != OP_WIRE_VERSION {
            return Err(OpError::UnsupportedVersion(op.version));
        }
        Ok(op)
    }

    pub fn decode_payload<P: serde::de::DeserializeOwned>(&self) -> Result<P, OpError> {
        cbor_decode(&self.payload)
    }
}

/// `true` only for a well-formed envelope with a valid signature.
pub fn verify_operation(op: &OpEnvelope) -> bool {
    matches!(op.verify(), Ok(true))
}

/// Create a signed op stamped by the group's causal clock.
///
/// The clock hands out (and persists) the next lamport before signing, so
/// concurrent callers must serialize through the group actor.
pub fn create_operation<P: Serialize, S: DigestSigner + ?Sized>(
    group_id: GroupID,
    op_type: OpType,
    payload: &P,
    deps: Vec<OpID>,
    signer: &S,
    clock: &mut CausalClock,
) -> Result<OpEnvelope, OpError> {
    let lamport = clock.next_lamport()?;
    let nonce: u64 = rand::random();
    let op = OpEnvelope::create_signed(group_id, op_type, payload, deps, lamport, nonce, signer)?;
    clock.observe(&op);
    Ok(op)
}

// ---------------------------------------------------------------------------
// Batch codec
// ---------------------------------------------------------------------------

/// `[u32 count][u32 len][envelope]...`, big-endian lengths.
pub fn encode_op_batch(ops: &[OpEnvelope]) -> Result<Vec<u8>, OpError> {
    if ops.len() > MAX_OPS_PER_BATCH {
        return Err(OpError::MalformedBatch(format!(
            "{} ops exceeds {}",
            ops.len(),
            MAX_OPS_PER_BATCH
        )));
    }
    let mut out = Vec::with_capacity(4 + ops.len() * 256);
    out.extend_from_slice(&(ops.len() as u32).to_be_bytes());
    for op in ops {
        let bytes = op.to_bytes()?;
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

pub fn decode_op_batch(data: &[u8]) -> Result<Vec<OpEnvelope>, OpError> {
    let mut cursor = data;
    let count = read_u32(&mut cursor)? as usize;
    if count > MAX_OPS_PER_BATCH {
        return Err(OpError::MalformedBatch(format!(
            "count {} exceeds {}",
            count, MAX_OPS_PER_BATCH
        )));
    }

    let mut ops = Vec::with_capacity(count);
    for i in 0..count {
        let len = read_u32(&mut cursor)? as usize;
        if len as u64 > MAX_ENVELOPE_BYTES {
            return Err(OpError::MalformedBatch(format!("op {} is {} bytes", i, len)));
        }
        if cursor.len() < len {
            return Err(OpError::MalformedBatch(format!("op {} truncated", i)));
        }
        let (op_bytes, rest) = cursor.split_at(len);
        ops.push(OpEnvelope::from_bytes(op_bytes)?);
        cursor = rest;
    }
    if !cursor.is_empty() {
        return Err(OpError::MalformedBatch(format!(
            "{} trailing bytes",
            cursor.len()
        )));
    }
    Ok(ops)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32, OpError> {
    if cursor.len() < 4 {
        return Err(OpError::MalformedBatch("truncated length".into()));
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
}

// ---------------------------------------------------------------------------
// CBOR helpers
// ---------------------------------------------------------------------------

pub fn cbor_encode<T: Serialize>(value: &T) -> Result<Vec<u8>, OpError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| OpError::CborEncode(e.to_string()))?;
    Ok(buf)
}

pub fn cbor_decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, OpError> {
    ciborium::from_reader(bytes).map_err(|e| OpError::CborDecode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// BLAKE3(author_device_id || lamport || nonce).
pub fn generate_msg_id(author: &DeviceID, lamport: u64, nonce: u64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(author.as_bytes());
    hasher.update(&lamport.to_le_bytes());
    hasher.update(&nonce.to_le_bytes());
    *hasher.finalize().as_bytes()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
