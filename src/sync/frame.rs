/// Wire frames exchanged between group members.
///
/// A frame is bincode `Frame { version, message }`. Requests are signed by
/// the requester so a responder can check membership before it hands out
/// history or secrets; the op envelopes inside carry their own signatures.
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::crdt::ids::{DeviceID, GroupID, OpID};
use crate::crdt::limits::{
    MAX_BYTES_PER_SYNC_ROUND, MAX_FETCH_IDS, MAX_FRAME_BYTES, MAX_OPS_PER_CHUNK,
};
use crate::crdt::ops::OpEnvelope;
use crate::crdt::secrets::SealedSecret;
use crate::crypto::signing::{verify_signature, DigestSigner, SigningError};
use crate::sync::digest::SyncDigest;

/// Frame format version.
pub const FRAME_WIRE_VERSION: u8 = 1;

const REQUEST_CONTEXT: &[u8] = b"SL-GROUP-REQ-v1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Frame codec error: {0}")]
    Codec(String),

    #[error("Unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    #[error("Request signature invalid")]
    InvalidSignature,

    #[error("Request for another group")]
    WrongGroup,

    #[error("Requester {0} is not a member")]
    NotAMember(DeviceID),

    #[error("Too many ids requested: {count} (max {max})")]
    TooManyIds { count: usize, max: usize },

    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

fn frame_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_BYTES)
}

// ---------------------------------------------------------------------------
// Signed requests
// ---------------------------------------------------------------------------

/// Body of a signed request. The tag keeps a signature for one kind of
/// request from being replayed as another.
pub trait RequestBody: Serialize + DeserializeOwned + Clone {
    const TAG: &'static [u8];
}

/// Our digest; the responder sends what it has and we lack.
impl RequestBody for SyncDigest {
    const TAG: &'static [u8] = b"sync";
}

/// Specific ops, usually missing dependencies.
impl RequestBody for Vec<OpID> {
    const TAG: &'static [u8] = b"fetch";
}

/// A group secret by id, or the current one when `None`.
impl RequestBody for Option<OpID> {
    const TAG: &'static [u8] = b"secret";
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SignedRequest<B> {
    pub group_id: GroupID,
    pub requester_pubkey: [u8; 32],
    pub issued_at_ms: u64,
    pub body: B,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

pub type SyncRequest = SignedRequest<SyncDigest>;
pub type FetchRequest = SignedRequest<Vec<OpID>>;
pub type SecretRequest = SignedRequest<Option<OpID>>;

impl<B: RequestBody> SignedRequest<B> {
    pub fn sign<S: DigestSigner + ?Sized>(group_id: GroupID, body: B, signer: &S) -> Result<Self> {
        let mut request = SignedRequest {
            group_id,
            requester_pubkey: signer.public_key(),
            issued_at_ms: now_ms(),
            body,
            signature: [0u8; 64],
        };
        request.signature = signer.sign_digest(&request.signing_digest()?)?;
        Ok(request)
    }

    pub fn requester(&self) -> DeviceID {
        DeviceID::from_pubkey(&self.requester_pubkey)
    }

    pub fn verify(&self) -> bool {
        match self.signing_digest() {
            Ok(digest) => verify_signature(&digest, &self.signature, &self.requester_pubkey),
            Err(_) => false,
        }
    }

    fn signing_digest(&self) -> Result<[u8; 32]> {
        let signable = (
            REQUEST_CONTEXT,
            B::TAG,
            &self.group_id,
            &self.requester_pubkey,
            self.issued_at_ms,
            &self.body,
        );
        let bytes = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .serialize(&signable)
            .map_err(|e| SyncError::Codec(e.to_string()))?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }
}

impl FetchRequest {
    pub fn check_size(&self) -> Result<()> {
        if self.body.len() > MAX_FETCH_IDS {
            return Err(SyncError::TooManyIds {
                count: self.body.len(),
                max: MAX_FETCH_IDS,
            });
        }
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum FrameMessage {
    /// A single new op, pushed by its author.
    Operation(OpEnvelope),
    SyncRequest(SyncRequest),
    /// One chunk of an answer to a sync or fetch request.
    SyncResponse {
        group_id: GroupID,
        ops: Vec<OpEnvelope>,
        chunk: u32,
        last: bool,
    },
    FetchRequest(FetchRequest),
    SealedSecret(SealedSecret),
    SecretRequest(SecretRequest),
}

impl FrameMessage {
    pub fn group_id(&self) -> GroupID {
        match self {
            FrameMessage::Operation(op) => op.group_id,
            FrameMessage::SyncRequest(r) => r.group_id,
            FrameMessage::SyncResponse { group_id, .. } => *group_id,
            FrameMessage::FetchRequest(r) => r.group_id,
            FrameMessage::SealedSecret(s) => s.group_id,
            FrameMessage::SecretRequest(r) => r.group_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FrameMessage::Operation(_) => "Operation",
            FrameMessage::SyncRequest(_) => "SyncRequest",
            FrameMessage::SyncResponse { .. } => "SyncResponse",
            FrameMessage::FetchRequest(_) => "FetchRequest",
            FrameMessage::SealedSecret(_) => "SealedSecret",
            FrameMessage::SecretRequest(_) => "SecretRequest",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub message: FrameMessage,
}

impl Frame {
    pub fn new(message: FrameMessage) -> Self {
        Frame {
            version: FRAME_WIRE_VERSION,
            message,
        }
    }

    pub fn group_id(&self) -> GroupID {
        self.message.group_id()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        frame_options()
            .serialize(self)
            .map_err(|e| SyncError::Codec(e.to_string()))
    }

    /// Size-limited decode. Trailing bytes are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() as u64 > MAX_FRAME_BYTES {
            return Err(SyncError::Codec(format!(
                "frame is {} bytes (max {})",
                bytes.len(),
                MAX_FRAME_BYTES
            )));
        }
        // Peek at the version before committing to the layout.
        if let Some(&version) = bytes.first() {
            if version != FRAME_WIRE_VERSION {
                return Err(SyncError::UnsupportedVersion(version));
            }
        }
        let frame: Frame = frame_options()
            .reject_trailing_bytes()
            .deserialize(bytes)
            .map_err(|e| SyncError::Codec(e.to_string()))?;
        Ok(frame)
    }
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// Split a sync answer into chunks of at most `MAX_OPS_PER_CHUNK` ops.
///
/// The whole answer is capped at `max_ops` ops and
/// `MAX_BYTES_PER_SYNC_ROUND` encoded bytes. Ops past either cap are left
/// for the requester's next round.
pub fn chunk_ops(ops: Vec<OpEnvelope>, max_ops: usize) -> Vec<Vec<OpEnvelope>> {
    let mut chunks: Vec<Vec<OpEnvelope>> = Vec::new();
    let mut current: Vec<OpEnvelope> = Vec::new();
    let mut total_bytes = 0usize;
    let mut total_ops = 0usize;

    for op in ops {
        if total_ops >= max_ops {
            break;
        }
        let size = match op.to_bytes() {
            Ok(bytes) => bytes.len(),
            Err(e) => {
                log::warn!("sync: skipped unencodable op {}: {}", op.op_id, e);
                continue;
            }
        };
        if total_bytes + size > MAX_BYTES_PER_SYNC_ROUND {
            break;
        }
        total_bytes += size;
        total_ops += 1;
        current.push(op);
        if current.len() == MAX_OPS_PER_CHUNK {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Response frames for `ops`. Always at least one frame, so an empty answer
/// still tells the requester the round is over.
pub fn sync_response_frames(group_id: GroupID, ops: Vec<OpEnvelope>, max_ops: usize) -> Vec<Frame> {
    let chunks = chunk_ops(ops, max_ops);
    if chunks.is_empty() {
        return vec![Frame::new(FrameMessage::SyncResponse {
            group_id,
            ops: Vec::new(),
            chunk: 0,
            last: true,
        })];
    }
    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, ops)| {
            Frame::new(FrameMessage::SyncResponse {
                group_id,
                ops,
                chunk: i as u32,
                last: i + 1 == count,
            })
        })
        .collect()
}
