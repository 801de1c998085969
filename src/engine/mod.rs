/// Group engine: op authoring, ingestion, sync answers and secret handling
/// for each group, driven by one actor task per group.
///
/// # Module structure
/// - `keystore`: Device keys and held group secrets
/// - `directory`: Member pubkey to transport address
/// - `group`: `GroupEngine`, the synchronous per-group core
/// - `actor`: `GroupActor` task and its `GroupHandle`
/// - `messenger`: `Messenger`, the public API over all groups
use std::sync::Arc;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::crdt::apply::{ApplyError, ApplyOutcome};
use crate::crdt::ids::{DeviceID, GroupID, OpID};
use crate::crdt::membership::MembershipEffect;
use crate::crdt::ops::{OpError, OpType};
use crate::crdt::secrets::SecretError;
use crate::crdt::store::StoreError;
use crate::persistence::{ClockStore, OpLogStore, PersistenceError};
use crate::sync::dispatcher::{PeerAddress, TransportError};
use crate::sync::frame::{Frame, SyncError};

pub mod actor;
pub mod directory;
pub mod group;
pub mod keystore;
pub mod messenger;

pub use actor::{GroupActor, GroupCommand, GroupHandle};
pub use directory::{MemoryDirectory, PeerDirectory};
pub use group::{Authored, GroupEngine, LocalAction, OperationInfo};
pub use keystore::{KeyStore, KeyStoreError, MemoryKeyStore};
pub use messenger::Messenger;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Group not loaded: {0}")]
    UnknownGroup(GroupID),

    #[error("Group already loaded: {0}")]
    GroupExists(GroupID),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("No pending invite {0}")]
    NoPendingInvite(OpID),

    #[error("Message not found")]
    MessageNotFound,

    #[error("Group secret {0} not held")]
    SecretUnavailable(OpID),

    #[error("Hard op limit reached")]
    LimitReached,

    #[error("Group actor stopped")]
    ActorGone,

    #[error("Lock poisoned")]
    Poisoned,

    #[error("Op error: {0}")]
    Op(#[from] OpError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Query error: {0}")]
    Query(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Everything a group engine needs from the host.
#[derive(Clone)]
pub struct EngineContext {
    pub keys: Arc<dyn KeyStore>,
    pub op_log: Arc<dyn OpLogStore>,
    pub clocks: Arc<dyn ClockStore>,
    pub config: EngineConfig,
}

impl EngineContext {
    pub fn local_device(&self) -> DeviceID {
        DeviceID::from_pubkey(&self.keys.signing_public_key())
    }
}

// ---------------------------------------------------------------------------
// Engine output
// ---------------------------------------------------------------------------

/// Where an outbound frame goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipient {
    /// A member, addressed through the peer directory.
    Device([u8; 32]),
    /// The sender of a request: its directory address if known, else the
    /// address the request came from.
    Reply { pubkey: [u8; 32], source: PeerAddress },
    /// A raw address.
    Peer(PeerAddress),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub to: Recipient,
    pub frame: Frame,
}

/// Published on the group's broadcast channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupEvent {
    /// A newly stored op was folded.
    OperationApplied {
        op_id: OpID,
        op_type: OpType,
        outcome: ApplyOutcome,
    },
    MembershipChanged {
        op_id: OpID,
        effect: MembershipEffect,
    },
    MessageReceived {
        msg_id: [u8; 32],
        author: DeviceID,
    },
    /// This device was invited. Accept with `accept_invite`.
    InvitedToGroup {
        invite_op_id: OpID,
        inviter: DeviceID,
    },
    SecretInstalled {
        secret_id: OpID,
    },
    DependenciesExpired(Vec<OpID>),
    /// The projection was rebuilt from the whole log.
    ProjectionRebuilt,
    GroupDeleted,
}

/// Frames to send and events to publish after one engine call.
#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Outbound>,
    pub events: Vec<GroupEvent>,
}

impl Effects {
    pub fn extend(&mut self, other: Effects) {
        self.outbound.extend(other.outbound);
        self.events.extend(other.events);
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty()
    }
}
