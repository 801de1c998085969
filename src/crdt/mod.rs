/// CRDT group system: operation-based, causally ordered group state.
///
/// Groups are append-only logs of signed operations. Every action (create,
/// invite, accept, remove, role change, message, edit, delete, react,
/// metadata change) is an immutable op. Devices converge by exchanging
/// missing ops and folding them in causal order.
///
/// # Module structure
/// - `ids`: DeviceID, GroupID, OpID identity types
/// - `ops`: OpEnvelope, OpType, payload types, signing/verification
/// - `limits`: Guardrail constants and op limit checking
/// - `clock`: Per-group lamport clock and dependency checks
/// - `store`: Deduplicating, buffering op store
/// - `membership`: Roster with role-based authorization and tombstones
/// - `messages`: Send/edit/delete/react with LWW edits and permanent tombstones
/// - `metadata`: LWW registers for group name, icon, topic
/// - `secrets`: Group secrets, content sealing, sealed secret delivery
/// - `apply`: Unified fold (GroupState, causal order, state_hash)
/// - `conversation`: Decrypted, time-ordered view
pub mod apply;
pub mod clock;
pub mod conversation;
pub mod ids;
pub mod limits;
pub mod membership;
pub mod messages;
pub mod metadata;
pub mod ops;
pub mod secrets;
pub mod store;

#[cfg(test)]
pub(crate) mod testkit;

pub use apply::{causal_order, ApplyError, ApplyOutcome, GroupState, SecretDuty, SystemEvent};
pub use clock::{is_deliverable, missing_dependencies, CausalClock};
pub use conversation::{ConversationEntry, EntryKind, MessageBody, MetadataValue};
pub use ids::{DeviceID, GroupID, IdParseError, OpID};
pub use limits::{check_op_limits, OpLimitStatus};
pub use membership::{MemberEntry, MembershipEffect, MembershipError, MembershipState};
pub use messages::{MessageEntry, MessageError, MessageState};
pub use metadata::{LWWRegister, MetadataError, MetadataState};
pub use ops::{
    cbor_decode, cbor_encode, create_operation, decode_op_batch, encode_op_batch,
    generate_msg_id, verify_operation, GroupCreatePayload, MemberAcceptPayload,
    MemberInvitePayload, MemberMutePayload, MemberRemovePayload, MemberReportPayload,
    MessageDeletePayload, MessageEditPayload, MessageSendPayload, MetadataKey,
    MetadataSetPayload, OpEnvelope, OpError, OpType, ReactionSetPayload, RemoveReason, Role,
    RoleSetPayload, SealedContent,
};
pub use secrets::{GroupSecret, SealedSecret, SecretError, SecretLookup};
pub use store::{AppendReport, AppendResult, OpStore, PendingInfo, StoreError};
