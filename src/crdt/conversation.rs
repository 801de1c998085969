/// Decrypted conversation view.
///
/// Merges live messages and membership system events into one list sorted
/// by `(timestamp_ms, op_id)`. Content is opened with whatever secrets the
/// caller holds; a missing secret renders as `Undecryptable`, a secret that
/// fails to open the content as `Corrupt`. Neither is an error.
use std::collections::BTreeMap;

use crate::crdt::apply::GroupState;
use crate::crdt::ids::{DeviceID, GroupID, OpID};
use crate::crdt::membership::MembershipEffect;
use crate::crdt::messages::MessageEntry;
use crate::crdt::ops::{MetadataKey, SealedContent};
use crate::crdt::secrets::{open_content, SecretLookup};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    /// Sealed under a secret this device does not hold (yet).
    Undecryptable { secret_id: OpID },
    /// Secret held but the content did not open, or was not UTF-8.
    Corrupt,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Message {
        msg_id: [u8; 32],
        author: DeviceID,
        body: MessageBody,
        edited: bool,
        /// emoji -> devices
        reactions: BTreeMap<String, Vec<DeviceID>>,
    },
    System(MembershipEffect),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationEntry {
    pub op_id: OpID,
    pub timestamp_ms: u64,
    pub kind: EntryKind,
}

impl ConversationEntry {
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::Message {
                body: MessageBody::Text(t),
                ..
            } => Some(t),
            _ => None,
        }
    }
}

/// A metadata register as the UI sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataValue {
    Value(Vec<u8>),
    Undecryptable { secret_id: OpID },
    Corrupt,
}

fn open_sealed<S: SecretLookup + ?Sized>(
    secrets: &S,
    group_id: &GroupID,
    sealed: &SealedContent,
) -> Result<Vec<u8>, MessageBody> {
    let Some(secret) = secrets.secret(&sealed.secret_id) else {
        return Err(MessageBody::Undecryptable {
            secret_id: sealed.secret_id,
        });
    };
    open_content(&secret, group_id, sealed).map_err(|e| {
        log::warn!("conversation: content under {:?} did not open: {}", sealed.secret_id, e);
        MessageBody::Corrupt
    })
}

/// Open sealed content with the matching secret, if held.
pub fn decrypt_body<S: SecretLookup + ?Sized>(
    secrets: &S,
    group_id: &GroupID,
    sealed: &SealedContent,
) -> MessageBody {
    match open_sealed(secrets, group_id, sealed) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => MessageBody::Text(text),
            Err(_) => MessageBody::Corrupt,
        },
        Err(body) => body,
    }
}

/// Decrypted metadata registers.
pub fn metadata_view<S: SecretLookup + ?Sized>(
    state: &GroupState,
    secrets: &S,
) -> BTreeMap<MetadataKey, MetadataValue> {
    state
        .metadata
        .registers()
        .iter()
        .map(|(key, reg)| {
            let value = match open_sealed(secrets, &state.group_id, &reg.value) {
                Ok(bytes) => MetadataValue::Value(bytes),
                Err(MessageBody::Undecryptable { secret_id }) => {
                    MetadataValue::Undecryptable { secret_id }
                }
                Err(_) => MetadataValue::Corrupt,
            };
            (*key, value)
        })
        .collect()
}

fn message_entry<S: SecretLookup + ?Sized>(
    secrets: &S,
    group_id: &GroupID,
    msg: &MessageEntry,
) -> ConversationEntry {
    let reactions = msg
        .active_reactions()
        .into_iter()
        .map(|(emoji, devices)| (emoji.to_string(), devices))
        .collect();
    ConversationEntry {
        op_id: msg.create_op,
        timestamp_ms: msg.timestamp_ms,
        kind: EntryKind::Message {
            msg_id: msg.msg_id,
            author: msg.author,
            body: decrypt_body(secrets, group_id, &msg.content),
            edited: msg.edited,
            reactions,
        },
    }
}

/// Mutes and reports are moderation annotations, not timeline entries.
fn shows_in_timeline(effect: &MembershipEffect) -> bool {
    !matches!(
        effect,
        MembershipEffect::Muted { .. } | MembershipEffect::Reported { .. }
    )
}

/// The full conversation, deleted messages left out.
pub fn project<S: SecretLookup + ?Sized>(state: &GroupState, secrets: &S) -> Vec<ConversationEntry> {
    let messages = state
        .messages
        .messages()
        .values()
        .filter(|m| !m.deleted)
        .map(|m| message_entry(secrets, &state.group_id, m));
    let events = state
        .system_events()
        .values()
        .filter(|e| shows_in_timeline(&e.effect))
        .map(|e| ConversationEntry {
            op_id: e.op_id,
            timestamp_ms: e.timestamp_ms,
            kind: EntryKind::System(e.effect.clone()),
        });

    let mut entries: Vec<ConversationEntry> = messages.chain(events).collect();
    entries.sort_by(|a, b| (a.timestamp_ms, a.op_id).cmp(&(b.timestamp_ms, b.op_id)));
    entries
}

/// Messages sent after `after_lamport`, oldest first by OpID, at most
/// `limit`. Paging cursor for the UI: pass the last entry's lamport back.
pub fn messages_after<S: SecretLookup + ?Sized>(
    state: &GroupState,
    secrets: &S,
    after_lamport: u64,
    limit: usize,
) -> Vec<ConversationEntry> {
    let mut msgs: Vec<&MessageEntry> = state
        .messages
        .messages()
        .values()
        .filter(|m| !m.deleted && m.create_op.lamport > after_lamport)
        .collect();
    msgs.sort_by_key(|m| m.create_op);
    msgs.into_iter()
        .take(limit)
        .map(|m| message_entry(secrets, &state.group_id, m))
        .collect()
}
