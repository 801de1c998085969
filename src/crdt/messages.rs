/// Message projection: send, edit, delete and react.
///
/// Messages are keyed by `msg_id`, which must equal
/// `generate_msg_id(author, lamport, nonce)` of the sending op so a peer
/// cannot claim somebody else's message slot. Edits are LWW by OpID and
/// only the author may edit. Deletes are permanent tombstones; edits and
/// reactions arriving after one are ignored.
///
/// Content stays sealed here. Decryption happens in the conversation view.
use std::collections::BTreeMap;
use thiserror::Error;

use crate::crdt::ids::{DeviceID, OpID};
use crate::crdt::limits::MAX_EMOJI_BYTES;
use crate::crdt::membership::MembershipState;
use crate::crdt::ops::{
    generate_msg_id, MessageDeletePayload, MessageEditPayload, MessageSendPayload, OpEnvelope,
    ReactionSetPayload, SealedContent,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Message id does not derive from the sending op")]
    MsgIdMismatch,

    #[error("Message with this msg_id already exists")]
    MessageAlreadyExists,

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Only the original author can edit this message")]
    NotMessageAuthor,

    #[error("Not authorized to delete this message")]
    DeleteNotAuthorized,

    #[error("Emoji must be 1..={max} bytes")]
    InvalidEmoji { max: usize },

    #[error("Payload decode error: {0}")]
    PayloadDecode(String),
}

fn decode<P: serde::de::DeserializeOwned>(op: &OpEnvelope) -> Result<P, MessageError> {
    op.decode_payload()
        .map_err(|e| MessageError::PayloadDecode(e.to_string()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEntry {
    pub msg_id: [u8; 32],
    pub author: DeviceID,
    /// The MessageSend that created this message.
    pub create_op: OpID,
    /// Current content, replaced by newer edits.
    pub content: SealedContent,
    /// Wall clock of the send, for display.
    pub timestamp_ms: u64,
    /// The op whose content is current: the send or the winning edit.
    pub content_op: OpID,
    pub edited: bool,
    pub deleted: bool,
    pub delete_op: Option<OpID>,
    /// (reactor, emoji) -> present
    pub reactions: BTreeMap<(DeviceID, String), bool>,
    reaction_ops: BTreeMap<(DeviceID, String), OpID>,
}

impl MessageEntry {
    /// Emojis currently set, with the devices that set them.
    pub fn active_reactions(&self) -> BTreeMap<&str, Vec<DeviceID>> {
        let mut out: BTreeMap<&str, Vec<DeviceID>> = BTreeMap::new();
        for ((device, emoji), present) in &self.reactions {
            if *present {
                out.entry(emoji.as_str()).or_default().push(*device);
            }
        }
        out
    }
}

#[derive(Clone, Debug, Default)]
pub struct MessageState {
    messages: BTreeMap<[u8; 32], MessageEntry>,
}

impl MessageState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &BTreeMap<[u8; 32], MessageEntry> {
        &self.messages
    }

    pub fn get_message(&self, msg_id: &[u8; 32]) -> Option<&MessageEntry> {
        self.messages.get(msg_id)
    }

    /// Including tombstones.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    fn entry_mut(&mut self, msg_id: &[u8; 32]) -> Result<&mut MessageEntry, MessageError> {
        self.messages
            .get_mut(msg_id)
            .ok_or_else(|| MessageError::MessageNotFound(hex::encode(msg_id)))
    }

    pub fn apply_message_send(&mut self, op: &OpEnvelope) -> Result<(), MessageError> {
        let payload: MessageSendPayload = decode(op)?;
        let author = op.author();
        if payload.msg_id != generate_msg_id(&author, op.lamport, op.op_id.nonce) {
            return Err(MessageError::MsgIdMismatch);
        }
        if self.messages.contains_key(&payload.msg_id) {
            return Err(MessageError::MessageAlreadyExists);
        }

        self.messages.insert(
            payload.msg_id,
            MessageEntry {
                msg_id: payload.msg_id,
                author,
                create_op: op.op_id,
                content: payload.content,
                timestamp_ms: op.timestamp_ms,
                content_op: op.op_id,
                edited: false,
                deleted: false,
                delete_op: None,
                reactions: BTreeMap::new(),
                reaction_ops: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// LWW by OpID. Stale edits and edits of deleted messages are no-ops.
    pub fn apply_message_edit(&mut self, op: &OpEnvelope) -> Result<(), MessageError> {
        let payload: MessageEditPayload = decode(op)?;
        let msg = self.entry_mut(&payload.msg_id)?;
        if op.author() != msg.author {
            return Err(MessageError::NotMessageAuthor);
        }
        if msg.deleted || op.op_id <= msg.content_op {
            return Ok(());
        }
        msg.content = payload.content;
        msg.content_op = op.op_id;
        msg.edited = true;
        Ok(())
    }

    /// The author, or any active Owner/Admin, may delete.
    pub fn apply_message_delete(
        &mut self,
        op: &OpEnvelope,
        membership: &MembershipState,
    ) -> Result<(), MessageError> {
        let payload: MessageDeletePayload = decode(op)?;
        let author = op.author();
        let moderator = membership
            .get_active_member(&author)
            .is_some_and(|m| m.role.is_moderator());

        let msg = self.entry_mut(&payload.msg_id)?;
        if msg.deleted {
            return Ok(());
        }
        if author != msg.author && !moderator {
            return Err(MessageError::DeleteNotAuthorized);
        }
        msg.deleted = true;
        msg.delete_op = Some(op.op_id);
        Ok(())
    }

    /// Per (device, emoji) LWW flag. Ignored on deleted messages.
    pub fn apply_reaction_set(&mut self, op: &OpEnvelope) -> Result<(), MessageError> {
        let payload: ReactionSetPayload = decode(op)?;
        if payload.emoji.is_empty() || payload.emoji.len() > MAX_EMOJI_BYTES {
            return Err(MessageError::InvalidEmoji {
                max: MAX_EMOJI_BYTES,
            });
        }
        let msg = self.entry_mut(&payload.msg_id)?;
        if msg.deleted {
            return Ok(());
        }

        let key = (op.author(), payload.emoji);
        if msg.reaction_ops.get(&key).is_some_and(|prev| op.op_id <= *prev) {
            return Ok(());
        }
        msg.reactions.insert(key.clone(), payload.present);
        msg.reaction_ops.insert(key, op.op_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::ids::GroupID;
    use crate::crdt::ops::{OpType, Role};
    use crate::crdt::secrets::{open_content, GroupSecret};
    use crate::crdt::testkit::*;

    struct Fixture {
        gid: GroupID,
        owner: TestDevice,
        alice: TestDevice,
        membership: MembershipState,
        secret: GroupSecret,
        secret_id: OpID,
    }

    fn fixture() -> Fixture {
        let owner = TestDevice::new();
        let alice = TestDevice::new();
        let (gid, create) = op_create(&owner);
        let invite = op_invite(gid, &owner, &alice, Role::Member, 2);
        let accept = op_accept(gid, &alice, &invite, 3);

        let mut membership = MembershipState::new();
        membership.apply_group_create(&create, &gid).unwrap();
        membership.apply_member_invite(&invite).unwrap();
        membership.apply_member_accept(&accept).unwrap();

        Fixture {
            gid,
            owner,
            alice,
            membership,
            secret: GroupSecret::generate(),
            secret_id: create.op_id,
        }
    }

    fn text(f: &Fixture, entry: &MessageEntry) -> String {
        String::from_utf8(open_content(&f.secret, &f.gid, &entry.content).unwrap()).unwrap()
    }

    #[test]
    fn test_send_and_read_back() {
        let f = fixture();
        let mut state = MessageState::new();
        let op = op_message(f.gid, &f.alice, &f.secret, f.secret_id, "hello", 4);
        state.apply_message_send(&op).unwrap();

        let entry = state.get_message(&msg_id_of(&op)).unwrap();
        assert_eq!(entry.author, f.alice.device());
        assert_eq!(entry.create_op, op.op_id);
        assert_eq!(text(&f, entry), "hello");
        assert_eq!(state.message_count(), 1);
    }

    #[test]
    fn test_forged_msg_id_rejected() {
        let f = fixture();
        let mut state = MessageState::new();
        let real = op_message(f.gid, &f.alice, &f.secret, f.secret_id, "mine", 4);
        state.apply_message_send(&real).unwrap();

        // owner reuses alice's msg_id in his own send
        let payload = MessageSendPayload {
            msg_id: msg_id_of(&real),
            content: real.decode_payload::<MessageSendPayload>().unwrap().content,
        };
        let forged = OpEnvelope::create_signed(
            f.gid,
            OpType::MessageSend,
            &payload,
            vec![],
            5,
            9,
            &f.owner.keys,
        )
        .unwrap();
        assert_eq!(
            state.apply_message_send(&forged).unwrap_err(),
            MessageError::MsgIdMismatch
        );
    }

    #[test]
    fn test_edit_lww_author_only() {
        let f = fixture();
        let mut state = MessageState::new();
        let send = op_message(f.gid, &f.alice, &f.secret, f.secret_id, "v1", 4);
        let id = msg_id_of(&send);
        state.apply_message_send(&send).unwrap();

        let v3 = op_edit(f.gid, &f.alice, id, &f.secret, f.secret_id, "v3", 6);
        let v2 = op_edit(f.gid, &f.alice, id, &f.secret, f.secret_id, "v2", 5);
        state.apply_message_edit(&v3).unwrap();
        state.apply_message_edit(&v2).unwrap();
        let entry = state.get_message(&id).unwrap();
        assert_eq!(text(&f, entry), "v3");
        assert!(entry.edited);

        let hijack = op_edit(f.gid, &f.owner, id, &f.secret, f.secret_id, "owned", 7);
        assert_eq!(
            state.apply_message_edit(&hijack).unwrap_err(),
            MessageError::NotMessageAuthor
        );
    }

    #[test]
    fn test_delete_is_permanent() {
        let f = fixture();
        let mut state = MessageState::new();
        let send = op_message(f.gid, &f.alice, &f.secret, f.secret_id, "oops", 4);
        let id = msg_id_of(&send);
        state.apply_message_send(&send).unwrap();

        state
            .apply_message_delete(&op_delete(f.gid, &f.alice, id, 5), &f.membership)
            .unwrap();
        let edit = op_edit(f.gid, &f.alice, id, &f.secret, f.secret_id, "fixed", 6);
        state.apply_message_edit(&edit).unwrap();
        state
            .apply_reaction_set(&op_react(f.gid, &f.owner, id, "👍", true, 7))
            .unwrap();

        let entry = state.get_message(&id).unwrap();
        assert!(entry.deleted);
        assert!(!entry.edited);
        assert!(entry.reactions.is_empty());
    }

    #[test]
    fn test_moderator_may_delete_others() {
        let f = fixture();
        let mut state = MessageState::new();
        let by_owner = op_message(f.gid, &f.owner, &f.secret, f.secret_id, "rules", 4);
        let by_alice = op_message(f.gid, &f.alice, &f.secret, f.secret_id, "spam", 5);
        state.apply_message_send(&by_owner).unwrap();
        state.apply_message_send(&by_alice).unwrap();

        let denied = op_delete(f.gid, &f.alice, msg_id_of(&by_owner), 6);
        assert_eq!(
            state.apply_message_delete(&denied, &f.membership).unwrap_err(),
            MessageError::DeleteNotAuthorized
        );
        let allowed = op_delete(f.gid, &f.owner, msg_id_of(&by_alice), 7);
        state.apply_message_delete(&allowed, &f.membership).unwrap();
        assert!(state.get_message(&msg_id_of(&by_alice)).unwrap().deleted);
    }

    #[test]
    fn test_reactions_lww_per_device() {
        let f = fixture();
        let mut state = MessageState::new();
        let send = op_message(f.gid, &f.owner, &f.secret, f.secret_id, "poll", 4);
        let id = msg_id_of(&send);
        state.apply_message_send(&send).unwrap();

        let off = op_react(f.gid, &f.alice, id, "🎉", false, 6);
        let on = op_react(f.gid, &f.alice, id, "🎉", true, 5);
        state.apply_reaction_set(&off).unwrap();
        state.apply_reaction_set(&on).unwrap();
        state
            .apply_reaction_set(&op_react(f.gid, &f.owner, id, "🎉", true, 7))
            .unwrap();

        let entry = state.get_message(&id).unwrap();
        assert_eq!(entry.reactions.get(&(f.alice.device(), "🎉".to_string())), Some(&false));
        assert_eq!(entry.active_reactions().get("🎉"), Some(&vec![f.owner.device()]));

        let long = op_react(f.gid, &f.alice, id, &"x".repeat(MAX_EMOJI_BYTES + 1), true, 8);
        assert!(matches!(
            state.apply_reaction_set(&long),
            Err(MessageError::InvalidEmoji { .. })
        ));
    }

    #[test]
    fn test_edit_unknown_message() {
        let f = fixture();
        let mut state = MessageState::new();
        let edit = op_edit(f.gid, &f.alice, [7; 32], &f.secret, f.secret_id, "?", 4);
        assert!(matches!(
            state.apply_message_edit(&edit),
            Err(MessageError::MessageNotFound(_))
        ));
    }
}
