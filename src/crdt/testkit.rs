//! Op builders shared by the projection tests.

use crate::crdt::ids::{DeviceID, GroupID, OpID};
use crate::crdt::ops::*;
use crate::crdt::secrets::{seal_content, GroupSecret};
use crate::crypto::key_exchange::generate_static_keypair;
use crate::crypto::signing::SigningKeyPair;

pub(crate) struct TestDevice {
    pub keys: SigningKeyPair,
    pub exchange_private: [u8; 32],
    exchange_public: [u8; 32],
}

impl TestDevice {
    pub fn new() -> Self {
        let (exchange_public, exchange_private) = generate_static_keypair();
        TestDevice {
            keys: SigningKeyPair::generate(),
            exchange_private,
            exchange_public,
        }
    }

    pub fn device(&self) -> DeviceID {
        DeviceID::from_pubkey(&self.keys.public())
    }

    pub fn public(&self) -> [u8; 32] {
        self.keys.public()
    }

    pub fn exchange_public(&self) -> [u8; 32] {
        self.exchange_public
    }
}

fn signed<P: serde::Serialize>(
    gid: GroupID,
    by: &TestDevice,
    op_type: OpType,
    payload: &P,
    deps: Vec<OpID>,
    lamport: u64,
    nonce: u64,
) -> OpEnvelope {
    OpEnvelope::create_signed(gid, op_type, payload, deps, lamport, nonce, &by.keys).unwrap()
}

/// New group owned by `owner`, GroupCreate at lamport 1.
pub(crate) fn op_create(owner: &TestDevice) -> (GroupID, OpEnvelope) {
    let (gid, salt) = GroupID::generate(&owner.device());
    (gid, op_create_for(gid, owner, salt, 1))
}

pub(crate) fn op_create_for(gid: GroupID, by: &TestDevice, salt: [u8; 32], lamport: u64) -> OpEnvelope {
    let payload = GroupCreatePayload {
        salt,
        creator_exchange_pubkey: by.exchange_public(),
    };
    signed(gid, by, OpType::GroupCreate, &payload, vec![], lamport, rand::random())
}

pub(crate) fn op_invite(gid: GroupID, by: &TestDevice, target: &TestDevice, role: Role, lamport: u64) -> OpEnvelope {
    op_invite_raw(gid, by, target.device(), target.public(), role, lamport)
}

pub(crate) fn op_invite_raw(
    gid: GroupID,
    by: &TestDevice,
    invited_device_id: DeviceID,
    invited_pubkey: [u8; 32],
    role: Role,
    lamport: u64,
) -> OpEnvelope {
    let payload = MemberInvitePayload {
        invited_device_id,
        invited_pubkey,
        role,
    };
    signed(gid, by, OpType::MemberInvite, &payload, vec![], lamport, rand::random())
}

pub(crate) fn op_accept(gid: GroupID, who: &TestDevice, invite: &OpEnvelope, lamport: u64) -> OpEnvelope {
    let payload = MemberAcceptPayload {
        invite_op_id: invite.op_id,
        exchange_pubkey: who.exchange_public(),
    };
    signed(gid, who, OpType::MemberAccept, &payload, vec![invite.op_id], lamport, rand::random())
}

pub(crate) fn op_accept_nodeps(gid: GroupID, who: &TestDevice, invite_op_id: OpID, lamport: u64) -> OpEnvelope {
    let payload = MemberAcceptPayload {
        invite_op_id,
        exchange_pubkey: who.exchange_public(),
    };
    signed(gid, who, OpType::MemberAccept, &payload, vec![], lamport, rand::random())
}

pub(crate) fn op_remove(
    gid: GroupID,
    by: &TestDevice,
    target: &TestDevice,
    reason: RemoveReason,
    lamport: u64,
) -> OpEnvelope {
    let payload = MemberRemovePayload {
        target_device_id: target.device(),
        reason,
        coordinator: None,
    };
    signed(gid, by, OpType::MemberRemove, &payload, vec![], lamport, rand::random())
}

/// A Leave that names who rotates the secret.
pub(crate) fn op_leave_to(gid: GroupID, by: &TestDevice, coordinator: &TestDevice, lamport: u64) -> OpEnvelope {
    let payload = MemberRemovePayload {
        target_device_id: by.device(),
        reason: RemoveReason::Leave,
        coordinator: Some(coordinator.device()),
    };
    signed(gid, by, OpType::MemberRemove, &payload, vec![], lamport, rand::random())
}

pub(crate) fn op_role(gid: GroupID, by: &TestDevice, target: &TestDevice, role: Role, lamport: u64) -> OpEnvelope {
    let payload = RoleSetPayload {
        target_device_id: target.device(),
        new_role: role,
    };
    signed(gid, by, OpType::RoleSet, &payload, vec![], lamport, rand::random())
}

pub(crate) fn op_mute(gid: GroupID, by: &TestDevice, target: &TestDevice, muted: bool, lamport: u64) -> OpEnvelope {
    let payload = MemberMutePayload {
        target_device_id: target.device(),
        muted,
    };
    signed(gid, by, OpType::MemberMute, &payload, vec![], lamport, rand::random())
}

pub(crate) fn op_report(gid: GroupID, by: &TestDevice, target: &TestDevice, reason: &str, lamport: u64) -> OpEnvelope {
    let payload = MemberReportPayload {
        target_device_id: target.device(),
        reason: reason.to_string(),
    };
    signed(gid, by, OpType::MemberReport, &payload, vec![], lamport, rand::random())
}

/// MessageSend sealed under `secret`.
pub(crate) fn op_message(
    gid: GroupID,
    by: &TestDevice,
    secret: &GroupSecret,
    secret_id: OpID,
    text: &str,
    lamport: u64,
) -> OpEnvelope {
    let nonce: u64 = rand::random();
    let payload = MessageSendPayload {
        msg_id: generate_msg_id(&by.device(), lamport, nonce),
        content: seal_content(secret, secret_id, &gid, text.as_bytes()).unwrap(),
    };
    signed(gid, by, OpType::MessageSend, &payload, vec![], lamport, nonce)
}

pub(crate) fn op_edit(
    gid: GroupID,
    by: &TestDevice,
    msg_id: [u8; 32],
    secret: &GroupSecret,
    secret_id: OpID,
    text: &str,
    lamport: u64,
) -> OpEnvelope {
    let payload = MessageEditPayload {
        msg_id,
        content: seal_content(secret, secret_id, &gid, text.as_bytes()).unwrap(),
    };
    signed(gid, by, OpType::MessageEdit, &payload, vec![], lamport, rand::random())
}

pub(crate) fn op_delete(gid: GroupID, by: &TestDevice, msg_id: [u8; 32], lamport: u64) -> OpEnvelope {
    signed(
        gid,
        by,
        OpType::MessageDelete,
        &MessageDeletePayload { msg_id },
        vec![],
        lamport,
        rand::random(),
    )
}

pub(crate) fn op_react(
    gid: GroupID,
    by: &TestDevice,
    msg_id: [u8; 32],
    emoji: &str,
    present: bool,
    lamport: u64,
) -> OpEnvelope {
    let payload = ReactionSetPayload {
        msg_id,
        emoji: emoji.to_string(),
        present,
    };
    signed(gid, by, OpType::ReactionSet, &payload, vec![], lamport, rand::random())
}

pub(crate) fn op_metadata(
    gid: GroupID,
    by: &TestDevice,
    key: MetadataKey,
    secret: &GroupSecret,
    secret_id: OpID,
    value: &[u8],
    lamport: u64,
) -> OpEnvelope {
    let payload = MetadataSetPayload {
        key,
        value: seal_content(secret, secret_id, &gid, value).unwrap(),
    };
    signed(gid, by, OpType::MetadataSet, &payload, vec![], lamport, rand::random())
}

pub(crate) fn msg_id_of(op: &OpEnvelope) -> [u8; 32] {
    op.decode_payload::<MessageSendPayload>().unwrap().msg_id
}
