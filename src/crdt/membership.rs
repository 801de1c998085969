/// Membership projection with role-based authorization.
///
/// Tracks the roster as `MemberEntry` records keyed by DeviceID. Every apply
/// function judges the op against the roster *as of the op's position* in the
/// fold, so replaying the same op set always voids the same ops.
///
/// - Removal is a tombstone. Only an invite with a strictly higher lamport
///   than the removal starts a fresh membership; an accept at or below the
///   removal lamport is void.
/// - Roles and mutes are LWW by OpID `(lamport, author, nonce)`.
/// - Any removal of a member who held the group secret sets `rekey_required`
///   on everyone left.
use std::collections::BTreeMap;
use thiserror::Error;

use crate::crdt::ids::{DeviceID, GroupID, OpID};
use crate::crdt::limits::MAX_REPORT_REASON_BYTES;
use crate::crdt::ops::{
    GroupCreatePayload, MemberAcceptPayload, MemberInvitePayload, MemberMutePayload,
    MemberRemovePayload, MemberReportPayload, OpEnvelope, OpType, RemoveReason, Role,
    RoleSetPayload,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("Group already created")]
    GroupAlreadyCreated,

    #[error("GroupCreate author is not bound to the group id")]
    CreatorNotBound,

    #[error("Invited device id does not match invited pubkey")]
    InviteeMismatch,

    #[error("Inviter role is below the invited role")]
    InsufficientRoleForInvite,

    #[error("Target is already an active member")]
    AlreadyActiveMember,

    #[error("Invite does not supersede the removal")]
    StaleInvite,

    #[error("No pending invite found for this device")]
    NoPendingInvite,

    #[error("Accept does not match a pending invite")]
    AcceptInviteMismatch,

    #[error("Accept must depend on the invite it accepts")]
    AcceptMissingDependency,

    #[error("Member already accepted")]
    AlreadyAccepted,

    #[error("Accept does not supersede the removal")]
    StaleAccept,

    #[error("Target not found in membership")]
    TargetNotFound,

    #[error("Target already removed")]
    AlreadyRemoved,

    #[error("Kicker is not an active moderator")]
    KickerNotActive,

    #[error("Insufficient role to kick target")]
    InsufficientRoleForKick,

    #[error("Leave requires author to be the target")]
    LeaveAuthorMismatch,

    #[error("Target is not an active member")]
    TargetNotActive,

    #[error("Insufficient role to change this role")]
    InsufficientRoleForRoleSet,

    #[error("Insufficient role to mute target")]
    InsufficientRoleForMute,

    #[error("Report reason too long")]
    ReportReasonTooLong,

    #[error("Cannot report yourself")]
    SelfReport,

    #[error("Payload decode error: {0}")]
    PayloadDecode(String),
}

fn decode<P: serde::de::DeserializeOwned>(op: &OpEnvelope) -> Result<P, MembershipError> {
    op.decode_payload()
        .map_err(|e| MembershipError::PayloadDecode(e.to_string()))
}

// ---------------------------------------------------------------------------
// MemberEntry
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingInvite {
    pub role: Role,
    pub inviter: DeviceID,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberEntry {
    pub device_id: DeviceID,
    pub pubkey: [u8; 32],
    /// X25519 key for secret delivery, from GroupCreate or MemberAccept.
    pub exchange_pubkey: Option<[u8; 32]>,
    pub role: Role,
    /// The invite (or GroupCreate) this membership is anchored to.
    pub invited_by: OpID,
    pub inviter: Option<DeviceID>,
    pub accepted: bool,
    /// The GroupCreate or MemberAccept that made this member active.
    pub joined_op: Option<OpID>,
    pub removed: bool,
    pub remove_op: Option<OpID>,
    pub remove_reason: Option<RemoveReason>,
    pub muted: bool,
    /// reporter -> reason
    pub reports: BTreeMap<DeviceID, String>,
    /// A member holding the secret was removed since this member joined.
    pub rekey_required: bool,
    pending_invites: BTreeMap<OpID, PendingInvite>,
    last_removal_lamport: Option<u64>,
    role_op: OpID,
    mute_op: Option<OpID>,
}

impl MemberEntry {
    fn pending(device_id: DeviceID, pubkey: [u8; 32], op: &OpEnvelope, role: Role) -> Self {
        let mut pending_invites = BTreeMap::new();
        pending_invites.insert(
            op.op_id,
            PendingInvite {
                role,
                inviter: op.author(),
            },
        );
        MemberEntry {
            device_id,
            pubkey,
            exchange_pubkey: None,
            role,
            invited_by: op.op_id,
            inviter: Some(op.author()),
            accepted: false,
            joined_op: None,
            removed: false,
            remove_op: None,
            remove_reason: None,
            muted: false,
            reports: BTreeMap::new(),
            rekey_required: false,
            pending_invites,
            last_removal_lamport: None,
            role_op: op.op_id,
            mute_op: None,
        }
    }

    /// Accepted and not removed.
    pub fn is_active(&self) -> bool {
        self.accepted && !self.removed
    }

    /// Invited, not yet accepted, not removed.
    pub fn is_pending(&self) -> bool {
        !self.accepted && !self.removed
    }

    pub fn pending_invites(&self) -> &BTreeMap<OpID, PendingInvite> {
        &self.pending_invites
    }
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// What an effective membership op changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEffect {
    Created {
        creator: DeviceID,
    },
    Invited {
        target: DeviceID,
        by: DeviceID,
        role: Role,
    },
    Joined {
        member: DeviceID,
        inviter: DeviceID,
    },
    Removed {
        target: DeviceID,
        by: DeviceID,
        reason: RemoveReason,
        /// Target was accepted, so it held the group secret.
        held_secret: bool,
    },
    RoleChanged {
        target: DeviceID,
        role: Role,
    },
    Muted {
        target: DeviceID,
        muted: bool,
    },
    Reported {
        target: DeviceID,
        by: DeviceID,
    },
}

// ---------------------------------------------------------------------------
// MembershipState
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct MembershipState {
    members: BTreeMap<DeviceID, MemberEntry>,
    created: Option<OpID>,
}

impl MembershipState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_created(&self) -> bool {
        self.created.is_some()
    }

    /// The effective GroupCreate.
    pub fn create_op(&self) -> Option<OpID> {
        self.created
    }

    pub fn members(&self) -> &BTreeMap<DeviceID, MemberEntry> {
        &self.members
    }

    pub fn get(&self, device_id: &DeviceID) -> Option<&MemberEntry> {
        self.members.get(device_id)
    }

    pub fn get_active_member(&self, device_id: &DeviceID) -> Option<&MemberEntry> {
        self.members.get(device_id).filter(|m| m.is_active())
    }

    pub fn is_active(&self, device_id: &DeviceID) -> bool {
        self.get_active_member(device_id).is_some()
    }

    pub fn active_members(&self) -> impl Iterator<Item = &MemberEntry> {
        self.members.values().filter(|m| m.is_active())
    }

    pub fn active_member_count(&self) -> usize {
        self.active_members().count()
    }

    pub fn needs_rekey(&self) -> bool {
        self.active_members().any(|m| m.rekey_required)
    }

    /// Deterministic coordinator for secret work nobody else owns: the most
    /// privileged active moderator, lowest DeviceID among equals. Falls back
    /// to the lowest active DeviceID when no moderator is left.
    pub fn secret_coordinator(&self) -> Option<DeviceID> {
        self.coordinator_among(|_| true)
    }

    /// The coordinator once `leaving` is gone.
    pub fn successor_coordinator(&self, leaving: &DeviceID) -> Option<DeviceID> {
        self.coordinator_among(|m| m.device_id != *leaving)
    }

    fn coordinator_among(&self, keep: impl Fn(&MemberEntry) -> bool) -> Option<DeviceID> {
        let candidates: Vec<&MemberEntry> = self.active_members().filter(|m| keep(*m)).collect();
        candidates
            .iter()
            .filter(|m| m.role.is_moderator())
            .min_by_key(|m| (m.role, m.device_id))
            .or_else(|| candidates.iter().min_by_key(|m| m.device_id))
            .map(|m| m.device_id)
    }

    /// Coarse per-type gate. The apply functions check target-specific rules.
    pub fn can_author_op(&self, device_id: &DeviceID, op_type: &OpType) -> bool {
        let Some(member) = self.members.get(device_id) else {
            return false;
        };
        if member.removed {
            return false;
        }
        if !member.accepted {
            // a pending invitee may accept or decline
            return matches!(op_type, OpType::MemberAccept | OpType::MemberRemove);
        }
        match op_type {
            OpType::GroupCreate => false,
            OpType::MemberInvite | OpType::RoleSet | OpType::MemberMute | OpType::MetadataSet => {
                member.role.is_moderator()
            }
            _ => true,
        }
    }

    // -----------------------------------------------------------------------
    // Apply functions
    // -----------------------------------------------------------------------

    pub fn apply_group_create(
        &mut self,
        op: &OpEnvelope,
        group_id: &GroupID,
    ) -> Result<Option<MembershipEffect>, MembershipError> {
        if self.created.is_some() {
            return Err(MembershipError::GroupAlreadyCreated);
        }
        let payload: GroupCreatePayload = decode(op)?;
        let creator = op.author();
        if !group_id.is_bound_to(&creator, &payload.salt) {
            return Err(MembershipError::CreatorNotBound);
        }

        let mut entry = MemberEntry::pending(creator, op.author_pubkey, op, Role::Owner);
        entry.pending_invites.clear();
        entry.inviter = None;
        entry.accepted = true;
        entry.joined_op = Some(op.op_id);
        entry.exchange_pubkey = Some(payload.creator_exchange_pubkey);

        self.members.insert(creator, entry);
        self.created = Some(op.op_id);
        Ok(Some(MembershipEffect::Created { creator }))
    }

    pub fn apply_member_invite(
        &mut self,
        op: &OpEnvelope,
    ) -> Result<Option<MembershipEffect>, MembershipError> {
        let payload: MemberInvitePayload = decode(op)?;
        if DeviceID::from_pubkey(&payload.invited_pubkey) != payload.invited_device_id {
            return Err(MembershipError::InviteeMismatch);
        }
        let author = op.author();
        let inviter_role = self
            .get_active_member(&author)
            .map(|m| m.role)
            .ok_or(MembershipError::TargetNotActive)?;
        if !inviter_role.is_moderator() || !inviter_role.at_least(payload.role) {
            return Err(MembershipError::InsufficientRoleForInvite);
        }

        let target = payload.invited_device_id;
        let effect = Some(MembershipEffect::Invited {
            target,
            by: author,
            role: payload.role,
        });

        match self.members.get_mut(&target) {
            None => {
                let entry = MemberEntry::pending(target, payload.invited_pubkey, op, payload.role);
                self.members.insert(target, entry);
                Ok(effect)
            }
            Some(existing) if existing.removed => {
                let removal = existing.last_removal_lamport.unwrap_or(0);
                if op.lamport <= removal {
                    return Err(MembershipError::StaleInvite);
                }
                let mut fresh = MemberEntry::pending(target, payload.invited_pubkey, op, payload.role);
                fresh.last_removal_lamport = existing.last_removal_lamport;
                *existing = fresh;
                Ok(effect)
            }
            Some(existing) if existing.accepted => Err(MembershipError::AlreadyActiveMember),
            Some(existing) => {
                existing.pending_invites.insert(
                    op.op_id,
                    PendingInvite {
                        role: payload.role,
                        inviter: author,
                    },
                );
                Ok(effect)
            }
        }
    }

    pub fn apply_member_accept(
        &mut self,
        op: &OpEnvelope,
    ) -> Result<Option<MembershipEffect>, MembershipError> {
        let payload: MemberAcceptPayload = decode(op)?;
        if !op.deps.contains(&payload.invite_op_id) {
            return Err(MembershipError::AcceptMissingDependency);
        }
        let author = op.author();
        let entry = self
            .members
            .get_mut(&author)
            .ok_or(MembershipError::NoPendingInvite)?;
        if entry.removed {
            return Err(MembershipError::AlreadyRemoved);
        }
        if entry.accepted {
            return Err(MembershipError::AlreadyAccepted);
        }
        if entry.last_removal_lamport.is_some_and(|l| op.lamport <= l) {
            return Err(MembershipError::StaleAccept);
        }
        let invite = *entry
            .pending_invites
            .get(&payload.invite_op_id)
            .ok_or(MembershipError::AcceptInviteMismatch)?;

        entry.accepted = true;
        entry.joined_op = Some(op.op_id);
        entry.invited_by = payload.invite_op_id;
        entry.inviter = Some(invite.inviter);
        entry.role = invite.role;
        entry.role_op = payload.invite_op_id;
        entry.exchange_pubkey = Some(payload.exchange_pubkey);
        entry.pending_invites.clear();

        Ok(Some(MembershipEffect::Joined {
            member: author,
            inviter: invite.inviter,
        }))
    }

    pub fn apply_member_remove(
        &mut self,
        op: &OpEnvelope,
    ) -> Result<Option<MembershipEffect>, MembershipError> {
        let payload: MemberRemovePayload = decode(op)?;
        let author = op.author();
        let target = payload.target_device_id;

        let target_entry = self
            .members
            .get(&target)
            .ok_or(MembershipError::TargetNotFound)?;
        if target_entry.removed {
            return Err(MembershipError::AlreadyRemoved);
        }

        match payload.reason {
            RemoveReason::Leave => {
                if author != target {
                    return Err(MembershipError::LeaveAuthorMismatch);
                }
            }
            RemoveReason::Kick => {
                let kicker = self
                    .get_active_member(&author)
                    .filter(|m| m.role.is_moderator())
                    .ok_or(MembershipError::KickerNotActive)?;
                if !kicker.role.at_least(target_entry.role) {
                    return Err(MembershipError::InsufficientRoleForKick);
                }
            }
        }

        let held_secret = target_entry.accepted;
        if let Some(entry) = self.members.get_mut(&target) {
            entry.removed = true;
            entry.remove_op = Some(op.op_id);
            entry.remove_reason = Some(payload.reason);
            entry.last_removal_lamport = Some(op.lamport);
            entry.pending_invites.clear();
        }
        if held_secret {
            for member in self.members.values_mut().filter(|m| m.is_active()) {
                member.rekey_required = true;
            }
        }

        Ok(Some(MembershipEffect::Removed {
            target,
            by: author,
            reason: payload.reason,
            held_secret,
        }))
    }

    pub fn apply_role_set(
        &mut self,
        op: &OpEnvelope,
    ) -> Result<Option<MembershipEffect>, MembershipError> {
        let payload: RoleSetPayload = decode(op)?;
        let author_role = self
            .get_active_member(&op.author())
            .map(|m| m.role)
            .ok_or(MembershipError::InsufficientRoleForRoleSet)?;
        let target = self
            .members
            .get_mut(&payload.target_device_id)
            .filter(|m| m.is_active())
            .ok_or(MembershipError::TargetNotActive)?;

        if !author_role.at_least(payload.new_role) || !author_role.at_least(target.role) {
            return Err(MembershipError::InsufficientRoleForRoleSet);
        }
        if op.op_id <= target.role_op {
            return Ok(None);
        }
        target.role = payload.new_role;
        target.role_op = op.op_id;

        Ok(Some(MembershipEffect::RoleChanged {
            target: payload.target_device_id,
            role: payload.new_role,
        }))
    }

    pub fn apply_member_mute(
        &mut self,
        op: &OpEnvelope,
    ) -> Result<Option<MembershipEffect>, MembershipError> {
        let payload: MemberMutePayload = decode(op)?;
        let author_role = self
            .get_active_member(&op.author())
            .map(|m| m.role)
            .ok_or(MembershipError::InsufficientRoleForMute)?;
        let target = self
            .members
            .get_mut(&payload.target_device_id)
            .filter(|m| m.is_active())
            .ok_or(MembershipError::TargetNotActive)?;

        if !author_role.at_least(target.role) {
            return Err(MembershipError::InsufficientRoleForMute);
        }
        if target.mute_op.is_some_and(|prev| op.op_id <= prev) {
            return Ok(None);
        }
        target.muted = payload.muted;
        target.mute_op = Some(op.op_id);

        Ok(Some(MembershipEffect::Muted {
            target: payload.target_device_id,
            muted: payload.muted,
        }))
    }

    pub fn apply_member_report(
        &mut self,
        op: &OpEnvelope,
    ) -> Result<Option<MembershipEffect>, MembershipError> {
        let payload: MemberReportPayload = decode(op)?;
        let author = op.author();
        if payload.reason.len() > MAX_REPORT_REASON_BYTES {
            return Err(MembershipError::ReportReasonTooLong);
        }
        if payload.target_device_id == author {
            return Err(MembershipError::SelfReport);
        }
        let target = self
            .members
            .get_mut(&payload.target_device_id)
            .filter(|m| !m.removed)
            .ok_or(MembershipError::TargetNotFound)?;
        target.reports.insert(author, payload.reason);

        Ok(Some(MembershipEffect::Reported {
            target: payload.target_device_id,
            by: author,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::testkit::*;

    /// Apply through the same dispatch the fold uses, minus the bookkeeping.
    fn apply(
        state: &mut MembershipState,
        gid: &GroupID,
        op: &OpEnvelope,
    ) -> Result<Option<MembershipEffect>, MembershipError> {
        if op.op_type != OpType::GroupCreate && !state.can_author_op(&op.author(), &op.op_type) {
            return Err(MembershipError::TargetNotActive);
        }
        match op.op_type {
            OpType::GroupCreate => state.apply_group_create(op, gid),
            OpType::MemberInvite => state.apply_member_invite(op),
            OpType::MemberAccept => state.apply_member_accept(op),
            OpType::MemberRemove => state.apply_member_remove(op),
            OpType::RoleSet => state.apply_role_set(op),
            OpType::MemberMute => state.apply_member_mute(op),
            OpType::MemberReport => state.apply_member_report(op),
            other => panic!("not a membership op: {:?}", other),
        }
    }

    fn with_member(role: Role) -> (MembershipState, GroupID, TestDevice, TestDevice) {
        let owner = TestDevice::new();
        let alice = TestDevice::new();
        let (gid, create) = op_create(&owner);
        let invite = op_invite(gid, &owner, &alice, role, 2);
        let accept = op_accept(gid, &alice, &invite, 3);

        let mut state = MembershipState::new();
        for op in [&create, &invite, &accept] {
            apply(&mut state, &gid, op).unwrap();
        }
        (state, gid, owner, alice)
    }

    #[test]
    fn test_create_group() {
        let owner = TestDevice::new();
        let (gid, create) = op_create(&owner);
        let mut state = MembershipState::new();

        let effect = apply(&mut state, &gid, &create).unwrap();
        assert_eq!(
            effect,
            Some(MembershipEffect::Created {
                creator: owner.device()
            })
        );
        let entry = state.get_active_member(&owner.device()).unwrap();
        assert_eq!(entry.role, Role::Owner);
        assert_eq!(entry.exchange_pubkey, Some(owner.exchange_public()));
        assert_eq!(state.create_op(), Some(create.op_id));
    }

    #[test]
    fn test_second_create_void() {
        let owner = TestDevice::new();
        let (gid, create) = op_create(&owner);
        let mut state = MembershipState::new();
        apply(&mut state, &gid, &create).unwrap();

        let again = op_create_for(gid, &owner, [0xAB; 32], 5);
        assert_eq!(
            state.apply_group_create(&again, &gid).unwrap_err(),
            MembershipError::GroupAlreadyCreated
        );
    }

    #[test]
    fn test_create_by_unbound_author_void() {
        let owner = TestDevice::new();
        let mallory = TestDevice::new();
        let (gid, _) = op_create(&owner);
        let forged = op_create_for(gid, &mallory, [0xAA; 32], 1);

        let mut state = MembershipState::new();
        assert_eq!(
            state.apply_group_create(&forged, &gid).unwrap_err(),
            MembershipError::CreatorNotBound
        );
        assert!(!state.is_created());
    }

    #[test]
    fn test_full_lifecycle_create_invite_accept() {
        let (state, _, owner, alice) = with_member(Role::Member);
        let a = state.get_active_member(&alice.device()).unwrap();
        assert_eq!(a.role, Role::Member);
        assert_eq!(a.inviter, Some(owner.device()));
        assert_eq!(a.exchange_pubkey, Some(alice.exchange_public()));
        assert_eq!(state.active_member_count(), 2);
    }

    #[test]
    fn test_joined_op_tracks_latest_accept() {
        let owner = TestDevice::new();
        let alice = TestDevice::new();
        let (gid, create) = op_create(&owner);
        let invite = op_invite(gid, &owner, &alice, Role::Member, 2);
        let accept = op_accept(gid, &alice, &invite, 3);
        let kick = op_remove(gid, &owner, &alice, RemoveReason::Kick, 4);
        let reinvite = op_invite(gid, &owner, &alice, Role::Member, 5);
        let reaccept = op_accept(gid, &alice, &reinvite, 6);

        let mut state = MembershipState::new();
        for op in [&create, &invite, &accept] {
            apply(&mut state, &gid, op).unwrap();
        }
        assert_eq!(state.get(&owner.device()).unwrap().joined_op, Some(create.op_id));
        assert_eq!(state.get(&alice.device()).unwrap().joined_op, Some(accept.op_id));

        apply(&mut state, &gid, &kick).unwrap();
        apply(&mut state, &gid, &reinvite).unwrap();
        assert_eq!(state.get(&alice.device()).unwrap().joined_op, None);
        apply(&mut state, &gid, &reaccept).unwrap();
        assert_eq!(state.get(&alice.device()).unwrap().joined_op, Some(reaccept.op_id));
    }

    #[test]
    fn test_member_cannot_invite() {
        let (state, _, _, alice) = with_member(Role::Member);
        assert!(!state.can_author_op(&alice.device(), &OpType::MemberInvite));
        assert!(state.can_author_op(&alice.device(), &OpType::MessageSend));
        assert!(state.can_author_op(&alice.device(), &OpType::MemberReport));
    }

    #[test]
    fn test_admin_cannot_invite_owner() {
        let (mut state, gid, _, admin) = with_member(Role::Admin);
        let bob = TestDevice::new();
        let invite = op_invite(gid, &admin, &bob, Role::Owner, 4);
        assert_eq!(
            apply(&mut state, &gid, &invite).unwrap_err(),
            MembershipError::InsufficientRoleForInvite
        );
        let invite = op_invite(gid, &admin, &bob, Role::Admin, 5);
        assert!(apply(&mut state, &gid, &invite).is_ok());
    }

    #[test]
    fn test_invite_mismatched_device_void() {
        let (mut state, gid, owner, _) = with_member(Role::Member);
        let bob = TestDevice::new();
        let carol = TestDevice::new();
        let bad = op_invite_raw(gid, &owner, carol.device(), bob.public(), Role::Member, 4);
        assert_eq!(
            apply(&mut state, &gid, &bad).unwrap_err(),
            MembershipError::InviteeMismatch
        );
    }

    #[test]
    fn test_invite_already_active_rejected() {
        let (mut state, gid, owner, alice) = with_member(Role::Member);
        let again = op_invite(gid, &owner, &alice, Role::Member, 4);
        assert_eq!(
            apply(&mut state, &gid, &again).unwrap_err(),
            MembershipError::AlreadyActiveMember
        );
    }

    #[test]
    fn test_second_invite_recorded_while_pending() {
        let owner = TestDevice::new();
        let admin = TestDevice::new();
        let bob = TestDevice::new();
        let (gid, create) = op_create(&owner);
        let inv_admin = op_invite(gid, &owner, &admin, Role::Admin, 2);
        let acc_admin = op_accept(gid, &admin, &inv_admin, 3);
        let inv1 = op_invite(gid, &owner, &bob, Role::Member, 4);
        let inv2 = op_invite(gid, &admin, &bob, Role::Admin, 5);

        let mut state = MembershipState::new();
        for op in [&create, &inv_admin, &acc_admin, &inv1, &inv2] {
            apply(&mut state, &gid, op).unwrap();
        }
        assert_eq!(state.get(&bob.device()).unwrap().pending_invites().len(), 2);

        // accepting the second invite takes its role and inviter
        let accept = op_accept(gid, &bob, &inv2, 6);
        apply(&mut state, &gid, &accept).unwrap();
        let b = state.get_active_member(&bob.device()).unwrap();
        assert_eq!(b.role, Role::Admin);
        assert_eq!(b.inviter, Some(admin.device()));
        assert_eq!(b.invited_by, inv2.op_id);
    }

    #[test]
    fn test_accept_wrong_invite_rejected() {
        let owner = TestDevice::new();
        let bob = TestDevice::new();
        let (gid, create) = op_create(&owner);
        let invite = op_invite(gid, &owner, &bob, Role::Member, 2);
        let other = op_invite(gid, &owner, &TestDevice::new(), Role::Member, 3);

        let mut state = MembershipState::new();
        apply(&mut state, &gid, &create).unwrap();
        apply(&mut state, &gid, &invite).unwrap();
        apply(&mut state, &gid, &other).unwrap();

        let accept = op_accept(gid, &bob, &other, 4);
        assert_eq!(
            apply(&mut state, &gid, &accept).unwrap_err(),
            MembershipError::AcceptInviteMismatch
        );
    }

    #[test]
    fn test_accept_without_dependency_rejected() {
        let owner = TestDevice::new();
        let bob = TestDevice::new();
        let (gid, create) = op_create(&owner);
        let invite = op_invite(gid, &owner, &bob, Role::Member, 2);
        let accept = op_accept_nodeps(gid, &bob, invite.op_id, 3);

        let mut state = MembershipState::new();
        apply(&mut state, &gid, &create).unwrap();
        apply(&mut state, &gid, &invite).unwrap();
        assert_eq!(
            apply(&mut state, &gid, &accept).unwrap_err(),
            MembershipError::AcceptMissingDependency
        );
    }

    #[test]
    fn test_double_accept_rejected() {
        let (mut state, gid, owner, alice) = with_member(Role::Member);
        let invite = op_invite(gid, &owner, &TestDevice::new(), Role::Member, 4);
        apply(&mut state, &gid, &invite).unwrap();
        let again = op_accept(gid, &alice, &invite, 5);
        assert_eq!(
            apply(&mut state, &gid, &again).unwrap_err(),
            MembershipError::AlreadyAccepted
        );
    }

    #[test]
    fn test_kick_sets_removed_and_rekey_required() {
        let (mut state, gid, owner, alice) = with_member(Role::Member);
        let kick = op_remove(gid, &owner, &alice, RemoveReason::Kick, 4);

        let effect = apply(&mut state, &gid, &kick).unwrap();
        assert_eq!(
            effect,
            Some(MembershipEffect::Removed {
                target: alice.device(),
                by: owner.device(),
                reason: RemoveReason::Kick,
                held_secret: true,
            })
        );
        let a = state.get(&alice.device()).unwrap();
        assert!(a.removed);
        assert_eq!(a.remove_reason, Some(RemoveReason::Kick));
        assert_eq!(a.remove_op, Some(kick.op_id));
        assert!(state.get(&owner.device()).unwrap().rekey_required);
        assert!(state.needs_rekey());
    }

    #[test]
    fn test_leave_also_requires_rekey() {
        let (mut state, gid, _, alice) = with_member(Role::Member);
        let leave = op_remove(gid, &alice, &alice, RemoveReason::Leave, 4);
        apply(&mut state, &gid, &leave).unwrap();
        assert!(!state.is_active(&alice.device()));
        assert!(state.needs_rekey());
    }

    #[test]
    fn test_pending_invitee_can_decline() {
        let owner = TestDevice::new();
        let bob = TestDevice::new();
        let (gid, create) = op_create(&owner);
        let invite = op_invite(gid, &owner, &bob, Role::Member, 2);
        let decline = op_remove(gid, &bob, &bob, RemoveReason::Leave, 3);

        let mut state = MembershipState::new();
        for op in [&create, &invite] {
            apply(&mut state, &gid, op).unwrap();
        }
        let effect = apply(&mut state, &gid, &decline).unwrap();
        assert!(matches!(
            effect,
            Some(MembershipEffect::Removed {
                held_secret: false,
                ..
            })
        ));
        // never held the secret, so nobody needs a new one
        assert!(!state.needs_rekey());
    }

    #[test]
    fn test_leave_wrong_author_rejected() {
        let (mut state, gid, owner, alice) = with_member(Role::Member);
        let bad = op_remove(gid, &owner, &alice, RemoveReason::Leave, 4);
        assert_eq!(
            apply(&mut state, &gid, &bad).unwrap_err(),
            MembershipError::LeaveAuthorMismatch
        );
    }

    #[test]
    fn test_admin_cannot_kick_owner() {
        let (mut state, gid, owner, admin) = with_member(Role::Admin);
        let kick = op_remove(gid, &admin, &owner, RemoveReason::Kick, 4);
        assert_eq!(
            apply(&mut state, &gid, &kick).unwrap_err(),
            MembershipError::InsufficientRoleForKick
        );
    }

    #[test]
    fn test_member_cannot_kick() {
        let (mut state, gid, owner, alice) = with_member(Role::Member);
        let kick = op_remove(gid, &alice, &owner, RemoveReason::Kick, 4);
        assert_eq!(
            apply(&mut state, &gid, &kick).unwrap_err(),
            MembershipError::KickerNotActive
        );
    }

    #[test]
    fn test_double_remove_rejected() {
        let (mut state, gid, owner, alice) = with_member(Role::Member);
        apply(&mut state, &gid, &op_remove(gid, &owner, &alice, RemoveReason::Kick, 4)).unwrap();
        assert_eq!(
            apply(&mut state, &gid, &op_remove(gid, &owner, &alice, RemoveReason::Kick, 5))
                .unwrap_err(),
            MembershipError::AlreadyRemoved
        );
    }

    #[test]
    fn test_reinvite_after_kick_with_higher_lamport() {
        let (mut state, gid, owner, alice) = with_member(Role::Member);
        apply(&mut state, &gid, &op_remove(gid, &owner, &alice, RemoveReason::Kick, 4)).unwrap();

        let reinvite = op_invite(gid, &owner, &alice, Role::Member, 5);
        apply(&mut state, &gid, &reinvite).unwrap();
        assert!(state.get(&alice.device()).unwrap().is_pending());

        let accept = op_accept(gid, &alice, &reinvite, 6);
        apply(&mut state, &gid, &accept).unwrap();
        assert!(state.is_active(&alice.device()));
    }

    #[test]
    fn test_stale_invite_cannot_resurrect() {
        let (mut state, gid, owner, alice) = with_member(Role::Member);
        apply(&mut state, &gid, &op_remove(gid, &owner, &alice, RemoveReason::Kick, 7)).unwrap();

        let stale = op_invite(gid, &owner, &alice, Role::Member, 7);
        assert_eq!(
            apply(&mut state, &gid, &stale).unwrap_err(),
            MembershipError::StaleInvite
        );
        assert!(state.get(&alice.device()).unwrap().removed);
    }

    #[test]
    fn test_role_set_rules() {
        let (mut state, gid, owner, admin) = with_member(Role::Admin);
        let bob = TestDevice::new();
        let invite = op_invite(gid, &owner, &bob, Role::Member, 4);
        let accept = op_accept(gid, &bob, &invite, 5);
        apply(&mut state, &gid, &invite).unwrap();
        apply(&mut state, &gid, &accept).unwrap();

        // admin may promote a member to admin but not to owner
        let to_owner = op_role(gid, &admin, &bob, Role::Owner, 6);
        assert_eq!(
            apply(&mut state, &gid, &to_owner).unwrap_err(),
            MembershipError::InsufficientRoleForRoleSet
        );
        let to_admin = op_role(gid, &admin, &bob, Role::Admin, 7);
        apply(&mut state, &gid, &to_admin).unwrap();
        assert_eq!(state.get(&bob.device()).unwrap().role, Role::Admin);

        // admin may not demote the owner
        let demote = op_role(gid, &admin, &owner, Role::Member, 8);
        assert_eq!(
            apply(&mut state, &gid, &demote).unwrap_err(),
            MembershipError::InsufficientRoleForRoleSet
        );
    }

    #[test]
    fn test_role_set_on_pending_rejected() {
        let (mut state, gid, owner, _) = with_member(Role::Member);
        let bob = TestDevice::new();
        apply(&mut state, &gid, &op_invite(gid, &owner, &bob, Role::Member, 4)).unwrap();
        assert_eq!(
            apply(&mut state, &gid, &op_role(gid, &owner, &bob, Role::Admin, 5)).unwrap_err(),
            MembershipError::TargetNotActive
        );
    }

    #[test]
    fn test_role_set_lww_ignores_older() {
        let (mut state, gid, owner, alice) = with_member(Role::Member);
        let newer = op_role(gid, &owner, &alice, Role::Admin, 10);
        let older = op_role(gid, &owner, &alice, Role::Member, 9);
        apply(&mut state, &gid, &newer).unwrap();
        assert_eq!(apply(&mut state, &gid, &older).unwrap(), None);
        assert_eq!(state.get(&alice.device()).unwrap().role, Role::Admin);
    }

    #[test]
    fn test_mute_and_report() {
        let (mut state, gid, owner, alice) = with_member(Role::Member);
        apply(&mut state, &gid, &op_mute(gid, &owner, &alice, true, 4)).unwrap();
        assert!(state.get(&alice.device()).unwrap().muted);

        // member cannot mute
        assert!(!state.can_author_op(&alice.device(), &OpType::MemberMute));

        apply(&mut state, &gid, &op_report(gid, &alice, &owner, "spam", 5)).unwrap();
        assert_eq!(
            state.get(&owner.device()).unwrap().reports.get(&alice.device()),
            Some(&"spam".to_string())
        );

        let selfie = op_report(gid, &alice, &alice, "me", 6);
        assert_eq!(
            apply(&mut state, &gid, &selfie).unwrap_err(),
            MembershipError::SelfReport
        );
        let long = op_report(gid, &alice, &owner, &"x".repeat(MAX_REPORT_REASON_BYTES + 1), 7);
        assert_eq!(
            apply(&mut state, &gid, &long).unwrap_err(),
            MembershipError::ReportReasonTooLong
        );
    }

    #[test]
    fn test_non_member_can_only_accept_or_decline() {
        let owner = TestDevice::new();
        let bob = TestDevice::new();
        let (gid, create) = op_create(&owner);
        let mut state = MembershipState::new();
        apply(&mut state, &gid, &create).unwrap();

        assert!(!state.can_author_op(&bob.device(), &OpType::MemberAccept));
        apply(&mut state, &gid, &op_invite(gid, &owner, &bob, Role::Member, 2)).unwrap();
        assert!(state.can_author_op(&bob.device(), &OpType::MemberAccept));
        assert!(state.can_author_op(&bob.device(), &OpType::MemberRemove));
        assert!(!state.can_author_op(&bob.device(), &OpType::MessageSend));
    }

    #[test]
    fn test_secret_coordinator() {
        let (mut state, gid, owner, alice) = with_member(Role::Member);
        assert_eq!(state.secret_coordinator(), Some(owner.device()));
        assert_eq!(state.successor_coordinator(&owner.device()), Some(alice.device()));
        assert_eq!(state.successor_coordinator(&alice.device()), Some(owner.device()));

        apply(&mut state, &gid, &op_remove(gid, &owner, &owner, RemoveReason::Leave, 4)).unwrap();
        // no moderator left: lowest active id
        assert_eq!(state.secret_coordinator(), Some(alice.device()));
    }
}
