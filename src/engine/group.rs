/// The synchronous core of one group.
///
/// `GroupEngine` owns the op store, the causal clock and the projection.
/// Every call returns `Effects`: frames to send and events to publish. It
/// never does I/O itself; the actor hands the effects to the dispatcher.
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use zeroize::Zeroizing;

use crate::config::EngineConfig;
use crate::crdt::apply::{ApplyError, ApplyOutcome, GroupState, SecretDuty};
use crate::crdt::clock::CausalClock;
use crate::crdt::conversation::{self, ConversationEntry, MetadataValue};
use crate::crdt::ids::{DeviceID, GroupID, OpID};
use crate::crdt::limits::{OpLimitStatus, MAX_EMOJI_BYTES, MAX_FETCH_IDS, MAX_REPORT_REASON_BYTES};
use crate::crdt::membership::{MemberEntry, MembershipError};
use crate::crdt::messages::{MessageEntry, MessageError};
use crate::crdt::ops::{
    create_operation, generate_msg_id, GroupCreatePayload, MemberAcceptPayload,
    MemberInvitePayload, MemberMutePayload, MemberRemovePayload, MemberReportPayload,
    MessageDeletePayload, MessageEditPayload, MessageSendPayload, MetadataKey,
    MetadataSetPayload, OpEnvelope, OpType, ReactionSetPayload, RemoveReason, Role,
    RoleSetPayload,
};
use crate::crdt::secrets::{seal_content, GroupSecret, SealedSecret, SecretError};
use crate::crdt::store::{AppendResult, OpStore, PendingInfo};
use crate::engine::keystore::KeyStore;
use crate::engine::{EngineContext, EngineError, Effects, GroupEvent, Outbound, Recipient, Result};
use crate::sync::dispatcher::PeerAddress;
use crate::sync::frame::{
    sync_response_frames, FetchRequest, Frame, FrameMessage, RequestBody, SecretRequest,
    SignedRequest, SyncError, SyncRequest,
};

// ---------------------------------------------------------------------------
// Local actions
// ---------------------------------------------------------------------------

/// Something the local user does to a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalAction {
    Invite { pubkey: [u8; 32], role: Role },
    Accept { invite_op_id: OpID },
    /// Kick, or leave when `device` is this device.
    Remove { device: DeviceID },
    Leave,
    SetRole { device: DeviceID, role: Role },
    Mute { device: DeviceID, muted: bool },
    Report { device: DeviceID, reason: String },
    SetMetadata { key: MetadataKey, value: Vec<u8> },
    SendMessage { text: String },
    EditMessage { msg_id: [u8; 32], text: String },
    DeleteMessage { msg_id: [u8; 32] },
    React { msg_id: [u8; 32], emoji: String, present: bool },
}

impl LocalAction {
    pub fn op_type(&self) -> OpType {
        match self {
            LocalAction::Invite { .. } => OpType::MemberInvite,
            LocalAction::Accept { .. } => OpType::MemberAccept,
            LocalAction::Remove { .. } | LocalAction::Leave => OpType::MemberRemove,
            LocalAction::SetRole { .. } => OpType::RoleSet,
            LocalAction::Mute { .. } => OpType::MemberMute,
            LocalAction::Report { .. } => OpType::MemberReport,
            LocalAction::SetMetadata { .. } => OpType::MetadataSet,
            LocalAction::SendMessage { .. } => OpType::MessageSend,
            LocalAction::EditMessage { .. } => OpType::MessageEdit,
            LocalAction::DeleteMessage { .. } => OpType::MessageDelete,
            LocalAction::React { .. } => OpType::ReactionSet,
        }
    }
}

/// A locally authored op.
#[derive(Clone, Debug)]
pub struct Authored {
    pub op: OpEnvelope,
    /// How the op folded locally.
    pub outcome: Option<ApplyOutcome>,
    /// Set for `SendMessage`.
    pub msg_id: Option<[u8; 32]>,
}

#[derive(Clone, Debug)]
pub struct OperationInfo {
    pub op: OpEnvelope,
    /// `None` while the op is buffered.
    pub outcome: Option<ApplyOutcome>,
}

// ---------------------------------------------------------------------------
// GroupEngine
// ---------------------------------------------------------------------------

pub struct GroupEngine {
    group_id: GroupID,
    local: DeviceID,
    keys: Arc<dyn KeyStore>,
    config: EngineConfig,
    store: OpStore,
    clock: CausalClock,
    state: GroupState,
    /// Duties this device has settled, by the op that created them.
    handled_duties: BTreeSet<OpID>,
    /// Invites to this device already announced.
    announced_invites: BTreeSet<OpID>,
    /// Outstanding secret requests: last sent, times sent.
    secret_requests: BTreeMap<Option<OpID>, (Instant, u32)>,
}

impl GroupEngine {
    /// Load a group from the op log. An unknown group opens empty.
    pub fn open(ctx: &EngineContext, group_id: GroupID) -> Result<Self> {
        let local = ctx.local_device();
        let store = OpStore::load(group_id, ctx.op_log.clone(), ctx.config.max_pending_ops)?;
        let mut clock = CausalClock::load(group_id, local, ctx.clocks.clone())?;
        for op in store.ops() {
            clock.observe(op);
        }
        let state = GroupState::replay(&store);
        // A rotation we own but never stored a secret for is left to `resume`.
        let handled_duties: BTreeSet<OpID> = state
            .duties()
            .iter()
            .filter(|(_, duty)| match duty {
                SecretDuty::Rotate {
                    secret_id,
                    coordinator,
                } => *coordinator == local && ctx.keys.group_secret(&group_id, secret_id).is_some(),
                SecretDuty::Deliver { distributor, .. } => *distributor == local,
            })
            .map(|(id, _)| *id)
            .collect();
        let announced_invites: BTreeSet<OpID> = state
            .membership
            .get(&local)
            .map(|m| m.pending_invites().keys().copied().collect())
            .unwrap_or_default();
        log::info!("group {}: loaded {} ops", group_id, store.len());

        Ok(GroupEngine {
            group_id,
            local,
            keys: ctx.keys.clone(),
            config: ctx.config.clone(),
            store,
            clock,
            state,
            handled_duties,
            announced_invites,
            secret_requests: BTreeMap::new(),
        })
    }

    /// Create a new group owned by this device, with its first secret.
    pub fn create(ctx: &EngineContext, name: Option<&str>) -> Result<(Self, Effects)> {
        let (group_id, salt) = GroupID::generate(&ctx.local_device());
        let mut engine = Self::open(ctx, group_id)?;

        let payload = GroupCreatePayload {
            salt,
            creator_exchange_pubkey: ctx.keys.exchange_public_key(),
        };
        let op = engine.sign(OpType::GroupCreate, &payload, Vec::new())?;
        ctx.keys
            .store_group_secret(&group_id, op.op_id, GroupSecret::generate())?;

        let mut effects = Effects::default();
        engine.commit(op, &mut effects)?;
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            let (_, more) = engine.author(LocalAction::SetMetadata {
                key: MetadataKey::Name,
                value: name.as_bytes().to_vec(),
            })?;
            effects.extend(more);
        }
        log::info!("group {}: created", group_id);
        Ok((engine, effects))
    }

    // -----------------------------------------------------------------------
    // Authoring
    // -----------------------------------------------------------------------

    /// Author, store, fold and push one op.
    pub fn author(&mut self, action: LocalAction) -> Result<(Authored, Effects)> {
        let op_type = action.op_type();
        if !op_type.is_membership_op() && self.state.limit_status() == OpLimitStatus::HardCapReached {
            return Err(EngineError::LimitReached);
        }
        if !self.state.membership.can_author_op(&self.local, &op_type) {
            return Err(EngineError::NotAuthorized(format!(
                "cannot author {} in group {}",
                op_type.as_str(),
                self.group_id
            )));
        }

        let mut msg_id = None;
        let op = match action {
            LocalAction::Invite { pubkey, role } => {
                let target = DeviceID::from_pubkey(&pubkey);
                if self.state.membership.is_active(&target) {
                    return Err(MembershipError::AlreadyActiveMember.into_engine());
                }
                if !self.local_role().is_some_and(|r| r.at_least(role)) {
                    return Err(MembershipError::InsufficientRoleForInvite.into_engine());
                }
                let payload = MemberInvitePayload {
                    invited_device_id: target,
                    invited_pubkey: pubkey,
                    role,
                };
                self.sign(OpType::MemberInvite, &payload, Vec::new())?
            }
            LocalAction::Accept { invite_op_id } => {
                let pending = self.state.membership.get(&self.local).is_some_and(|m| {
                    m.is_pending() && m.pending_invites().contains_key(&invite_op_id)
                });
                if !pending {
                    return Err(EngineError::NoPendingInvite(invite_op_id));
                }
                let payload = MemberAcceptPayload {
                    invite_op_id,
                    exchange_pubkey: self.keys.exchange_public_key(),
                };
                self.sign(OpType::MemberAccept, &payload, vec![invite_op_id])?
            }
            LocalAction::Remove { device } => {
                self.require_member(&device)?;
                let (reason, coordinator) = if device == self.local {
                    (RemoveReason::Leave, self.state.membership.successor_coordinator(&self.local))
                } else {
                    (RemoveReason::Kick, None)
                };
                let payload = MemberRemovePayload {
                    target_device_id: device,
                    reason,
                    coordinator,
                };
                self.sign(OpType::MemberRemove, &payload, Vec::new())?
            }
            LocalAction::Leave => {
                let payload = MemberRemovePayload {
                    target_device_id: self.local,
                    reason: RemoveReason::Leave,
                    coordinator: self.state.membership.successor_coordinator(&self.local),
                };
                self.sign(OpType::MemberRemove, &payload, Vec::new())?
            }
            LocalAction::SetRole { device, role } => {
                self.require_member(&device)?;
                let payload = RoleSetPayload {
                    target_device_id: device,
                    new_role: role,
                };
                self.sign(OpType::RoleSet, &payload, Vec::new())?
            }
            LocalAction::Mute { device, muted } => {
                self.require_member(&device)?;
                let payload = MemberMutePayload {
                    target_device_id: device,
                    muted,
                };
                self.sign(OpType::MemberMute, &payload, Vec::new())?
            }
            LocalAction::Report { device, reason } => {
                self.require_member(&device)?;
                if device == self.local {
                    return Err(MembershipError::SelfReport.into_engine());
                }
                if reason.len() > MAX_REPORT_REASON_BYTES {
                    return Err(MembershipError::ReportReasonTooLong.into_engine());
                }
                let payload = MemberReportPayload {
                    target_device_id: device,
                    reason,
                };
                self.sign(OpType::MemberReport, &payload, Vec::new())?
            }
            LocalAction::SetMetadata { key, value } => {
                let (secret_id, secret) = self.sealing_secret()?;
                let payload = MetadataSetPayload {
                    key,
                    value: seal_content(&secret, secret_id, &self.group_id, &value)?,
                };
                self.sign(OpType::MetadataSet, &payload, Vec::new())?
            }
            LocalAction::SendMessage { text } => {
                let (secret_id, secret) = self.sealing_secret()?;
                let content = seal_content(&secret, secret_id, &self.group_id, text.as_bytes())?;
                // msg_id commits to the stamp, so stamp before signing
                let lamport = self.clock.next_lamport()?;
                let nonce: u64 = rand::random();
                let id = generate_msg_id(&self.local, lamport, nonce);
                msg_id = Some(id);
                let op = OpEnvelope::create_signed(
                    self.group_id,
                    OpType::MessageSend,
                    &MessageSendPayload { msg_id: id, content },
                    Vec::new(),
                    lamport,
                    nonce,
                    self.keys.as_ref(),
                )?;
                self.clock.observe(&op);
                op
            }
            LocalAction::EditMessage { msg_id, text } => {
                if self.live_message(&msg_id)?.author != self.local {
                    return Err(MessageError::NotMessageAuthor.into_engine());
                }
                let (secret_id, secret) = self.sealing_secret()?;
                let payload = MessageEditPayload {
                    msg_id,
                    content: seal_content(&secret, secret_id, &self.group_id, text.as_bytes())?,
                };
                self.sign(OpType::MessageEdit, &payload, Vec::new())?
            }
            LocalAction::DeleteMessage { msg_id } => {
                let author = self.live_message(&msg_id)?.author;
                let moderator = self.local_role().is_some_and(Role::is_moderator);
                if author != self.local && !moderator {
                    return Err(MessageError::DeleteNotAuthorized.into_engine());
                }
                self.sign(OpType::MessageDelete, &MessageDeletePayload { msg_id }, Vec::new())?
            }
            LocalAction::React {
                msg_id,
                emoji,
                present,
            } => {
                self.live_message(&msg_id)?;
                if emoji.is_empty() || emoji.len() > MAX_EMOJI_BYTES {
                    return Err(MessageError::InvalidEmoji {
                        max: MAX_EMOJI_BYTES,
                    }
                    .into_engine());
                }
                let payload = ReactionSetPayload {
                    msg_id,
                    emoji,
                    present,
                };
                self.sign(OpType::ReactionSet, &payload, Vec::new())?
            }
        };

        let mut effects = Effects::default();
        let outcome = self.commit(op.clone(), &mut effects)?;
        if let Some(ApplyOutcome::Void(e)) = &outcome {
            log::warn!(
                "group {}: own {} {} folded void: {}",
                self.group_id,
                op.op_type.as_str(),
                op.op_id,
                e
            );
        }
        Ok((Authored { op, outcome, msg_id }, effects))
    }

    fn sign<P: Serialize>(&mut self, op_type: OpType, payload: &P, deps: Vec<OpID>) -> Result<OpEnvelope> {
        Ok(create_operation(
            self.group_id,
            op_type,
            payload,
            deps,
            self.keys.as_ref(),
            &mut self.clock,
        )?)
    }

    /// Store a local op, fold it, push it to the members, then run any
    /// secret work it caused.
    fn commit(&mut self, op: OpEnvelope, effects: &mut Effects) -> Result<Option<ApplyOutcome>> {
        let report = self.store.append(op.clone(), Instant::now())?;
        if report.result != AppendResult::Accepted {
            log::warn!(
                "group {}: own op {} not accepted: {}",
                self.group_id,
                op.op_id,
                report.result.as_str()
            );
        }
        let mut follow_up = Effects::default();
        self.absorb(&report.stored, report.replaced, &mut follow_up)?;
        self.push_op(&op, effects);
        effects.extend(follow_up);
        Ok(self.state.outcome(&op.op_id).cloned())
    }

    /// Every active member, plus the invitee of an invite and the target of
    /// a kick.
    fn push_op(&self, op: &OpEnvelope, effects: &mut Effects) {
        let membership = &self.state.membership;
        let mut recipients: BTreeSet<[u8; 32]> = membership
            .active_members()
            .filter(|m| m.device_id != self.local)
            .map(|m| m.pubkey)
            .collect();
        match op.op_type {
            OpType::MemberInvite => {
                if let Ok(p) = op.decode_payload::<MemberInvitePayload>() {
                    recipients.insert(p.invited_pubkey);
                }
            }
            OpType::MemberRemove => {
                if let Ok(p) = op.decode_payload::<MemberRemovePayload>() {
                    if let Some(target) = membership.get(&p.target_device_id) {
                        if target.device_id != self.local {
                            recipients.insert(target.pubkey);
                        }
                    }
                }
            }
            _ => {}
        }
        for pubkey in recipients {
            effects.outbound.push(Outbound {
                to: Recipient::Device(pubkey),
                frame: Frame::new(FrameMessage::Operation(op.clone())),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Ingest a remote op. A buffered op triggers a fetch of its missing
    /// dependencies from `from`.
    pub fn ingest(&mut self, op: OpEnvelope, from: Option<&PeerAddress>) -> Result<(AppendResult, Effects)> {
        let mut effects = Effects::default();
        let report = self.store.append(op, Instant::now())?;
        log_append(&self.group_id, &report.result);
        self.absorb(&report.stored, report.replaced, &mut effects)?;

        if let (AppendResult::BufferedAwaitingDependency { missing }, Some(peer)) = (&report.result, from) {
            let fetch = self.fetch_request(missing.clone(), Recipient::Peer(peer.clone()))?;
            effects.outbound.extend(fetch);
        }
        Ok((report.result, effects))
    }

    /// Fold newly stored ops, publish their events, then handle invites and
    /// secret duties that became visible.
    fn absorb(&mut self, stored: &[OpID], replaced: bool, effects: &mut Effects) -> Result<()> {
        for id in stored {
            if let Some(op) = self.store.get(id) {
                self.clock.observe(op);
            }
        }
        if self.state.integrate(&self.store, stored, replaced) {
            effects.events.push(GroupEvent::ProjectionRebuilt);
        }

        for id in stored {
            let (Some(op), Some(outcome)) = (self.store.get(id), self.state.outcome(id)) else {
                continue;
            };
            effects.events.push(GroupEvent::OperationApplied {
                op_id: *id,
                op_type: op.op_type,
                outcome: outcome.clone(),
            });
            if !outcome.is_applied() {
                continue;
            }
            if let Some(event) = self.state.system_events().get(id) {
                effects.events.push(GroupEvent::MembershipChanged {
                    op_id: *id,
                    effect: event.effect.clone(),
                });
            }
            if op.op_type == OpType::MessageSend {
                if let Ok(p) = op.decode_payload::<MessageSendPayload>() {
                    effects.events.push(GroupEvent::MessageReceived {
                        msg_id: p.msg_id,
                        author: op.author(),
                    });
                }
            }
        }

        self.announce_invites(effects);
        self.run_duties(effects);
        Ok(())
    }

    fn announce_invites(&mut self, effects: &mut Effects) {
        let Some(me) = self.state.membership.get(&self.local).filter(|m| m.is_pending()) else {
            return;
        };
        let fresh: Vec<(OpID, DeviceID)> = me
            .pending_invites()
            .iter()
            .filter(|(id, _)| !self.announced_invites.contains(id))
            .map(|(id, invite)| (*id, invite.inviter))
            .collect();
        let latest = me.pending_invites().keys().next_back().copied();
        if fresh.is_empty() {
            return;
        }
        for (invite_op_id, inviter) in fresh {
            log::info!("group {}: invited by {}", self.group_id, inviter);
            self.announced_invites.insert(invite_op_id);
            effects.events.push(GroupEvent::InvitedToGroup {
                invite_op_id,
                inviter,
            });
        }

        if let (true, Some(invite_op_id)) = (self.config.auto_accept_invites, latest) {
            match self.author(LocalAction::Accept { invite_op_id }) {
                Ok((_, more)) => effects.extend(more),
                Err(e) => log::warn!("group {}: auto-accept failed: {}", self.group_id, e),
            }
        }
    }

    /// Act on duties not yet settled on this device. A duty is settled once
    /// this device has carried it out; duties owned by others stay open,
    /// since a later fold may hand them to us. Rotations go first so a
    /// member joining in the same batch gets the newest secret.
    fn run_duties(&mut self, effects: &mut Effects) {
        let (rotations, deliveries): (Vec<_>, Vec<_>) = self
            .state
            .duties()
            .iter()
            .filter(|(id, _)| !self.handled_duties.contains(id))
            .map(|(id, duty)| (*id, *duty))
            .partition(|(_, duty)| matches!(duty, SecretDuty::Rotate { .. }));

        for (op_id, duty) in rotations.into_iter().chain(deliveries) {
            match self.perform_duty(duty, effects) {
                Ok(true) => {
                    self.handled_duties.insert(op_id);
                }
                Ok(false) => {}
                Err(e) => log::warn!("group {}: secret duty for {} failed: {}", self.group_id, op_id, e),
            }
        }
    }

    /// Carry out `duty` if it is ours. Returns whether it is settled.
    fn perform_duty(&mut self, duty: SecretDuty, effects: &mut Effects) -> Result<bool> {
        match duty {
            SecretDuty::Rotate {
                secret_id,
                coordinator,
            } => {
                if coordinator != self.local {
                    return Ok(false);
                }
                if !self.config.rotate_secret_on_removal || !self.state.membership.is_active(&self.local) {
                    return Ok(true);
                }
                let secret = match self.keys.group_secret(&self.group_id, &secret_id) {
                    Some(secret) => secret,
                    None => {
                        let secret = GroupSecret::generate();
                        self.keys
                            .store_group_secret(&self.group_id, secret_id, secret.clone())?;
                        log::info!("group {}: rotated group secret to {}", self.group_id, secret_id);
                        effects.events.push(GroupEvent::SecretInstalled { secret_id });
                        secret
                    }
                };
                let members: Vec<MemberEntry> = self
                    .state
                    .membership
                    .active_members()
                    .filter(|m| m.device_id != self.local)
                    .cloned()
                    .collect();
                for member in &members {
                    if let Some(out) = self.seal_to(member, secret_id, &secret, Recipient::Device(member.pubkey))? {
                        effects.outbound.push(out);
                    }
                }
                Ok(true)
            }
            SecretDuty::Deliver {
                member,
                distributor,
            } => {
                if distributor != self.local {
                    return Ok(false);
                }
                let Some(entry) = self.state.membership.get_active_member(&member).cloned() else {
                    return Ok(true);
                };
                // the epoch in force at the join, then what new content uses
                let mut ids: Vec<OpID> = self.join_epoch(&entry).into_iter().collect();
                match self.sealing_secret() {
                    Ok((id, _)) => ids.push(id),
                    Err(e) => log::debug!("group {}: no sealing secret for {} yet: {}", self.group_id, member, e),
                }
                ids.dedup();
                let mut sent = false;
                for secret_id in ids {
                    let Some(secret) = self.keys.group_secret(&self.group_id, &secret_id) else {
                        continue;
                    };
                    if let Some(out) = self.seal_to(&entry, secret_id, &secret, Recipient::Device(entry.pubkey))? {
                        effects.outbound.push(out);
                    }
                    sent = true;
                }
                // retried once a secret arrives
                Ok(sent)
            }
        }
    }

    /// Pick up secret work left unsettled by a previous run.
    pub fn resume(&mut self) -> Effects {
        let mut effects = Effects::default();
        self.run_duties(&mut effects);
        effects
    }

    fn seal_to(
        &self,
        member: &MemberEntry,
        secret_id: OpID,
        secret: &GroupSecret,
        to: Recipient,
    ) -> Result<Option<Outbound>> {
        let Some(exchange_pubkey) = member.exchange_pubkey else {
            log::warn!("group {}: {} has no exchange key", self.group_id, member.device_id);
            return Ok(None);
        };
        let sealed = SealedSecret::seal(
            self.group_id,
            secret_id,
            secret,
            member.device_id,
            &exchange_pubkey,
            self.keys.as_ref(),
        )?;
        Ok(Some(Outbound {
            to,
            frame: Frame::new(FrameMessage::SealedSecret(sealed)),
        }))
    }

    // -----------------------------------------------------------------------
    // Frames
    // -----------------------------------------------------------------------

    pub fn handle_frame(&mut self, message: FrameMessage, from: &PeerAddress) -> Result<Effects> {
        match message {
            FrameMessage::Operation(op) => Ok(self.ingest(op, Some(from))?.1),
            FrameMessage::SyncRequest(req) => self.handle_sync_request(req, from),
            FrameMessage::SyncResponse { ops, chunk, last, .. } => {
                log::trace!("group {}: sync chunk {} ({} ops, last={})", self.group_id, chunk, ops.len(), last);
                self.handle_sync_response(ops, from)
            }
            FrameMessage::FetchRequest(req) => self.handle_fetch_request(req, from),
            FrameMessage::SealedSecret(sealed) => self.handle_sealed_secret(sealed),
            FrameMessage::SecretRequest(req) => self.handle_secret_request(req, from),
        }
    }

    /// Check a request's group, signature and requester membership. Pending
    /// invitees may sync; only active members get secrets.
    fn check_request<B: RequestBody>(&self, req: &SignedRequest<B>, require_active: bool) -> Result<MemberEntry> {
        if req.group_id != self.group_id {
            return Err(SyncError::WrongGroup.into());
        }
        if !req.verify() {
            return Err(SyncError::InvalidSignature.into());
        }
        let requester = req.requester();
        self.state
            .membership
            .get(&requester)
            .filter(|m| m.is_active() || (!require_active && m.is_pending()))
            .cloned()
            .ok_or_else(|| SyncError::NotAMember(requester).into())
    }

    pub fn handle_sync_request(&mut self, req: SyncRequest, from: &PeerAddress) -> Result<Effects> {
        self.check_request(&req, false)?;
        let to = Recipient::Reply {
            pubkey: req.requester_pubkey,
            source: from.clone(),
        };
        let ops: Vec<OpEnvelope> = self
            .store
            .get_missing(&req.body)
            .iter()
            .filter_map(|id| self.store.get(id).cloned())
            .collect();
        log::debug!("group {}: answering sync from {} with {} ops", self.group_id, req.requester(), ops.len());

        let mut effects = Effects::default();
        for frame in sync_response_frames(self.group_id, ops, self.config.max_ops_per_sync_round) {
            effects.outbound.push(Outbound {
                to: to.clone(),
                frame,
            });
        }
        if self.store.digest().is_missing_from(&req.body) {
            effects.outbound.push(self.sync_request(to)?);
        }
        Ok(effects)
    }

    pub fn handle_sync_response(&mut self, ops: Vec<OpEnvelope>, from: &PeerAddress) -> Result<Effects> {
        let mut effects = Effects::default();
        let mut stored = Vec::new();
        let mut replaced = false;
        let mut buffered = false;
        let now = Instant::now();
        for op in ops {
            match self.store.append(op, now) {
                Ok(report) => {
                    log_append(&self.group_id, &report.result);
                    buffered |= matches!(report.result, AppendResult::BufferedAwaitingDependency { .. });
                    replaced |= report.replaced;
                    stored.extend(report.stored);
                }
                Err(e) => log::warn!("group {}: sync op rejected: {}", self.group_id, e),
            }
        }
        self.absorb(&stored, replaced, &mut effects)?;
        if buffered {
            let wanted = self.store.wanted_dependencies();
            effects
                .outbound
                .extend(self.fetch_request(wanted, Recipient::Peer(from.clone()))?);
        }
        Ok(effects)
    }

    pub fn handle_fetch_request(&mut self, req: FetchRequest, from: &PeerAddress) -> Result<Effects> {
        self.check_request(&req, false)?;
        req.check_size()?;
        let ops: Vec<OpEnvelope> = req.body.iter().filter_map(|id| self.store.get(id).cloned()).collect();
        let to = Recipient::Reply {
            pubkey: req.requester_pubkey,
            source: from.clone(),
        };
        let mut effects = Effects::default();
        for frame in sync_response_frames(self.group_id, ops, self.config.max_ops_per_sync_round) {
            effects.outbound.push(Outbound {
                to: to.clone(),
                frame,
            });
        }
        Ok(effects)
    }

    /// Install a group secret sealed to this device by an active member.
    /// Only known epochs are accepted. The first secret stored under an id
    /// is kept; a different copy is logged and dropped.
    pub fn handle_sealed_secret(&mut self, sealed: SealedSecret) -> Result<Effects> {
        if sealed.group_id != self.group_id {
            return Err(SecretError::WrongGroup.into());
        }
        if sealed.recipient != self.local {
            return Err(SecretError::WrongRecipient.into());
        }
        if !sealed.verify() {
            return Err(SecretError::InvalidSignature.into());
        }
        let sender = sealed.sender();
        if !self.state.membership.is_active(&sender) {
            return Err(EngineError::NotAuthorized(format!("secret from non-member {}", sender)));
        }

        if !self.state.secret_epochs().contains(&sealed.secret_id) {
            return Err(SecretError::UnknownEpoch(sealed.secret_id).into());
        }

        let mut effects = Effects::default();
        let shared = Zeroizing::new(self.keys.key_agreement(&sealed.ephemeral_pubkey)?);
        let secret = sealed.open(&shared)?;
        if let Some(held) = self.keys.group_secret(&self.group_id, &sealed.secret_id) {
            if held != secret {
                log::warn!(
                    "group {}: conflicting copy of secret {} from {}, keeping the stored one",
                    self.group_id,
                    sealed.secret_id,
                    sender
                );
            }
            return Ok(effects);
        }
        self.keys
            .store_group_secret(&self.group_id, sealed.secret_id, secret)?;
        self.secret_requests
            .retain(|wanted, _| wanted.is_some_and(|id| id != sealed.secret_id));
        log::info!("group {}: installed secret {} from {}", self.group_id, sealed.secret_id, sender);
        effects.events.push(GroupEvent::SecretInstalled {
            secret_id: sealed.secret_id,
        });
        self.run_duties(&mut effects);
        Ok(effects)
    }

    /// Seal a secret to an active member who asked for it. A member gets
    /// the current secret, the epoch in force when it joined and every
    /// later one; `None` asks for whatever this device would seal new
    /// content under.
    pub fn handle_secret_request(&mut self, req: SecretRequest, from: &PeerAddress) -> Result<Effects> {
        let member = self.check_request(&req, true)?;
        let wanted = match req.body {
            Some(id) => {
                if !self.state.secret_epochs().contains(&id) || !self.entitled_to(&member, &id) {
                    return Err(EngineError::NotAuthorized(format!(
                        "{} may not have secret {}",
                        member.device_id, id
                    )));
                }
                self.keys.group_secret(&self.group_id, &id).map(|s| (id, s))
            }
            None => self.sealing_secret().ok(),
        };
        let mut effects = Effects::default();
        let Some((secret_id, secret)) = wanted else {
            return Ok(effects);
        };
        let to = Recipient::Reply {
            pubkey: member.pubkey,
            source: from.clone(),
        };
        effects.outbound.extend(self.seal_to(&member, secret_id, &secret, to)?);
        Ok(effects)
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    pub fn sync_request(&self, to: Recipient) -> Result<Outbound> {
        let req = SyncRequest::sign(self.group_id, self.store.digest(), self.keys.as_ref())?;
        Ok(Outbound {
            to,
            frame: Frame::new(FrameMessage::SyncRequest(req)),
        })
    }

    /// Members to sync with: every active member but us.
    pub fn sync_targets(&self) -> Vec<[u8; 32]> {
        self.state
            .membership
            .active_members()
            .filter(|m| m.device_id != self.local)
            .map(|m| m.pubkey)
            .collect()
    }

    pub fn sync_all(&self) -> Result<Effects> {
        let mut effects = Effects::default();
        let targets = self.sync_targets();
        if targets.is_empty() {
            return Ok(effects);
        }
        let req = SyncRequest::sign(self.group_id, self.store.digest(), self.keys.as_ref())?;
        for pubkey in targets {
            effects.outbound.push(Outbound {
                to: Recipient::Device(pubkey),
                frame: Frame::new(FrameMessage::SyncRequest(req.clone())),
            });
        }
        Ok(effects)
    }

    fn fetch_request(&self, mut ids: Vec<OpID>, to: Recipient) -> Result<Option<Outbound>> {
        ids.truncate(MAX_FETCH_IDS);
        if ids.is_empty() {
            return Ok(None);
        }
        let req = FetchRequest::sign(self.group_id, ids, self.keys.as_ref())?;
        Ok(Some(Outbound {
            to,
            frame: Frame::new(FrameMessage::FetchRequest(req)),
        }))
    }

    /// Ask one active member for a secret, at most once per
    /// `secret_request_interval`. Successive requests rotate through the
    /// members, coordinator first.
    pub fn secret_request(&mut self, secret_id: Option<OpID>, now: Instant) -> Result<Effects> {
        let mut effects = Effects::default();
        let (last, attempts) = match self.secret_requests.get(&secret_id) {
            Some((last, attempts)) => (Some(*last), *attempts),
            None => (None, 0),
        };
        if last.is_some_and(|l| now.saturating_duration_since(l) < self.config.secret_request_interval()) {
            return Ok(effects);
        }

        let coordinator = self.state.membership.secret_coordinator();
        let mut candidates: Vec<&MemberEntry> = self
            .state
            .membership
            .active_members()
            .filter(|m| m.device_id != self.local)
            .collect();
        if candidates.is_empty() {
            return Ok(effects);
        }
        candidates.sort_by_key(|m| (Some(m.device_id) != coordinator, m.device_id));
        let target = candidates[attempts as usize % candidates.len()].pubkey;

        self.secret_requests.insert(secret_id, (now, attempts + 1));
        let req = SecretRequest::sign(self.group_id, secret_id, self.keys.as_ref())?;
        log::debug!("group {}: requesting secret {:?}", self.group_id, secret_id);
        effects.outbound.push(Outbound {
            to: Recipient::Device(target),
            frame: Frame::new(FrameMessage::SecretRequest(req)),
        });
        Ok(effects)
    }

    /// Periodic upkeep: expire stale buffered ops and retry open secret work.
    pub fn tick(&mut self, now: Instant) -> Result<Effects> {
        let mut effects = Effects::default();
        let expired = self.store.expire_pending(now, self.config.dependency_timeout());
        if !expired.is_empty() {
            effects.events.push(GroupEvent::DependenciesExpired(expired));
        }

        self.run_duties(&mut effects);
        effects.extend(self.chase_secret(now)?);
        Ok(effects)
    }

    /// Ask for the secret new content must be sealed under, if this device
    /// is active and lacks it.
    pub fn chase_secret(&mut self, now: Instant) -> Result<Effects> {
        if !self.state.membership.is_active(&self.local) {
            return Ok(Effects::default());
        }
        let Some(current) = self.state.current_secret_id() else {
            return Ok(Effects::default());
        };
        if self.keys.group_secret(&self.group_id, &current).is_some() {
            return Ok(Effects::default());
        }
        if self.config.rotate_secret_on_removal {
            self.secret_request(Some(current), now)
        } else if self.latest_held_secret().is_none() {
            self.secret_request(None, now)
        } else {
            Ok(Effects::default())
        }
    }

    // -----------------------------------------------------------------------
    // Secrets
    // -----------------------------------------------------------------------

    /// The secret new content is sealed under. With rotation on that must
    /// be the current epoch; without, the newest epoch held will do.
    pub fn sealing_secret(&self) -> Result<(OpID, GroupSecret)> {
        let current = self
            .state
            .current_secret_id()
            .ok_or_else(|| EngineError::NotAuthorized(format!("group {} not created", self.group_id)))?;
        if let Some(secret) = self.keys.group_secret(&self.group_id, &current) {
            return Ok((current, secret));
        }
        if !self.config.rotate_secret_on_removal {
            if let Some(held) = self.latest_held_secret() {
                return Ok(held);
            }
        }
        Err(EngineError::SecretUnavailable(current))
    }

    /// The epoch in force when `member` last joined.
    fn join_epoch(&self, member: &MemberEntry) -> Option<OpID> {
        let joined = member.joined_op?;
        self.state.secret_epochs().range(..=joined).next_back().copied()
    }

    /// Epochs from the one in force at the member's join onward, plus the
    /// current epoch.
    fn entitled_to(&self, member: &MemberEntry, secret_id: &OpID) -> bool {
        self.state.current_secret_id() == Some(*secret_id)
            || self.join_epoch(member).is_some_and(|first| *secret_id >= first)
    }

    fn latest_held_secret(&self) -> Option<(OpID, GroupSecret)> {
        self.state
            .secret_epochs()
            .iter()
            .rev()
            .find_map(|id| self.keys.group_secret(&self.group_id, id).map(|s| (*id, s)))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn group_id(&self) -> GroupID {
        self.group_id
    }

    pub fn local_device(&self) -> DeviceID {
        self.local
    }

    pub fn state(&self) -> &GroupState {
        &self.state
    }

    pub fn store(&self) -> &OpStore {
        &self.store
    }

    pub fn clock(&self) -> &CausalClock {
        &self.clock
    }

    pub fn secrets(&self) -> BTreeMap<OpID, GroupSecret> {
        self.keys.group_secrets(&self.group_id)
    }

    pub fn members(&self) -> Vec<MemberEntry> {
        self.state.membership.members().values().cloned().collect()
    }

    pub fn conversation(&self) -> Vec<ConversationEntry> {
        conversation::project(&self.state, &self.secrets())
    }

    pub fn messages_after(&self, after_lamport: u64, limit: usize) -> Vec<ConversationEntry> {
        conversation::messages_after(&self.state, &self.secrets(), after_lamport, limit)
    }

    pub fn metadata(&self) -> BTreeMap<MetadataKey, MetadataValue> {
        conversation::metadata_view(&self.state, &self.secrets())
    }

    pub fn operation(&self, op_id: &OpID) -> Option<OperationInfo> {
        self.store.get(op_id).map(|op| OperationInfo {
            op: op.clone(),
            outcome: self.state.outcome(op_id).cloned(),
        })
    }

    pub fn pending_dependencies(&self, now: Instant) -> Vec<PendingInfo> {
        self.store.pending_dependencies(now)
    }

    fn local_role(&self) -> Option<Role> {
        self.state
            .membership
            .get_active_member(&self.local)
            .map(|m| m.role)
    }

    fn require_member(&self, device: &DeviceID) -> Result<()> {
        match self.state.membership.get(device) {
            Some(m) if !m.removed => Ok(()),
            _ => Err(MembershipError::TargetNotFound.into_engine()),
        }
    }

    fn live_message(&self, msg_id: &[u8; 32]) -> Result<&MessageEntry> {
        self.state
            .messages
            .get_message(msg_id)
            .filter(|m| !m.deleted)
            .ok_or(EngineError::MessageNotFound)
    }
}

impl fmt::Debug for GroupEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupEngine")
            .field("group_id", &self.group_id)
            .field("local", &self.local)
            .field("ops", &self.store.len())
            .field("pending", &self.store.pending_len())
            .finish_non_exhaustive()
    }
}

fn log_append(group_id: &GroupID, result: &AppendResult) {
    match result {
        AppendResult::RejectedInvalidSignature => {
            log::warn!("group {}: rejected op with invalid signature", group_id)
        }
        AppendResult::BufferedAwaitingDependency { missing } => {
            log::debug!("group {}: op buffered, {} deps missing", group_id, missing.len())
        }
        _ => {}
    }
}

/// Local pre-checks report the same reasons the fold would.
trait IntoEngineError {
    fn into_engine(self) -> EngineError;
}

impl<E: Into<ApplyError>> IntoEngineError for E {
    fn into_engine(self) -> EngineError {
        EngineError::Apply(self.into())
    }
}
