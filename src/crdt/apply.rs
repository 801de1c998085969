/// Unified apply engine: the single fold from op set to group state.
///
/// `GroupState` holds the full projection for one group: membership,
/// messages, metadata, DAG heads, per-op outcomes, the secret epochs and
/// the secret duties that membership changes produce.
///
/// **Determinism:** ops are folded in causal order (Kahn topological sort
/// over `deps`, OpID as priority), so any delivery order of the same op set
/// yields the same `state_hash`. Authorization is judged against the state
/// as of each op's position. Unauthorized ops stay in the log as
/// `ApplyOutcome::Void` with their reason.
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use thiserror::Error;

use crate::crdt::ids::{DeviceID, GroupID, OpID};
use crate::crdt::limits::{check_op_limits, OpLimitStatus};
use crate::crdt::membership::{MembershipEffect, MembershipError, MembershipState};
use crate::crdt::messages::{MessageError, MessageState};
use crate::crdt::metadata::{MetadataError, MetadataState};
use crate::crdt::ops::{verify_operation, MemberRemovePayload, OpEnvelope, OpError, OpType, RemoveReason};
use crate::crdt::store::OpStore;

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Op targets wrong group")]
    WrongGroup,

    #[error("Hard op limit reached, only membership ops allowed")]
    OpLimitReached,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Op error: {0}")]
    Op(#[from] OpError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Kept in the log, no effect.
    Void(ApplyError),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Secret work an effective membership op asks of one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretDuty {
    /// Seal the current secret to a member who just joined.
    Deliver {
        member: DeviceID,
        distributor: DeviceID,
    },
    /// Generate the secret identified by `secret_id` and hand it to every
    /// remaining member.
    Rotate {
        secret_id: OpID,
        coordinator: DeviceID,
    },
}

/// A membership change as it shows up in the conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemEvent {
    pub op_id: OpID,
    pub timestamp_ms: u64,
    pub effect: MembershipEffect,
}

// ---------------------------------------------------------------------------
// Causal order
// ---------------------------------------------------------------------------

/// Kahn topological order over `deps` with the OpID as priority.
///
/// Deps outside the given set are ignored. Ops left over by a dependency
/// cycle (only possible for forged ops) are appended in OpID order; the
/// second value is how many there were.
pub fn causal_order<'a>(
    ops: impl IntoIterator<Item = &'a OpEnvelope>,
) -> (Vec<&'a OpEnvelope>, usize) {
    let by_id: BTreeMap<OpID, &OpEnvelope> = ops.into_iter().map(|op| (op.op_id, op)).collect();

    let mut indegree: BTreeMap<OpID, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<OpID, Vec<OpID>> = BTreeMap::new();
    for op in by_id.values() {
        let deps: BTreeSet<OpID> = op
            .deps
            .iter()
            .filter(|d| by_id.contains_key(d))
            .copied()
            .collect();
        indegree.insert(op.op_id, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(op.op_id);
        }
    }

    let mut ready: BinaryHeap<Reverse<OpID>> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();
    let mut order = Vec::with_capacity(by_id.len());
    while let Some(Reverse(id)) = ready.pop() {
        if let Some(op) = by_id.get(&id) {
            order.push(*op);
        }
        indegree.remove(&id);
        for waiter in dependents.get(&id).into_iter().flatten() {
            if let Some(n) = indegree.get_mut(waiter) {
                *n -= 1;
                if *n == 0 {
                    ready.push(Reverse(*waiter));
                }
            }
        }
    }

    let leftovers = indegree.len();
    if leftovers > 0 {
        log::warn!("apply: dependency cycle among {} ops, appending in id order", leftovers);
        order.extend(indegree.keys().filter_map(|id| by_id.get(id).copied()));
    }
    (order, leftovers)
}

// ---------------------------------------------------------------------------
// GroupState
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct GroupState {
    pub group_id: GroupID,
    pub membership: MembershipState,
    pub messages: MessageState,
    pub metadata: MetadataState,
    /// Ops no other folded op depends on.
    pub heads: BTreeSet<OpID>,
    /// Per-author maximum lamport (for sync gap detection).
    pub max_lamport: BTreeMap<DeviceID, u64>,
    /// Ops folded so far, void ones included.
    pub op_count: usize,
    outcomes: BTreeMap<OpID, ApplyOutcome>,
    events: BTreeMap<OpID, SystemEvent>,
    /// GroupCreate and every removal of a secret holder.
    secret_epochs: BTreeSet<OpID>,
    duties: BTreeMap<OpID, SecretDuty>,
    max_applied: Option<OpID>,
    /// The last full fold had to break a cycle. Incremental folds are off.
    unordered: bool,
}

impl GroupState {
    pub fn new(group_id: GroupID) -> Self {
        GroupState {
            group_id,
            membership: MembershipState::new(),
            messages: MessageState::new(),
            metadata: MetadataState::new(),
            heads: BTreeSet::new(),
            max_lamport: BTreeMap::new(),
            op_count: 0,
            outcomes: BTreeMap::new(),
            events: BTreeMap::new(),
            secret_epochs: BTreeSet::new(),
            duties: BTreeMap::new(),
            max_applied: None,
            unordered: false,
        }
    }

    /// Apply a single op on top of the current state.
    ///
    /// `Ok(true)` if applied, `Ok(false)` if already folded, `Err` if the op
    /// was rejected (bad signature, wrong group) or folded as void.
    pub fn apply_op(&mut self, op: &OpEnvelope) -> Result<bool, ApplyError> {
        if !verify_operation(op) {
            return Err(ApplyError::InvalidSignature);
        }
        if op.group_id != self.group_id {
            return Err(ApplyError::WrongGroup);
        }
        if self.outcomes.contains_key(&op.op_id) {
            return Ok(false);
        }
        match self.apply_verified(op) {
            ApplyOutcome::Applied => Ok(true),
            ApplyOutcome::Void(e) => Err(e),
        }
    }

    /// Fold an arbitrary op set from scratch, in any input order.
    ///
    /// Ops that fail verification or belong to another group are skipped.
    /// Two envelopes with one OpID resolve to the smaller content hash, as
    /// in the store.
    pub fn rebuild_from_ops(group_id: GroupID, ops: &[OpEnvelope]) -> Self {
        let mut chosen: BTreeMap<OpID, (&OpEnvelope, [u8; 32])> = BTreeMap::new();
        for op in ops {
            if op.group_id != group_id || !verify_operation(op) {
                log::warn!("apply: skipping unverifiable op {:?}", op.op_id);
                continue;
            }
            let Ok(hash) = op.content_hash() else {
                continue;
            };
            match chosen.get(&op.op_id) {
                Some((_, existing)) if *existing <= hash => {}
                _ => {
                    chosen.insert(op.op_id, (op, hash));
                }
            }
        }

        let mut state = GroupState::new(group_id);
        state.fold(chosen.values().map(|(op, _)| *op));
        state
    }

    /// Full replay of everything in the store. Store ops are already verified.
    pub fn replay(store: &OpStore) -> Self {
        let mut state = GroupState::new(*store.group_id());
        state.fold(store.ops());
        state
    }

    /// Bring the projection up to date after an append stored `new_ids`.
    ///
    /// Folds incrementally when every new op sorts after everything already
    /// folded and its deps are already folded; otherwise replays the store.
    /// Returns whether a full replay happened.
    pub fn integrate(&mut self, store: &OpStore, new_ids: &[OpID], replaced: bool) -> bool {
        if new_ids.is_empty() && !replaced {
            return false;
        }
        let mut sorted = new_ids.to_vec();
        sorted.sort();
        sorted.dedup();

        if !replaced && !self.unordered && self.can_fold_incrementally(store, &sorted) {
            for id in &sorted {
                if let Some(op) = store.get(id) {
                    self.apply_verified(op);
                }
            }
            return false;
        }

        log::debug!("apply: full replay of {} ops", store.len());
        *self = GroupState::replay(store);
        true
    }

    fn can_fold_incrementally(&self, store: &OpStore, sorted: &[OpID]) -> bool {
        let after_applied = match (sorted.first(), self.max_applied) {
            (Some(first), Some(max)) => *first > max,
            _ => true,
        };
        if !after_applied {
            return false;
        }
        let mut folded_here = BTreeSet::new();
        sorted.iter().all(|id| {
            let ready = store.get(id).is_some_and(|op| {
                op.deps
                    .iter()
                    .all(|d| self.outcomes.contains_key(d) || folded_here.contains(d))
            });
            folded_here.insert(*id);
            ready
        })
    }

    fn fold<'a>(&mut self, ops: impl IntoIterator<Item = &'a OpEnvelope>) {
        let (order, leftovers) = causal_order(ops);
        self.unordered = leftovers > 0;
        for op in order {
            self.apply_verified(op);
        }
    }

    fn apply_verified(&mut self, op: &OpEnvelope) -> ApplyOutcome {
        let outcome = match self.dispatch(op) {
            Ok(()) => ApplyOutcome::Applied,
            Err(e) => {
                log::debug!("apply: {} {:?} void: {}", op.op_type.as_str(), op.op_id, e);
                ApplyOutcome::Void(e)
            }
        };
        self.bookkeep(op);
        self.outcomes.insert(op.op_id, outcome.clone());
        outcome
    }

    fn dispatch(&mut self, op: &OpEnvelope) -> Result<(), ApplyError> {
        if !op.op_type.is_membership_op()
            && check_op_limits(self.op_count) == OpLimitStatus::HardCapReached
        {
            return Err(ApplyError::OpLimitReached);
        }

        let author = op.author();
        if op.op_type != OpType::GroupCreate
            && !self.membership.can_author_op(&author, &op.op_type)
        {
            return Err(ApplyError::Unauthorized(format!(
                "{} cannot author {}",
                author,
                op.op_type.as_str()
            )));
        }

        let effect = match op.op_type {
            OpType::GroupCreate => {
                let result = self.membership.apply_group_create(op, &self.group_id);
                if result == Err(MembershipError::GroupAlreadyCreated) {
                    log::warn!("apply: competing GroupCreate {:?} ignored", op.op_id);
                }
                result?
            }
            OpType::MemberInvite => self.membership.apply_member_invite(op)?,
            OpType::MemberAccept => self.membership.apply_member_accept(op)?,
            OpType::MemberRemove => self.membership.apply_member_remove(op)?,
            OpType::RoleSet => self.membership.apply_role_set(op)?,
            OpType::MemberMute => self.membership.apply_member_mute(op)?,
            OpType::MemberReport => self.membership.apply_member_report(op)?,
            OpType::MetadataSet => {
                self.metadata.apply_metadata_set(op)?;
                None
            }
            OpType::MessageSend => {
                self.messages.apply_message_send(op)?;
                None
            }
            OpType::MessageEdit => {
                self.messages.apply_message_edit(op)?;
                None
            }
            OpType::MessageDelete => {
                self.messages.apply_message_delete(op, &self.membership)?;
                None
            }
            OpType::ReactionSet => {
                self.messages.apply_reaction_set(op)?;
                None
            }
        };

        if let Some(effect) = effect {
            self.on_membership_effect(op, effect);
        }
        Ok(())
    }

    fn on_membership_effect(&mut self, op: &OpEnvelope, effect: MembershipEffect) {
        match &effect {
            MembershipEffect::Created { .. } => {
                self.secret_epochs.insert(op.op_id);
            }
            MembershipEffect::Joined { member, inviter } => {
                let distributor = if self.membership.is_active(inviter) {
                    Some(*inviter)
                } else {
                    self.membership.secret_coordinator()
                };
                if let Some(distributor) = distributor {
                    self.duties.insert(
                        op.op_id,
                        SecretDuty::Deliver {
                            member: *member,
                            distributor,
                        },
                    );
                }
            }
            MembershipEffect::Removed {
                by,
                reason,
                held_secret: true,
                ..
            } => {
                self.secret_epochs.insert(op.op_id);
                let coordinator = match reason {
                    RemoveReason::Kick => Some(*by),
                    RemoveReason::Leave => op
                        .decode_payload::<MemberRemovePayload>()
                        .ok()
                        .and_then(|p| p.coordinator)
                        .filter(|named| self.membership.is_active(named))
                        .or_else(|| self.membership.secret_coordinator()),
                };
                if let Some(coordinator) = coordinator {
                    self.duties.insert(
                        op.op_id,
                        SecretDuty::Rotate {
                            secret_id: op.op_id,
                            coordinator,
                        },
                    );
                }
            }
            _ => {}
        }
        self.events.insert(
            op.op_id,
            SystemEvent {
                op_id: op.op_id,
                timestamp_ms: op.timestamp_ms,
                effect,
            },
        );
    }

    fn bookkeep(&mut self, op: &OpEnvelope) {
        for dep in &op.deps {
            self.heads.remove(dep);
        }
        self.heads.insert(op.op_id);
        self.op_count += 1;
        self.max_lamport
            .entry(op.author())
            .and_modify(|l| *l = (*l).max(op.lamport))
            .or_insert(op.lamport);
        if self.max_applied.map_or(true, |m| op.op_id > m) {
            self.max_applied = Some(op.op_id);
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn outcome(&self, op_id: &OpID) -> Option<&ApplyOutcome> {
        self.outcomes.get(op_id)
    }

    /// Folded and effective.
    pub fn has_applied(&self, op_id: &OpID) -> bool {
        self.outcomes.get(op_id).is_some_and(|o| o.is_applied())
    }

    pub fn void_ops(&self) -> impl Iterator<Item = (&OpID, &ApplyError)> {
        self.outcomes.iter().filter_map(|(id, o)| match o {
            ApplyOutcome::Void(e) => Some((id, e)),
            ApplyOutcome::Applied => None,
        })
    }

    pub fn system_events(&self) -> &BTreeMap<OpID, SystemEvent> {
        &self.events
    }

    pub fn secret_epochs(&self) -> &BTreeSet<OpID> {
        &self.secret_epochs
    }

    /// The secret new content should be sealed under.
    pub fn current_secret_id(&self) -> Option<OpID> {
        self.secret_epochs.last().copied()
    }

    pub fn duty(&self, op_id: &OpID) -> Option<&SecretDuty> {
        self.duties.get(op_id)
    }

    pub fn duties(&self) -> &BTreeMap<OpID, SecretDuty> {
        &self.duties
    }

    pub fn limit_status(&self) -> OpLimitStatus {
        check_op_limits(self.op_count)
    }

    /// Deterministic hash for convergence checks.
    ///
    /// Covers membership, messages, metadata and which ops were void, in
    /// canonical BTreeMap order. Enum discriminants are stable `repr(u8)`.
    pub fn state_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();

        hasher.update(b"M");
        for (device_id, entry) in self.membership.members() {
            hasher.update(device_id.as_bytes());
            hasher.update(&entry.pubkey);
            hasher.update(&[
                entry.role as u8,
                entry.accepted as u8,
                entry.removed as u8,
                entry.muted as u8,
                entry.rekey_required as u8,
            ]);
            hasher.update(&entry.invited_by.to_key_bytes());
            hasher.update(&(entry.reports.len() as u64).to_le_bytes());
            for reporter in entry.reports.keys() {
                hasher.update(reporter.as_bytes());
            }
        }

        hasher.update(b"G");
        for (msg_id, entry) in self.messages.messages() {
            hasher.update(msg_id);
            hasher.update(entry.author.as_bytes());
            hasher.update(&[entry.deleted as u8]);
            hasher.update(&entry.content_op.to_key_bytes());
            hasher.update(&(entry.content.ciphertext.len() as u64).to_le_bytes());
            hasher.update(&entry.content.ciphertext);
            for ((reactor, emoji), present) in &entry.reactions {
                hasher.update(reactor.as_bytes());
                hasher.update(&(emoji.len() as u64).to_le_bytes());
                hasher.update(emoji.as_bytes());
                hasher.update(&[*present as u8]);
            }
        }

        hasher.update(b"D");
        for (key, reg) in self.metadata.registers() {
            hasher.update(&[*key as u8]);
            hasher.update(&reg.writer_op.to_key_bytes());
            hasher.update(&reg.value.ciphertext);
        }

        hasher.update(b"V");
        for (id, _) in self.void_ops() {
            hasher.update(&id.to_key_bytes());
        }

        *hasher.finalize().as_bytes()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
