/// Append-only op store for one group.
///
/// Deduplicates by OpID, rejects bad signatures (remembering them in an LRU
/// so replays cost one hash, not one signature check), buffers ops whose
/// `deps` have not arrived yet and releases them once they do, and resolves
/// equivocation (two envelopes with one OpID) to the smaller content hash.
///
/// Every stored op is persisted through [`OpLogStore`] before `append`
/// reports it.
use lru::LruCache;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::crdt::clock::missing_dependencies;
use crate::crdt::ids::{DeviceID, GroupID, OpID};
use crate::crdt::limits::REJECTED_OP_CACHE_SIZE;
use crate::crdt::ops::{verify_operation, OpEnvelope, OpError};
use crate::persistence::{MemoryOpLog, OpLogStore, PersistenceError};
use crate::sync::digest::{AuthorSummary, SyncDigest};

/// Default bound on buffered ops when the caller does not configure one.
const DEFAULT_MAX_PENDING: usize = 1_024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Op belongs to group {got}, store holds {expected}")]
    WrongGroup { expected: GroupID, got: GroupID },

    #[error("Op encoding failed: {0}")]
    Op(#[from] OpError),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendResult {
    Accepted,
    DuplicateIgnored,
    RejectedInvalidSignature,
    BufferedAwaitingDependency { missing: Vec<OpID> },
}

impl AppendResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppendResult::Accepted => "Accepted",
            AppendResult::DuplicateIgnored => "DuplicateIgnored",
            AppendResult::RejectedInvalidSignature => "RejectedInvalidSignature",
            AppendResult::BufferedAwaitingDependency { .. } => "BufferedAwaitingDependency",
        }
    }
}

/// What an append changed, for the projection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendReport {
    pub result: AppendResult,
    /// Ops newly stored by this call: the op itself if accepted, then any
    /// buffered ops it released, in release order.
    pub stored: Vec<OpID>,
    /// An existing envelope was replaced (equivocation). Forces a full replay.
    pub replaced: bool,
}

impl AppendReport {
    fn only(result: AppendResult) -> Self {
        AppendReport {
            result,
            stored: Vec::new(),
            replaced: false,
        }
    }
}

/// A buffered op as shown to the UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingInfo {
    pub op_id: OpID,
    pub missing: Vec<OpID>,
    pub waiting: Duration,
    /// Dropped from the buffer after the dependency timeout. A re-delivery
    /// (sync or fetch) brings it back.
    pub expired: bool,
}

// ---------------------------------------------------------------------------
// OpStore
// ---------------------------------------------------------------------------

struct StoredOp {
    op: OpEnvelope,
    content_hash: [u8; 32],
}

struct PendingOp {
    op: OpEnvelope,
    content_hash: [u8; 32],
    missing: BTreeSet<OpID>,
    received_at: Instant,
}

pub struct OpStore {
    group_id: GroupID,
    ops: BTreeMap<OpID, StoredOp>,
    by_author: BTreeMap<DeviceID, BTreeSet<OpID>>,
    pending: BTreeMap<OpID, PendingOp>,
    /// missing dep -> buffered ops waiting on it
    waiting: BTreeMap<OpID, BTreeSet<OpID>>,
    /// expired op -> the deps it was still missing
    expired: BTreeMap<OpID, (Vec<OpID>, Instant)>,
    rejected: LruCache<[u8; 32], ()>,
    log: Arc<dyn OpLogStore>,
    max_pending_ops: usize,
}

impl OpStore {
    pub fn new(group_id: GroupID, log: Arc<dyn OpLogStore>, max_pending_ops: usize) -> Self {
        let cache_size = NonZeroUsize::new(REJECTED_OP_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        OpStore {
            group_id,
            ops: BTreeMap::new(),
            by_author: BTreeMap::new(),
            pending: BTreeMap::new(),
            waiting: BTreeMap::new(),
            expired: BTreeMap::new(),
            rejected: LruCache::new(cache_size),
            log,
            max_pending_ops: max_pending_ops.max(1),
        }
    }

    /// Store backed by a throwaway in-memory log.
    pub fn in_memory(group_id: GroupID) -> Self {
        OpStore::new(group_id, Arc::new(MemoryOpLog::new()), DEFAULT_MAX_PENDING)
    }

    /// Rebuild from the durable log. Undecodable or badly signed rows are
    /// skipped with a warning; nothing is re-persisted.
    pub fn load(
        group_id: GroupID,
        log: Arc<dyn OpLogStore>,
        max_pending_ops: usize,
    ) -> Result<Self, StoreError> {
        let rows = log.load(&group_id)?;
        let mut store = OpStore::new(group_id, log, max_pending_ops);
        let now = Instant::now();
        for row in rows {
            match OpEnvelope::from_bytes(&row) {
                Ok(op) => {
                    let report = store.append_inner(op, now, false)?;
                    if report.result == AppendResult::RejectedInvalidSignature {
                        log::warn!("opStore: skipped stored op with invalid signature");
                    }
                }
                Err(e) => log::warn!("opStore: skipped undecodable stored op: {}", e),
            }
        }
        Ok(store)
    }

    pub fn group_id(&self) -> &GroupID {
        &self.group_id
    }

    /// Append an op received or authored at `now`.
    pub fn append(&mut self, op: OpEnvelope, now: Instant) -> Result<AppendReport, StoreError> {
        self.append_inner(op, now, true)
    }

    fn append_inner(
        &mut self,
        op: OpEnvelope,
        now: Instant,
        persist: bool,
    ) -> Result<AppendReport, StoreError> {
        if op.group_id != self.group_id {
            return Err(StoreError::WrongGroup {
                expected: self.group_id,
                got: op.group_id,
            });
        }

        let hash = op.content_hash()?;
        let existing_hash = self.ops.get(&op.op_id).map(|s| s.content_hash);
        if existing_hash == Some(hash) {
            return Ok(AppendReport::only(AppendResult::DuplicateIgnored));
        }
        if self.rejected.get(&hash).is_some() {
            return Ok(AppendReport::only(AppendResult::RejectedInvalidSignature));
        }
        if !verify_operation(&op) {
            log::warn!("opStore: rejected op {:?}: invalid signature", op.op_id);
            self.rejected.put(hash, ());
            return Ok(AppendReport::only(AppendResult::RejectedInvalidSignature));
        }

        if let Some(existing_hash) = existing_hash {
            return self.resolve_equivocation(op, hash, existing_hash, persist);
        }

        if let Some(buffered) = self.pending.get(&op.op_id) {
            if hash < buffered.content_hash {
                log::warn!("opStore: equivocating buffered op {:?}", op.op_id);
                let missing = buffered.missing.iter().copied().collect();
                if let Some(p) = self.pending.get_mut(&op.op_id) {
                    p.op = op;
                    p.content_hash = hash;
                }
                return Ok(AppendReport::only(
                    AppendResult::BufferedAwaitingDependency { missing },
                ));
            }
            return Ok(AppendReport::only(AppendResult::DuplicateIgnored));
        }

        let missing = missing_dependencies(&op, self);
        if !missing.is_empty() {
            self.buffer(op, hash, &missing, now);
            return Ok(AppendReport::only(
                AppendResult::BufferedAwaitingDependency { missing },
            ));
        }

        let op_id = op.op_id;
        self.insert(op, hash, persist)?;
        let mut stored = vec![op_id];
        self.release_waiting(op_id, persist, &mut stored)?;
        Ok(AppendReport {
            result: AppendResult::Accepted,
            stored,
            replaced: false,
        })
    }

    fn resolve_equivocation(
        &mut self,
        op: OpEnvelope,
        hash: [u8; 32],
        existing_hash: [u8; 32],
        persist: bool,
    ) -> Result<AppendReport, StoreError> {
        log::warn!(
            "opStore: equivocation on {:?} ({} vs {})",
            op.op_id,
            hex::encode(&existing_hash[..8]),
            hex::encode(&hash[..8]),
        );
        if hash >= existing_hash {
            return Ok(AppendReport::only(AppendResult::DuplicateIgnored));
        }
        let op_id = op.op_id;
        if persist {
            self.log.append(&self.group_id, &op_id, &op.to_bytes()?)?;
        }
        self.ops.insert(
            op_id,
            StoredOp {
                op,
                content_hash: hash,
            },
        );
        Ok(AppendReport {
            result: AppendResult::Accepted,
            stored: vec![op_id],
            replaced: true,
        })
    }

    fn insert(&mut self, op: OpEnvelope, hash: [u8; 32], persist: bool) -> Result<(), StoreError> {
        if persist {
            self.log.append(&self.group_id, &op.op_id, &op.to_bytes()?)?;
        }
        self.expired.remove(&op.op_id);
        self.by_author
            .entry(op.author())
            .or_default()
            .insert(op.op_id);
        self.ops.insert(
            op.op_id,
            StoredOp {
                op,
                content_hash: hash,
            },
        );
        Ok(())
    }

    fn buffer(&mut self, op: OpEnvelope, hash: [u8; 32], missing: &[OpID], now: Instant) {
        if self.pending.len() >= self.max_pending_ops {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, p)| p.received_at)
                .map(|(id, _)| *id);
            if let Some(oldest) = oldest {
                log::warn!("opStore: pending buffer full, evicting {:?}", oldest);
                self.drop_pending(&oldest);
            }
        }

        let op_id = op.op_id;
        for dep in missing {
            self.waiting.entry(*dep).or_default().insert(op_id);
        }
        self.expired.remove(&op_id);
        self.pending.insert(
            op_id,
            PendingOp {
                op,
                content_hash: hash,
                missing: missing.iter().copied().collect(),
                received_at: now,
            },
        );
    }

    fn drop_pending(&mut self, op_id: &OpID) -> Option<PendingOp> {
        let pending = self.pending.remove(op_id)?;
        for dep in &pending.missing {
            if let Some(waiters) = self.waiting.get_mut(dep) {
                waiters.remove(op_id);
                if waiters.is_empty() {
                    self.waiting.remove(dep);
                }
            }
        }
        Some(pending)
    }

    fn release_waiting(
        &mut self,
        accepted: OpID,
        persist: bool,
        stored: &mut Vec<OpID>,
    ) -> Result<(), StoreError> {
        let mut queue = VecDeque::from([accepted]);
        while let Some(id) = queue.pop_front() {
            let Some(waiters) = self.waiting.remove(&id) else {
                continue;
            };
            for waiter in waiters {
                let ready = match self.pending.get_mut(&waiter) {
                    Some(p) => {
                        p.missing.remove(&id);
                        p.missing.is_empty()
                    }
                    None => false,
                };
                if !ready {
                    continue;
                }
                if let Some(p) = self.pending.remove(&waiter) {
                    log::debug!("opStore: released {:?}", waiter);
                    self.insert(p.op, p.content_hash, persist)?;
                    stored.push(waiter);
                    queue.push_back(waiter);
                }
            }
        }
        Ok(())
    }

    /// Drop buffered ops older than `timeout`. Returns the expired ids.
    pub fn expire_pending(&mut self, now: Instant, timeout: Duration) -> Vec<OpID> {
        let stale: Vec<OpID> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.received_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            if let Some(p) = self.drop_pending(id) {
                log::warn!(
                    "opStore: {:?} expired waiting for {} dependencies",
                    id,
                    p.missing.len()
                );
                self.expired
                    .insert(*id, (p.missing.into_iter().collect(), p.received_at));
            }
        }
        while self.expired.len() > self.max_pending_ops {
            self.expired.pop_first();
        }
        stale
    }

    pub fn pending_dependencies(&self, now: Instant) -> Vec<PendingInfo> {
        let buffered = self.pending.iter().map(|(id, p)| PendingInfo {
            op_id: *id,
            missing: p.missing.iter().copied().collect(),
            waiting: now.saturating_duration_since(p.received_at),
            expired: false,
        });
        let expired = self.expired.iter().map(|(id, (missing, since))| PendingInfo {
            op_id: *id,
            missing: missing.clone(),
            waiting: now.saturating_duration_since(*since),
            expired: true,
        });
        buffered.chain(expired).collect()
    }

    /// Dependencies some buffered op is waiting for that are neither stored
    /// nor buffered themselves.
    pub fn wanted_dependencies(&self) -> Vec<OpID> {
        self.waiting
            .keys()
            .filter(|id| !self.ops.contains_key(id) && !self.pending.contains_key(id))
            .copied()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn contains(&self, op_id: &OpID) -> bool {
        self.ops.contains_key(op_id)
    }

    pub fn is_pending(&self, op_id: &OpID) -> bool {
        self.pending.contains_key(op_id)
    }

    pub fn get(&self, op_id: &OpID) -> Option<&OpEnvelope> {
        self.ops.get(op_id).map(|s| &s.op)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Stored ops in OpID order.
    pub fn ops(&self) -> impl Iterator<Item = &OpEnvelope> {
        self.ops.values().map(|s| &s.op)
    }

    pub fn ops_by_author(&self, author: &DeviceID) -> impl Iterator<Item = &OpEnvelope> {
        self.by_author
            .get(author)
            .into_iter()
            .flatten()
            .filter_map(|id| self.get(id))
    }

    // -----------------------------------------------------------------------
    // Sync support
    // -----------------------------------------------------------------------

    pub fn digest(&self) -> SyncDigest {
        SyncDigest::from_index(&self.by_author)
    }

    /// Ops a peer with `peer` digest lacks, in OpID order.
    ///
    /// Per author: nothing if the hashes agree or the peer's summary covers
    /// ours (it reaches our max lamport with at least as many ops); only ops
    /// above the peer's max lamport when the peer holds exactly our prefix up
    /// to that lamport; otherwise every op of that author (the peer
    /// deduplicates).
    pub fn get_missing(&self, peer: &SyncDigest) -> Vec<OpID> {
        let mut out = Vec::new();
        for (author, ids) in &self.by_author {
            match peer.authors.get(author) {
                None => out.extend(ids.iter().copied()),
                Some(theirs) => {
                    let ours = AuthorSummary::of(ids);
                    if ours.ids_hash == theirs.ids_hash {
                        continue;
                    }
                    if theirs.max_lamport >= ours.max_lamport && theirs.count >= ours.count {
                        continue;
                    }
                    let prefix = AuthorSummary::of(
                        ids.iter().take_while(|id| id.lamport <= theirs.max_lamport),
                    );
                    if prefix == *theirs {
                        out.extend(ids.iter().filter(|id| id.lamport > theirs.max_lamport));
                    } else {
                        out.extend(ids.iter().copied());
                    }
                }
            }
        }
        out.sort();
        out
    }
}

impl fmt::Debug for OpStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpStore")
            .field("group_id", &self.group_id)
            .field("ops", &self.ops.len())
            .field("pending", &self.pending.len())
            .field("expired", &self.expired.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
