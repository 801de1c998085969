/// Per-group Lamport clock and the causal delivery check.
///
/// `next_lamport` is `max(local, observed for self, observed for anyone) + 1`,
/// so a local op always sorts after everything this device has seen. This is
/// what puts an accept after its invite and a reply after the message it
/// answers in the `(lamport, author, nonce)` order.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::crdt::ids::{DeviceID, GroupID, OpID};
use crate::crdt::ops::OpEnvelope;
use crate::crdt::store::OpStore;
use crate::persistence::{ClockStore, PersistenceError};

pub struct CausalClock {
    group_id: GroupID,
    local: DeviceID,
    local_counter: u64,
    observed: BTreeMap<DeviceID, u64>,
    store: Arc<dyn ClockStore>,
}

impl CausalClock {
    /// Restore the local counter from the clock store (0 for a new group).
    pub fn load(
        group_id: GroupID,
        local: DeviceID,
        store: Arc<dyn ClockStore>,
    ) -> Result<Self, PersistenceError> {
        let local_counter = store.load(&group_id, &local)?.unwrap_or(0);
        Ok(CausalClock {
            group_id,
            local,
            local_counter,
            observed: BTreeMap::new(),
            store,
        })
    }

    /// Record an op's lamport for its author.
    pub fn observe(&mut self, op: &OpEnvelope) {
        let author = op.author();
        let entry = self.observed.entry(author).or_insert(0);
        *entry = (*entry).max(op.lamport);

        // Our own op coming back from a peer (e.g. after a reinstall) must
        // push the counter forward or the next op would reuse its lamport.
        if author == self.local && op.lamport > self.local_counter {
            self.local_counter = op.lamport;
            if let Err(e) = self.store.store(&self.group_id, &self.local, op.lamport) {
                log::warn!("clock: failed to persist observed lamport: {}", e);
            }
        }
    }

    /// Next lamport for a local op. Persisted before it is returned.
    pub fn next_lamport(&mut self) -> Result<u64, PersistenceError> {
        let next = self
            .local_counter
            .max(self.highest_observed(&self.local))
            .max(self.max_observed())
            + 1;
        self.store.store(&self.group_id, &self.local, next)?;
        self.local_counter = next;
        Ok(next)
    }

    pub fn local_counter(&self) -> u64 {
        self.local_counter
    }

    pub fn highest_observed(&self, author: &DeviceID) -> u64 {
        self.observed.get(author).copied().unwrap_or(0)
    }

    pub fn max_observed(&self) -> u64 {
        self.observed.values().copied().max().unwrap_or(0)
    }

    pub fn observed(&self) -> &BTreeMap<DeviceID, u64> {
        &self.observed
    }
}

impl fmt::Debug for CausalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CausalClock")
            .field("group_id", &self.group_id)
            .field("local", &self.local)
            .field("local_counter", &self.local_counter)
            .field("observed", &self.observed)
            .finish()
    }
}

/// Dependencies of `op` not yet in the store, in id order.
pub fn missing_dependencies(op: &OpEnvelope, store: &OpStore) -> Vec<OpID> {
    let mut missing: Vec<OpID> = op
        .deps
        .iter()
        .filter(|dep| !store.contains(dep))
        .copied()
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

/// True once every dependency of `op` is stored.
pub fn is_deliverable(op: &OpEnvelope, store: &OpStore) -> bool {
    op.deps.iter().all(|dep| store.contains(dep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::ops::{MessageDeletePayload, OpType};
    use crate::crypto::signing::SigningKeyPair;
    use crate::persistence::MemoryClockStore;

    fn op_at(signer: &SigningKeyPair, gid: GroupID, lamport: u64, deps: Vec<OpID>) -> OpEnvelope {
        OpEnvelope::create_signed(
            gid,
            OpType::MessageDelete,
            &MessageDeletePayload { msg_id: [0; 32] },
            deps,
            lamport,
            lamport,
            signer,
        )
        .unwrap()
    }

    #[test]
    fn test_next_lamport_monotonic_and_persisted() {
        let gid = GroupID::from_bytes([1; 32]);
        let me = DeviceID::from_bytes([1; 16]);
        let store = Arc::new(MemoryClockStore::new());

        let mut clock = CausalClock::load(gid, me, store.clone()).unwrap();
        assert_eq!(clock.next_lamport().unwrap(), 1);
        assert_eq!(clock.next_lamport().unwrap(), 2);
        assert_eq!(store.load(&gid, &me).unwrap(), Some(2));

        // restart resumes after the persisted value
        let mut restarted = CausalClock::load(gid, me, store).unwrap();
        assert_eq!(restarted.next_lamport().unwrap(), 3);
    }

    #[test]
    fn test_next_lamport_jumps_past_observed() {
        let peer = SigningKeyPair::generate();
        let gid = GroupID::from_bytes([2; 32]);
        let me = DeviceID::from_bytes([9; 16]);
        let mut clock = CausalClock::load(gid, me, Arc::new(MemoryClockStore::new())).unwrap();

        clock.observe(&op_at(&peer, gid, 41, vec![]));
        assert_eq!(clock.max_observed(), 41);
        assert_eq!(clock.next_lamport().unwrap(), 42);
    }

    #[test]
    fn test_observing_own_op_advances_local_counter() {
        let me = SigningKeyPair::generate();
        let gid = GroupID::from_bytes([3; 32]);
        let dev = DeviceID::from_pubkey(&me.public());
        let store = Arc::new(MemoryClockStore::new());
        let mut clock = CausalClock::load(gid, dev, store.clone()).unwrap();

        clock.observe(&op_at(&me, gid, 10, vec![]));
        assert_eq!(clock.local_counter(), 10);
        assert_eq!(store.load(&gid, &dev).unwrap(), Some(10));
        assert_eq!(clock.next_lamport().unwrap(), 11);
    }

    #[test]
    fn test_deliverable_tracks_store() {
        let signer = SigningKeyPair::generate();
        let gid = GroupID::from_bytes([4; 32]);
        let mut store = OpStore::in_memory(gid);

        let first = op_at(&signer, gid, 1, vec![]);
        let second = op_at(&signer, gid, 2, vec![first.op_id]);

        assert!(is_deliverable(&first, &store));
        assert!(!is_deliverable(&second, &store));
        assert_eq!(missing_dependencies(&second, &store), vec![first.op_id]);

        store.append(first, std::time::Instant::now()).unwrap();
        assert!(is_deliverable(&second, &store));
        assert!(missing_dependencies(&second, &store).is_empty());
    }
}
