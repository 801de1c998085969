//! Durable storage contracts for the op log and causal clocks.
//!
//! The application implements these (SQLCipher on mobile, IndexedDB on web).
//! The engine only ever appends raw envelope bytes and reads them back on
//! `load_group`; projections are always rebuilt from the log, never stored.
//!
//! Schema hint for SQLCipher:
//! ```sql
//! CREATE TABLE IF NOT EXISTS group_ops (
//!   group_id  BLOB NOT NULL,
//!   op_id     TEXT NOT NULL,
//!   envelope  BLOB NOT NULL,
//!   PRIMARY KEY (group_id, op_id)
//! );
//! CREATE TABLE IF NOT EXISTS group_clocks (
//!   group_id  BLOB NOT NULL,
//!   author    BLOB NOT NULL,
//!   lamport   INTEGER NOT NULL,
//!   PRIMARY KEY (group_id, author)
//! );
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use thiserror::Error;

use crate::crdt::ids::{DeviceID, GroupID, OpID};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Storage I/O error: {0}")]
    Io(String),
    #[error("Storage lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

// ---------------------------------------------------------------------------
// Contracts (app implements)
// ---------------------------------------------------------------------------

/// Append-only op log keyed by `(group, op_id)`.
///
/// `append` overwrites an existing key: the store replaces an envelope only
/// when resolving an equivocating op id.
pub trait OpLogStore: Send + Sync {
    fn append(&self, group: &GroupID, op_id: &OpID, envelope: &[u8]) -> Result<()>;

    /// Every stored envelope for the group, in any order.
    fn load(&self, group: &GroupID) -> Result<Vec<Vec<u8>>>;

    fn delete_group(&self, group: &GroupID) -> Result<()>;

    /// Groups with at least one stored op.
    fn groups(&self) -> Result<Vec<GroupID>>;
}

/// `(group, author) -> lamport` for the causal clock.
pub trait ClockStore: Send + Sync {
    fn load(&self, group: &GroupID, author: &DeviceID) -> Result<Option<u64>>;

    fn store(&self, group: &GroupID, author: &DeviceID, lamport: u64) -> Result<()>;

    fn delete_group(&self, group: &GroupID) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryOpLog {
    groups: Mutex<HashMap<GroupID, BTreeMap<OpID, Vec<u8>>>>,
}

impl MemoryOpLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op_count(&self, group: &GroupID) -> usize {
        self.groups
            .lock()
            .map(|g| g.get(group).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }
}

impl OpLogStore for MemoryOpLog {
    fn append(&self, group: &GroupID, op_id: &OpID, envelope: &[u8]) -> Result<()> {
        let mut groups = self.groups.lock().map_err(|_| PersistenceError::Poisoned)?;
        groups
            .entry(*group)
            .or_default()
            .insert(*op_id, envelope.to_vec());
        Ok(())
    }

    fn load(&self, group: &GroupID) -> Result<Vec<Vec<u8>>> {
        let groups = self.groups.lock().map_err(|_| PersistenceError::Poisoned)?;
        Ok(groups
            .get(group)
            .map(|ops| ops.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_group(&self, group: &GroupID) -> Result<()> {
        let mut groups = self.groups.lock().map_err(|_| PersistenceError::Poisoned)?;
        groups.remove(group);
        Ok(())
    }

    fn groups(&self) -> Result<Vec<GroupID>> {
        let groups = self.groups.lock().map_err(|_| PersistenceError::Poisoned)?;
        Ok(groups.keys().copied().collect())
    }
}

#[derive(Default)]
pub struct MemoryClockStore {
    clocks: Mutex<HashMap<(GroupID, DeviceID), u64>>,
}

impl MemoryClockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClockStore for MemoryClockStore {
    fn load(&self, group: &GroupID, author: &DeviceID) -> Result<Option<u64>> {
        let clocks = self.clocks.lock().map_err(|_| PersistenceError::Poisoned)?;
        Ok(clocks.get(&(*group, *author)).copied())
    }

    fn store(&self, group: &GroupID, author: &DeviceID, lamport: u64) -> Result<()> {
        let mut clocks = self.clocks.lock().map_err(|_| PersistenceError::Poisoned)?;
        clocks.insert((*group, *author), lamport);
        Ok(())
    }

    fn delete_group(&self, group: &GroupID) -> Result<()> {
        let mut clocks = self.clocks.lock().map_err(|_| PersistenceError::Poisoned)?;
        clocks.retain(|(g, _), _| g != group);
        Ok(())
    }
}
