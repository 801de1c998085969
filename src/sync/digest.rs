/// Per-author summaries of an op log, exchanged to compute sync deltas.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::crdt::ids::{DeviceID, OpID};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthorSummary {
    pub max_lamport: u64,
    pub count: u64,
    /// BLAKE3 over the author's op ids in ascending order.
    pub ids_hash: [u8; 32],
}

impl AuthorSummary {
    pub fn of<'a>(ids: impl IntoIterator<Item = &'a OpID>) -> Self {
        let mut hasher = blake3::Hasher::new();
        let mut max_lamport = 0;
        let mut count = 0;
        for id in ids {
            hasher.update(&id.to_key_bytes());
            max_lamport = max_lamport.max(id.lamport);
            count += 1;
        }
        AuthorSummary {
            max_lamport,
            count,
            ids_hash: *hasher.finalize().as_bytes(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncDigest {
    pub authors: BTreeMap<DeviceID, AuthorSummary>,
}

impl SyncDigest {
    pub fn from_index(by_author: &BTreeMap<DeviceID, BTreeSet<OpID>>) -> Self {
        SyncDigest {
            authors: by_author
                .iter()
                .map(|(author, ids)| (*author, AuthorSummary::of(ids)))
                .collect(),
        }
    }

    pub fn total_ops(&self) -> u64 {
        self.authors.values().map(|s| s.count).sum()
    }

    /// True when `other` lists an author we lack, or a summary that we
    /// cannot reproduce from our own ids.
    pub fn is_missing_from(&self, other: &SyncDigest) -> bool {
        other.authors.iter().any(|(author, theirs)| {
            self.authors
                .get(author)
                .map_or(true, |ours| ours.ids_hash != theirs.ids_hash && !covers(ours, theirs))
        })
    }
}

/// Our summary strictly extends theirs: more ops, higher max. The exact
/// prefix check happens in the store, this is only the cheap test.
fn covers(ours: &AuthorSummary, theirs: &AuthorSummary) -> bool {
    ours.count > theirs.count && ours.max_lamport > theirs.max_lamport
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(author: DeviceID, lamports: &[u64]) -> BTreeSet<OpID> {
        lamports.iter().map(|l| OpID::new(author, *l, *l)).collect()
    }

    #[test]
    fn test_summary_fields() {
        let a = DeviceID::from_bytes([1; 16]);
        let s = AuthorSummary::of(&ids(a, &[1, 4, 9]));
        assert_eq!(s.count, 3);
        assert_eq!(s.max_lamport, 9);
        assert_ne!(s.ids_hash, AuthorSummary::of(&ids(a, &[1, 4])).ids_hash);
    }

    #[test]
    fn test_is_missing_from() {
        let a = DeviceID::from_bytes([1; 16]);
        let b = DeviceID::from_bytes([2; 16]);

        let mut small = BTreeMap::new();
        small.insert(a, ids(a, &[1, 2]));
        let mut big = small.clone();
        big.insert(a, ids(a, &[1, 2, 3]));
        big.insert(b, ids(b, &[5]));

        let small = SyncDigest::from_index(&small);
        let big = SyncDigest::from_index(&big);

        assert!(small.is_missing_from(&big));
        assert!(!big.is_missing_from(&small));
        assert!(!big.is_missing_from(&big));
        assert_eq!(big.total_ops(), 4);
    }
}
