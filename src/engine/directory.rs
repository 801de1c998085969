/// Maps member public keys to transport addresses.
///
/// The contact list owns this mapping; the engine only asks for it when a
/// frame is addressed to a device.
use std::collections::HashMap;
use std::sync::RwLock;

use crate::sync::dispatcher::PeerAddress;

pub trait PeerDirectory: Send + Sync {
    fn address_for(&self, pubkey: &[u8; 32]) -> Option<PeerAddress>;
}

#[derive(Default)]
pub struct MemoryDirectory {
    addresses: RwLock<HashMap<[u8; 32], PeerAddress>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pubkey: [u8; 32], address: PeerAddress) {
        if let Ok(mut addresses) = self.addresses.write() {
            addresses.insert(pubkey, address);
        }
    }

    pub fn remove(&self, pubkey: &[u8; 32]) {
        if let Ok(mut addresses) = self.addresses.write() {
            addresses.remove(pubkey);
        }
    }
}

impl PeerDirectory for MemoryDirectory {
    fn address_for(&self, pubkey: &[u8; 32]) -> Option<PeerAddress> {
        self.addresses.read().ok()?.get(pubkey).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_remove() {
        let dir = MemoryDirectory::new();
        assert!(dir.address_for(&[1; 32]).is_none());
        dir.insert([1; 32], PeerAddress::new("abc.onion"));
        assert_eq!(dir.address_for(&[1; 32]), Some(PeerAddress::new("abc.onion")));
        dir.remove(&[1; 32]);
        assert!(dir.address_for(&[1; 32]).is_none());
    }
}
