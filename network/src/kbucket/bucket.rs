use std::collections::VecDeque;

use meridian_types::{common_prefix_len, PeerId, PeerIdAddressPair};

/// Most recently seen peers sit at the front.
#[derive(Clone, Debug, Default)]
pub struct Bucket {
    peers: VecDeque<PeerIdAddressPair>,
}

impl Bucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, id: &PeerId) -> bool {
        self.peers.iter().any(|p| p.id == *id)
    }

    pub fn find(&self, id: &PeerId) -> Option<&PeerIdAddressPair> {
        self.peers.iter().find(|p| p.id == *id)
    }

    pub fn push_front(&mut self, pair: PeerIdAddressPair) {
        self.peers.push_front(pair);
    }

    /// Move `id` to the front. The address is refreshed as well.
    pub fn move_to_front(&mut self, id: &PeerId, address: String) {
        if let Some(pos) = self.peers.iter().position(|p| p.id == *id) {
            if let Some(mut pair) = self.peers.remove(pos) {
                pair.address = address;
                self.peers.push_front(pair);
            }
        }
    }

    pub fn remove(&mut self, id: &PeerId) -> bool {
        match self.peers.iter().position(|p| p.id == *id) {
            Some(pos) => {
                self.peers.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerIdAddressPair> {
        self.peers.iter()
    }

    /// Move every peer sharing more than `cpl` bits with `local` into a new
    /// bucket, keeping relative order in both.
    pub fn split(&mut self, cpl: usize, local: &PeerId) -> Bucket {
        let (stay, go): (VecDeque<_>, VecDeque<_>) = self
            .peers
            .drain(..)
            .partition(|p| common_prefix_len(&p.id, local) <= cpl);
        self.peers = stay;
        Bucket { peers: go }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(byte: u8) -> PeerIdAddressPair {
        let mut id = [0u8; 20];
        id[0] = byte;
        PeerIdAddressPair {
            id: PeerId::Canonical(id),
            address: format!("10.0.0.{byte}:20338"),
        }
    }

    #[test]
    fn move_to_front_reorders() {
        let mut b = Bucket::new();
        b.push_front(pair(1));
        b.push_front(pair(2));
        b.move_to_front(&pair(1).id, "10.9.9.9:1".into());
        let first = b.peers().next().unwrap();
        assert_eq!(first.id, pair(1).id);
        assert_eq!(first.address, "10.9.9.9:1");
    }

    #[test]
    fn split_moves_longer_prefixes() {
        let local = PeerId::Canonical([0u8; 20]);
        let mut b = Bucket::new();
        b.push_front(pair(0x80)); // cpl 0
        b.push_front(pair(0x40)); // cpl 1
        b.push_front(pair(0x01)); // cpl 7
        let moved = b.split(0, &local);
        assert_eq!(b.len(), 1);
        assert_eq!(moved.len(), 2);
        assert!(b.has(&pair(0x80).id));
        assert!(!b.remove(&pair(0x40).id));
    }
}
