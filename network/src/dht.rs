//! Thread-safe wrapper around the routing table used by discovery.

use std::time::Duration;

use meridian_types::{PeerId, PeerIdAddressPair};
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::kbucket::{PeerCallback, RouteTable, RouteTableError};

/// Peers per k-bucket.
pub const BUCKET_SIZE: usize = 20;

/// Concurrency factor of a lookup: how many closer peers we ask at once.
pub const ALPHA: usize = 3;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

pub struct Dht {
    local: PeerId,
    table: RwLock<RouteTable>,
    refresh_interval: Duration,
}

impl Dht {
    pub fn new(local: PeerId) -> Self {
        Self::with_options(local, BUCKET_SIZE, DEFAULT_REFRESH_INTERVAL)
    }

    pub fn with_options(local: PeerId, bucket_size: usize, refresh_interval: Duration) -> Self {
        Self {
            local,
            table: RwLock::new(RouteTable::new(bucket_size, local)),
            refresh_interval,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn set_callbacks(&self, added: PeerCallback, removed: PeerCallback) {
        let mut table = self.table.write();
        table.set_peer_added(added);
        table.set_peer_removed(removed);
    }

    pub fn update(&self, id: PeerId, address: String) -> Result<(), RouteTableError> {
        let mut table = self.table.write();
        table.update(id, address)?;
        table.reset_cpl_refreshed_at(&id, Instant::now());
        Ok(())
    }

    pub fn remove(&self, id: &PeerId) {
        self.table.write().remove(id);
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.table.read().find(id).is_some()
    }

    /// Up to `count` peers closer to `target`, never including ourselves or
    /// the target.
    pub fn better_peers(&self, target: &PeerId, count: usize) -> Vec<PeerIdAddressPair> {
        let table = self.table.read();
        table
            .nearest_peers(target, count + 2)
            .into_iter()
            .filter(|p| p.id != self.local && p.id != *target)
            .take(count)
            .collect()
    }

    pub fn list_peers(&self) -> Vec<PeerIdAddressPair> {
        self.table.read().list_peers()
    }

    pub fn size(&self) -> usize {
        self.table.read().size()
    }

    pub fn bucket_count(&self) -> usize {
        self.table.read().buckets().len()
    }

    pub fn gen_rand_kad_id(&self, cpl: usize) -> PeerId {
        self.table.read().gen_rand_kad_id(cpl)
    }

    pub fn reset_cpl_refreshed_at(&self, id: &PeerId) {
        self.table.write().reset_cpl_refreshed_at(id, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn better_peers_skips_target_and_self() {
        let local = PeerId::Canonical([0u8; 20]);
        let dht = Dht::new(local);
        let target = local.gen_rand_peer_id(6);
        dht.update(target, "t".into()).unwrap();
        for cpl in 0..8 {
            dht.update(local.gen_rand_peer_id(cpl), format!("p{cpl}")).unwrap();
        }
        let closer = dht.better_peers(&target, ALPHA);
        assert_eq!(closer.len(), ALPHA);
        assert!(closer.iter().all(|p| p.id != target && p.id != local));
    }

    #[test]
    fn contains_tracks_update_and_remove() {
        let local = PeerId::Canonical([7u8; 20]);
        let dht = Dht::new(local);
        let peer = PeerId::Pseudo(99);
        dht.update(peer, "127.0.0.1:20338".into()).unwrap();
        assert!(dht.contains(&peer));
        dht.remove(&peer);
        assert!(!dht.contains(&peer));
    }
}
