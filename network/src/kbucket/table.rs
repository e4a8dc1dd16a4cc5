use std::collections::HashMap;

use meridian_types::{common_prefix_len, PeerId, PeerIdAddressPair};
use thiserror::Error;
use tokio::time::Instant;

use super::bucket::Bucket;

/// Largest CPL we generate random refresh targets for.
pub const MAX_CPL_FOR_REFRESH: usize = 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteTableError {
    #[error("peer rejected; insufficient capacity")]
    NoCapacity,
}

/// A CPL and the last time we searched for an id with that CPL.
#[derive(Clone, Copy, Debug)]
pub struct CplRefresh {
    pub cpl: usize,
    pub last_refresh_at: Instant,
}

pub type PeerCallback = Box<dyn Fn(PeerId) + Send + Sync>;

pub struct RouteTable {
    local: PeerId,
    buckets: Vec<Bucket>,
    bucket_size: usize,
    cpl_refreshed_at: HashMap<usize, Instant>,
    on_peer_added: PeerCallback,
    on_peer_removed: PeerCallback,
}

impl RouteTable {
    pub fn new(bucket_size: usize, local: PeerId) -> Self {
        Self {
            local,
            buckets: vec![Bucket::new()],
            bucket_size,
            cpl_refreshed_at: HashMap::new(),
            on_peer_added: Box::new(|_| {}),
            on_peer_removed: Box::new(|_| {}),
        }
    }

    pub fn set_peer_added(&mut self, f: PeerCallback) {
        self.on_peer_added = f;
    }

    pub fn set_peer_removed(&mut self, f: PeerCallback) {
        self.on_peer_removed = f;
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    fn bucket_index(&self, cpl: usize) -> usize {
        cpl.min(self.buckets.len() - 1)
    }

    /// Add `id` or move it to the front of its bucket.
    pub fn update(&mut self, id: PeerId, address: String) -> Result<(), RouteTableError> {
        let cpl = common_prefix_len(&id, &self.local);
        let mut idx = self.bucket_index(cpl);

        if self.buckets[idx].has(&id) {
            self.buckets[idx].move_to_front(&id, address);
            return Ok(());
        }

        let pair = PeerIdAddressPair { id, address };
        if self.buckets[idx].len() < self.bucket_size {
            self.buckets[idx].push_front(pair);
            (self.on_peer_added)(id);
            return Ok(());
        }

        if idx == self.buckets.len() - 1 {
            self.unfold_last_bucket();
            idx = self.bucket_index(cpl);
            if self.buckets[idx].len() >= self.bucket_size {
                return Err(RouteTableError::NoCapacity);
            }
            self.buckets[idx].push_front(pair);
            (self.on_peer_added)(id);
            return Ok(());
        }

        Err(RouteTableError::NoCapacity)
    }

    /// Split the last bucket, repeating while the new last bucket is still full.
    fn unfold_last_bucket(&mut self) {
        loop {
            let last = self.buckets.len() - 1;
            let local = self.local;
            let next = self.buckets[last].split(last, &local);
            let overflowing = next.len() >= self.bucket_size;
            self.buckets.push(next);
            if !overflowing {
                break;
            }
        }
    }

    pub fn remove(&mut self, id: &PeerId) {
        let idx = self.bucket_index(common_prefix_len(id, &self.local));
        if self.buckets[idx].remove(id) {
            (self.on_peer_removed)(*id);
        }
    }

    pub fn find(&self, id: &PeerId) -> Option<PeerIdAddressPair> {
        let idx = self.bucket_index(common_prefix_len(id, &self.local));
        self.buckets[idx].find(id).cloned()
    }

    /// Up to `count` known peers closest to `target`, nearest first.
    pub fn nearest_peers(&self, target: &PeerId, count: usize) -> Vec<PeerIdAddressPair> {
        let cpl = self.bucket_index(common_prefix_len(target, &self.local));

        let mut found: Vec<PeerIdAddressPair> = self.buckets[cpl].peers().cloned().collect();
        // Buckets to the right all share exactly `cpl` bits with the target
        // and are ordered only by their lower bits, so take every one.
        if found.len() < count {
            for bucket in &self.buckets[cpl + 1..] {
                found.extend(bucket.peers().cloned());
            }
        }
        // Buckets to the left share one bit fewer each.
        for bucket in self.buckets[..cpl].iter().rev() {
            if found.len() >= count {
                break;
            }
            found.extend(bucket.peers().cloned());
        }

        found.sort_by_key(|p| target.distance(&p.id));
        found.truncate(count);
        found
    }

    pub fn size(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn list_peers(&self) -> Vec<PeerIdAddressPair> {
        self.buckets
            .iter()
            .flat_map(|b| b.peers().cloned())
            .collect()
    }

    /// A random id sharing `cpl` leading bits with the local id.
    pub fn gen_rand_kad_id(&self, cpl: usize) -> PeerId {
        self.local.gen_rand_peer_id(cpl.min(MAX_CPL_FOR_REFRESH))
    }

    pub fn reset_cpl_refreshed_at(&mut self, id: &PeerId, at: Instant) {
        let cpl = common_prefix_len(id, &self.local);
        if cpl > MAX_CPL_FOR_REFRESH {
            return;
        }
        self.cpl_refreshed_at.insert(cpl, at);
    }

    pub fn tracked_cpls_for_refresh(&self) -> Vec<CplRefresh> {
        self.cpl_refreshed_at
            .iter()
            .map(|(cpl, at)| CplRefresh {
                cpl: *cpl,
                last_refresh_at: *at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn id_with_cpl(local: &PeerId, cpl: usize) -> PeerId {
        local.gen_rand_peer_id(cpl)
    }

    #[test]
    fn update_inserts_and_finds() {
        let local = PeerId::Canonical([0u8; 20]);
        let mut rt = RouteTable::new(4, local);
        let id = id_with_cpl(&local, 3);
        rt.update(id, "1.2.3.4:1".into()).unwrap();
        assert_eq!(rt.size(), 1);
        assert_eq!(rt.find(&id).unwrap().address, "1.2.3.4:1");
        rt.remove(&id);
        assert!(rt.find(&id).is_none());
    }

    #[test]
    fn last_bucket_unfolds_on_overflow() {
        let local = PeerId::Canonical([0u8; 20]);
        let mut rt = RouteTable::new(2, local);
        rt.update(id_with_cpl(&local, 0), "a".into()).unwrap();
        rt.update(id_with_cpl(&local, 1), "b".into()).unwrap();
        // Third peer overflows the single wildcard bucket; it splits.
        rt.update(id_with_cpl(&local, 2), "c".into()).unwrap();
        assert!(rt.buckets().len() >= 2);
        assert_eq!(rt.size(), 3);
        assert_eq!(rt.buckets()[0].len(), 1);
    }

    #[test]
    fn full_inner_bucket_rejects() {
        let local = PeerId::Canonical([0u8; 20]);
        let mut rt = RouteTable::new(1, local);
        rt.update(id_with_cpl(&local, 0), "a".into()).unwrap();
        rt.update(id_with_cpl(&local, 5), "b".into()).unwrap();
        assert_eq!(
            rt.update(id_with_cpl(&local, 0), "c".into()),
            Err(RouteTableError::NoCapacity)
        );
    }

    #[test]
    fn callbacks_fire_once_per_change() {
        let local = PeerId::Canonical([0u8; 20]);
        let mut rt = RouteTable::new(4, local);
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let a = added.clone();
        let r = removed.clone();
        rt.set_peer_added(Box::new(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        }));
        rt.set_peer_removed(Box::new(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        }));

        let id = id_with_cpl(&local, 1);
        rt.update(id, "x".into()).unwrap();
        rt.update(id, "x".into()).unwrap();
        rt.remove(&id);
        rt.remove(&id);
        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nearest_peers_sorted_by_distance() {
        let local = PeerId::Canonical([0u8; 20]);
        let mut rt = RouteTable::new(20, local);
        for cpl in 0..10 {
            rt.update(id_with_cpl(&local, cpl), format!("p{cpl}")).unwrap();
        }
        let target = id_with_cpl(&local, 4);
        let near = rt.nearest_peers(&target, 5);
        assert_eq!(near.len(), 5);
        for w in near.windows(2) {
            assert!(target.distance(&w[0].id) <= target.distance(&w[1].id));
        }
    }

    #[test]
    fn nearest_peer_may_sit_in_a_deeper_bucket() {
        let local = PeerId::Canonical([0u8; 20]);
        let mut rt = RouteTable::new(1, local);
        let mut bytes = [0u8; 20];
        for first in [0x40, 0x20, 0x10] {
            bytes[0] = first;
            rt.update(PeerId::Canonical(bytes), format!("{first:#x}")).unwrap();
        }
        assert_eq!(rt.buckets().len(), 4);

        bytes[0] = 0x80;
        let target = PeerId::Canonical(bytes);
        let near = rt.nearest_peers(&target, 1);
        bytes[0] = 0x10;
        assert_eq!(near[0].id, PeerId::Canonical(bytes));
    }

    #[test]
    fn refresh_ids_are_capped() {
        let local = PeerId::Canonical([0x33; 20]);
        let rt = RouteTable::new(20, local);
        let id = rt.gen_rand_kad_id(40);
        assert_eq!(common_prefix_len(&id, &local), MAX_CPL_FOR_REFRESH);
    }
}
