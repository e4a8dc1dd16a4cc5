use std::collections::HashMap;

use meridian_types::PeerId;
use tokio::time::Instant;

/// One outstanding header or block request.
#[derive(Clone, Debug)]
pub struct SyncFlightInfo {
    pub height: u32,
    peer: PeerId,
    start: Instant,
    failed: HashMap<PeerId, u32>,
    total_failed: u32,
}

impl SyncFlightInfo {
    pub fn new(height: u32, peer: PeerId, now: Instant) -> Self {
        Self {
            height,
            peer,
            start: now,
            failed: HashMap::new(),
            total_failed: 0,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn set_peer(&mut self, peer: PeerId) {
        self.peer = peer;
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn reset_start(&mut self, now: Instant) {
        self.start = now;
    }

    /// Charge a timeout to the peer currently serving the request.
    pub fn mark_failed(&mut self) {
        *self.failed.entry(self.peer).or_insert(0) += 1;
        self.total_failed += 1;
    }

    pub fn failed_times(&self, peer: &PeerId) -> u32 {
        self.failed.get(peer).copied().unwrap_or(0)
    }

    pub fn total_failed(&self) -> u32 {
        self.total_failed
    }

    /// Pick who serves the request next from `ranked` (best first).
    ///
    /// The first eligible peer that never failed this request wins;
    /// otherwise the eligible peer with the fewest failures.
    pub fn next_peer(&self, ranked: &[(PeerId, u64)]) -> Option<PeerId> {
        let mut best: Option<(PeerId, u32)> = None;
        for (id, peer_height) in ranked {
            if u64::from(self.height) > *peer_height {
                continue;
            }
            let failed = self.failed_times(id);
            if failed == 0 {
                return Some(*id);
            }
            if best.map_or(true, |(_, f)| failed < f) {
                best = Some((*id, failed));
            }
        }
        best.map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> PeerId {
        PeerId::from_bytes([n; 20])
    }

    #[test]
    fn mark_failed_charges_current_peer() {
        let mut f = SyncFlightInfo::new(10, id(1), Instant::now());
        f.mark_failed();
        f.set_peer(id(2));
        f.mark_failed();
        f.mark_failed();
        assert_eq!(f.failed_times(&id(1)), 1);
        assert_eq!(f.failed_times(&id(2)), 2);
        assert_eq!(f.failed_times(&id(3)), 0);
        assert_eq!(f.total_failed(), 3);
    }

    #[test]
    fn next_peer_skips_failed_and_short_peers() {
        let mut f = SyncFlightInfo::new(10, id(1), Instant::now());
        f.mark_failed();
        let ranked = [(id(1), 20), (id(2), 5), (id(3), 10)];
        assert_eq!(f.next_peer(&ranked), Some(id(3)));
    }

    #[test]
    fn next_peer_falls_back_to_fewest_failures() {
        let mut f = SyncFlightInfo::new(10, id(1), Instant::now());
        f.mark_failed();
        f.mark_failed();
        f.set_peer(id(2));
        f.mark_failed();
        let ranked = [(id(1), 20), (id(2), 20)];
        assert_eq!(f.next_peer(&ranked), Some(id(2)));
        assert_eq!(f.next_peer(&[(id(9), 1)]), None);
    }
}
