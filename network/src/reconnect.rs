//! Keeps the node online: dials seeds while outbound connectivity is low
//! and retries peers we lost a bounded number of times.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use meridian_protocol::PeerInfo;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::net::Network;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(6);
pub const DEFAULT_MIN_OUTBOUND: usize = 4;

/// Dial attempts for a lost peer before it is forgotten.
pub const MAX_RETRY_COUNT: u32 = 3;

pub struct ReconnectService {
    net: Arc<dyn Network>,
    seeds: Vec<String>,
    min_outbound: usize,
    interval: Duration,
    /// Listen address of lost peers and the attempts made so far.
    retry: Mutex<HashMap<String, u32>>,
}

impl ReconnectService {
    pub fn new(net: Arc<dyn Network>, seeds: Vec<String>) -> Self {
        Self {
            net,
            seeds,
            min_outbound: DEFAULT_MIN_OUTBOUND,
            interval: DEFAULT_RECONNECT_INTERVAL,
            retry: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_min_outbound(mut self, min_outbound: usize) -> Self {
        self.min_outbound = min_outbound;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            // seeds are dialed right away
            let mut tick = interval_at(Instant::now(), me.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => me.tick(),
                }
            }
        })
    }

    pub fn on_add_peer(&self, info: &PeerInfo) {
        self.retry.lock().remove(&info.remote_listen_address());
    }

    pub fn on_del_peer(&self, info: &PeerInfo) {
        if info.port == 0 {
            return;
        }
        let addr = info.remote_listen_address();
        tracing::info!(peer = %info.id, addr = %addr, "scheduling reconnect");
        self.retry.lock().entry(addr).or_insert(0);
    }

    pub fn retry_count(&self, addr: &str) -> Option<u32> {
        self.retry.lock().get(addr).copied()
    }

    pub fn tick(&self) {
        let connected: HashSet<String> = self
            .net
            .connected_peers()
            .iter()
            .map(|p| p.remote_listen_address())
            .collect();

        if self.net.outbound_count() < self.min_outbound {
            for seed in &self.seeds {
                if !connected.contains(seed) {
                    tracing::debug!(seed = %seed, "dialing seed");
                    self.net.connect(seed.clone());
                }
            }
        }

        let due: Vec<String> = {
            let mut retry = self.retry.lock();
            retry.retain(|addr, _| !connected.contains(addr));
            let due = retry.keys().cloned().collect();
            for attempts in retry.values_mut() {
                *attempts += 1;
            }
            retry.retain(|_, attempts| *attempts < MAX_RETRY_COUNT);
            due
        };
        for addr in due {
            tracing::debug!(addr = %addr, "retrying lost peer");
            self.net.connect(addr);
        }
    }
}
