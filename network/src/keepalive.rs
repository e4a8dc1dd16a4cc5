//! Heartbeat: ping every session and drop the silent ones.

use std::sync::Arc;
use std::time::Duration;

use meridian_messages::Message;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::ledger::Ledger;
use crate::net::Network;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(45);

pub struct Keepalive {
    net: Arc<dyn Network>,
    ledger: Arc<dyn Ledger>,
    interval: Duration,
    timeout: Duration,
}

impl Keepalive {
    pub fn new(net: Arc<dyn Network>, ledger: Arc<dyn Ledger>) -> Self {
        Self::with_intervals(net, ledger, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_KEEPALIVE_TIMEOUT)
    }

    pub fn with_intervals(
        net: Arc<dyn Network>,
        ledger: Arc<dyn Ledger>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            net,
            ledger,
            interval,
            timeout,
        }
    }

    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + me.interval, me.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => me.tick(),
                }
            }
        })
    }

    /// One heartbeat round.
    pub fn tick(&self) {
        let height = u64::from(self.ledger.current_block_height());
        self.net.set_local_height(height);
        let now = Instant::now();
        for info in self.net.connected_peers() {
            let silent = self
                .net
                .last_contact(&info.id)
                .is_some_and(|t| now.saturating_duration_since(t) > self.timeout);
            if silent {
                tracing::warn!(peer = %info.id, addr = %info.addr, "keepalive timeout");
                self.net.disconnect(&info.id);
                continue;
            }
            if let Err(e) = self.net.send_to(&info.id, Message::Ping { height }) {
                tracing::debug!(peer = %info.id, error = %e, "ping not sent");
            }
        }
    }
}
