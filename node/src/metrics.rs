//! Prometheus metrics for the P2P layer.
//!
//! [`P2pMetrics`] owns a dedicated [`Registry`]; gauges are refreshed from
//! the live components by [`P2pMetrics::sample`] and the whole registry can
//! be rendered in the text exposition format with [`P2pMetrics::encode`].

use std::sync::atomic::Ordering;

use meridian_network::{BlockSyncMgr, Ledger, NetServer, NetStats, Network};
use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, IntCounter,
    IntGauge, Opts, Registry, TextEncoder,
};

use crate::NodeError;

pub struct P2pMetrics {
    pub registry: Registry,

    // ── Connections ─────────────────────────────────────────────────────
    pub connected_peers: IntGauge,
    pub inbound_peers: IntGauge,
    pub outbound_peers: IntGauge,
    pub rejected_connections: IntCounter,
    pub handshake_failures: IntCounter,

    // ── Sync ────────────────────────────────────────────────────────────
    pub header_height: IntGauge,
    pub block_height: IntGauge,
    pub flight_headers: IntGauge,
    pub flight_blocks: IntGauge,
    pub sync_peers: IntGauge,
}

impl P2pMetrics {
    pub fn new() -> Result<Self, NodeError> {
        let registry = Registry::new();

        let connected_peers = register_int_gauge_with_registry!(
            Opts::new("meridian_connected_peers", "Live peer sessions"),
            registry
        )?;
        let inbound_peers = register_int_gauge_with_registry!(
            Opts::new("meridian_inbound_peers", "Admitted inbound connections"),
            registry
        )?;
        let outbound_peers = register_int_gauge_with_registry!(
            Opts::new("meridian_outbound_peers", "Admitted outbound connections"),
            registry
        )?;
        let rejected_connections = register_int_counter_with_registry!(
            Opts::new(
                "meridian_rejected_connections_total",
                "Connections refused by admission control"
            ),
            registry
        )?;
        let handshake_failures = register_int_counter_with_registry!(
            Opts::new(
                "meridian_handshake_failures_total",
                "Connections dropped during the handshake"
            ),
            registry
        )?;

        let header_height = register_int_gauge_with_registry!(
            Opts::new("meridian_header_height", "Height of the header chain tip"),
            registry
        )?;
        let block_height = register_int_gauge_with_registry!(
            Opts::new("meridian_block_height", "Height of the last committed block"),
            registry
        )?;
        let flight_headers = register_int_gauge_with_registry!(
            Opts::new("meridian_flight_headers", "Outstanding header requests"),
            registry
        )?;
        let flight_blocks = register_int_gauge_with_registry!(
            Opts::new("meridian_flight_blocks", "Outstanding block requests"),
            registry
        )?;
        let sync_peers = register_int_gauge_with_registry!(
            Opts::new("meridian_sync_peers", "Peers eligible as sync sources"),
            registry
        )?;

        Ok(Self {
            registry,
            connected_peers,
            inbound_peers,
            outbound_peers,
            rejected_connections,
            handshake_failures,
            header_height,
            block_height,
            flight_headers,
            flight_blocks,
            sync_peers,
        })
    }

    /// Refresh every metric from the running components.
    pub fn sample(&self, server: &NetServer, sync: &BlockSyncMgr, ledger: &dyn Ledger) {
        self.connected_peers
            .set(server.connected_peers().len() as i64);
        self.inbound_peers.set(server.inbound_count() as i64);
        self.outbound_peers.set(server.outbound_count() as i64);
        self.sample_stats(server.stats());

        self.header_height
            .set(i64::from(ledger.current_header_height()));
        self.block_height
            .set(i64::from(ledger.current_block_height()));
        self.flight_headers.set(sync.flight_header_count() as i64);
        self.flight_blocks.set(sync.flight_block_count() as i64);
        self.sync_peers.set(sync.node_count() as i64);
    }

    /// Counters only move forward; catch up with the server's tallies.
    fn sample_stats(&self, stats: &NetStats) {
        let rejected = stats.rejected_connections.load(Ordering::Relaxed);
        let failed = stats.handshake_failures.load(Ordering::Relaxed);
        catch_up(&self.rejected_connections, rejected);
        catch_up(&self.handshake_failures, failed);
    }

    /// The registry in the Prometheus text format.
    pub fn encode(&self) -> Result<String, NodeError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| NodeError::Config(e.to_string()))
    }
}

fn catch_up(counter: &IntCounter, total: u64) {
    let seen = counter.get();
    if total > seen {
        counter.inc_by(total - seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_follow_running_totals() {
        let metrics = P2pMetrics::new().unwrap();
        let stats = NetStats::default();
        stats.rejected_connections.store(3, Ordering::Relaxed);
        metrics.sample_stats(&stats);
        metrics.sample_stats(&stats);
        assert_eq!(metrics.rejected_connections.get(), 3);

        stats.rejected_connections.store(5, Ordering::Relaxed);
        stats.handshake_failures.store(1, Ordering::Relaxed);
        metrics.sample_stats(&stats);
        assert_eq!(metrics.rejected_connections.get(), 5);
        assert_eq!(metrics.handshake_failures.get(), 1);
    }

    #[test]
    fn encodes_registered_families() {
        let metrics = P2pMetrics::new().unwrap();
        metrics.block_height.set(12);
        let text = metrics.encode().unwrap();
        assert!(text.contains("meridian_block_height 12"));
        assert!(text.contains("meridian_rejected_connections_total"));
    }
}
