//! meridian P2P node.
//!
//! Loads the [`NodeConfig`], sets up logging and metrics, and builds a
//! [`P2pNode`] that runs the network services from `meridian-network`
//! until it is told to stop.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod shutdown;

pub use config::{ConnectionConfig, DiscoveryConfig, NodeConfig, SyncSection};
pub use error::NodeError;
pub use logging::{init_logging, LogFormat};
pub use metrics::P2pMetrics;
pub use node::P2pNode;
pub use shutdown::ShutdownController;
