//! Nullable infrastructure for deterministic testing.
//!
//! Each collaborator of the network core has a test-friendly stand-in:
//! an in-memory chain, a network that records instead of sending, and a
//! transport that connects listeners and dialers through in-process pipes.
//! None of them touch the filesystem or real sockets.

pub mod ledger;
pub mod network;
pub mod transport;

pub use ledger::{build_chain, genesis, NullLedger};
pub use network::{peer_info, NullNetwork, NULL_PEER_PORT};
pub use transport::{MemoryDialer, MemoryListener, MemoryNetwork};
