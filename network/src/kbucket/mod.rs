//! Kademlia k-bucket routing table keyed by [`PeerId`](meridian_types::PeerId).
//!
//! Bucket `i` holds peers whose common prefix with the local id is exactly
//! `i` bits, except the last bucket, which holds every peer with a longer
//! common prefix. The last bucket unfolds into a new one when it overflows.

mod bucket;
mod table;

pub use bucket::Bucket;
pub use table::{CplRefresh, PeerCallback, RouteTable, RouteTableError, MAX_CPL_FOR_REFRESH};
