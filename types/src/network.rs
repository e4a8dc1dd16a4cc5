//! Network identifier.

use serde::{Deserialize, Serialize};

/// Identifies which meridian network a node belongs to.
///
/// The id selects the default listen port and the frame magic, so nodes on
/// different networks reject each other's traffic at the codec layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkId {
    /// The production network.
    Main,
    /// The public test network.
    Test,
    /// Local development network.
    Dev,
}

impl NetworkId {
    /// Default sync port for this network.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Main => 20338,
            Self::Test => 20438,
            Self::Dev => 20538,
        }
    }

    /// Magic number written at the start of every frame.
    pub fn magic(&self) -> u32 {
        match self {
            Self::Main => 0x8c77_ab60,
            Self::Test => 0x2d88_29df,
            Self::Dev => 0x0000_0de7,
        }
    }

    /// Human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Test => "test",
            Self::Dev => "dev",
        }
    }

    /// Parse a network name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Self::Main),
            "test" | "testnet" => Some(Self::Test),
            "dev" => Some(Self::Dev),
            _ => None,
        }
    }
}
