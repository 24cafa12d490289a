//! Protocol-wide constants shared across the workspace.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_016;
/// Oldest protocol version this client will talk to.
pub const MIN_PEER_PROTOCOL_VERSION: i32 = 70_001;
/// Serialized size of a block header, in bytes (network rule).
pub const HEADER_SIZE: usize = 80;
/// Inventory type for a block announcement.
pub const INV_TYPE_BLOCK: u32 = 2;
/// Service bit advertising full chain data.
pub const NODE_NETWORK: u64 = 1;
