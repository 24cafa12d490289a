use std::net::SocketAddr;
use std::time::Duration;

use chaintip_consensus::Hash256;
use chaintip_primitives::BlockHeader;

/// How a session left the wire, for reputation purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectKind {
    /// The owner disposed the session or cancelled its token.
    Intentional,
    /// The transport failed before the handshake completed.
    UnintentionalBeforeConnect,
    /// The transport failed at or after `Ready`.
    UnintentionalAfterConnect,
}

/// Notifications a session sends to its pool.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Handshake completed; the session is `Ready`.
    Connected,
    Disconnected(DisconnectKind),
    Pong { duration: Duration, nonce: u64 },
    NewChainTip { height: u32, hash_hex: String },
    /// Headers rejected against the invalid-block set.
    InvalidBlocks(Vec<BlockHeader>),
    /// The peer's tip lags the longest chain.
    OutOfSync,
    /// Unsolicited peer addresses for the address database.
    Addr(Vec<SocketAddr>),
    /// Block announcements; the pool may sync opportunistically.
    BlockHashes(Vec<Hash256>),
}

/// The one event the embedding application subscribes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TipEvent {
    pub height: u32,
    pub hash_hex: String,
}
