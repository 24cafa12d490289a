//! Wire-format framing and message payload codecs.

pub mod frame;
pub mod message;

pub use frame::{deframe, frame, DeframeResult, FrameError, MAX_PAYLOAD_SIZE};
pub use message::{
    build_addr, build_getaddr, build_getheaders, build_headers, build_inv, build_ping, build_pong,
    build_verack, build_version, parse_addr, parse_getheaders, parse_headers, parse_inv,
    parse_nonce, parse_version, InvEntry, MessageError, NetAddr, VersionMessage,
};

pub mod commands {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const GETHEADERS: &str = "getheaders";
    pub const HEADERS: &str = "headers";
    pub const GETADDR: &str = "getaddr";
    pub const ADDR: &str = "addr";
    pub const INV: &str = "inv";
}
