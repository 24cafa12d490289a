//! Block header type and consensus serialization.

pub mod encoding;
pub mod hash;
pub mod header;

pub use encoding::{DecodeError, Decoder, Encoder};
pub use hash::{sha256, sha256d, sha256d_checksum};
pub use header::{BlockHeader, HeaderError, HEADER_SIZE};
