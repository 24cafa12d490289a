//! Chain parameters and shared consensus types.

pub mod constants;
pub mod params;

pub use constants::PROTOCOL_VERSION;
pub use params::{chain_params, ChainParams, Network};

/// A 256-bit hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexError;

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid hex string")
    }
}

impl std::error::Error for HexError {}

/// Parse a display-order (reversed) hex string into internal byte order.
pub fn hash256_from_hex(hex: &str) -> Result<Hash256, HexError> {
    if hex.len() != 64 {
        return Err(HexError);
    }
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for i in 0..32 {
        let high = (bytes[i * 2] as char).to_digit(16).ok_or(HexError)? as u8;
        let low = (bytes[i * 2 + 1] as char).to_digit(16).ok_or(HexError)? as u8;
        out[31 - i] = (high << 4) | low;
    }
    Ok(out)
}

/// Render a hash in display order (reversed-byte big-endian hex).
pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips_in_display_order() {
        let hex = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = hash256_from_hex(hex).expect("valid hex");
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x6f);
        assert_eq!(hash256_to_hex(&hash), hex);
    }

    #[test]
    fn rejects_bad_lengths_and_digits() {
        assert_eq!(hash256_from_hex("abcd"), Err(HexError));
        let mut bad = String::from("zz");
        bad.push_str(&"00".repeat(31));
        assert_eq!(hash256_from_hex(&bad), Err(HexError));
    }
}
