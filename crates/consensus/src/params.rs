//! Per-network chain parameters.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "main" | "mainnet" | "bsv" => Some(Network::Mainnet),
            "test" | "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// First field of every wire message.
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub user_agent: &'static str,
    /// Serialized 80-byte genesis header.
    pub genesis_header: [u8; 80],
    /// Display-order hex hashes of blocks this chain rejects a priori.
    pub invalid_blocks: &'static [&'static str],
    /// Hard-coded seed peers, `host` or `host:port`.
    pub fixed_seeds: &'static [&'static str],
    /// One-shot bootstrap peer list endpoint.
    pub bootstrap_url: Option<&'static str>,
}

/// Merkle root of the shared genesis coinbase, internal byte order.
const GENESIS_MERKLE_ROOT: Hash256 = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f,
    0x61, 0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e,
    0x5e, 0x4a,
];

const MAINNET_SEEDS: &[&str] = &[
    "seed.bitcoinsv.io",
    "seed.satoshisvision.network",
    "seed.bitcoinseed.directory",
];

const TESTNET_SEEDS: &[&str] = &[
    "testnet-seed.bitcoinsv.io",
    "testnet-seed.bitcoincloud.net",
];

/// Post-fork branches this chain treats as permanently invalid.
const MAINNET_INVALID_BLOCKS: &[&str] = &[
    // BTC branch point after the 2017 fork.
    "00000000000000000019f112ec0a9982926f1258cdcc558dd7c3b7e5dc7fa148",
    // ABC branch point after the 2018 fork.
    "000000000000000001d956714215d96ffc00e0afda4cd0a96c96f8d802b1662b",
];

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            message_start: [0xe3, 0xe1, 0xf3, 0xe8],
            default_port: 8333,
            user_agent: "/chaintip:0.1.0/",
            genesis_header: genesis_header(1_231_006_505, 0x1d00_ffff, 2_083_236_893),
            invalid_blocks: MAINNET_INVALID_BLOCKS,
            fixed_seeds: MAINNET_SEEDS,
            bootstrap_url: Some("https://api.bitcoinsv.io/v1/peers"),
        },
        Network::Testnet => ChainParams {
            network,
            message_start: [0xf4, 0xe5, 0xf3, 0xf4],
            default_port: 18333,
            user_agent: "/chaintip:0.1.0/",
            genesis_header: genesis_header(1_296_688_602, 0x1d00_ffff, 414_098_458),
            invalid_blocks: &[],
            fixed_seeds: TESTNET_SEEDS,
            bootstrap_url: None,
        },
        Network::Regtest => ChainParams {
            network,
            message_start: [0xda, 0xb5, 0xbf, 0xfa],
            default_port: 18444,
            user_agent: "/chaintip:0.1.0/",
            genesis_header: genesis_header(1_296_688_602, 0x207f_ffff, 2),
            invalid_blocks: &[],
            fixed_seeds: &[],
            bootstrap_url: None,
        },
    }
}

/// All three networks share the genesis layout; only time, bits and nonce vary.
fn genesis_header(time: u32, bits: u32, nonce: u32) -> [u8; 80] {
    let mut header = [0u8; 80];
    header[0..4].copy_from_slice(&1i32.to_le_bytes());
    // prev hash stays zero
    header[36..68].copy_from_slice(&GENESIS_MERKLE_ROOT);
    header[68..72].copy_from_slice(&time.to_le_bytes());
    header[72..76].copy_from_slice(&bits.to_le_bytes());
    header[76..80].copy_from_slice(&nonce.to_le_bytes());
    header
}
