//! Payload codecs for the protocol messages this client speaks.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use chaintip_consensus::constants::INV_TYPE_BLOCK;
use chaintip_consensus::Hash256;
use chaintip_primitives::encoding::{DecodeError, Decoder, Encoder};
use chaintip_primitives::{BlockHeader, HeaderError};

/// Upper bound on headers in one `headers` payload.
pub const MAX_HEADERS_RESULTS: usize = 2000;
/// Upper bound on entries in one `addr` payload.
pub const MAX_ADDR_RESULTS: usize = 1000;
/// Upper bound on entries in one `inv` payload.
pub const MAX_INV_RESULTS: usize = 50_000;
/// Upper bound on locator hashes in one `getheaders` payload.
pub const MAX_LOCATOR_HASHES: u64 = 101;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    Malformed {
        command: &'static str,
        reason: DecodeError,
    },
    OversizedCount {
        command: &'static str,
        count: u64,
    },
    Header(HeaderError),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::Malformed { command, reason } => {
                write!(f, "malformed {command} payload: {reason}")
            }
            MessageError::OversizedCount { command, count } => {
                write!(f, "{command} count too large: {count}")
            }
            MessageError::Header(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for MessageError {}

impl From<HeaderError> for MessageError {
    fn from(err: HeaderError) -> Self {
        MessageError::Header(err)
    }
}

fn malformed(command: &'static str) -> impl Fn(DecodeError) -> MessageError + Copy {
    move |reason| MessageError::Malformed { command, reason }
}

/// A `(services, ip, port)` network address record.
///
/// IPv4 travels as the IPv4-mapped IPv6 form `::ffff:a.b.c.d`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetAddr {
    pub services: u64,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetAddr {
    pub fn unroutable() -> Self {
        Self {
            services: 0,
            ip: Ipv6Addr::UNSPECIFIED,
            port: 0,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        let ip = match self.ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.ip),
        };
        SocketAddr::new(ip, self.port)
    }

    fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.services);
        encoder.write_bytes(&self.ip.octets());
        encoder.write_u16_be(self.port);
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let services = decoder.read_u64_le()?;
        let ip = Ipv6Addr::from(decoder.read_fixed::<16>()?);
        let port = decoder.read_u16_be()?;
        Ok(Self { services, ip, port })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub recv_addr: NetAddr,
    pub from_addr: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[allow(clippy::too_many_arguments)]
pub fn build_version(message: &VersionMessage) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(96 + message.user_agent.len());
    encoder.write_i32_le(message.version);
    encoder.write_u64_le(message.services);
    encoder.write_i64_le(message.timestamp);
    message.recv_addr.encode_to(&mut encoder);
    message.from_addr.encode_to(&mut encoder);
    encoder.write_u64_le(message.nonce);
    encoder.write_var_str(&message.user_agent);
    encoder.write_i32_le(message.start_height);
    encoder.write_u8(u8::from(message.relay));
    encoder.into_inner()
}

pub fn parse_version(payload: &[u8]) -> Result<VersionMessage, MessageError> {
    let err = malformed(crate::commands::VERSION);
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le().map_err(err)?;
    let services = decoder.read_u64_le().map_err(err)?;
    let timestamp = decoder.read_i64_le().map_err(err)?;
    let recv_addr = NetAddr::decode_from(&mut decoder).map_err(err)?;
    let from_addr = NetAddr::decode_from(&mut decoder).map_err(err)?;
    let nonce = decoder.read_u64_le().map_err(err)?;
    let user_agent = decoder.read_var_str().map_err(err)?;
    let start_height = decoder.read_i32_le().map_err(err)?;
    // Old peers omit the relay flag.
    let relay = match decoder.read_u8() {
        Ok(value) => value != 0,
        Err(_) => true,
    };
    Ok(VersionMessage {
        version,
        services,
        timestamp,
        recv_addr,
        from_addr,
        nonce,
        user_agent,
        start_height,
        relay,
    })
}

pub fn build_verack() -> Vec<u8> {
    Vec::new()
}

pub fn build_getaddr() -> Vec<u8> {
    Vec::new()
}

pub fn build_ping(nonce: u64) -> Vec<u8> {
    nonce.to_le_bytes().to_vec()
}

pub fn build_pong(nonce: u64) -> Vec<u8> {
    nonce.to_le_bytes().to_vec()
}

/// Decode the 8-byte nonce shared by `ping` and `pong`.
pub fn parse_nonce(command: &'static str, payload: &[u8]) -> Result<u64, MessageError> {
    let mut decoder = Decoder::new(payload);
    decoder.read_u64_le().map_err(malformed(command))
}

pub fn build_getheaders(version: i32, locator: &[Hash256], stop: &Hash256) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(4 + 1 + 32 * (locator.len() + 1));
    encoder.write_i32_le(version);
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_hash(hash);
    }
    encoder.write_hash(stop);
    encoder.into_inner()
}

/// Decode a `getheaders` payload into `(version, locator, stop)`.
pub fn parse_getheaders(payload: &[u8]) -> Result<(i32, Vec<Hash256>, Hash256), MessageError> {
    let err = malformed(crate::commands::GETHEADERS);
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le().map_err(err)?;
    let count = decoder.read_varint().map_err(err)?;
    if count > MAX_LOCATOR_HASHES {
        return Err(MessageError::OversizedCount {
            command: crate::commands::GETHEADERS,
            count,
        });
    }
    let mut locator = Vec::with_capacity(count as usize);
    for _ in 0..count {
        locator.push(decoder.read_hash().map_err(err)?);
    }
    let stop = decoder.read_hash().map_err(err)?;
    Ok((version, locator, stop))
}

pub fn build_headers(headers: &[BlockHeader]) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(1 + headers.len() * 81);
    encoder.write_varint(headers.len() as u64);
    for header in headers {
        header.consensus_encode_to(&mut encoder);
        encoder.write_varint(0);
    }
    encoder.into_inner()
}

/// Decode a `headers` payload, verifying proof-of-work unless `skip_pow`.
pub fn parse_headers(payload: &[u8], skip_pow: bool) -> Result<Vec<BlockHeader>, MessageError> {
    let err = malformed(crate::commands::HEADERS);
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(err)?;
    if count as usize > MAX_HEADERS_RESULTS {
        return Err(MessageError::OversizedCount {
            command: crate::commands::HEADERS,
            count,
        });
    }
    let mut headers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let bytes = decoder.read_bytes(chaintip_primitives::HEADER_SIZE).map_err(err)?;
        let header = BlockHeader::parse(bytes, skip_pow)?;
        let _tx_count = decoder.read_varint().map_err(err)?;
        headers.push(header);
    }
    Ok(headers)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvEntry {
    pub kind: u32,
    pub hash: Hash256,
}

impl InvEntry {
    pub fn is_block(&self) -> bool {
        self.kind == INV_TYPE_BLOCK
    }
}

pub fn build_inv(entries: &[InvEntry]) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(1 + entries.len() * 36);
    encoder.write_varint(entries.len() as u64);
    for entry in entries {
        encoder.write_u32_le(entry.kind);
        encoder.write_hash(&entry.hash);
    }
    encoder.into_inner()
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<InvEntry>, MessageError> {
    let err = malformed(crate::commands::INV);
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(err)?;
    if count as usize > MAX_INV_RESULTS {
        return Err(MessageError::OversizedCount {
            command: crate::commands::INV,
            count,
        });
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = decoder.read_u32_le().map_err(err)?;
        let hash = decoder.read_hash().map_err(err)?;
        entries.push(InvEntry { kind, hash });
    }
    Ok(entries)
}

pub fn build_addr(entries: &[(u32, NetAddr)]) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(1 + entries.len() * 30);
    encoder.write_varint(entries.len() as u64);
    for (time, addr) in entries {
        encoder.write_u32_le(*time);
        addr.encode_to(&mut encoder);
    }
    encoder.into_inner()
}

/// Decode an `addr` payload into routable socket addresses.
pub fn parse_addr(payload: &[u8]) -> Result<Vec<SocketAddr>, MessageError> {
    let err = malformed(crate::commands::ADDR);
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(err)?;
    if count as usize > MAX_ADDR_RESULTS {
        return Err(MessageError::OversizedCount {
            command: crate::commands::ADDR,
            count,
        });
    }
    let mut addrs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let _time = decoder.read_u32_le().map_err(err)?;
        let net_addr = NetAddr::decode_from(&mut decoder).map_err(err)?;
        if net_addr.port == 0 {
            continue;
        }
        let addr = net_addr.to_socket_addr();
        if addr.ip().is_unspecified() || addr.ip().is_loopback() {
            continue;
        }
        addrs.push(addr);
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaintip_consensus::params::{chain_params, Network};
    use chaintip_consensus::ZERO_HASH;

    fn sample_version() -> VersionMessage {
        VersionMessage {
            version: 70_016,
            services: 1,
            timestamp: 1_700_000_000,
            recv_addr: NetAddr::from_socket_addr("203.0.113.7:8333".parse().expect("addr"), 1),
            from_addr: NetAddr::unroutable(),
            nonce: 0xdead_beef_cafe_f00d,
            user_agent: "/chaintip:0.1.0/".to_string(),
            start_height: 850_000,
            relay: false,
        }
    }

    #[test]
    fn version_round_trip() {
        let message = sample_version();
        let payload = build_version(&message);
        let parsed = parse_version(&payload).expect("version parses");
        assert_eq!(parsed, message);
    }

    #[test]
    fn version_without_relay_flag_defaults_on() {
        let message = sample_version();
        let mut payload = build_version(&message);
        payload.pop();
        let parsed = parse_version(&payload).expect("short version parses");
        assert!(parsed.relay);
    }

    #[test]
    fn ipv4_mapped_round_trip() {
        let addr: SocketAddr = "198.51.100.23:8333".parse().expect("addr");
        let net_addr = NetAddr::from_socket_addr(addr, 1);
        assert_eq!(net_addr.ip.octets()[..12], [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(net_addr.to_socket_addr(), addr);

        let mut encoder = Encoder::new();
        net_addr.encode_to(&mut encoder);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        let decoded = NetAddr::decode_from(&mut decoder).expect("decode");
        assert_eq!(decoded, net_addr);
    }

    #[test]
    fn getheaders_layout() {
        let locator = [[0x11u8; 32], [0x22u8; 32]];
        let payload = build_getheaders(70_016, &locator, &ZERO_HASH);
        assert_eq!(payload.len(), 4 + 1 + 32 * 3);
        assert_eq!(payload[4], 2);
        assert_eq!(&payload[5..37], &[0x11u8; 32]);
        assert_eq!(&payload[69..101], &ZERO_HASH);
    }

    #[test]
    fn getheaders_round_trip() {
        let locator = [[0x31u8; 32], [0x32u8; 32], [0x33u8; 32]];
        let stop = [0x44u8; 32];
        let payload = build_getheaders(70_016, &locator, &stop);
        let (version, parsed_locator, parsed_stop) =
            parse_getheaders(&payload).expect("getheaders parses");
        assert_eq!(version, 70_016);
        assert_eq!(parsed_locator, locator);
        assert_eq!(parsed_stop, stop);
    }

    #[test]
    fn headers_round_trip_with_pow() {
        let params = chain_params(Network::Mainnet);
        let genesis = BlockHeader::parse(&params.genesis_header, false).expect("genesis");
        let payload = build_headers(&[genesis]);
        let parsed = parse_headers(&payload, false).expect("headers parse");
        assert_eq!(parsed, vec![genesis]);
    }

    #[test]
    fn headers_with_bad_pow_fail_unless_skipped() {
        let params = chain_params(Network::Mainnet);
        let mut genesis = BlockHeader::parse(&params.genesis_header, false).expect("genesis");
        genesis.nonce ^= 1;
        let payload = build_headers(&[genesis]);
        assert!(matches!(
            parse_headers(&payload, false),
            Err(MessageError::Header(HeaderError::InvalidProofOfWork))
        ));
        assert_eq!(parse_headers(&payload, true).expect("skip pow"), vec![genesis]);
    }

    #[test]
    fn oversized_header_count_is_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_varint((MAX_HEADERS_RESULTS + 1) as u64);
        let payload = encoder.into_inner();
        assert!(matches!(
            parse_headers(&payload, true),
            Err(MessageError::OversizedCount { .. })
        ));
    }

    #[test]
    fn inv_round_trip_and_block_filter() {
        let entries = [
            InvEntry { kind: 1, hash: [0xaau8; 32] },
            InvEntry { kind: 2, hash: [0xbbu8; 32] },
        ];
        let payload = build_inv(&entries);
        let parsed = parse_inv(&payload).expect("inv parses");
        assert_eq!(parsed, entries);
        assert!(!parsed[0].is_block());
        assert!(parsed[1].is_block());
    }

    #[test]
    fn addr_skips_unroutable_entries() {
        let good: SocketAddr = "203.0.113.9:8333".parse().expect("addr");
        let entries = [
            (0u32, NetAddr::from_socket_addr(good, 1)),
            (0u32, NetAddr::unroutable()),
            (0u32, NetAddr::from_socket_addr("127.0.0.1:8333".parse().expect("addr"), 1)),
        ];
        let payload = build_addr(&entries);
        let parsed = parse_addr(&payload).expect("addr parses");
        assert_eq!(parsed, vec![good]);
    }

    #[test]
    fn truncated_payload_names_the_command() {
        let err = parse_version(&[0x01, 0x02]).expect_err("truncated");
        match err {
            MessageError::Malformed { command, .. } => assert_eq!(command, "version"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
