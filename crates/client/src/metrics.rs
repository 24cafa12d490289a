//! Per-peer behavior metrics, persisted as versioned binary records.

use std::collections::VecDeque;

use chaintip_primitives::encoding::{DecodeError, Decoder, Encoder};

/// Bounded history length for pings and disconnect events.
pub const DEQUE_CAP: usize = 10;

pub const METRICS_RECORD_VERSION: u8 = 1;

/// Events within this window of a connect-ish signal count as
/// "disconnected after connecting".
pub const AFTER_CONNECT_WINDOW_MS: u64 = 28 * 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerMetrics {
    pub last_seen_ms: u64,
    /// `(duration_ms, timestamp_ms)`, newest last.
    pub recent_pings: VecDeque<(u64, u64)>,
    pub disconnects_before_connect_ms: VecDeque<u64>,
    pub disconnects_after_connect_ms: VecDeque<u64>,
    pub last_connect_ms: Option<u64>,
    pub last_connect_and_test_ms: Option<u64>,
    pub last_data_received_ms: Option<u64>,
    pub last_out_of_sync_ms: Option<u64>,
    pub last_invalid_chain_ms: Option<u64>,
}

fn push_bounded<T>(deque: &mut VecDeque<T>, value: T) {
    deque.push_back(value);
    while deque.len() > DEQUE_CAP {
        deque.pop_front();
    }
}

impl PeerMetrics {
    fn touch(&mut self, now_ms: u64) {
        // Every metric update is also a "seen" signal.
        if now_ms > self.last_seen_ms {
            self.last_seen_ms = now_ms;
        }
    }

    pub fn add_seen(&mut self, now_ms: u64) {
        self.touch(now_ms);
    }

    pub fn add_ping(&mut self, duration_ms: u64, now_ms: u64) {
        push_bounded(&mut self.recent_pings, (duration_ms, now_ms));
        self.touch(now_ms);
    }

    pub fn add_last_connect(&mut self, now_ms: u64) {
        self.last_connect_ms = Some(now_ms);
        self.touch(now_ms);
    }

    pub fn add_last_connect_and_test(&mut self, now_ms: u64) {
        self.last_connect_and_test_ms = Some(now_ms);
        self.touch(now_ms);
    }

    pub fn add_data_received(&mut self, now_ms: u64) {
        self.last_data_received_ms = Some(now_ms);
        self.touch(now_ms);
    }

    pub fn add_out_of_sync(&mut self, now_ms: u64) {
        self.last_out_of_sync_ms = Some(now_ms);
        self.touch(now_ms);
    }

    pub fn add_invalid_chain(&mut self, now_ms: u64) {
        self.last_invalid_chain_ms = Some(now_ms);
        self.touch(now_ms);
    }

    /// Latest timestamp proving the peer accepted a full connection.
    pub fn latest_connect_signal(&self) -> Option<u64> {
        [
            self.last_connect_ms,
            self.last_connect_and_test_ms,
            self.last_data_received_ms,
        ]
        .into_iter()
        .flatten()
        .max()
    }

    fn latest_connect_or_ping(&self) -> Option<u64> {
        let ping = self.recent_pings.iter().map(|(_, ts)| *ts).max();
        [self.latest_connect_signal(), ping].into_iter().flatten().max()
    }

    /// Route a drop to the after-connect list when it lands within four
    /// weeks of the most recent connect or ping signal.
    pub fn add_unintentional_disconnect(&mut self, now_ms: u64) {
        let after = self
            .latest_connect_or_ping()
            .is_some_and(|signal| now_ms.saturating_sub(signal) <= AFTER_CONNECT_WINDOW_MS);
        if after {
            push_bounded(&mut self.disconnects_after_connect_ms, now_ms);
        } else {
            push_bounded(&mut self.disconnects_before_connect_ms, now_ms);
        }
        self.touch(now_ms);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(128);
        encoder.write_u8(METRICS_RECORD_VERSION);
        encoder.write_u64_le(self.last_seen_ms);
        encoder.write_varint(self.recent_pings.len() as u64);
        for (duration, timestamp) in &self.recent_pings {
            encoder.write_u64_le(*duration);
            encoder.write_u64_le(*timestamp);
        }
        write_deque(&mut encoder, &self.disconnects_before_connect_ms);
        write_deque(&mut encoder, &self.disconnects_after_connect_ms);
        write_optional(&mut encoder, self.last_connect_ms);
        write_optional(&mut encoder, self.last_connect_and_test_ms);
        write_optional(&mut encoder, self.last_data_received_ms);
        write_optional(&mut encoder, self.last_out_of_sync_ms);
        write_optional(&mut encoder, self.last_invalid_chain_ms);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != METRICS_RECORD_VERSION {
            // Unknown layout; treat the record as absent.
            return Err(DecodeError::UnexpectedEnd);
        }
        let last_seen_ms = decoder.read_u64_le()?;
        let ping_count = decoder.read_varint()?;
        if ping_count > DEQUE_CAP as u64 {
            return Err(DecodeError::OversizedLength(ping_count));
        }
        let mut recent_pings = VecDeque::with_capacity(ping_count as usize);
        for _ in 0..ping_count {
            let duration = decoder.read_u64_le()?;
            let timestamp = decoder.read_u64_le()?;
            recent_pings.push_back((duration, timestamp));
        }
        let disconnects_before_connect_ms = read_deque(&mut decoder)?;
        let disconnects_after_connect_ms = read_deque(&mut decoder)?;
        Ok(Self {
            last_seen_ms,
            recent_pings,
            disconnects_before_connect_ms,
            disconnects_after_connect_ms,
            last_connect_ms: read_optional(&mut decoder)?,
            last_connect_and_test_ms: read_optional(&mut decoder)?,
            last_data_received_ms: read_optional(&mut decoder)?,
            last_out_of_sync_ms: read_optional(&mut decoder)?,
            last_invalid_chain_ms: read_optional(&mut decoder)?,
        })
    }
}

fn write_deque(encoder: &mut Encoder, deque: &VecDeque<u64>) {
    encoder.write_varint(deque.len() as u64);
    for value in deque {
        encoder.write_u64_le(*value);
    }
}

fn read_deque(decoder: &mut Decoder<'_>) -> Result<VecDeque<u64>, DecodeError> {
    let count = decoder.read_varint()?;
    if count > DEQUE_CAP as u64 {
        return Err(DecodeError::OversizedLength(count));
    }
    let mut deque = VecDeque::with_capacity(count as usize);
    for _ in 0..count {
        deque.push_back(decoder.read_u64_le()?);
    }
    Ok(deque)
}

fn write_optional(encoder: &mut Encoder, value: Option<u64>) {
    match value {
        Some(value) => {
            encoder.write_u8(1);
            encoder.write_u64_le(value);
        }
        None => encoder.write_u8(0),
    }
}

fn read_optional(decoder: &mut Decoder<'_>) -> Result<Option<u64>, DecodeError> {
    match decoder.read_u8()? {
        0 => Ok(None),
        _ => Ok(Some(decoder.read_u64_le()?)),
    }
}
