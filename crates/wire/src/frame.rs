//! Length-prefixed message framing: magic, command, length, checksum.

use std::fmt;

use chaintip_primitives::sha256d_checksum;

/// Largest payload this client will frame or accept.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

pub const FRAME_HEADER_SIZE: usize = 24;
const COMMAND_SIZE: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    CommandTooLong(String),
    PayloadTooLarge(usize),
    ChecksumMismatch,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::CommandTooLong(command) => {
                write!(f, "command exceeds {COMMAND_SIZE} bytes: {command}")
            }
            FrameError::PayloadTooLarge(len) => write!(f, "payload too large: {len} bytes"),
            FrameError::ChecksumMismatch => write!(f, "payload checksum mismatch"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Wrap a payload in a 24-byte frame header.
pub fn frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let command_bytes = command.as_bytes();
    if command_bytes.len() > COMMAND_SIZE {
        return Err(FrameError::CommandTooLong(command.to_string()));
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic);
    let mut padded = [0u8; COMMAND_SIZE];
    padded[..command_bytes.len()].copy_from_slice(command_bytes);
    out.extend_from_slice(&padded);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&sha256d_checksum(payload));
    out.extend_from_slice(payload);
    Ok(out)
}

#[derive(Debug, Default)]
pub struct DeframeResult {
    pub messages: Vec<(String, Vec<u8>)>,
    /// Unconsumed tail; callers append newly received bytes and deframe again.
    pub remaining: Vec<u8>,
    pub errors: Vec<(String, FrameError)>,
}

/// Extract complete frames from `buffer`.
///
/// The scan slides forward one byte at a time until the magic matches. An
/// incomplete frame stops the scan and is returned as `remaining`; a frame
/// with a bad checksum is recorded in `errors` and skipped; a frame whose
/// declared length exceeds [`MAX_PAYLOAD_SIZE`] is recorded and the scan
/// resumes one byte past its magic.
pub fn deframe(buffer: &[u8], magic: [u8; 4]) -> DeframeResult {
    let mut result = DeframeResult::default();
    let mut offset = 0usize;

    while offset < buffer.len() {
        if buffer.len() - offset < 4 || buffer[offset..offset + 4] != magic {
            // No full magic here; keep a partial match alive at the tail.
            if buffer.len() - offset < 4 && magic.starts_with(&buffer[offset..]) {
                break;
            }
            offset += 1;
            continue;
        }

        if buffer.len() - offset < FRAME_HEADER_SIZE {
            break;
        }

        let header = &buffer[offset..offset + FRAME_HEADER_SIZE];
        let command = command_from_bytes(&header[4..16]);
        let length =
            u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;

        if length > MAX_PAYLOAD_SIZE {
            result.errors.push((command, FrameError::PayloadTooLarge(length)));
            offset += 4;
            continue;
        }

        if buffer.len() - offset < FRAME_HEADER_SIZE + length {
            break;
        }

        let declared = [header[20], header[21], header[22], header[23]];
        let payload = &buffer[offset + FRAME_HEADER_SIZE..offset + FRAME_HEADER_SIZE + length];
        if sha256d_checksum(payload) != declared {
            result.errors.push((command, FrameError::ChecksumMismatch));
        } else {
            result.messages.push((command, payload.to_vec()));
        }
        offset += FRAME_HEADER_SIZE + length;
    }

    result.remaining = buffer[offset..].to_vec();
    result
}

fn command_from_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect()
}
