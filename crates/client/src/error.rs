use std::fmt;

use chaintip_pow::CompactError;
use chaintip_storage::StoreError;
use chaintip_wire::MessageError;

/// Failure of a single peer session operation.
///
/// None of these are fatal to the client; the pool converts them into metric
/// updates and reconnects elsewhere.
#[derive(Debug)]
pub enum SessionError {
    /// A payload failed to decode.
    Parse(MessageError),
    /// The peer broke an ordering or contiguity rule.
    Protocol(&'static str),
    /// A correlated request timed out.
    Timeout(&'static str),
    /// The transport failed or closed underneath us.
    Transport(String),
    /// The peer advertised descendants of a known-invalid block.
    InvalidChain,
    /// The peer is significantly behind the longest chain.
    OutOfSync,
    /// A caller-supplied token cancelled the request.
    Cancelled,
    /// The session is disposed; all waiters are flushed with this.
    Closed,
    /// A single-slot correlator already has a request in flight.
    Busy(&'static str),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Parse(err) => write!(f, "{err}"),
            SessionError::Protocol(what) => write!(f, "protocol violation: {what}"),
            SessionError::Timeout(what) => write!(f, "{what} timed out"),
            SessionError::Transport(what) => write!(f, "transport error: {what}"),
            SessionError::InvalidChain => write!(f, "peer follows an invalid chain"),
            SessionError::OutOfSync => write!(f, "peer is out of sync"),
            SessionError::Cancelled => write!(f, "request cancelled"),
            SessionError::Closed => write!(f, "connection closed"),
            SessionError::Busy(what) => write!(f, "{what} request already in flight"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<MessageError> for SessionError {
    fn from(err: MessageError) -> Self {
        SessionError::Parse(err)
    }
}

/// Failure surfaced to the embedding application.
#[derive(Debug)]
pub enum ClientError {
    Config(String),
    Store(StoreError),
    Genesis(CompactError),
    Cancelled,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Config(what) => write!(f, "invalid configuration: {what}"),
            ClientError::Store(err) => write!(f, "{err}"),
            ClientError::Genesis(err) => write!(f, "genesis header unusable: {err}"),
            ClientError::Cancelled => write!(f, "client stopped"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<StoreError> for ClientError {
    fn from(err: StoreError) -> Self {
        ClientError::Store(err)
    }
}

impl From<CompactError> for ClientError {
    fn from(err: CompactError) -> Self {
        ClientError::Genesis(err)
    }
}
