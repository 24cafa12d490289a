//! One peer session per TCP connection: handshake, correlated requests,
//! keepalive, and the header sync loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chaintip_consensus::constants::NODE_NETWORK;
use chaintip_consensus::params::ChainParams;
use chaintip_consensus::{Hash256, ZERO_HASH};
use chaintip_primitives::BlockHeader;
use chaintip_wire::{commands, deframe, frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chain::Chain;
use crate::config::Config;
use crate::error::SessionError;
use crate::events::{DisconnectKind, SessionEvent};
use crate::liveness::LivenessMonitor;

/// Don't bother pinging when the session pinged this recently and the
/// process already has liveness evidence.
const KEEPALIVE_FRESH: Duration = Duration::from_secs(10 * 60);

/// How long the tip must sit still before a lagging peer resumes syncing.
const DEFAULT_TIP_STABLE_WAIT: Duration = Duration::from_secs(5);

/// Blocks of lag below the longest chain before a quiet peer counts as out
/// of sync.
const DEFAULT_OUT_OF_SYNC_LAG: u32 = 100;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub magic: [u8; 4],
    pub protocol_version: i32,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub getaddr_timeout: Duration,
    pub ping_interval: Duration,
    pub tip_stable_wait: Duration,
    pub out_of_sync_lag: u32,
}

impl SessionConfig {
    pub fn from_params(params: &ChainParams, config: &Config) -> Self {
        Self {
            magic: params.message_start,
            protocol_version: chaintip_consensus::PROTOCOL_VERSION,
            user_agent: params.user_agent.to_string(),
            connect_timeout: Duration::from_millis(config.request_timeout_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            getaddr_timeout: Duration::from_millis(config.getaddr_timeout_ms),
            ping_interval: Duration::from_secs(config.liveness_poll_secs),
            tip_stable_wait: DEFAULT_TIP_STABLE_WAIT,
            out_of_sync_lag: DEFAULT_OUT_OF_SYNC_LAG,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    HandshakePending,
    Ready,
    Disposed,
}

/// Whether a shutdown came from the owner or from the wire.
enum ShutdownIntent {
    Intentional,
    Unintentional,
}

struct SessionState {
    phase: Phase,
    version_received: bool,
    verack_received: bool,
    remote_user_agent: Option<String>,
    remote_start_height: i32,
    /// Tip of the longest chain when this session was created.
    start_tip: Hash256,
    start_height: u32,
    /// Last hash this peer handed us during sync.
    peer_tip: Option<Hash256>,
    last_ping_at: Option<Instant>,
}

struct PingWaiter {
    tx: oneshot::Sender<Result<Duration, SessionError>>,
    sent_at: Instant,
}

#[derive(Default)]
struct Pending {
    handshake: Vec<oneshot::Sender<Result<(), SessionError>>>,
    pings: HashMap<u64, PingWaiter>,
    getheaders: Option<oneshot::Sender<Result<Vec<BlockHeader>, SessionError>>>,
    getaddr: Vec<oneshot::Sender<Result<Vec<SocketAddr>, SessionError>>>,
    getaddr_inflight: bool,
}

/// Identifies a correlator for cleanup on timeout or cancellation.
enum Correlator {
    Handshake,
    Ping(u64),
    GetHeaders,
    GetAddr,
}

impl Correlator {
    fn name(&self) -> &'static str {
        match self {
            Correlator::Handshake => "handshake",
            Correlator::Ping(_) => "ping",
            Correlator::GetHeaders => "getheaders",
            Correlator::GetAddr => "getaddr",
        }
    }
}

struct SessionInner {
    addr: SocketAddr,
    config: SessionConfig,
    chain: Chain,
    liveness: Arc<LivenessMonitor>,
    events: mpsc::UnboundedSender<(SocketAddr, SessionEvent)>,
    cancel: CancellationToken,
    state: StdMutex<SessionState>,
    pending: StdMutex<Pending>,
    writer: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    /// Serializes `sync_headers` per session.
    sync_serial: AsyncMutex<()>,
    /// Pool-wide count of sessions currently inside a sync loop.
    sync_count: Arc<AtomicUsize>,
}

pub struct PeerSession {
    inner: Arc<SessionInner>,
}

impl PeerSession {
    pub async fn new(
        addr: SocketAddr,
        config: SessionConfig,
        chain: Chain,
        liveness: Arc<LivenessMonitor>,
        events: mpsc::UnboundedSender<(SocketAddr, SessionEvent)>,
        parent_cancel: &CancellationToken,
        sync_count: Arc<AtomicUsize>,
    ) -> Self {
        let (start_height, start_tip, _) = chain.tip_summary().await;
        let inner = Arc::new(SessionInner {
            addr,
            config,
            chain,
            liveness,
            events,
            cancel: parent_cancel.child_token(),
            state: StdMutex::new(SessionState {
                phase: Phase::Idle,
                version_received: false,
                verack_received: false,
                remote_user_agent: None,
                remote_start_height: -1,
                start_tip,
                start_height,
                peer_tip: None,
                last_ping_at: None,
            }),
            pending: StdMutex::new(Pending::default()),
            writer: StdMutex::new(None),
            sync_serial: AsyncMutex::new(()),
            sync_count,
        });
        Self { inner }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn is_ready(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.phase == Phase::Ready)
            .unwrap_or(false)
    }

    pub fn remote_user_agent(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|state| state.remote_user_agent.clone())
    }

    pub fn peer_tip(&self) -> Option<Hash256> {
        self.inner.state.lock().ok().and_then(|state| state.peer_tip)
    }

    /// Open the transport and complete the version/verack handshake.
    pub async fn connect(&self, cancel: Option<&CancellationToken>) -> Result<(), SessionError> {
        self.inner.connect(cancel).await
    }

    pub async fn ping(&self, cancel: Option<&CancellationToken>) -> Result<Duration, SessionError> {
        self.inner.ping_request(cancel).await
    }

    pub async fn get_headers(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<BlockHeader>, SessionError> {
        self.inner.getheaders_request(locator, stop, cancel).await
    }

    pub async fn get_addr(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<SocketAddr>, SessionError> {
        self.inner.getaddr_request(cancel).await
    }

    /// Pull the peer's headers into the shared graph until it runs dry.
    pub async fn sync_headers(&self, cancel: Option<&CancellationToken>) -> Result<(), SessionError> {
        self.inner.sync_headers(cancel).await
    }

    /// Probe whether the peer serves descendants of any known-invalid block.
    pub async fn on_valid_chain(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, SessionError> {
        self.inner.on_valid_chain(cancel).await
    }

    /// Tear the session down without penalizing the peer.
    pub fn dispose(&self) {
        self.inner.shutdown(ShutdownIntent::Intentional);
    }
}

impl SessionInner {
    async fn connect(self: &Arc<Self>, cancel: Option<&CancellationToken>) -> Result<(), SessionError> {
        let drive = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| SessionError::Closed)?;
            match state.phase {
                Phase::Ready => return Ok(()),
                Phase::Disposed => return Err(SessionError::Closed),
                Phase::Connecting | Phase::HandshakePending => false,
                Phase::Idle => {
                    state.phase = Phase::Connecting;
                    true
                }
            }
        };

        let rx = {
            let (tx, rx) = oneshot::channel();
            let mut pending = self.pending.lock().map_err(|_| SessionError::Closed)?;
            pending.handshake.push(tx);
            rx
        };

        if drive {
            let connect = TcpStream::connect(self.addr);
            match tokio::time::timeout(self.config.connect_timeout, connect).await {
                Ok(Ok(stream)) => {
                    if let Err(err) = self.install_transport(stream) {
                        self.shutdown(ShutdownIntent::Unintentional);
                        return Err(err);
                    }
                }
                Ok(Err(err)) => {
                    let message = err.to_string();
                    self.shutdown(ShutdownIntent::Unintentional);
                    return Err(SessionError::Transport(message));
                }
                Err(_) => {
                    self.shutdown(ShutdownIntent::Unintentional);
                    return Err(SessionError::Timeout("connect"));
                }
            }
        }

        self.await_response(rx, self.config.request_timeout, cancel, Correlator::Handshake)
            .await
    }

    fn install_transport(self: &Arc<Self>, stream: TcpStream) -> Result<(), SessionError> {
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        {
            let mut writer = self.writer.lock().map_err(|_| SessionError::Closed)?;
            *writer = Some(writer_tx);
        }
        // The phase must read HandshakePending before the reader can
        // dispatch an eager peer's version message.
        {
            let mut state = self.state.lock().map_err(|_| SessionError::Closed)?;
            if state.phase == Phase::Connecting {
                state.phase = Phase::HandshakePending;
            }
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut write_half = write_half;
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    queued = writer_rx.recv() => match queued {
                        Some(bytes) => {
                            if let Err(err) = write_half.write_all(&bytes).await {
                                inner.on_transport_error(err.to_string());
                                break;
                            }
                            if let Err(err) = write_half.flush().await {
                                inner.on_transport_error(err.to_string());
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut read_half = read_half;
            let mut buffer: Vec<u8> = Vec::new();
            let mut chunk = vec![0u8; 64 * 1024];
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        inner.shutdown(ShutdownIntent::Intentional);
                        break;
                    }
                    read = read_half.read(&mut chunk) => match read {
                        Ok(0) => {
                            inner.on_transport_error("connection closed by peer".to_string());
                            break;
                        }
                        Ok(count) => {
                            inner.liveness.note_online();
                            buffer.extend_from_slice(&chunk[..count]);
                            let result = deframe(&buffer, inner.config.magic);
                            buffer = result.remaining;
                            for (command, reason) in result.errors {
                                warn!(peer = %inner.addr, %command, %reason, "dropping corrupt frame");
                            }
                            for (command, payload) in result.messages {
                                inner.dispatch(&command, &payload);
                            }
                        }
                        Err(err) => {
                            inner.on_transport_error(err.to_string());
                            break;
                        }
                    }
                }
            }
        });

        self.send_version()?;
        Ok(())
    }

    fn send_version(&self) -> Result<(), SessionError> {
        let start_height = self
            .state
            .lock()
            .map(|state| state.start_height as i32)
            .unwrap_or(0);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        let message = chaintip_wire::VersionMessage {
            version: self.config.protocol_version,
            services: NODE_NETWORK,
            timestamp,
            recv_addr: chaintip_wire::NetAddr::from_socket_addr(self.addr, NODE_NETWORK),
            from_addr: chaintip_wire::NetAddr::unroutable(),
            nonce: rand::random(),
            user_agent: self.config.user_agent.clone(),
            start_height,
            relay: false,
        };
        self.send_frame(commands::VERSION, &chaintip_wire::build_version(&message))
    }

    fn send_frame(&self, command: &str, payload: &[u8]) -> Result<(), SessionError> {
        let bytes = frame(self.config.magic, command, payload)
            .map_err(|err| SessionError::Transport(err.to_string()))?;
        let writer = self.writer.lock().map_err(|_| SessionError::Closed)?;
        match writer.as_ref() {
            Some(tx) => tx.send(bytes).map_err(|_| SessionError::Closed),
            None => Err(SessionError::Closed),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send((self.addr, event));
    }

    // ---- inbound dispatch -------------------------------------------------

    fn dispatch(self: &Arc<Self>, command: &str, payload: &[u8]) {
        match command {
            commands::VERSION => self.on_version(payload),
            commands::VERACK => self.on_verack(),
            commands::PING => {
                if let Ok(nonce) = chaintip_wire::parse_nonce(commands::PING, payload) {
                    let _ = self.send_frame(commands::PONG, &chaintip_wire::build_pong(nonce));
                }
            }
            commands::PONG => self.on_pong(payload),
            commands::HEADERS => self.on_headers(payload),
            commands::ADDR => self.on_addr(payload),
            commands::INV => self.on_inv(payload),
            other => {
                debug!(peer = %self.addr, command = other, "ignoring message");
            }
        }
    }

    fn on_version(self: &Arc<Self>, payload: &[u8]) {
        let complete = {
            let Ok(mut state) = self.state.lock() else { return };
            if state.phase != Phase::HandshakePending {
                return;
            }
            match chaintip_wire::parse_version(payload) {
                Ok(message) => {
                    state.remote_user_agent = Some(message.user_agent);
                    state.remote_start_height = message.start_height;
                }
                Err(err) => {
                    warn!(peer = %self.addr, %err, "unreadable version payload");
                }
            }
            state.version_received = true;
            state.verack_received
        };
        let _ = self.send_frame(commands::VERACK, &chaintip_wire::build_verack());
        if complete {
            self.complete_handshake();
        }
    }

    fn on_verack(self: &Arc<Self>) {
        let complete = {
            let Ok(mut state) = self.state.lock() else { return };
            if state.phase != Phase::HandshakePending {
                return;
            }
            state.verack_received = true;
            state.version_received
        };
        if complete {
            self.complete_handshake();
        }
    }

    fn complete_handshake(self: &Arc<Self>) {
        {
            let Ok(mut state) = self.state.lock() else { return };
            if state.phase != Phase::HandshakePending {
                return;
            }
            state.phase = Phase::Ready;
        }
        let waiters = {
            let Ok(mut pending) = self.pending.lock() else { return };
            std::mem::take(&mut pending.handshake)
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        self.emit(SessionEvent::Connected);
        self.spawn_keepalive();
    }

    fn on_pong(&self, payload: &[u8]) {
        let Ok(nonce) = chaintip_wire::parse_nonce(commands::PONG, payload) else {
            warn!(peer = %self.addr, "unreadable pong payload");
            return;
        };
        let waiter = {
            let Ok(mut pending) = self.pending.lock() else { return };
            pending.pings.remove(&nonce)
        };
        let Some(waiter) = waiter else {
            debug!(peer = %self.addr, nonce, "pong with no pending ping");
            return;
        };
        let duration = waiter.sent_at.elapsed();
        let _ = waiter.tx.send(Ok(duration));
        self.emit(SessionEvent::Pong { duration, nonce });
    }

    fn on_headers(&self, payload: &[u8]) {
        let waiter = {
            let Ok(mut pending) = self.pending.lock() else { return };
            pending.getheaders.take()
        };
        match chaintip_wire::parse_headers(payload, false) {
            Ok(headers) => {
                if let Some(tx) = waiter {
                    let _ = tx.send(Ok(headers));
                } else {
                    debug!(peer = %self.addr, count = headers.len(), "unsolicited headers");
                }
            }
            Err(err) => {
                if let Some(tx) = waiter {
                    let _ = tx.send(Err(err.into()));
                } else {
                    warn!(peer = %self.addr, %err, "unreadable headers payload");
                }
            }
        }
    }

    fn on_addr(&self, payload: &[u8]) {
        let waiters = {
            let Ok(mut pending) = self.pending.lock() else { return };
            pending.getaddr_inflight = false;
            std::mem::take(&mut pending.getaddr)
        };
        match chaintip_wire::parse_addr(payload) {
            Ok(addrs) => {
                if waiters.is_empty() {
                    self.emit(SessionEvent::Addr(addrs));
                } else {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(addrs.clone()));
                    }
                }
            }
            Err(err) => {
                if waiters.is_empty() {
                    warn!(peer = %self.addr, %err, "unreadable addr payload");
                } else {
                    for waiter in waiters {
                        let _ = waiter.send(Err(SessionError::Parse(err.clone())));
                    }
                }
            }
        }
    }

    fn on_inv(&self, payload: &[u8]) {
        match chaintip_wire::parse_inv(payload) {
            Ok(entries) => {
                let hashes: Vec<Hash256> = entries
                    .iter()
                    .filter(|entry| entry.is_block())
                    .map(|entry| entry.hash)
                    .collect();
                if !hashes.is_empty() {
                    self.emit(SessionEvent::BlockHashes(hashes));
                }
            }
            Err(err) => {
                warn!(peer = %self.addr, %err, "unreadable inv payload");
            }
        }
    }

    // ---- correlated requests ----------------------------------------------

    async fn ping_request(self: &Arc<Self>, cancel: Option<&CancellationToken>) -> Result<Duration, SessionError> {
        let (nonce, rx) = {
            let mut pending = self.pending.lock().map_err(|_| SessionError::Closed)?;
            let nonce = loop {
                let candidate: u64 = rand::random();
                if !pending.pings.contains_key(&candidate) {
                    break candidate;
                }
            };
            let (tx, rx) = oneshot::channel();
            pending.pings.insert(
                nonce,
                PingWaiter {
                    tx,
                    sent_at: Instant::now(),
                },
            );
            (nonce, rx)
        };
        if let Err(err) = self.send_frame(commands::PING, &chaintip_wire::build_ping(nonce)) {
            self.remove_correlator(&Correlator::Ping(nonce));
            return Err(err);
        }
        {
            if let Ok(mut state) = self.state.lock() {
                state.last_ping_at = Some(Instant::now());
            }
        }
        self.await_response(rx, self.config.request_timeout, cancel, Correlator::Ping(nonce))
            .await
    }

    async fn getheaders_request(
        self: &Arc<Self>,
        locator: &[Hash256],
        stop: &Hash256,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<BlockHeader>, SessionError> {
        let rx = {
            let mut pending = self.pending.lock().map_err(|_| SessionError::Closed)?;
            if pending.getheaders.is_some() {
                return Err(SessionError::Busy("getheaders"));
            }
            let (tx, rx) = oneshot::channel();
            pending.getheaders = Some(tx);
            rx
        };
        let payload = chaintip_wire::build_getheaders(self.config.protocol_version, locator, stop);
        if let Err(err) = self.send_frame(commands::GETHEADERS, &payload) {
            self.remove_correlator(&Correlator::GetHeaders);
            return Err(err);
        }
        self.await_response(rx, self.config.request_timeout, cancel, Correlator::GetHeaders)
            .await
    }

    async fn getaddr_request(
        self: &Arc<Self>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<SocketAddr>, SessionError> {
        let (rx, issue) = {
            let mut pending = self.pending.lock().map_err(|_| SessionError::Closed)?;
            let (tx, rx) = oneshot::channel();
            pending.getaddr.push(tx);
            let issue = !pending.getaddr_inflight;
            pending.getaddr_inflight = true;
            (rx, issue)
        };
        if issue {
            if let Err(err) = self.send_frame(commands::GETADDR, &chaintip_wire::build_getaddr()) {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.getaddr_inflight = false;
                    pending.getaddr.clear();
                }
                return Err(err);
            }
        }
        self.await_response(rx, self.config.getaddr_timeout, cancel, Correlator::GetAddr)
            .await
    }

    async fn await_response<T>(
        self: &Arc<Self>,
        rx: oneshot::Receiver<Result<T, SessionError>>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
        correlator: Correlator,
    ) -> Result<T, SessionError> {
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            outcome = rx => match outcome {
                Ok(result) => result,
                Err(_) => Err(SessionError::Closed),
            },
            _ = tokio::time::sleep(timeout) => {
                self.remove_correlator(&correlator);
                self.shutdown(ShutdownIntent::Unintentional);
                Err(SessionError::Timeout(correlator.name()))
            }
            _ = cancelled => {
                // Caller cancellation frees the correlator but leaves the
                // transport up.
                self.remove_correlator(&correlator);
                Err(SessionError::Cancelled)
            }
        }
    }

    fn remove_correlator(&self, correlator: &Correlator) {
        let Ok(mut pending) = self.pending.lock() else { return };
        match correlator {
            Correlator::Ping(nonce) => {
                pending.pings.remove(nonce);
            }
            Correlator::GetHeaders => {
                pending.getheaders = None;
            }
            // Coalesced waiters: dropping the receiver is enough; the
            // in-flight request stays live for the other callers.
            Correlator::Handshake | Correlator::GetAddr => {}
        }
    }

    // ---- keepalive --------------------------------------------------------

    fn spawn_keepalive(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(inner.config.ping_interval) => {}
                }
                let fresh_evidence = inner.liveness.online_within(Duration::from_secs(1));
                let pinged_recently = inner
                    .state
                    .lock()
                    .ok()
                    .and_then(|state| state.last_ping_at)
                    .is_some_and(|at| at.elapsed() < KEEPALIVE_FRESH);
                // An already-proven-live process with a recently-pinged peer
                // can skip a round; active traffic is keepalive enough.
                if fresh_evidence && pinged_recently {
                    continue;
                }
                if inner.ping_request(None).await.is_err() {
                    break;
                }
            }
        });
    }

    // ---- header sync ------------------------------------------------------

    async fn sync_headers(self: &Arc<Self>, cancel: Option<&CancellationToken>) -> Result<(), SessionError> {
        let _serial = self.sync_serial.lock().await;
        let _active = SyncGuard::enter(&self.sync_count);

        let mut from = self.chain.block_locator().await;
        let mut slow_guard_used = false;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SessionError::Closed);
            }
            let headers = self.getheaders_request(&from, &ZERO_HASH, cancel).await?;
            if headers.is_empty() {
                return self.finish_sync().await;
            }

            let batch_len = headers.len();
            let peer_tip = headers[batch_len - 1].hash();
            if let Ok(mut state) = self.state.lock() {
                state.peer_tip = Some(peer_tip);
            }

            let changeset = self.chain.add_headers(&headers).await;
            if !changeset.invalidated.is_empty() {
                self.emit(SessionEvent::InvalidBlocks(changeset.invalidated));
                return Err(SessionError::InvalidChain);
            }
            if !self.chain.contains(&peer_tip).await {
                self.shutdown(ShutdownIntent::Unintentional);
                return Err(SessionError::Protocol("non-contiguous headers"));
            }
            let advanced = !changeset.added.is_empty();
            if advanced {
                let (height, _, hash_hex) = self.chain.tip_summary().await;
                self.emit(SessionEvent::NewChainTip { height, hash_hex });
            }

            // A peer far behind a parallel sync would re-serve headers the
            // graph already has; wait out the burst once, then re-anchor.
            if !slow_guard_used {
                if let Some((peer_height, on_chain)) = self.chain.node_summary(&peer_tip).await {
                    let (tip_height, _, _) = self.chain.tip_summary().await;
                    let behind = tip_height.saturating_sub(peer_height) as usize;
                    if on_chain && behind > 4 * batch_len {
                        slow_guard_used = true;
                        self.wait_for_stable_tip(cancel).await?;
                        if let Ok(mut state) = self.state.lock() {
                            state.peer_tip = None;
                        }
                        from = self.chain.block_locator().await;
                        continue;
                    }
                }
            }

            if !advanced && from.len() == 1 && from[0] == peer_tip {
                // The peer keeps re-serving the same batch.
                return self.finish_sync().await;
            }
            from = vec![peer_tip];
        }
    }

    /// The peer ran dry; decide whether that means it is out of sync.
    async fn finish_sync(self: &Arc<Self>) -> Result<(), SessionError> {
        let (peer_tip, start_tip) = {
            let Ok(state) = self.state.lock() else {
                return Ok(());
            };
            (state.peer_tip, state.start_tip)
        };
        let Some(peer_tip) = peer_tip else {
            return Ok(());
        };
        let (tip_height, tip_hash, _) = self.chain.tip_summary().await;
        if peer_tip == start_tip || peer_tip == tip_hash {
            return Ok(());
        }
        let Some(peer_height) = self.chain.height_of(&peer_tip).await else {
            return Ok(());
        };
        if tip_height.saturating_sub(peer_height) >= self.config.out_of_sync_lag {
            self.emit(SessionEvent::OutOfSync);
            return Err(SessionError::OutOfSync);
        }
        Ok(())
    }

    async fn wait_for_stable_tip(&self, cancel: Option<&CancellationToken>) -> Result<(), SessionError> {
        let (_, mut last_tip, _) = self.chain.tip_summary().await;
        let mut stable_since = Instant::now();
        loop {
            let cancelled = async {
                match cancel {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Closed),
                _ = cancelled => return Err(SessionError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
            let (_, tip, _) = self.chain.tip_summary().await;
            if tip != last_tip {
                last_tip = tip;
                stable_since = Instant::now();
            } else if stable_since.elapsed() >= self.config.tip_stable_wait {
                return Ok(());
            }
        }
    }

    async fn on_valid_chain(self: &Arc<Self>, cancel: Option<&CancellationToken>) -> Result<bool, SessionError> {
        for invalid in self.chain.invalid_hashes().await {
            let headers = self.getheaders_request(&[invalid], &ZERO_HASH, cancel).await?;
            if let Some(first) = headers.first() {
                if first.prev_hash == invalid {
                    self.emit(SessionEvent::InvalidBlocks(headers));
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    // ---- teardown ---------------------------------------------------------

    fn on_transport_error(self: &Arc<Self>, message: String) {
        debug!(peer = %self.addr, %message, "transport closed");
        self.shutdown(ShutdownIntent::Unintentional);
    }

    fn shutdown(&self, intent: ShutdownIntent) {
        let kind = {
            let Ok(mut state) = self.state.lock() else { return };
            if state.phase == Phase::Disposed {
                return;
            }
            let kind = match intent {
                ShutdownIntent::Intentional => DisconnectKind::Intentional,
                ShutdownIntent::Unintentional => {
                    if state.phase == Phase::Ready {
                        DisconnectKind::UnintentionalAfterConnect
                    } else {
                        DisconnectKind::UnintentionalBeforeConnect
                    }
                }
            };
            state.phase = Phase::Disposed;
            kind
        };
        self.cancel.cancel();
        if let Ok(mut writer) = self.writer.lock() {
            *writer = None;
        }
        self.flush_waiters();
        self.emit(SessionEvent::Disconnected(kind));
    }

    fn flush_waiters(&self) {
        let Ok(mut pending) = self.pending.lock() else { return };
        for waiter in std::mem::take(&mut pending.handshake) {
            let _ = waiter.send(Err(SessionError::Closed));
        }
        for (_, waiter) in pending.pings.drain() {
            let _ = waiter.tx.send(Err(SessionError::Closed));
        }
        if let Some(waiter) = pending.getheaders.take() {
            let _ = waiter.send(Err(SessionError::Closed));
        }
        for waiter in std::mem::take(&mut pending.getaddr) {
            let _ = waiter.send(Err(SessionError::Closed));
        }
        pending.getaddr_inflight = false;
    }
}

/// RAII marker for "this session is inside its sync loop".
struct SyncGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> SyncGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
