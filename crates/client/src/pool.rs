//! The peer pool: keeps a target number of verified sessions alive, feeds
//! observed behavior into the peer book, and defends against coordinated
//! mass disconnects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chaintip_consensus::params::ChainParams;
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bootstrap::{fetch_bootstrap_peers, resolve_seed_addresses};
use crate::chain::Chain;
use crate::config::Config;
use crate::error::SessionError;
use crate::events::{DisconnectKind, SessionEvent, TipEvent};
use crate::liveness::LivenessMonitor;
use crate::peer_book::PeerBook;
use crate::session::{PeerSession, SessionConfig};
use crate::unix_now_ms;

/// Below this many non-blacklisted addresses the pool bootstraps more.
const MIN_ADDRESS_POOL: usize = 16;
/// Address database cap enforced by the health monitor.
const MAX_ADDRESS_BOOK: usize = 4_000;
/// Candidates drawn from the top of the rating index.
const TOP_CANDIDATES: usize = 1;
const HEALTH_INTERVAL: Duration = Duration::from_secs(30 * 60);
const BOOTSTRAP_COOLDOWN_MS: u64 = 60_000;
const BOOTSTRAP_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Retention for the mass-disconnect correlation buffer.
const DISCONNECT_BUFFER_MS: u64 = 10_000;

/// More than half of the previously-connected others dropped alongside this
/// peer: treat the event as an upstream failure, not peer misbehavior.
fn is_mass_disconnect(before_others: usize, remaining_others: usize) -> bool {
    if before_others == 0 {
        return false;
    }
    (remaining_others + before_others / 2).saturating_sub(1) < before_others
}

#[derive(Default)]
struct SessionMaps {
    verified: HashMap<SocketAddr, Arc<PeerSession>>,
    connecting: HashSet<SocketAddr>,
}

struct PoolInner {
    params: ChainParams,
    config: Config,
    session_config: SessionConfig,
    chain: Chain,
    book: Arc<PeerBook>,
    liveness: Arc<LivenessMonitor>,
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<(SocketAddr, SessionEvent)>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<(SocketAddr, SessionEvent)>>>,
    tip_tx: broadcast::Sender<TipEvent>,
    sessions: AsyncMutex<SessionMaps>,
    /// Caller-requested addresses, tried before the rating index.
    priority: StdMutex<VecDeque<SocketAddr>>,
    sync_count: Arc<AtomicUsize>,
    /// `(addr, unix ms)` of recent after-connect drops, for correlation.
    recent_disconnects: StdMutex<VecDeque<(SocketAddr, u64)>>,
    /// Cancelled when the target is reached to prune idle connect attempts.
    round_cancel: StdMutex<CancellationToken>,
    bootstrap_fetched: AtomicBool,
    last_bootstrap_ms: StdMutex<u64>,
    health_started: AtomicBool,
}

pub struct PeerPool {
    inner: Arc<PoolInner>,
}

impl PeerPool {
    pub fn new(
        params: ChainParams,
        config: Config,
        chain: Chain,
        book: Arc<PeerBook>,
        liveness: Arc<LivenessMonitor>,
        cancel: CancellationToken,
        tip_tx: broadcast::Sender<TipEvent>,
    ) -> Self {
        let session_config = SessionConfig::from_params(&params, &config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let round_cancel = cancel.child_token();
        Self {
            inner: Arc::new(PoolInner {
                params,
                config,
                session_config,
                chain,
                book,
                liveness,
                cancel,
                events_tx,
                events_rx: StdMutex::new(Some(events_rx)),
                tip_tx,
                sessions: AsyncMutex::new(SessionMaps::default()),
                priority: StdMutex::new(VecDeque::new()),
                sync_count: Arc::new(AtomicUsize::new(0)),
                recent_disconnects: StdMutex::new(VecDeque::new()),
                round_cancel: StdMutex::new(round_cancel),
                bootstrap_fetched: AtomicBool::new(false),
                last_bootstrap_ms: StdMutex::new(0),
                health_started: AtomicBool::new(false),
            }),
        }
    }

    /// Launch the event loop and the connection workers.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(events_rx) = self
            .inner
            .events_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
        {
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(async move {
                inner.event_loop(events_rx).await;
            }));
        }

        for worker in 0..self.inner.config.workers() {
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(async move {
                inner.worker_loop(worker).await;
            }));
        }
        handles
    }

    /// Try this address before anything the rating index suggests.
    pub fn add_priority_peer(&self, addr: SocketAddr) {
        if let Ok(mut priority) = self.inner.priority.lock() {
            priority.push_back(addr);
        }
        self.inner.book.add_seen(addr);
    }

    pub async fn verified_count(&self) -> usize {
        self.inner.sessions.lock().await.verified.len()
    }

    pub async fn verified_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .sessions
            .lock()
            .await
            .verified
            .keys()
            .copied()
            .collect()
    }

    /// Dispose every session; used on client stop after cancellation.
    pub async fn dispose_sessions(&self) {
        let sessions: Vec<Arc<PeerSession>> = {
            let mut maps = self.inner.sessions.lock().await;
            maps.connecting.clear();
            maps.verified.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.dispose();
        }
    }
}

impl PoolInner {
    // ---- event fan-in -----------------------------------------------------

    async fn event_loop(
        self: Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<(SocketAddr, SessionEvent)>,
    ) {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = events_rx.recv() => received,
            };
            let Some((addr, event)) = received else { break };
            match event {
                SessionEvent::Connected => self.book.add_last_connect(addr),
                SessionEvent::Pong { duration, .. } => {
                    self.book.add_ping(addr, duration.as_millis() as u64);
                }
                SessionEvent::NewChainTip { height, hash_hex } => {
                    self.book.add_data_received(addr);
                    let _ = self.tip_tx.send(TipEvent { height, hash_hex });
                }
                SessionEvent::InvalidBlocks(_) => {
                    self.book.add_invalid_chain(addr);
                    self.drop_session(addr).await;
                }
                SessionEvent::OutOfSync => {
                    self.book.add_out_of_sync(addr);
                    self.drop_session(addr).await;
                }
                SessionEvent::Addr(addrs) => self.book.add_seen_batch(&addrs),
                SessionEvent::BlockHashes(_) => self.opportunistic_sync(addr).await,
                SessionEvent::Disconnected(kind) => self.on_disconnected(addr, kind).await,
            }
        }
    }

    async fn drop_session(self: &Arc<Self>, addr: SocketAddr) {
        let session = self.sessions.lock().await.verified.remove(&addr);
        if let Some(session) = session {
            session.dispose();
        }
    }

    async fn opportunistic_sync(self: &Arc<Self>, addr: SocketAddr) {
        let session = self.sessions.lock().await.verified.get(&addr).cloned();
        if let Some(session) = session {
            tokio::spawn(async move {
                if let Err(err) = session.sync_headers(None).await {
                    debug!(peer = %session.addr(), %err, "announcement-driven sync failed");
                }
            });
        }
    }

    async fn on_disconnected(self: &Arc<Self>, addr: SocketAddr, kind: DisconnectKind) {
        let before_others = {
            let mut maps = self.sessions.lock().await;
            maps.verified.remove(&addr);
            maps.verified.len()
        };
        match kind {
            DisconnectKind::Intentional => {}
            DisconnectKind::UnintentionalBeforeConnect => {
                self.book.add_unintentional_disconnect(addr);
            }
            DisconnectKind::UnintentionalAfterConnect => {
                self.correlate_disconnect(addr, before_others);
            }
        }
    }

    /// Defer the penalty decision until the correlation window closes.
    fn correlate_disconnect(self: &Arc<Self>, addr: SocketAddr, before_others: usize) {
        let now = unix_now_ms();
        let window_ms = self.config.recent_disconnect_window_ms;
        if let Ok(mut recent) = self.recent_disconnects.lock() {
            recent.push_back((addr, now));
            while let Some((_, at)) = recent.front() {
                if now.saturating_sub(*at) > DISCONNECT_BUFFER_MS {
                    recent.pop_front();
                } else {
                    break;
                }
            }
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(window_ms)).await;
            let dropped_others = inner
                .recent_disconnects
                .lock()
                .map(|recent| {
                    recent
                        .iter()
                        .filter(|(other, at)| {
                            *other != addr && at.abs_diff(now) <= window_ms
                        })
                        .count()
                })
                .unwrap_or(0);
            let remaining = before_others.saturating_sub(dropped_others);
            if is_mass_disconnect(before_others, remaining) {
                info!(peer = %addr, dropped_others, "mass disconnect; not penalizing");
            } else {
                inner.book.add_unintentional_disconnect(addr);
            }
        });
    }

    // ---- connection establishment -----------------------------------------

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "connection worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.sessions.lock().await.verified.len() >= self.config.target_connections {
                self.idle_sleep(Duration::from_secs(1)).await;
                continue;
            }
            if self.book.non_blacklisted_count() < MIN_ADDRESS_POOL {
                self.bootstrap_addresses().await;
            }
            let Some(addr) = self.pick_candidate().await else {
                self.idle_sleep(Duration::from_secs(1)).await;
                continue;
            };
            let round = self.round_token();
            match self.verify_candidate(addr, &round, false).await {
                Ok(session) => self.install(session).await,
                // Another worker beat us to this address; just pick again.
                Err(SessionError::Busy(_)) => {}
                Err(err) => {
                    debug!(peer = %addr, %err, "candidate failed verification");
                    if !self.liveness.is_online().await {
                        // Our own uplink is down; the failure says nothing
                        // about the peer.
                        self.idle_sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    async fn idle_sleep(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Fresh round token once the previous round was pruned.
    fn round_token(&self) -> CancellationToken {
        let Ok(mut slot) = self.round_cancel.lock() else {
            return self.cancel.child_token();
        };
        if slot.is_cancelled() {
            *slot = self.cancel.child_token();
        }
        slot.clone()
    }

    async fn pick_candidate(&self) -> Option<SocketAddr> {
        let exclude: HashSet<SocketAddr> = {
            let maps = self.sessions.lock().await;
            maps.verified.keys().chain(maps.connecting.iter()).copied().collect()
        };
        if let Ok(mut priority) = self.priority.lock() {
            while let Some(addr) = priority.pop_front() {
                if !exclude.contains(&addr) {
                    return Some(addr);
                }
            }
        }
        let top = self.book.top_rated(TOP_CANDIDATES, &exclude);
        top.choose(&mut rand::thread_rng()).copied()
    }

    async fn begin_connecting(&self, addr: SocketAddr) -> bool {
        let mut maps = self.sessions.lock().await;
        if maps.verified.contains_key(&addr) {
            return false;
        }
        maps.connecting.insert(addr)
    }

    async fn end_connecting(&self, addr: SocketAddr) {
        self.sessions.lock().await.connecting.remove(&addr);
    }

    /// The composite verify: connect, ping, invalid-chain probe, header
    /// sync, and opportunistically an address refresh.
    async fn verify_candidate(
        self: &Arc<Self>,
        addr: SocketAddr,
        round: &CancellationToken,
        always_get_addr: bool,
    ) -> Result<Arc<PeerSession>, SessionError> {
        if !self.begin_connecting(addr).await {
            return Err(SessionError::Busy("session"));
        }
        let session = Arc::new(
            PeerSession::new(
                addr,
                self.session_config.clone(),
                self.chain.clone(),
                Arc::clone(&self.liveness),
                self.events_tx.clone(),
                &self.cancel,
                Arc::clone(&self.sync_count),
            )
            .await,
        );
        let result = self.run_verify(&session, round, always_get_addr).await;
        self.end_connecting(addr).await;
        match result {
            Ok(()) => {
                self.book.add_last_connect_and_test(addr);
                Ok(session)
            }
            Err(err) => {
                session.dispose();
                Err(err)
            }
        }
    }

    async fn run_verify(
        self: &Arc<Self>,
        session: &Arc<PeerSession>,
        round: &CancellationToken,
        always_get_addr: bool,
    ) -> Result<(), SessionError> {
        session.connect(Some(round)).await?;
        session.ping(Some(round)).await?;
        if !session.on_valid_chain(Some(round)).await? {
            return Err(SessionError::InvalidChain);
        }
        session.sync_headers(Some(round)).await?;
        if always_get_addr || self.book.non_blacklisted_count() < MIN_ADDRESS_POOL {
            match session.get_addr(Some(round)).await {
                Ok(addrs) => self.book.add_seen_batch(&addrs),
                Err(err) => debug!(peer = %session.addr(), %err, "address refresh failed"),
            }
        }
        Ok(())
    }

    async fn install(self: &Arc<Self>, session: Arc<PeerSession>) {
        let addr = session.addr();
        let (installed, reached_target) = {
            let mut maps = self.sessions.lock().await;
            if maps.verified.len() >= self.config.target_connections {
                (false, true)
            } else {
                maps.verified.insert(addr, Arc::clone(&session));
                (true, maps.verified.len() >= self.config.target_connections)
            }
        };
        if !installed {
            // Excess beyond the target; the newest connection yields.
            session.dispose();
            return;
        }
        info!(peer = %addr, "peer verified and installed");
        if reached_target {
            if let Ok(slot) = self.round_cancel.lock() {
                slot.cancel();
            }
        }
        self.maybe_start_health_monitor();
    }

    // ---- bootstrap --------------------------------------------------------

    async fn bootstrap_addresses(self: &Arc<Self>) {
        let now = unix_now_ms();
        {
            let Ok(mut last) = self.last_bootstrap_ms.lock() else { return };
            if now.saturating_sub(*last) < BOOTSTRAP_COOLDOWN_MS {
                return;
            }
            *last = now;
        }

        if !self.bootstrap_fetched.swap(true, Ordering::SeqCst) {
            let url = self
                .config
                .bootstrap_url
                .clone()
                .or_else(|| self.params.bootstrap_url.map(str::to_string));
            if let Some(url) = url {
                match fetch_bootstrap_peers(&url, BOOTSTRAP_FETCH_TIMEOUT).await {
                    Ok(addrs) => {
                        info!(count = addrs.len(), "bootstrap peer list fetched");
                        self.book.add_seen_batch(&addrs);
                    }
                    Err(err) => warn!(%err, "bootstrap fetch failed; falling back to seeds"),
                }
            }
        }

        let mut seeds: Vec<String> = self.config.seed_nodes.clone();
        seeds.extend(self.params.fixed_seeds.iter().map(|seed| seed.to_string()));
        let addrs = resolve_seed_addresses(&seeds, self.params.default_port).await;
        if !addrs.is_empty() {
            self.book.add_seen_batch(&addrs);
        }
    }

    // ---- health monitor ---------------------------------------------------

    fn maybe_start_health_monitor(self: &Arc<Self>) {
        if self.health_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(HEALTH_INTERVAL) => {}
                }
                inner.health_cycle().await;
            }
        });
    }

    async fn health_cycle(self: &Arc<Self>) {
        // Refresh the address database through one extra connection.
        if let Some(addr) = self.pick_candidate().await {
            match self.verify_candidate(addr, &self.cancel.child_token(), true).await {
                Ok(session) => session.dispose(),
                Err(err) => debug!(peer = %addr, %err, "address refresh connection failed"),
            }
        }

        // Shed the oldest addresses above the cap, sparing live sessions.
        let keep: HashSet<SocketAddr> = {
            let maps = self.sessions.lock().await;
            maps.verified.keys().chain(maps.connecting.iter()).copied().collect()
        };
        let pruned = self.book.prune_oldest(MAX_ADDRESS_BOOK, &keep);
        if pruned > 0 {
            debug!(pruned, "address database pruned");
        }

        // Re-sync every verified session; laggards surface out_of_sync.
        let sessions: Vec<Arc<PeerSession>> = {
            let maps = self.sessions.lock().await;
            maps.verified.values().cloned().collect()
        };
        let mut join_set = JoinSet::new();
        for session in sessions {
            join_set.spawn(async move {
                if let Err(err) = session.sync_headers(None).await {
                    debug!(peer = %session.addr(), %err, "health sync failed");
                }
            });
        }
        while join_set.join_next().await.is_some() {}

        // Prune losing branches only while nothing is mid-sync.
        if self.sync_count.load(Ordering::SeqCst) == 0 {
            let pruned = self.chain.prune_branches().await;
            if pruned > 0 {
                debug!(pruned, "stale header branches pruned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lone_disconnect_is_penalized() {
        assert!(!is_mass_disconnect(7, 7));
        assert!(!is_mass_disconnect(0, 0));
    }

    #[test]
    fn majority_drop_is_a_network_event() {
        // Eight verified sessions, five of which drop together: each sees
        // seven others with four of them gone.
        assert!(is_mass_disconnect(7, 3));
        // All others gone at once.
        assert!(is_mass_disconnect(7, 0));
    }

    #[test]
    fn minority_drop_still_counts() {
        assert!(!is_mass_disconnect(7, 6));
        assert!(!is_mass_disconnect(2, 2));
    }
}
