//! The embedding-facing facade: lifecycle, read-only queries, and the
//! `new_chain_tip` subscription.

use std::sync::Arc;

use chaintip_consensus::params::{chain_params, ChainParams};
use chaintip_consensus::{hash256_from_hex, Hash256};
use chaintip_graph::HeaderGraph;
use chaintip_primitives::BlockHeader;
use chaintip_storage::memory::MemoryStore;
use chaintip_storage::KeyValueStore;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::Chain;
use crate::config::Config;
use crate::error::ClientError;
use crate::events::TipEvent;
use crate::liveness::LivenessMonitor;
use crate::peer_book::PeerBook;
use crate::pool::PeerPool;
use crate::store;

enum RunState {
    Stopped,
    Running {
        cancel: CancellationToken,
        pool: PeerPool,
        tasks: Vec<JoinHandle<()>>,
    },
}

pub struct HeaderClient {
    config: Config,
    params: ChainParams,
    chain_template: HeaderGraphSeed,
    chain: AsyncMutex<Option<Chain>>,
    book: Arc<PeerBook>,
    tip_tx: broadcast::Sender<TipEvent>,
    state: AsyncMutex<RunState>,
}

/// Everything needed to rebuild the graph on each `start`.
struct HeaderGraphSeed {
    genesis: BlockHeader,
    invalid: Vec<Hash256>,
}

impl HeaderClient {
    pub fn new(config: Config) -> Result<Self, ClientError> {
        let network = config.network()?;
        let params = chain_params(network);

        let genesis = BlockHeader::parse(&params.genesis_header, false)
            .map_err(|err| ClientError::Config(format!("genesis header: {err}")))?;

        let mut invalid = Vec::new();
        for hex in params
            .invalid_blocks
            .iter()
            .copied()
            .map(str::to_string)
            .chain(config.invalid_blocks.iter().cloned())
        {
            let hash = hash256_from_hex(&hex)
                .map_err(|_| ClientError::Config(format!("invalid block hash: {hex}")))?;
            invalid.push(hash);
        }

        let (tip_tx, _) = broadcast::channel(256);
        Ok(Self {
            config,
            params,
            chain_template: HeaderGraphSeed { genesis, invalid },
            chain: AsyncMutex::new(None),
            book: Arc::new(PeerBook::new()),
            tip_tx,
            state: AsyncMutex::new(RunState::Stopped),
        })
    }

    /// Subscribe to `new_chain_tip` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TipEvent> {
        self.tip_tx.subscribe()
    }

    /// Ask the pool to try a specific peer ahead of rating-based selection.
    pub async fn connect_peer(&self, addr: std::net::SocketAddr) {
        let state = self.state.lock().await;
        if let RunState::Running { pool, .. } = &*state {
            pool.add_priority_peer(addr);
        }
    }

    /// Blacklist cutoff currently in force, mostly for diagnostics.
    pub fn blacklist_threshold(&self) -> f64 {
        self.book.threshold()
    }

    /// Bring the client up: open stores, replay persisted headers, launch
    /// the liveness monitor, persistence writers and the peer pool.
    /// Idempotent; a second call while running is a no-op.
    pub async fn start(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        if matches!(*state, RunState::Running { .. }) {
            return Ok(());
        }

        let network = self.config.network()?;
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let headers_store = self.open_store(self.config.headers_store_path(network))?;
        let peers_store = self.open_store(self.config.peers_store_path(network))?;

        // Rebuild the graph and replay what the stores remember.
        let graph = HeaderGraph::new(
            self.chain_template.genesis,
            self.chain_template.invalid.iter().copied(),
        )?;
        store::persist_genesis(headers_store.as_ref(), &self.chain_template.genesis.serialize());

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let chain = Chain::new(graph).with_persistence(persist_tx);
        match store::load_headers(headers_store.as_ref()) {
            Ok(headers) if !headers.is_empty() => {
                let changeset = chain.add_headers(&headers).await;
                info!(
                    restored = changeset.added.len(),
                    "restored persisted header chain"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "could not read persisted headers; starting from genesis"),
        }

        match store::load_peers(peers_store.as_ref(), &self.book) {
            Ok(loaded) if loaded > 0 => info!(loaded, "restored peer metrics"),
            Ok(_) => {}
            Err(err) => warn!(%err, "could not read persisted peer metrics"),
        }

        tasks.push(store::spawn_header_writer(
            headers_store,
            persist_rx,
            cancel.clone(),
        ));
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        self.book.set_persist(Some(peer_tx));
        tasks.push(store::spawn_peer_writer(peers_store, peer_rx, cancel.clone()));

        let liveness = LivenessMonitor::new(std::time::Duration::from_secs(
            self.config.liveness_poll_secs,
        ));
        tasks.push(liveness.spawn(cancel.clone()));

        let pool = PeerPool::new(
            self.params.clone(),
            self.config.clone(),
            chain.clone(),
            Arc::clone(&self.book),
            liveness,
            cancel.clone(),
            self.tip_tx.clone(),
        );
        tasks.extend(pool.spawn());

        *self.chain.lock().await = Some(chain);
        *state = RunState::Running { cancel, pool, tasks };
        info!(chain = network.as_str(), "header client started");
        Ok(())
    }

    /// Abort background work, drain the persistence queues, and dispose all
    /// sessions. A subsequent `start` resets the cancellation token.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let RunState::Running { cancel, pool, tasks } =
            std::mem::replace(&mut *state, RunState::Stopped)
        else {
            return;
        };
        self.book.set_persist(None);
        cancel.cancel();
        pool.dispose_sessions().await;
        for task in tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(%err, "background task ended abnormally");
                }
            }
        }
        info!("header client stopped");
    }

    fn open_store(
        &self,
        path: Option<std::path::PathBuf>,
    ) -> Result<Arc<dyn KeyValueStore>, ClientError> {
        match path {
            None => Ok(Arc::new(MemoryStore::new())),
            #[cfg(feature = "fjall")]
            Some(path) => Ok(Arc::new(
                chaintip_storage::fjall::FjallStore::open(path)?,
            )),
            #[cfg(not(feature = "fjall"))]
            Some(_) => Err(ClientError::Config(
                "database_path configured but the fjall feature is disabled".to_string(),
            )),
        }
    }

    async fn chain(&self) -> Option<Chain> {
        self.chain.lock().await.clone()
    }

    /// `(height, hash hex)` of the current tip.
    pub async fn get_tip(&self) -> Option<(u32, String)> {
        let chain = self.chain().await?;
        let (height, _, hash_hex) = chain.tip_summary().await;
        Some((height, hash_hex))
    }

    pub async fn get_header_by_height(&self, height: u32) -> Option<BlockHeader> {
        self.chain().await?.header_by_height(height).await
    }

    pub async fn get_header_by_hash(&self, hash: &Hash256) -> Option<BlockHeader> {
        self.chain().await?.header_by_hash(hash).await
    }
}
