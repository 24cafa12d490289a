//! Shared handle over the header graph.
//!
//! All mutation funnels through this wrapper, which keeps the single-writer
//! discipline (one `RwLock` writer at a time) and forwards accepted
//! changesets to the write-behind persistence queue. The in-memory graph is
//! authoritative the moment `add_headers` returns.

use std::sync::Arc;

use chaintip_consensus::Hash256;
use chaintip_graph::{Changeset, HeaderGraph};
use chaintip_primitives::BlockHeader;
use tokio::sync::{mpsc, RwLock};

#[derive(Clone)]
pub struct Chain {
    graph: Arc<RwLock<HeaderGraph>>,
    persist: Option<mpsc::UnboundedSender<Changeset>>,
}

impl Chain {
    pub fn new(graph: HeaderGraph) -> Self {
        Self {
            graph: Arc::new(RwLock::new(graph)),
            persist: None,
        }
    }

    pub fn with_persistence(mut self, tx: mpsc::UnboundedSender<Changeset>) -> Self {
        self.persist = Some(tx);
        self
    }

    pub async fn add_headers(&self, batch: &[BlockHeader]) -> Changeset {
        let changeset = self.graph.write().await.add_headers(batch);
        if let Some(tx) = &self.persist {
            if !changeset.added.is_empty() || !changeset.removed.is_empty() {
                let _ = tx.send(changeset.clone());
            }
        }
        changeset
    }

    pub async fn block_locator(&self) -> Vec<Hash256> {
        self.graph.read().await.block_locator()
    }

    /// `(height, hash, display hex)` of the current tip.
    pub async fn tip_summary(&self) -> (u32, Hash256, String) {
        let graph = self.graph.read().await;
        let tip = graph.tip();
        (tip.height, tip.hash, tip.header.hash_hex())
    }

    /// `(height, lies on the longest chain)` for a known hash.
    pub async fn node_summary(&self, hash: &Hash256) -> Option<(u32, bool)> {
        let graph = self.graph.read().await;
        let node = graph.get_by_hash(hash)?;
        let on_chain = graph
            .get_by_height(node.height)
            .is_some_and(|chain_node| chain_node.hash == node.hash);
        Some((node.height, on_chain))
    }

    pub async fn contains(&self, hash: &Hash256) -> bool {
        self.graph.read().await.contains(hash)
    }

    pub async fn genesis_hash(&self) -> Hash256 {
        self.graph.read().await.genesis_hash()
    }

    pub async fn invalid_hashes(&self) -> Vec<Hash256> {
        self.graph.read().await.invalid_hashes().copied().collect()
    }

    pub async fn header_by_height(&self, height: u32) -> Option<BlockHeader> {
        self.graph
            .read()
            .await
            .get_by_height(height)
            .map(|node| node.header)
    }

    pub async fn header_by_hash(&self, hash: &Hash256) -> Option<BlockHeader> {
        self.graph
            .read()
            .await
            .get_by_hash(hash)
            .map(|node| node.header)
    }

    pub async fn height_of(&self, hash: &Hash256) -> Option<u32> {
        self.graph.read().await.get_by_hash(hash).map(|node| node.height)
    }

    pub async fn prune_branches(&self) -> usize {
        self.graph.write().await.prune_branches()
    }
}
