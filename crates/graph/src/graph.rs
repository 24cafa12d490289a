use std::collections::{HashMap, HashSet};

use chaintip_consensus::Hash256;
use chaintip_pow::{header_work, CompactError};
use chaintip_primitives::BlockHeader;
use primitive_types::U256;

/// A vertex of the header tree.
///
/// Parent references are logical (`header.prev_hash` looked up in the arena),
/// never held pointers; that keeps nodes free of back-references and makes
/// branch pruning a plain map removal.
#[derive(Clone, Debug)]
pub struct HeaderNode {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: u32,
    /// Expected hashes for this header alone.
    pub work: U256,
    /// Cumulative work from genesis along the unique path, set once on link.
    pub work_total: U256,
}

impl HeaderNode {
    pub fn raw(&self) -> [u8; 80] {
        self.header.serialize()
    }
}

/// The outcome of one `add_headers` call.
#[derive(Clone, Debug, Default)]
pub struct Changeset {
    /// Nodes appended to the longest chain, in chain order.
    pub added: Vec<HeaderNode>,
    /// Nodes truncated from the longest chain, in chain order.
    pub removed: Vec<HeaderNode>,
    /// Headers rejected because they touch the invalid set.
    pub invalidated: Vec<BlockHeader>,
}

impl Changeset {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.invalidated.is_empty()
    }
}

pub struct HeaderGraph {
    by_hash: HashMap<Hash256, HeaderNode>,
    children: HashMap<Hash256, HashSet<Hash256>>,
    leaves: HashSet<Hash256>,
    longest_chain: Vec<Hash256>,
    longest_index: HashMap<Hash256, usize>,
    invalid_hashes: HashSet<Hash256>,
    genesis_hash: Hash256,
}

impl HeaderGraph {
    pub fn new(
        genesis: BlockHeader,
        invalid_hashes: impl IntoIterator<Item = Hash256>,
    ) -> Result<Self, CompactError> {
        let work = header_work(genesis.bits)?;
        let hash = genesis.hash();
        let node = HeaderNode {
            header: genesis,
            hash,
            height: 0,
            work,
            work_total: work,
        };

        let mut graph = Self {
            by_hash: HashMap::new(),
            children: HashMap::new(),
            leaves: HashSet::new(),
            longest_chain: Vec::new(),
            longest_index: HashMap::new(),
            invalid_hashes: invalid_hashes.into_iter().collect(),
            genesis_hash: hash,
        };
        graph.by_hash.insert(hash, node);
        graph.children.insert(hash, HashSet::new());
        graph.leaves.insert(hash);
        graph.longest_chain.push(hash);
        graph.longest_index.insert(hash, 0);
        Ok(graph)
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    pub fn tip(&self) -> &HeaderNode {
        let hash = self
            .longest_chain
            .last()
            .unwrap_or(&self.genesis_hash);
        &self.by_hash[hash]
    }

    /// Height of the current tip.
    pub fn height(&self) -> u32 {
        (self.longest_chain.len() - 1) as u32
    }

    /// Total nodes in the arena; never below one, genesis is always seeded.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn get_by_hash(&self, hash: &Hash256) -> Option<&HeaderNode> {
        self.by_hash.get(hash)
    }

    /// Look up a node on the longest chain by height.
    pub fn get_by_height(&self, height: u32) -> Option<&HeaderNode> {
        let hash = self.longest_chain.get(height as usize)?;
        self.by_hash.get(hash)
    }

    pub fn is_invalid(&self, hash: &Hash256) -> bool {
        self.invalid_hashes.contains(hash)
    }

    pub fn invalid_hashes(&self) -> impl Iterator<Item = &Hash256> {
        self.invalid_hashes.iter()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Insert a sequential (but untrusted) batch of headers.
    ///
    /// Scanning stops at the first header whose parent is unknown; the
    /// remainder of the batch is dropped while earlier links stay. Headers
    /// touching the invalid set are reported in `invalidated` together with
    /// their in-batch descendants, and also stop the scan.
    pub fn add_headers(&mut self, batch: &[BlockHeader]) -> Changeset {
        let mut changeset = Changeset::default();

        let hashes: Vec<Hash256> = batch.iter().map(|header| header.hash()).collect();
        let nontrivial = self.by_hash.len() > 1;

        let mut index = 0usize;
        while index < batch.len() {
            let header = &batch[index];
            let hash = hashes[index];

            if nontrivial && self.by_hash.contains_key(&hash) {
                index += 1;
                continue;
            }

            let Some(parent) = self.by_hash.get(&header.prev_hash) else {
                break;
            };
            let (parent_hash, parent_height, parent_total) =
                (parent.hash, parent.height, parent.work_total);

            if self.invalid_hashes.contains(&hash)
                || self.invalid_hashes.contains(&header.prev_hash)
            {
                changeset.invalidated.push(*header);
                let mut last = hash;
                let mut follow = index + 1;
                while follow < batch.len() && batch[follow].prev_hash == last {
                    last = hashes[follow];
                    changeset.invalidated.push(batch[follow]);
                    follow += 1;
                }
                break;
            }

            let Ok(work) = header_work(header.bits) else {
                break;
            };

            let node = HeaderNode {
                header: *header,
                hash,
                height: parent_height + 1,
                work,
                work_total: parent_total + work,
            };
            self.by_hash.insert(hash, node);
            self.children.entry(parent_hash).or_default().insert(hash);
            self.children.insert(hash, HashSet::new());
            self.leaves.remove(&parent_hash);
            self.leaves.insert(hash);
            index += 1;
        }

        let tip_hash = *self.longest_chain.last().unwrap_or(&self.genesis_hash);
        let tip_total = self.by_hash[&tip_hash].work_total;

        // Strictly greater work re-orgs; an equal-work leaf never displaces
        // the tip.
        let mut best_hash = tip_hash;
        let mut best_total = tip_total;
        for leaf in &self.leaves {
            let node = &self.by_hash[leaf];
            if node.work_total > best_total {
                best_hash = *leaf;
                best_total = node.work_total;
            }
        }

        if best_hash == tip_hash {
            return changeset;
        }

        // Walk the new tip back to the first node already on the longest
        // chain; that node is the common ancestor.
        let mut walked = Vec::new();
        let mut cursor = best_hash;
        while !self.longest_index.contains_key(&cursor) {
            let node = &self.by_hash[&cursor];
            walked.push(cursor);
            cursor = node.header.prev_hash;
        }
        let split = self.longest_index[&cursor] + 1;

        for hash in self.longest_chain.drain(split..) {
            self.longest_index.remove(&hash);
            changeset.removed.push(self.by_hash[&hash].clone());
        }
        for hash in walked.into_iter().rev() {
            self.longest_index.insert(hash, self.longest_chain.len());
            self.longest_chain.push(hash);
            changeset.added.push(self.by_hash[&hash].clone());
        }

        changeset
    }

    /// Descending locator: ten contiguous hashes from the tip, then
    /// exponentially widening gaps, genesis always last.
    pub fn block_locator(&self) -> Vec<Hash256> {
        let mut locator = Vec::new();
        let mut height = (self.longest_chain.len() - 1) as i64;
        let mut step = 1i64;
        loop {
            locator.push(self.longest_chain[height as usize]);
            if height == 0 {
                break;
            }
            if locator.len() >= 10 {
                step = step.saturating_mul(2);
            }
            height = (height - step).max(0);
        }
        locator
    }

    /// Delete every branch that lost to the longest chain.
    ///
    /// Callers must ensure no session is mid-sync; a branch about to receive
    /// an extension would otherwise vanish under it. Afterwards the tip is
    /// the only leaf.
    pub fn prune_branches(&mut self) -> usize {
        let tip_hash = *self.longest_chain.last().unwrap_or(&self.genesis_hash);
        let stale: Vec<Hash256> = self
            .leaves
            .iter()
            .filter(|leaf| **leaf != tip_hash)
            .copied()
            .collect();

        let mut removed = 0usize;
        for leaf in stale {
            let mut cursor = leaf;
            while !self.longest_index.contains_key(&cursor) {
                let Some(node) = self.by_hash.remove(&cursor) else {
                    // Shared stem already deleted through a sibling leaf.
                    break;
                };
                self.children.remove(&cursor);
                self.leaves.remove(&cursor);
                removed += 1;
                let parent = node.header.prev_hash;
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.remove(&cursor);
                }
                cursor = parent;
            }
        }
        removed
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        for (index, hash) in self.longest_chain.iter().enumerate() {
            let node = &self.by_hash[hash];
            assert_eq!(node.height as usize, index);
            assert_eq!(self.longest_index[hash], index);
        }
        let tip_total = self.tip().work_total;
        for leaf in &self.leaves {
            assert!(self.by_hash[leaf].work_total <= tip_total);
            assert!(self.children[leaf].is_empty());
        }
        for node in self.by_hash.values() {
            if node.hash == self.genesis_hash {
                continue;
            }
            let parent = &self.by_hash[&node.header.prev_hash];
            assert_eq!(node.work_total, parent.work_total + node.work);
            assert_eq!(node.height, parent.height + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaintip_consensus::hash256_to_hex;
    use chaintip_consensus::params::{chain_params, Network};

    const EARLY_WORK: u64 = 4_295_032_833;

    fn genesis() -> BlockHeader {
        let params = chain_params(Network::Mainnet);
        BlockHeader::parse(&params.genesis_header, false).expect("genesis")
    }

    /// A synthetic child at minimum mainnet difficulty; `salt` makes the
    /// hash unique.
    fn child_of(parent: &BlockHeader, salt: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: parent.hash(),
            merkle_root: {
                let mut root = [0u8; 32];
                root[0..4].copy_from_slice(&salt.to_le_bytes());
                root
            },
            time: 1_231_006_505 + salt,
            bits: 0x1d00_ffff,
            nonce: salt,
        }
    }

    fn linear_chain(from: &BlockHeader, count: u32, salt_base: u32) -> Vec<BlockHeader> {
        let mut headers = Vec::new();
        let mut parent = *from;
        for offset in 0..count {
            let header = child_of(&parent, salt_base + offset);
            headers.push(header);
            parent = header;
        }
        headers
    }

    fn fresh_graph() -> HeaderGraph {
        HeaderGraph::new(genesis(), []).expect("graph")
    }

    #[test]
    fn fresh_graph_reports_genesis_tip() {
        let graph = fresh_graph();
        assert_eq!(graph.height(), 0);
        assert_eq!(
            hash256_to_hex(&graph.tip().hash),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(graph.tip().work_total, U256::from(EARLY_WORK));
        graph.assert_invariants();
    }

    #[test]
    fn adding_genesis_to_fresh_graph_is_noop() {
        let mut graph = fresh_graph();
        let changeset = graph.add_headers(&[genesis()]);
        assert!(changeset.is_noop());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn linear_extension_to_height_nine() {
        let mut graph = fresh_graph();
        let headers = linear_chain(&genesis(), 9, 1);
        let changeset = graph.add_headers(&headers);
        assert_eq!(changeset.added.len(), 9);
        assert!(changeset.removed.is_empty());
        assert_eq!(graph.height(), 9);
        assert_eq!(graph.tip().work_total, U256::from(10 * EARLY_WORK));
        assert_eq!(graph.leaf_count(), 1);
        graph.assert_invariants();
    }

    #[test]
    fn unknown_parent_drops_the_remainder() {
        let mut graph = fresh_graph();
        let headers = linear_chain(&genesis(), 3, 1);
        // Submit the chain with a hole: the second header has no parent yet.
        let changeset = graph.add_headers(&[headers[0], headers[2]]);
        assert_eq!(changeset.added.len(), 1);
        assert_eq!(graph.height(), 1);
        assert!(!graph.contains(&headers[2].hash()));
        graph.assert_invariants();
    }

    #[test]
    fn resubmitting_a_batch_is_noop() {
        let mut graph = fresh_graph();
        let headers = linear_chain(&genesis(), 5, 1);
        let first = graph.add_headers(&headers);
        assert_eq!(first.added.len(), 5);
        let second = graph.add_headers(&headers);
        assert!(second.is_noop());
        assert_eq!(graph.len(), 6);
        graph.assert_invariants();
    }

    #[test]
    fn reorg_replaces_the_weaker_suffix() {
        let mut graph = fresh_graph();
        let main = linear_chain(&genesis(), 9, 1);
        graph.add_headers(&main);
        let old_tip = graph.tip().hash;

        // Three headers branching from height 7 reach height 10 and win.
        let branch = linear_chain(&main[6], 3, 100);
        let changeset = graph.add_headers(&branch);
        assert_eq!(changeset.removed.len(), 2);
        assert_eq!(changeset.added.len(), 3);
        assert_eq!(
            changeset.removed.iter().map(|node| node.height).collect::<Vec<_>>(),
            vec![8, 9]
        );
        assert_eq!(
            changeset.added.iter().map(|node| node.height).collect::<Vec<_>>(),
            vec![8, 9, 10]
        );
        assert_eq!(graph.height(), 10);
        assert_eq!(graph.tip().work_total, U256::from(11 * EARLY_WORK));
        graph.assert_invariants();

        // Losing branch stays in the arena until pruned.
        assert!(graph.contains(&old_tip));
        assert_eq!(graph.leaf_count(), 2);
        let pruned = graph.prune_branches();
        assert_eq!(pruned, 2);
        assert!(!graph.contains(&old_tip));
        assert!(!graph.contains(&main[7].hash()));
        assert_eq!(graph.leaf_count(), 1);
        graph.assert_invariants();

        // Pruning again finds nothing.
        assert_eq!(graph.prune_branches(), 0);
    }

    #[test]
    fn equal_work_tie_does_not_reorg() {
        let mut graph = fresh_graph();
        let main = linear_chain(&genesis(), 3, 1);
        graph.add_headers(&main);
        let tip_before = graph.tip().hash;

        // A competing branch of the same length and difficulty ties on work.
        let rival = linear_chain(&genesis(), 3, 200);
        let changeset = graph.add_headers(&rival);
        assert!(changeset.added.is_empty());
        assert!(changeset.removed.is_empty());
        assert_eq!(graph.tip().hash, tip_before);
        assert_eq!(graph.leaf_count(), 2);
        graph.assert_invariants();
    }

    #[test]
    fn invalid_fork_is_quarantined_without_reorg() {
        let main = linear_chain(&genesis(), 9, 1);
        let branch = linear_chain(&main[6], 3, 100);

        // The branch header at height 9 is declared invalid a priori.
        let mut graph = HeaderGraph::new(genesis(), [branch[1].hash()]).expect("graph");
        graph.add_headers(&main);
        let tip_before = graph.tip().hash;

        let changeset = graph.add_headers(&branch);
        assert!(changeset.added.is_empty());
        assert!(changeset.removed.is_empty());
        assert_eq!(changeset.invalidated.len(), 2);
        assert_eq!(changeset.invalidated[0].hash(), branch[1].hash());
        assert_eq!(changeset.invalidated[1].hash(), branch[2].hash());
        assert_eq!(graph.tip().hash, tip_before);
        assert_eq!(graph.height(), 9);
        assert!(!graph.contains(&branch[1].hash()));
        graph.assert_invariants();
    }

    #[test]
    fn descendants_of_an_invalid_header_are_invalidated_with_it() {
        let main = linear_chain(&genesis(), 2, 1);
        let child = child_of(&main[1], 50);

        let mut graph = HeaderGraph::new(genesis(), [main[1].hash()]).expect("graph");
        graph.add_headers(&main[..1]);
        let changeset = graph.add_headers(&[main[1], child]);
        assert_eq!(changeset.invalidated.len(), 2);
        assert!(changeset.added.is_empty());
        assert!(!graph.contains(&child.hash()));
        graph.assert_invariants();
    }

    #[test]
    fn locator_is_dense_then_sparse() {
        let mut graph = fresh_graph();
        graph.add_headers(&linear_chain(&genesis(), 40, 1));
        assert_eq!(graph.height(), 40);

        let locator = graph.block_locator();
        let heights: Vec<u32> = locator
            .iter()
            .map(|hash| graph.get_by_hash(hash).expect("on chain").height)
            .collect();
        assert_eq!(heights, vec![40, 39, 38, 37, 36, 35, 34, 33, 32, 31, 29, 25, 17, 1, 0]);
        assert_eq!(locator.last(), Some(&graph.genesis_hash()));
    }

    #[test]
    fn short_chain_locator_reaches_genesis() {
        let mut graph = fresh_graph();
        graph.add_headers(&linear_chain(&genesis(), 3, 1));
        let locator = graph.block_locator();
        assert_eq!(locator.len(), 4);
        assert_eq!(locator.last(), Some(&graph.genesis_hash()));
    }

    #[test]
    fn prune_handles_shared_stems() {
        let mut graph = fresh_graph();
        let main = linear_chain(&genesis(), 5, 1);
        graph.add_headers(&main);

        // Two stale leaves share an off-chain stem from height 2.
        let stem = linear_chain(&main[1], 1, 300);
        graph.add_headers(&stem);
        let leaf_a = child_of(&stem[0], 400);
        let leaf_b = child_of(&stem[0], 401);
        graph.add_headers(&[leaf_a]);
        graph.add_headers(&[leaf_b]);
        assert_eq!(graph.leaf_count(), 3);

        let pruned = graph.prune_branches();
        assert_eq!(pruned, 3);
        assert_eq!(graph.leaf_count(), 1);
        assert!(!graph.contains(&stem[0].hash()));
        graph.assert_invariants();
    }

    #[test]
    fn queries_by_height_and_hash_agree() {
        let mut graph = fresh_graph();
        let headers = linear_chain(&genesis(), 4, 1);
        graph.add_headers(&headers);

        let node = graph.get_by_height(2).expect("height 2");
        assert_eq!(node.hash, headers[1].hash());
        assert_eq!(
            graph.get_by_hash(&headers[1].hash()).expect("by hash").height,
            2
        );
        assert!(graph.get_by_height(9).is_none());
    }
}
