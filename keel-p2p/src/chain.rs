//! The block store backing chain sync: one owning map of headers plus
//! indexes for orphans (by previous-block hash) and checkpoints (by height).

use std::{collections::HashMap, sync::Arc};

use keel_core::{
    constants::BLOCK_UNKNOWN_HEIGHT,
    hashes::BlockHash,
    merkle::MerkleBlock,
    params::{BlockSet, ChainParams, BLOCK_DIFFICULTY_INTERVAL},
};
use tracing::debug;

const ONE_WEEK: u32 = 7 * 24 * 60 * 60;

pub struct BlockStore {
    /// Every verified or fork-candidate block, by block hash.
    blocks: BlockSet,
    /// Blocks whose parent we have not seen, keyed by `prev_block` so a new
    /// block can be chained to its orphan child with one lookup.
    orphans: HashMap<BlockHash, Arc<MerkleBlock>>,
    /// Trusted blocks from chain params, keyed by height.
    checkpoints: HashMap<u32, Arc<MerkleBlock>>,
    /// Tip of the verified main chain.
    last_block: Arc<MerkleBlock>,
    /// Most recently stored orphan, used to suppress duplicate getblocks.
    last_orphan: Option<BlockHash>,
    max_orphans: usize,
    genesis: BlockHash,
}

impl BlockStore {
    /// Seeds the store from chain-params checkpoints and previously saved
    /// blocks. The starting tip is the newest checkpoint older than a week
    /// before `earliest_key_time`, advanced through any saved chain segment
    /// that starts at a difficulty transition.
    pub fn new(
        params: &ChainParams,
        saved_blocks: Vec<MerkleBlock>,
        earliest_key_time: u32,
        max_orphans: usize,
    ) -> Self {
        let mut blocks = BlockSet::new();
        let mut checkpoints = HashMap::new();
        let mut last_block: Option<Arc<MerkleBlock>> = None;

        for (i, checkpoint) in params.checkpoints.iter().enumerate() {
            let block = Arc::new(MerkleBlock {
                block_hash: checkpoint.hash,
                version: 1,
                prev_block: BlockHash::ZERO,
                merkle_root: [0u8; 32],
                timestamp: checkpoint.timestamp,
                target: checkpoint.target,
                nonce: 0,
                total_tx: 0,
                hashes: Vec::new(),
                flags: Vec::new(),
                height: checkpoint.height,
            });
            checkpoints.insert(checkpoint.height, Arc::clone(&block));
            blocks.insert(checkpoint.hash, Arc::clone(&block));
            if i == 0 || checkpoint.timestamp + ONE_WEEK < earliest_key_time {
                last_block = Some(block);
            }
        }

        let mut store = Self {
            blocks,
            orphans: HashMap::new(),
            checkpoints,
            last_block: last_block.expect("params carry a genesis checkpoint"),
            last_orphan: None,
            max_orphans: max_orphans.max(1),
            genesis: params.genesis_hash(),
        };

        // stage saved blocks as orphans, then walk forward from the newest
        // saved difficulty-transition block
        let mut transition: Option<Arc<MerkleBlock>> = None;
        for block in saved_blocks {
            debug_assert_ne!(block.height, BLOCK_UNKNOWN_HEIGHT);
            let block = Arc::new(block);
            store.orphans.insert(block.prev_block, Arc::clone(&block));
            if block.height % BLOCK_DIFFICULTY_INTERVAL == 0
                && transition
                    .as_ref()
                    .is_none_or(|t| block.height > t.height)
            {
                transition = Some(block);
            }
        }

        let mut next = transition;
        while let Some(block) = next {
            store.blocks.insert(block.block_hash, Arc::clone(&block));
            store.orphans.remove(&block.prev_block);
            store.last_block = Arc::clone(&block);
            next = store.orphans.remove(&block.block_hash);
        }
        store.orphans.clear();
        store.last_orphan = None;

        store
    }

    pub fn last_block(&self) -> &Arc<MerkleBlock> {
        &self.last_block
    }

    pub fn set_last_block(&mut self, block: Arc<MerkleBlock>) {
        self.last_block = block;
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&Arc<MerkleBlock>> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn insert(&mut self, block: Arc<MerkleBlock>) {
        self.blocks.insert(block.block_hash, block);
    }

    pub fn checkpoint_at(&self, height: u32) -> Option<&Arc<MerkleBlock>> {
        self.checkpoints.get(&height)
    }

    /// Height of the newest checkpoint; forks below it are ignored.
    pub fn last_checkpoint_height(&self) -> u32 {
        self.checkpoints.keys().copied().max().unwrap_or(0)
    }

    /// Rewinds the tip to the newest checkpoint at least a week older than
    /// `earliest_key_time`, for rescans.
    pub fn rewind_to_checkpoint(&mut self, earliest_key_time: u32) {
        let mut heights: Vec<u32> =
            self.checkpoints.keys().copied().collect();
        heights.sort_unstable();
        for &height in heights.iter().rev() {
            let checkpoint = &self.checkpoints[&height];
            if height == heights[0]
                || checkpoint.timestamp + ONE_WEEK < earliest_key_time
            {
                self.last_block = Arc::clone(checkpoint);
                break;
            }
        }
    }

    // --- orphans --- //

    pub fn add_orphan(&mut self, block: Arc<MerkleBlock>) {
        if self.orphans.len() >= self.max_orphans {
            // cap the orphan set; evict the oldest by timestamp
            if let Some(oldest) = self
                .orphans
                .values()
                .min_by_key(|b| b.timestamp)
                .map(|b| b.prev_block)
            {
                debug!("orphan cap reached, evicting oldest orphan");
                self.orphans.remove(&oldest);
            }
        }
        self.last_orphan = Some(block.block_hash);
        self.orphans.insert(block.prev_block, block);
    }

    /// Removes and returns the orphan whose parent is `parent`, if any.
    pub fn take_orphan_child(
        &mut self,
        parent: BlockHash,
    ) -> Option<Arc<MerkleBlock>> {
        let child = self.orphans.remove(&parent);
        if let Some(child) = &child {
            if self.last_orphan == Some(child.block_hash) {
                self.last_orphan = None;
            }
        }
        child
    }

    pub fn remove_orphan_by_hash(&mut self, hash: BlockHash) {
        self.orphans.retain(|_, b| b.block_hash != hash);
        if self.last_orphan == Some(hash) {
            self.last_orphan = None;
        }
    }

    pub fn last_orphan(&self) -> Option<BlockHash> {
        self.last_orphan
    }

    /// Drops every orphan; used when the installed filter changes and any
    /// partially-matched orphans may be incomplete.
    pub fn clear_orphans(&mut self) {
        self.orphans.clear();
        self.last_orphan = None;
    }

    // --- chain queries --- //

    /// Block locator: the 10 most recent hashes, then exponentially spaced
    /// ancestors, ending with the genesis hash.
    pub fn locators(&self) -> Vec<BlockHash> {
        let mut locators = Vec::new();
        let mut block = Some(&self.last_block);
        let mut step = 1usize;

        while let Some(b) = block {
            if b.height == 0 {
                break;
            }
            locators.push(b.block_hash);
            if locators.len() >= 10 {
                step *= 2;
            }
            let mut cursor = Some(b);
            for _ in 0..step {
                cursor = cursor
                    .and_then(|c| self.blocks.get(&c.prev_block));
                if cursor.is_none() {
                    break;
                }
            }
            block = cursor;
        }

        locators.push(self.genesis);
        locators
    }

    /// True if `block` lies on the chain ending at the current tip.
    pub fn on_main_chain(&self, block: &MerkleBlock) -> bool {
        let mut cursor = Some(&self.last_block);
        while let Some(b) = cursor {
            if b.height < block.height {
                return false;
            }
            if b.height == block.height {
                return b.block_hash == block.block_hash;
            }
            cursor = self.blocks.get(&b.prev_block);
        }
        false
    }

    /// Walks a fork tip and the main tip back to their join point. Returns
    /// the join block.
    pub fn fork_join_point(
        &self,
        fork_tip: &Arc<MerkleBlock>,
    ) -> Option<Arc<MerkleBlock>> {
        let mut fork = Some(Arc::clone(fork_tip));
        let mut main = Some(Arc::clone(&self.last_block));

        while let (Some(f), Some(m)) = (&fork, &main) {
            if f.block_hash == m.block_hash {
                return Some(Arc::clone(f));
            }
            if f.height <= m.height {
                main = self.blocks.get(&m.prev_block).cloned();
            } else {
                fork = self.blocks.get(&f.prev_block).cloned();
            }
        }
        None
    }

    /// The fork segment from `fork_tip` down to (excluding) `join`, tip
    /// first.
    pub fn fork_segment(
        &self,
        fork_tip: &Arc<MerkleBlock>,
        join: &MerkleBlock,
    ) -> Vec<Arc<MerkleBlock>> {
        let mut segment = Vec::new();
        let mut cursor = Some(Arc::clone(fork_tip));
        while let Some(block) = cursor {
            if block.block_hash == join.block_hash {
                break;
            }
            cursor = self.blocks.get(&block.prev_block).cloned();
            segment.push(block);
        }
        segment
    }

    /// Verifies a block against its parent: adjacent heights, the chain's
    /// difficulty policy at transition boundaries, and checkpoint equality.
    pub fn verify_block(
        &self,
        block: &MerkleBlock,
        prev: &MerkleBlock,
        params: &ChainParams,
    ) -> bool {
        if block.prev_block != prev.block_hash
            || block.height != prev.height + 1
        {
            return false;
        }

        if block.height % BLOCK_DIFFICULTY_INTERVAL == 0 {
            // the previous transition must be present to verify a retarget
            let mut b = self.blocks.get(&block.prev_block);
            for _ in 1..BLOCK_DIFFICULTY_INTERVAL {
                b = b.and_then(|b| self.blocks.get(&b.prev_block));
                if b.is_none() {
                    break;
                }
            }
            if b.is_none() {
                debug!(
                    height = block.height,
                    "missing previous difficulty transition"
                );
                return false;
            }
        }

        if !(params.verify_difficulty)(block, &self.blocks) {
            debug!(bits = block.target, "invalid difficulty target");
            return false;
        }

        if let Some(checkpoint) = self.checkpoint_at(block.height) {
            if checkpoint.block_hash != block.block_hash {
                debug!(
                    height = block.height,
                    "block differs from checkpoint"
                );
                return false;
            }
        }

        true
    }

    /// Frees headers below the previous difficulty transition, keeping
    /// transition blocks so retargets stay verifiable.
    pub fn prune_below(&mut self, height: u32) {
        let keep_from = height.saturating_sub(2 * BLOCK_DIFFICULTY_INTERVAL);
        self.blocks.retain(|_, b| {
            b.height >= keep_from
                || b.height % BLOCK_DIFFICULTY_INTERVAL == 0
        });
    }

    /// The chain of blocks to persist after accepting `tip`: up to `count`
    /// blocks walking back, trimmed so the batch starts at a difficulty
    /// transition.
    pub fn save_batch(
        &self,
        tip: &Arc<MerkleBlock>,
        count: usize,
    ) -> Vec<Arc<MerkleBlock>> {
        let mut batch = Vec::with_capacity(count);
        let mut cursor = Some(Arc::clone(tip));
        while let Some(block) = cursor {
            if batch.len() >= count {
                break;
            }
            cursor = self.blocks.get(&block.prev_block).cloned();
            batch.push(block);
        }

        // ensure the saved span begins at a difficulty interval so the store
        // can resume verifying retargets
        let tail_offset = batch
            .last()
            .map(|b| (b.height % BLOCK_DIFFICULTY_INTERVAL) as usize)
            .unwrap_or(0);
        if tail_offset > 0 {
            let excess = BLOCK_DIFFICULTY_INTERVAL as usize - tail_offset;
            let keep = batch.len().saturating_sub(excess.min(batch.len()));
            batch.truncate(keep);
        }
        batch
    }
}

#[cfg(test)]
mod test {
    use keel_core::params::Checkpoint;

    use super::*;

    fn test_params() -> ChainParams {
        ChainParams::test(Checkpoint {
            height: 0,
            hash: BlockHash([0x10; 32]),
            timestamp: 1_600_000_000,
            target: 0x207f_ffff,
        })
    }

    fn block_at(height: u32, prev: BlockHash) -> Arc<MerkleBlock> {
        let mut raw = [0u8; 32];
        raw[..4].copy_from_slice(&height.to_le_bytes());
        raw[4] = 0x20;
        Arc::new(MerkleBlock {
            block_hash: BlockHash(raw),
            version: 2,
            prev_block: prev,
            merkle_root: [0u8; 32],
            timestamp: 1_600_000_000 + height * 600,
            target: 0x207f_ffff,
            nonce: 0,
            total_tx: 0,
            hashes: Vec::new(),
            flags: Vec::new(),
            height,
        })
    }

    fn extend_chain(store: &mut BlockStore, count: u32) {
        for _ in 0..count {
            let tip = Arc::clone(store.last_block());
            let block = block_at(tip.height + 1, tip.block_hash);
            store.insert(Arc::clone(&block));
            store.set_last_block(block);
        }
    }

    #[test]
    fn locator_shape() {
        let params = test_params();
        let mut store =
            BlockStore::new(&params, Vec::new(), 1_600_000_000, 100);
        extend_chain(&mut store, 100);

        let locators = store.locators();
        // 10 recent + exponentially spaced + genesis, strictly decreasing
        assert_eq!(locators.last(), Some(&params.genesis_hash()));
        assert!(locators.len() <= 10 + 8 + 1);

        let height_of = |hash: &BlockHash| -> u32 {
            store.get(hash).map(|b| b.height).unwrap_or(0)
        };
        let heights: Vec<u32> = locators.iter().map(height_of).collect();
        assert_eq!(heights[0], 100);
        for pair in heights.windows(2) {
            assert!(pair[0] > pair[1] || pair[1] == 0);
        }
    }

    #[test]
    fn prune_keeps_transitions_and_the_recent_window() {
        let params = test_params();
        let mut store =
            BlockStore::new(&params, Vec::new(), 1_600_000_000, 100);

        // blocks at assorted depths; they need not chain for pruning
        let stale = block_at(1, BlockHash([0x01; 32]));
        let transition =
            block_at(BLOCK_DIFFICULTY_INTERVAL, BlockHash([0x02; 32]));
        let recent =
            block_at(2 * BLOCK_DIFFICULTY_INTERVAL + 500, BlockHash([0x03; 32]));
        for block in [&stale, &transition, &recent] {
            store.insert(Arc::clone(block));
        }

        store.prune_below(4 * BLOCK_DIFFICULTY_INTERVAL);

        assert!(store.get(&stale.block_hash).is_none());
        // below the window, but transition blocks stay retarget-verifiable
        assert!(store.get(&transition.block_hash).is_some());
        assert!(store.get(&recent.block_hash).is_some());
        // the genesis checkpoint is a transition block and always survives
        assert!(store.get(&params.genesis_hash()).is_some());
    }

    #[test]
    fn orphan_cap_evicts_oldest() {
        let params = test_params();
        let mut store = BlockStore::new(&params, Vec::new(), 1_600_000_000, 2);

        let a = block_at(5, BlockHash([0xaa; 32]));
        let b = block_at(6, BlockHash([0xbb; 32]));
        let c = block_at(7, BlockHash([0xcc; 32]));
        store.add_orphan(a);
        store.add_orphan(b);
        store.add_orphan(c);

        assert!(store.take_orphan_child(BlockHash([0xaa; 32])).is_none());
        assert!(store.take_orphan_child(BlockHash([0xcc; 32])).is_some());
    }

    #[test]
    fn saved_blocks_restore_the_tip() {
        let params = test_params();
        // a saved run 0..=4 connected to genesis; heights 0 % interval == 0
        let genesis = params.genesis_hash();
        let mut saved = Vec::new();
        let mut prev = genesis;
        for height in 1..=4u32 {
            let block = block_at(height, prev);
            prev = block.block_hash;
            saved.push((*block).clone());
        }

        // none of the saved blocks is a transition block, so the store
        // falls back to the genesis checkpoint
        let store = BlockStore::new(&params, saved, 1_600_000_000, 100);
        assert_eq!(store.last_block().height, 0);
    }

    #[test]
    fn fork_join_point_finds_common_ancestor() {
        let params = test_params();
        let mut store =
            BlockStore::new(&params, Vec::new(), 1_600_000_000, 100);
        extend_chain(&mut store, 10);
        let join = Arc::clone(store.last_block());

        // main chain grows 2 more
        extend_chain(&mut store, 2);

        // a fork of 3 on top of `join`
        let mut fork_prev = Arc::clone(&join);
        for i in 0..3u32 {
            let mut raw = [0u8; 32];
            raw[..4].copy_from_slice(&(join.height + 1 + i).to_le_bytes());
            raw[4] = 0x99;
            let block = Arc::new(MerkleBlock {
                block_hash: BlockHash(raw),
                prev_block: fork_prev.block_hash,
                height: join.height + 1 + i,
                ..(*block_at(0, BlockHash::ZERO)).clone()
            });
            store.insert(Arc::clone(&block));
            fork_prev = block;
        }

        let found = store.fork_join_point(&fork_prev).unwrap();
        assert_eq!(found.block_hash, join.block_hash);

        let segment = store.fork_segment(&fork_prev, &found);
        assert_eq!(segment.len(), 3);
        assert_eq!(segment[0].block_hash, fork_prev.block_hash);
    }
}
