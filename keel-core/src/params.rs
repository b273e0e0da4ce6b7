use std::{collections::HashMap, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    constants::{SERVICES_NODE_BLOOM, SERVICES_NODE_NETWORK},
    hashes::BlockHash,
    merkle::MerkleBlock,
};

/// Blocks between difficulty adjustments.
pub const BLOCK_DIFFICULTY_INTERVAL: u32 = 2016;
/// Seconds a full difficulty interval is targeted to span (two weeks).
pub const TARGET_TIMESPAN: u32 = 14 * 24 * 60 * 60;
/// The minimum difficulty (maximum target) in compact form.
pub const MAX_PROOF_OF_WORK: u32 = 0x1d00_ffff;

/// The block sets handed to a difficulty predicate, keyed by block hash.
pub type BlockSet = HashMap<BlockHash, Arc<MerkleBlock>>;

/// A trusted (height, hash) pair. Blocks arriving at this height must match
/// bit for bit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: BlockHash,
    pub timestamp: u32,
    pub target: u32,
}

/// Everything chain-specific the peer manager needs.
#[derive(Clone)]
pub struct ChainParams {
    /// Wire protocol magic.
    pub magic: u32,
    pub standard_port: u16,
    /// The first seed is resolved synchronously at connect; the rest are
    /// resolved on spawned tasks.
    pub dns_seeds: Vec<String>,
    /// Service bits a peer must advertise beyond NODE_NETWORK | NODE_BLOOM.
    pub services: u64,
    /// Ascending by height; index 0 is the genesis block.
    pub checkpoints: Vec<Checkpoint>,
    /// Returns true if `block`'s compact target is allowed given the chain
    /// context in `block_set`.
    pub verify_difficulty: fn(&MerkleBlock, &BlockSet) -> bool,
}

impl ChainParams {
    pub fn genesis_hash(&self) -> BlockHash {
        self.checkpoints[0].hash
    }

    /// Bitcoin mainnet.
    ///
    /// The checkpoint table carries only the genesis block for now; extend it
    /// at release time the way upstream SPV wallets embed a rolling table.
    pub fn main() -> Self {
        Self {
            magic: 0xd9b4_bef9,
            standard_port: 8333,
            dns_seeds: [
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
                "seed.bitcoin.jonasschnelli.ch",
                "seed.btc.petertodd.org",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            services: 0,
            checkpoints: vec![Checkpoint {
                height: 0,
                hash: BlockHash::from_str(
                    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
                )
                .expect("valid genesis hash"),
                timestamp: 1_231_006_505,
                target: 0x1d00_ffff,
            }],
            verify_difficulty: verify_difficulty_mainnet,
        }
    }

    /// A permissive parameter set for unit tests: no seeds, no difficulty
    /// enforcement, and a synthetic genesis checkpoint.
    pub fn test(genesis: Checkpoint) -> Self {
        Self {
            magic: 0x0b11_0907,
            standard_port: 18333,
            dns_seeds: Vec::new(),
            services: 0,
            checkpoints: vec![genesis],
            verify_difficulty: |_, _| true,
        }
    }

    /// Service bits required of every peer on this chain.
    pub fn required_services(&self) -> u64 {
        SERVICES_NODE_NETWORK | SERVICES_NODE_BLOOM | self.services
    }
}

/// Mainnet difficulty rule: inside an interval the target must not change;
/// at an interval boundary it retargets from the time the last interval took,
/// clamped to [1/4, 4x], and never below `MAX_PROOF_OF_WORK` difficulty.
///
/// The arithmetic happens in compact space: `TARGET_TIMESPAN` is a multiple
/// of 256 and `timespan >= TARGET_TIMESPAN/4`, so multiplying the mantissa by
/// `timespan` and dividing by `TARGET_TIMESPAN/256` loses no precision.
pub fn verify_difficulty_mainnet(
    block: &MerkleBlock,
    block_set: &BlockSet,
) -> bool {
    let Some(previous) = block_set.get(&block.prev_block) else {
        return false;
    };
    if block.height != previous.height + 1 {
        return false;
    }

    if block.height % BLOCK_DIFFICULTY_INTERVAL != 0 {
        return block.target == previous.target;
    }

    // walk back to the start of the previous interval
    let mut transition = Arc::clone(previous);
    for _ in 0..BLOCK_DIFFICULTY_INTERVAL - 1 {
        match block_set.get(&transition.prev_block) {
            Some(prev) => transition = Arc::clone(prev),
            None => return false,
        }
    }

    let mut timespan = previous.timestamp.wrapping_sub(transition.timestamp);
    timespan = timespan.clamp(TARGET_TIMESPAN / 4, TARGET_TIMESPAN * 4);

    // compensate for dividing by TARGET_TIMESPAN/256 by dropping one size byte
    let mut size = (previous.target >> 24) as i32 - 1;
    let mut target = (previous.target & 0x007f_ffff) as u64;

    target *= timespan as u64;
    target /= (TARGET_TIMESPAN >> 8) as u64;

    while size < 1 || target > 0x007f_ffff {
        target >>= 8;
        size += 1;
    }

    let mut compact = target as u32 | ((size as u32) << 24);
    if compact > MAX_PROOF_OF_WORK {
        compact = MAX_PROOF_OF_WORK;
    }

    block.target == compact
}
