//! Protocol constants shared across the workspace.

/// Standard tx fee per kb of tx size, rounded up to nearest kb.
pub const TX_FEE_PER_KB: u64 = 1_000;
/// Estimated size for a typical transaction output.
pub const TX_OUTPUT_SIZE: usize = 34;
/// Estimated size for a typical compact pubkey transaction input.
pub const TX_INPUT_SIZE: usize = 148;
/// No tx output can be below this amount.
pub const TX_MIN_OUTPUT_AMOUNT: u64 =
    TX_FEE_PER_KB * 3 * (TX_OUTPUT_SIZE as u64 + TX_INPUT_SIZE as u64) / 1000;
/// No tx can be larger than this size in bytes.
pub const TX_MAX_SIZE: usize = 100_000;
/// Block height indicating a transaction is unconfirmed.
pub const TX_UNCONFIRMED: u32 = i32::MAX as u32;
/// A lockTime below this value is a block height, otherwise a timestamp.
pub const TX_MAX_LOCK_HEIGHT: u32 = 500_000_000;
/// Sequence number for a finalized tx input.
pub const TXIN_SEQUENCE: u32 = u32::MAX;

pub const SATOSHIS: u64 = 100_000_000;
pub const MAX_MONEY: u64 = 84_000_000 * SATOSHIS;

/// Default fee-per-kb, matches the standard fee on a 191 byte tx.
pub const DEFAULT_FEE_PER_KB: u64 = (TX_FEE_PER_KB * 1000 + 190) / 191;
/// Minimum relay fee-per-kb.
pub const MIN_FEE_PER_KB: u64 = TX_FEE_PER_KB;
/// Slightly higher than a 10_000 bit fee on a 191 byte tx.
pub const MAX_FEE_PER_KB: u64 = (TX_FEE_PER_KB * 1_000_100 + 190) / 191;

/// Number of trailing unused receive addresses kept generated ahead.
pub const GAP_LIMIT_EXTERNAL: u32 = 10;
/// Number of trailing unused change addresses kept generated ahead.
pub const GAP_LIMIT_INTERNAL: u32 = 5;

/// Block height sentinel for a merkle block whose height is not yet known.
pub const BLOCK_UNKNOWN_HEIGHT: u32 = i32::MAX as u32;

// Sighash flags.
pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
/// BIP-143 digest method (for forks that commit to input amounts).
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

// Service bits.
pub const SERVICES_NODE_NETWORK: u64 = 0x01;
pub const SERVICES_NODE_BLOOM: u64 = 0x04;
