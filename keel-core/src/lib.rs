//! The `keel-core` crate contains the leaf types shared by the wallet engine
//! and the peer manager: hashes, scripts, addresses, key chains, transactions,
//! merkle blocks, and chain parameters.

/// Textual addresses and script <-> address conversion.
pub mod address;
/// Protocol and fee constants.
pub mod constants;
/// Hash primitives and 32-byte id newtypes.
pub mod hashes;
/// BIP-32 style key chains (non-hardened derivation below an account key).
pub mod keys;
/// Logger configuration.
pub mod logger;
/// Merkle block headers with embedded partial merkle trees.
pub mod merkle;
/// Per-network chain parameters (magic, seeds, checkpoints, difficulty).
pub mod params;
/// Injected randomness.
pub mod rng;
/// Script opcodes and element parsing.
pub mod script;
/// Transactions: serialization, signature digests, signing, size and fees.
pub mod tx;
/// CompactSize varint codec.
pub mod varint;
