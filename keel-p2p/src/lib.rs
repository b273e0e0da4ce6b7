//! The `keel-p2p` crate contains the peer manager: a bounded pool of peer
//! sessions driving header/merkle-block sync, bloom filter installation,
//! transaction publication, and reorg handling, feeding confirmed
//! transactions back into the wallet.

/// BIP-37 bloom filter.
pub mod bloom;
/// The block store: main chain, orphans, checkpoints, locators.
pub mod chain;
/// Error codes surfaced to the host.
pub mod error;
/// The peer manager itself.
pub mod manager;
/// The peer-session contract and session events.
pub mod peer;
/// One-shot shutdown channel.
pub mod shutdown;

pub use error::Error;
pub use manager::{NodeHooks, PeerManager, PeerManagerConfig};
pub use peer::{Peer, PeerEvent, PeerFactory, PeerInfo, PeerStatus};
