use std::{net::IpAddr, time::Duration};

use keel_core::{
    hashes::{BlockHash, TxId},
    merkle::MerkleBlock,
    tx::Transaction,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;

/// Manager-assigned id for one peer session.
pub type PeerId = u64;

/// A peer's network identity: 16-byte address (IPv4-mapped for v4) + port.
/// Two sessions to the same `(address, port)` compare equal.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct PeerAddr {
    pub address: [u8; 16],
    pub port: u16,
}

/// A known peer, as persisted to and restored from the peer cache.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: [u8; 16],
    pub port: u16,
    pub services: u64,
    /// Seconds since epoch when the peer was last heard of.
    pub timestamp: u32,
    pub flags: u32,
}

impl PeerInfo {
    pub fn new(ip: IpAddr, port: u16, services: u64, timestamp: u32) -> Self {
        let address = match ip {
            IpAddr::V4(v4) => {
                let mut bytes = [0u8; 16];
                bytes[10] = 0xff;
                bytes[11] = 0xff;
                bytes[12..].copy_from_slice(&v4.octets());
                bytes
            }
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            address,
            port,
            services,
            timestamp,
            flags: 0,
        }
    }

    pub fn addr(&self) -> PeerAddr {
        PeerAddr {
            address: self.address,
            port: self.port,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything a peer session can report back to the manager. Sessions never
/// call into the manager; they push events into its channel.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed.
    Connected,
    /// Session ended. `None` means an orderly local disconnect.
    Disconnected(Option<Error>),
    /// The peer relayed addresses of other peers.
    RelayedPeers(Vec<PeerInfo>),
    /// The peer relayed a full transaction.
    RelayedTx(Transaction),
    /// The peer announced a tx it already has (inv for a known hash).
    HasTx(TxId),
    /// The peer rejected a transaction.
    RejectedTx { tx_hash: TxId, code: u8 },
    /// The peer relayed a (merkle) block.
    RelayedBlock(MerkleBlock),
    /// The peer could not supply the requested data.
    NotFound {
        tx_hashes: Vec<TxId>,
        block_hashes: Vec<BlockHash>,
    },
    /// The peer advertised a minimum relay fee.
    FeeFilter(u64),
    /// The peer asked for a transaction we announced; respond with the tx
    /// or `None` if it is unknown or was invalidated.
    RequestedTx {
        tx_hash: TxId,
        responder: oneshot::Sender<Option<Transaction>>,
    },
}

/// The channel a session uses to report events, tagged with its id.
pub type PeerEventSender = mpsc::Sender<(PeerId, PeerEvent)>;

/// The wire-session collaborator contract.
///
/// Implementations own their socket, message framing, and I/O; the manager
/// only ever drives this surface and consumes [`PeerEvent`]s. Send methods
/// are fire-and-forget except ping and mempool, whose completions resolve a
/// one-shot with `true` once the round-trip finished (`false` if the session
/// died first) -- delivered exactly once either way.
pub trait Peer: Send + Sync + 'static {
    fn connect(&self);
    fn disconnect(&self);
    fn connect_status(&self) -> PeerStatus;

    fn version(&self) -> u32;
    /// The best block height the peer reported at handshake.
    fn last_block(&self) -> u32;
    fn ping_time(&self) -> f64;
    /// Fee rate from the peer's feefilter, 0 if none was received.
    fn fee_per_kb(&self) -> u64;
    fn host(&self) -> String;

    fn send_filterload(&self, filter: Vec<u8>);
    fn send_getblocks(&self, locators: Vec<BlockHash>, stop: BlockHash);
    fn send_getheaders(&self, locators: Vec<BlockHash>, stop: BlockHash);
    fn send_getdata(&self, tx_hashes: Vec<TxId>, block_hashes: Vec<BlockHash>);
    fn send_inv(&self, tx_hashes: Vec<TxId>);
    fn send_ping(&self) -> oneshot::Receiver<bool>;
    fn send_mempool(&self, known_tx_hashes: Vec<TxId>)
        -> oneshot::Receiver<bool>;
    fn send_getaddr(&self);
    /// Re-request merkle blocks after `from`, for filter-update re-sync.
    fn rerequest_blocks(&self, from: BlockHash);

    /// Arms (or with `None` cancels) the session's disconnect deadline.
    fn schedule_disconnect(&self, timeout: Option<Duration>);
    fn set_needs_filter_update(&self, needs: bool);
    fn set_current_block_height(&self, height: u32);
    fn set_earliest_key_time(&self, time: u32);
}

/// Creates peer sessions for the manager.
pub trait PeerFactory: Send + Sync + 'static {
    type Peer: Peer;

    /// Builds a session for `info` that will report events tagged `id` into
    /// `events`. The session starts disconnected.
    fn create(
        &self,
        info: &PeerInfo,
        magic: u32,
        id: PeerId,
        events: PeerEventSender,
    ) -> std::sync::Arc<Self::Peer>;
}
