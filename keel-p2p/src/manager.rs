use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::{Arc, Mutex, Weak},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use keel_core::{
    constants::{
        BLOCK_UNKNOWN_HEIGHT, DEFAULT_FEE_PER_KB, GAP_LIMIT_EXTERNAL,
        GAP_LIMIT_INTERNAL, MAX_FEE_PER_KB, SERVICES_NODE_NETWORK,
        TX_UNCONFIRMED,
    },
    hashes::{BlockHash, TxId},
    merkle::MerkleBlock,
    params::{ChainParams, BLOCK_DIFFICULTY_INTERVAL},
    rng::{self, RngCore},
    tx::Transaction,
};
use keel_wallet::Wallet;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::{
    bloom::{
        BloomFilter, BLOOM_DEFAULT_FALSEPOSITIVE_RATE,
        BLOOM_REDUCED_FALSEPOSITIVE_RATE, BLOOM_UPDATE_ALL,
    },
    chain::BlockStore,
    error::Error,
    peer::{
        Peer, PeerAddr, PeerEvent, PeerEventSender, PeerFactory, PeerId,
        PeerInfo, PeerStatus,
    },
    shutdown::{self, Shutdown, ShutdownSignal},
};

/// Default cap on concurrent peer sessions.
pub const PEER_MAX_CONNECTIONS: usize = 3;
/// Deadline for any in-flight protocol exchange.
pub const PROTOCOL_TIMEOUT: Duration = Duration::from_secs(20);
/// Consecutive connect failures before the host is told the sync failed.
const MAX_CONNECT_FAILURES: u32 = 20;
/// Misbehavior events before the peer cache is wiped for a fresh DNS list.
const MISBEHAVING_THRESHOLD: u32 = 10;
/// Reject code for a double-spend; any other rejection of our own send
/// suggests a misconfigured peer.
const REJECT_SPENT: u8 = 0x12;
const ONE_WEEK: u32 = 7 * 24 * 60 * 60;
/// Peer cache bounds: hard cap, and the trim floor for stale entries.
const MAX_KNOWN_PEERS: usize = 2500;
const KNOWN_PEERS_FLOOR: usize = 1000;

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Host callbacks for network-level events. Invoked outside the manager's
/// state lock, on the event-loop task (or the caller's task for connect-time
/// notifications).
pub trait NodeHooks: Send + Sync {
    fn sync_started(&self) {}
    /// `error` is `None` on success.
    fn sync_stopped(&self, _error: Option<Error>) {}
    /// Transaction confirmations or verification status may have changed.
    fn tx_status_update(&self) {}
    /// Persist `blocks`; when `replace` is set, drop previously saved ones.
    fn save_blocks(&self, _replace: bool, _blocks: &[Arc<MerkleBlock>]) {}
    /// Persist `peers`; when `replace` is set, drop previously saved ones.
    fn save_peers(&self, _replace: bool, _peers: &[PeerInfo]) {}
    fn network_is_reachable(&self) -> bool {
        true
    }
}

impl NodeHooks for () {}

pub struct PeerManagerConfig {
    pub params: ChainParams,
    /// Unix time the wallet's keys were created; nothing earlier is scanned.
    pub earliest_key_time: u32,
    pub max_connections: usize,
    /// Target bloom filter false-positive rate.
    pub fp_rate: f64,
    /// Cap on stored orphan blocks.
    pub max_orphans: usize,
}

impl PeerManagerConfig {
    pub fn new(params: ChainParams, earliest_key_time: u32) -> Self {
        Self {
            params,
            earliest_key_time,
            max_connections: PEER_MAX_CONNECTIONS,
            fp_rate: BLOOM_DEFAULT_FALSEPOSITIVE_RATE,
            max_orphans: 10_000,
        }
    }
}

/// What the currently armed session deadline means, so a timeout disconnect
/// can be attributed to the right operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerKind {
    None,
    Sync,
    Publish,
}

struct ConnectedPeer<P> {
    id: PeerId,
    info: PeerInfo,
    handle: Arc<P>,
    /// Finished relaying its mempool.
    synced: bool,
    /// A filter rebuild is staged behind this peer's next pong.
    needs_filter_update: bool,
    timer: TimerKind,
}

struct PublishedTx {
    tx: Arc<Transaction>,
    completion: Option<oneshot::Sender<Result<(), Error>>>,
}

struct State<P> {
    /// Cached candidate peers, sorted most-recent first.
    known_peers: Vec<PeerInfo>,
    connected: Vec<ConnectedPeer<P>>,
    download_peer: Option<PeerId>,
    fixed_peer: Option<PeerInfo>,
    max_connect_count: usize,
    is_connected: bool,
    connect_failure_count: u32,
    misbehaving_count: u32,
    /// 0 while no sync is in progress.
    sync_start_height: u32,
    filter_update_height: u32,
    estimated_height: u32,
    bloom_filter: Option<BloomFilter>,
    fp_rate: f64,
    average_tx_per_block: f64,
    store: BlockStore,
    tx_relays: HashMap<TxId, Vec<PeerAddr>>,
    tx_requests: HashMap<TxId, Vec<PeerAddr>>,
    published: Vec<PublishedTx>,
    next_peer_id: PeerId,
    dns_tasks: usize,
    rng: Box<dyn RngCore + Send>,
}

impl<P> State<P> {
    fn peer_pos(&self, id: PeerId) -> Option<usize> {
        self.connected.iter().position(|p| p.id == id)
    }

    fn published_hashes(&self) -> Vec<TxId> {
        self.published.iter().map(|p| p.tx.txid).collect()
    }

    fn has_pending_publish_other_than(&self, tx_hash: TxId) -> bool {
        self.published
            .iter()
            .any(|p| p.tx.txid != tx_hash && p.completion.is_some())
    }

    fn list_add(
        list: &mut HashMap<TxId, Vec<PeerAddr>>,
        tx_hash: TxId,
        addr: PeerAddr,
    ) -> usize {
        let peers = list.entry(tx_hash).or_default();
        if !peers.contains(&addr) {
            peers.push(addr);
        }
        peers.len()
    }

    fn list_remove(
        list: &mut HashMap<TxId, Vec<PeerAddr>>,
        tx_hash: TxId,
        addr: PeerAddr,
    ) -> bool {
        let Some(peers) = list.get_mut(&tx_hash) else { return false };
        let before = peers.len();
        peers.retain(|a| *a != addr);
        peers.len() != before
    }

    fn list_count(list: &HashMap<TxId, Vec<PeerAddr>>, tx_hash: TxId) -> usize {
        list.get(&tx_hash).map(Vec::len).unwrap_or(0)
    }

    fn list_has(
        list: &HashMap<TxId, Vec<PeerAddr>>,
        tx_hash: TxId,
        addr: PeerAddr,
    ) -> bool {
        list.get(&tx_hash)
            .is_some_and(|peers| peers.contains(&addr))
    }
}

/// Host notifications collected under the lock, delivered after release.
enum HostNotice {
    SyncStarted,
    SyncStopped(Option<Error>),
    TxStatusUpdate,
    SaveBlocks(bool, Vec<Arc<MerkleBlock>>),
    SavePeers(bool, Vec<PeerInfo>),
}

type Completion = (oneshot::Sender<Result<(), Error>>, Result<(), Error>);

/// Why a ping was sent; drives the continuation when the pong arrives.
#[derive(Clone, Copy, Debug)]
enum PingPurpose {
    /// Pong flushes any tx the peer already sent; now rebuild the filter.
    FilterUpdateBegin,
    /// Pong confirms the rebuilt filter is installed.
    FilterLoaded,
    /// Pong confirms the re-request went through; resume getblocks.
    Rerequested,
    /// Pong confirms the filter is installed; safe to request the mempool.
    FilterThenMempool,
    /// Pong follows an inv of published transactions.
    PublishedInv,
    /// Pong follows a getdata for possibly-dropped transactions.
    UnrelayedGetdata,
}

enum Internal {
    PingDone {
        peer: PeerId,
        purpose: PingPurpose,
        success: bool,
    },
    MempoolDone {
        peer: PeerId,
        success: bool,
    },
}

/// The peer manager: owns a bounded pool of peer sessions, drives chain
/// sync from a single download peer, installs bloom filters, publishes
/// wallet transactions, and reconciles confirmed transactions back into the
/// wallet.
///
/// All state transitions are serialized through one event loop plus a state
/// mutex; host hooks and publish completions are always invoked with the
/// lock released.
pub struct PeerManager<F: PeerFactory> {
    wallet: Arc<Wallet>,
    factory: F,
    hooks: Arc<dyn NodeHooks>,
    params: ChainParams,
    earliest_key_time: u32,
    state: Mutex<State<F::Peer>>,
    peer_events: PeerEventSender,
    internal: mpsc::UnboundedSender<Internal>,
    shutdown: Shutdown,
    /// (live sessions, in-flight dns tasks); `disconnect` awaits (0, 0).
    activity: watch::Sender<(usize, usize)>,
    /// Handle to ourselves for tasks spawned from event handlers.
    weak: Weak<PeerManager<F>>,
}

impl<F: PeerFactory> PeerManager<F> {
    /// Builds the manager and spawns its event loop.
    pub fn start(
        wallet: Arc<Wallet>,
        config: PeerManagerConfig,
        saved_blocks: Vec<MerkleBlock>,
        saved_peers: Vec<PeerInfo>,
        factory: F,
        hooks: Arc<dyn NodeHooks>,
        rng: Box<dyn RngCore + Send>,
    ) -> Arc<Self> {
        let store = BlockStore::new(
            &config.params,
            saved_blocks,
            config.earliest_key_time,
            config.max_orphans,
        );

        let mut known_peers = saved_peers;
        known_peers.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let (peer_events, peer_rx) = mpsc::channel(1024);
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let (shutdown, signal) = shutdown::channel();
        let (activity, _) = watch::channel((0usize, 0usize));

        let state = State {
            known_peers,
            connected: Vec::new(),
            download_peer: None,
            fixed_peer: None,
            max_connect_count: config.max_connections,
            is_connected: false,
            connect_failure_count: 0,
            misbehaving_count: 0,
            sync_start_height: 0,
            filter_update_height: 0,
            estimated_height: 0,
            bloom_filter: None,
            fp_rate: config.fp_rate,
            average_tx_per_block: 1400.0,
            store,
            tx_relays: HashMap::new(),
            tx_requests: HashMap::new(),
            published: Vec::new(),
            next_peer_id: 1,
            dns_tasks: 0,
            rng,
        };

        let manager = Arc::new_cyclic(|weak| Self {
            wallet,
            factory,
            hooks,
            params: config.params,
            earliest_key_time: config.earliest_key_time,
            state: Mutex::new(state),
            peer_events,
            internal,
            shutdown,
            activity,
            weak: weak.clone(),
        });

        tokio::spawn(Self::event_loop(
            Arc::clone(&manager),
            peer_rx,
            internal_rx,
            signal,
        ));

        manager
    }

    /// Pins a single peer to connect to (or clears the pin with `None`).
    pub async fn set_fixed_peer(&self, peer: Option<PeerInfo>) {
        self.disconnect().await;
        let mut state = self.state.lock().unwrap();
        state.max_connect_count =
            if peer.is_some() { 1 } else { PEER_MAX_CONNECTIONS };
        state.fixed_peer = peer;
        state.known_peers.clear();
    }

    /// Opens sessions up to the connection cap, discovering peers from the
    /// cache, DNS seeds, or the fixed peer. Also call whenever network
    /// reachability changes.
    pub async fn connect(&self) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.connect_failure_count >= MAX_CONNECT_FAILURES {
                state.connect_failure_count = 0; // manual retry
            }

            if (state.download_peer.is_none()
                || state.store.last_block().height < state.estimated_height)
                && state.sync_start_height == 0
            {
                state.sync_start_height = state.store.last_block().height + 1;
                notices.push(HostNotice::SyncStarted);
            }

            for peer in &state.connected {
                if peer.handle.connect_status() == PeerStatus::Connecting {
                    peer.handle.connect();
                }
            }
        }
        self.deliver(notices, Vec::new());

        let needs_discovery = {
            let state = self.state.lock().unwrap();
            let now = unix_time();
            state.connected.len() < state.max_connect_count
                && (state.known_peers.len() < state.max_connect_count
                    || state
                        .known_peers
                        .get(state.max_connect_count - 1)
                        .is_some_and(|p| {
                            p.timestamp + 3 * 24 * 60 * 60 < now
                        }))
        };
        if needs_discovery {
            self.find_peers().await;
        }

        let mut notices = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.connected.len() < state.max_connect_count {
                let mut candidates: Vec<PeerInfo> = state
                    .known_peers
                    .iter()
                    .take(100)
                    .copied()
                    .collect();

                while !candidates.is_empty()
                    && state.connected.len() < state.max_connect_count
                {
                    // bias selection toward peers with recent timestamps
                    let len = candidates.len();
                    let i = rng::next_upto(&mut state.rng, len as u32) as usize;
                    let i = i * i / len;
                    let info = candidates.remove(i);

                    if state
                        .connected
                        .iter()
                        .any(|p| p.info.addr() == info.addr())
                    {
                        continue;
                    }

                    let id = state.next_peer_id;
                    state.next_peer_id += 1;
                    let handle = self.factory.create(
                        &info,
                        self.params.magic,
                        id,
                        self.peer_events.clone(),
                    );
                    handle.set_earliest_key_time(self.earliest_key_time);
                    state.connected.push(ConnectedPeer {
                        id,
                        info,
                        handle: Arc::clone(&handle),
                        synced: false,
                        needs_filter_update: false,
                        timer: TimerKind::None,
                    });
                    self.update_activity(&state);
                    handle.connect();
                }
            }

            if state.connected.is_empty() {
                warn!("no peers available, sync failed");
                Self::sync_stopped_locked(&mut state);
                notices.push(HostNotice::SyncStopped(Some(
                    Error::NetworkUnreachable,
                )));
            }
        }
        self.deliver(notices, Vec::new());
    }

    /// Disconnects every session, suppresses auto-reconnect, and waits for
    /// sessions and DNS tasks to drain.
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.connect_failure_count = MAX_CONNECT_FAILURES;
            for peer in &state.connected {
                peer.handle.disconnect();
            }
        }

        let mut activity = self.activity.subscribe();
        let _ = activity.wait_for(|&(sessions, dns)| sessions == 0 && dns == 0).await;
    }

    /// Stops the event loop. The manager is unusable afterwards.
    pub fn stop(&self) {
        self.shutdown.send();
    }

    /// Restarts the chain download from the newest checkpoint at least a
    /// week older than the key birth time. A fresh download peer is chosen,
    /// since the old one may have been omitting matched transactions.
    pub async fn rescan(&self) {
        let should_connect = {
            let mut state = self.state.lock().unwrap();
            if !state.is_connected {
                false
            } else {
                state.store.rewind_to_checkpoint(self.earliest_key_time);

                if let Some(download) = state.download_peer {
                    if let Some(pos) = state.peer_pos(download) {
                        let addr = state.connected[pos].info.addr();
                        state.known_peers.retain(|p| p.addr() != addr);
                        state.connected[pos].handle.disconnect();
                    }
                }
                state.sync_start_height = 0;
                true
            }
        };

        if should_connect {
            self.connect().await;
        }
    }

    /// Publishes a signed transaction; the returned channel resolves exactly
    /// once with the outcome.
    pub fn publish_transaction(
        &self,
        tx: Transaction,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let (done, done_rx) = oneshot::channel();

        if !tx.is_signed() {
            let _ = done.send(Err(Error::InvalidTx));
            return done_rx;
        }

        // the reachability hook runs without the state lock held
        let (is_connected, failures) = {
            let state = self.state.lock().unwrap();
            (state.is_connected, state.connect_failure_count)
        };
        if !is_connected
            && (failures >= MAX_CONNECT_FAILURES
                || !self.hooks.network_is_reachable())
        {
            let _ = done.send(Err(Error::NotConnected));
            return done_rx;
        }

        let mut state = self.state.lock().unwrap();
        let mut tx = tx;
        tx.timestamp = unix_time();
        info!(txid = %tx.txid, "publishing transaction");
        self.add_to_publish_list(&mut state, tx, Some(done));

        let connected_count = state
            .connected
            .iter()
            .filter(|p| p.handle.connect_status() == PeerStatus::Connected)
            .count();

        // leave the download peer out so we can observe the tx relay back
        for pos in 0..state.connected.len() {
            let peer = &state.connected[pos];
            if peer.handle.connect_status() != PeerStatus::Connected {
                continue;
            }
            if state.download_peer == Some(peer.id) && connected_count != 1 {
                continue;
            }
            self.publish_pending_tx(&mut state, pos);
            let (id, handle) =
                (state.connected[pos].id, Arc::clone(&state.connected[pos].handle));
            self.send_ping_tagged(&handle, id, PingPurpose::PublishedInv);
        }

        done_rx
    }

    // --- status surface --- //

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().is_connected
    }

    pub fn connect_status(&self) -> PeerStatus {
        let state = self.state.lock().unwrap();
        if state.is_connected {
            return PeerStatus::Connected;
        }
        if state
            .connected
            .iter()
            .any(|p| p.handle.connect_status() != PeerStatus::Disconnected)
        {
            return PeerStatus::Connecting;
        }
        PeerStatus::Disconnected
    }

    /// The (unverified) best height reported by peers.
    pub fn estimated_block_height(&self) -> u32 {
        let state = self.state.lock().unwrap();
        state.estimated_height.max(state.store.last_block().height)
    }

    /// The verified tip height.
    pub fn last_block_height(&self) -> u32 {
        self.state.lock().unwrap().store.last_block().height
    }

    pub fn last_block_timestamp(&self) -> u32 {
        self.state.lock().unwrap().store.last_block().timestamp
    }

    /// Sync progress in [0, 1]. `start_height` is the tip of the last
    /// completed sync, or 0 to use the current sync's start.
    pub fn sync_progress(&self, start_height: u32) -> f64 {
        let state = self.state.lock().unwrap();
        let start = if start_height == 0 {
            state.sync_start_height
        } else {
            start_height
        };
        let last = state.store.last_block().height;

        if state.download_peer.is_none() && state.sync_start_height == 0 {
            0.0
        } else if state.download_peer.is_none()
            || last < state.estimated_height
        {
            if last > start && state.estimated_height > start {
                0.1 + 0.9 * (last - start) as f64
                    / (state.estimated_height - start) as f64
            } else {
                0.05
            }
        } else {
            1.0
        }
    }

    pub fn peer_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .connected
            .iter()
            .filter(|p| p.handle.connect_status() != PeerStatus::Disconnected)
            .count()
    }

    pub fn download_peer_name(&self) -> String {
        let state = self.state.lock().unwrap();
        state
            .download_peer
            .and_then(|id| state.peer_pos(id))
            .map(|pos| {
                let peer = &state.connected[pos];
                format!("{}:{}", peer.handle.host(), peer.info.port)
            })
            .unwrap_or_default()
    }

    /// How many connected peers have relayed the given unconfirmed tx.
    pub fn relay_count(&self, tx_hash: TxId) -> usize {
        let state = self.state.lock().unwrap();
        State::<F::Peer>::list_count(&state.tx_relays, tx_hash)
    }

    /// The current observed bloom filter false-positive rate estimate.
    pub fn false_positive_rate(&self) -> f64 {
        self.state.lock().unwrap().fp_rate
    }

    // --- event loop --- //

    async fn event_loop(
        self: Arc<Self>,
        mut peer_rx: mpsc::Receiver<(PeerId, PeerEvent)>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut signal: ShutdownSignal,
    ) {
        loop {
            tokio::select! {
                biased;
                () = signal.recv() => break,
                Some((id, event)) = peer_rx.recv() => {
                    self.handle_peer_event(id, event);
                }
                Some(internal) = internal_rx.recv() => {
                    self.handle_internal(internal);
                }
            }
        }
        debug!("peer manager event loop exited");
    }

    fn handle_peer_event(&self, id: PeerId, event: PeerEvent) {
        match event {
            PeerEvent::Connected => self.handle_connected(id),
            PeerEvent::Disconnected(error) =>
                self.handle_disconnected(id, error),
            PeerEvent::RelayedPeers(peers) =>
                self.handle_relayed_peers(id, peers),
            PeerEvent::RelayedTx(tx) => self.handle_relayed_tx(id, tx),
            PeerEvent::HasTx(tx_hash) => self.handle_has_tx(id, tx_hash),
            PeerEvent::RejectedTx { tx_hash, code } =>
                self.handle_rejected_tx(id, tx_hash, code),
            PeerEvent::RelayedBlock(block) =>
                self.handle_relayed_block(id, block),
            PeerEvent::NotFound {
                tx_hashes,
                block_hashes: _,
            } => self.handle_not_found(id, tx_hashes),
            PeerEvent::FeeFilter(fee_per_kb) =>
                self.handle_fee_filter(id, fee_per_kb),
            PeerEvent::RequestedTx { tx_hash, responder } =>
                self.handle_requested_tx(id, tx_hash, responder),
        }
    }

    fn handle_internal(&self, internal: Internal) {
        match internal {
            Internal::PingDone {
                peer,
                purpose,
                success,
            } => self.handle_ping_done(peer, purpose, success),
            Internal::MempoolDone { peer, success } =>
                self.handle_mempool_done(peer, success),
        }
    }

    // --- peer lifecycle --- //

    fn handle_connected(&self, id: PeerId) {
        {
            let mut state = self.state.lock().unwrap();
            let Some(pos) = state.peer_pos(id) else { return };
            let now = unix_time();

            {
                let info = &mut state.connected[pos].info;
                // sanity check the advertised timestamp
                if info.timestamp > now + 2 * 60 * 60
                    || info.timestamp < now.saturating_sub(2 * 60 * 60)
                {
                    info.timestamp = now;
                }
            }

            let handle = Arc::clone(&state.connected[pos].handle);
            let services = state.connected[pos].info.services;
            let last_height = state.store.last_block().height;

            if services & self.params.services != self.params.services {
                debug!(peer = id, "unsupported node type");
                handle.disconnect();
                return;
            }
            if services & SERVICES_NODE_NETWORK == 0 {
                debug!(peer = id, "node doesn't carry full blocks");
                handle.disconnect();
                return;
            }
            if handle.last_block() + 10 < last_height {
                debug!(peer = id, "node isn't synced");
                handle.disconnect();
                return;
            }
            if handle.version() >= 70011
                && services & keel_core::constants::SERVICES_NODE_BLOOM == 0
            {
                debug!(peer = id, "node doesn't support SPV mode");
                handle.disconnect();
                return;
            }

            let keep_current = state.download_peer.is_some_and(|dl| {
                state
                    .peer_pos(dl)
                    .map(|dl_pos| {
                        let dl_handle = &state.connected[dl_pos].handle;
                        dl_handle.last_block() >= handle.last_block()
                            || last_height >= handle.last_block()
                    })
                    .unwrap_or(false)
            });

            if keep_current {
                if last_height >= handle.last_block() {
                    // this peer adds mempool coverage right away
                    state.connect_failure_count = 0;
                    self.load_bloom_filter(&mut state, pos);
                    self.publish_pending_tx(&mut state, pos);
                    self.send_ping_tagged(
                        &handle,
                        id,
                        PingPurpose::FilterThenMempool,
                    );
                }
            } else {
                // pick the best download peer among connected candidates
                let mut best = pos;
                for (i, p) in state.connected.iter().enumerate() {
                    if p.handle.connect_status() != PeerStatus::Connected {
                        continue;
                    }
                    let best_handle = &state.connected[best].handle;
                    let better = (p.handle.ping_time()
                        < best_handle.ping_time()
                        && p.handle.last_block() >= best_handle.last_block())
                        || p.handle.last_block() > best_handle.last_block();
                    if better {
                        best = i;
                    }
                }

                if let Some(old) = state.download_peer {
                    if let Some(old_pos) = state.peer_pos(old) {
                        info!("selecting new download peer");
                        state.connected[old_pos].handle.disconnect();
                    }
                }

                let best_id = state.connected[best].id;
                let best_handle = Arc::clone(&state.connected[best].handle);
                state.download_peer = Some(best_id);
                state.is_connected = true;
                state.estimated_height = best_handle.last_block();
                self.load_bloom_filter(&mut state, best);
                best_handle.set_current_block_height(last_height);
                self.publish_pending_tx(&mut state, best);

                if last_height < best_handle.last_block() {
                    // start the chain sync
                    let locators = state.store.locators();
                    best_handle.schedule_disconnect(Some(PROTOCOL_TIMEOUT));
                    if let Some(best_pos) = state.peer_pos(best_id) {
                        state.connected[best_pos].timer = TimerKind::Sync;
                    }

                    // request bare headers up to a week before the key birth
                    // time, merkle blocks from there on
                    if state.store.last_block().timestamp + ONE_WEEK
                        >= self.earliest_key_time
                    {
                        best_handle
                            .send_getblocks(locators, BlockHash::ZERO);
                    } else {
                        best_handle
                            .send_getheaders(locators, BlockHash::ZERO);
                    }
                } else {
                    state.connect_failure_count = 0;
                    self.load_mempools(&mut state);
                }
            }
        }
    }

    fn handle_disconnected(
        &self,
        id: PeerId,
        error: Option<Error>,
    ) {
        let mut notices = Vec::new();
        let mut completions: Vec<Completion> = Vec::new();
        let mut reconnect = false;
        {
            let mut state = self.state.lock().unwrap();
            let Some(pos) = state.peer_pos(id) else { return };
            let addr = state.connected[pos].info.addr();
            let timer = state.connected[pos].timer;

            let mut tx_error: Option<Error> = None;
            match error {
                Some(Error::Protocol) => {
                    self.peer_misbehaving(&mut state, pos);
                }
                Some(err) => {
                    state.known_peers.retain(|p| p.addr() != addr);
                    state.connect_failure_count += 1;

                    // only a publish-tagged deadline fails publishes; a
                    // connect or sync timeout must not
                    if err == Error::TimedOut
                        && timer == TimerKind::Publish
                        && (state.download_peer != Some(id)
                            || state.sync_start_height == 0
                            || state.connected.len() == 1)
                    {
                        tx_error = Some(Error::TimedOut);
                    }
                }
                None => {}
            }

            for peers in state.tx_relays.values_mut() {
                peers.retain(|a| *a != addr);
            }

            if state.download_peer == Some(id) {
                state.is_connected = false;
                state.download_peer = None;
                if state.connect_failure_count > MAX_CONNECT_FAILURES {
                    state.connect_failure_count = MAX_CONNECT_FAILURES;
                }
            }

            let mut will_save = false;
            if !state.is_connected
                && state.connect_failure_count == MAX_CONNECT_FAILURES
            {
                Self::sync_stopped_locked(&mut state);
                // wipe the cache so the next connect starts from fresh DNS
                state.known_peers.clear();
                tx_error = Some(Error::NotConnected);
                will_save = true;
                warn!(peer = id, "sync failed");
            } else if state.connect_failure_count < MAX_CONNECT_FAILURES {
                reconnect = true;
            }

            if let Some(err) = tx_error {
                let mut kept = Vec::new();
                for mut published in state.published.drain(..) {
                    match published.completion.take() {
                        Some(completion) => {
                            debug!(txid = %published.tx.txid, "publish canceled: {err}");
                            completions.push((completion, Err(err)));
                        }
                        None => kept.push(published),
                    }
                }
                state.published = kept;
            }

            state.connected.remove(pos);
            self.update_activity(&state);

            if will_save {
                notices.push(HostNotice::SavePeers(true, Vec::new()));
                notices.push(HostNotice::SyncStopped(error));
            }
            notices.push(HostNotice::TxStatusUpdate);
        }
        self.deliver(notices, completions);

        if reconnect && !self.shutdown.is_sent() {
            if let Some(manager) = self.weak.upgrade() {
                tokio::spawn(async move { manager.connect().await });
            }
        }
    }

    fn handle_relayed_peers(&self, id: PeerId, peers: Vec<PeerInfo>) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            debug!(peer = id, count = peers.len(), "relayed peers");
            let relayed_count = peers.len();
            let now = unix_time();

            state.known_peers.extend(peers);
            state
                .known_peers
                .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            state.known_peers.truncate(MAX_KNOWN_PEERS);

            // drop peers older than 3 hours, down to the floor
            while state.known_peers.len() > KNOWN_PEERS_FLOOR {
                let Some(last) = state.known_peers.last() else { break };
                if last.timestamp + 3 * 60 * 60 >= now {
                    break;
                }
                state.known_peers.pop();
            }

            // an addr batch under 1000 means relaying is complete
            if relayed_count > 1 && relayed_count < 1000 {
                notices.push(HostNotice::SavePeers(
                    true,
                    state.known_peers.clone(),
                ));
            }
        }
        self.deliver(notices, Vec::new());
    }

    // --- transactions --- //

    fn handle_relayed_tx(&self, id: PeerId, tx: Transaction) {
        let mut completions: Vec<Completion> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(pos) = state.peer_pos(id) else { return };
            let addr = state.connected[pos].info.addr();
            let handle = Arc::clone(&state.connected[pos].handle);
            let tx_hash = tx.txid;
            debug!(peer = id, txid = %tx_hash, "relayed tx");

            let mut relay_count = 0;
            let mut completion = None;
            let mut is_published = false;
            for published in &mut state.published {
                if published.tx.txid == tx_hash {
                    is_published = true;
                    completion = published.completion.take();
                }
            }
            if is_published {
                relay_count = State::<F::Peer>::list_add(
                    &mut state.tx_relays,
                    tx_hash,
                    addr,
                );
            }

            // cancel the publish timeout once nothing else is pending
            if !state.has_pending_publish_other_than(tx_hash)
                && (state.sync_start_height == 0
                    || state.download_peer != Some(id))
            {
                handle.schedule_disconnect(None);
                state.connected[pos].timer = TimerKind::None;
            }

            let is_wallet_tx = if state.sync_start_height == 0
                || self.wallet.contains_transaction(&tx)
            {
                self.wallet.register_transaction(tx)
            } else {
                false
            };
            let registered = is_wallet_tx
                .then(|| self.wallet.transaction_for_hash(tx_hash))
                .flatten();

            if let Some(tx) = &registered {
                if state.sync_start_height > 0
                    && state.download_peer == Some(id)
                {
                    handle.schedule_disconnect(Some(PROTOCOL_TIMEOUT));
                    state.connected[pos].timer = TimerKind::Sync;
                }

                // our own valid sends join the publish list so peers asking
                // for them can be answered
                if self.wallet.amount_sent_by_tx(tx) > 0
                    && self.wallet.transaction_is_valid(tx)
                {
                    self.add_to_publish_list(
                        &mut state,
                        (**tx).clone(),
                        None,
                    );
                }

                // relay counts only matter once syncing is done
                if state.sync_start_height == 0 {
                    relay_count = State::<F::Peer>::list_add(
                        &mut state.tx_relays,
                        tx_hash,
                        addr,
                    );
                }
                State::<F::Peer>::list_remove(
                    &mut state.tx_requests,
                    tx_hash,
                    addr,
                );

                self.refresh_filter_if_needed(&mut state);
            }

            // enough relays mark an unconfirmed tx as verified
            if let Some(tx) = registered {
                if relay_count >= state.max_connect_count
                    && tx.block_height == TX_UNCONFIRMED
                    && tx.timestamp == 0
                {
                    self.update_tx(
                        &mut state,
                        &[tx_hash],
                        TX_UNCONFIRMED,
                        unix_time(),
                        &mut completions,
                    );
                }
            }

            if let Some(completion) = completion {
                completions.push((completion, Ok(())));
            }
        }
        self.deliver(Vec::new(), completions);
    }

    fn handle_has_tx(&self, id: PeerId, tx_hash: TxId) {
        let mut completions: Vec<Completion> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(pos) = state.peer_pos(id) else { return };
            let addr = state.connected[pos].info.addr();
            let handle = Arc::clone(&state.connected[pos].handle);
            debug!(peer = id, txid = %tx_hash, "has tx");

            let mut tx = self.wallet.transaction_for_hash(tx_hash);
            let mut relay_count = 0;
            let mut completion = None;
            let mut is_published = false;
            for published in &mut state.published {
                if published.tx.txid == tx_hash {
                    if tx.is_none() {
                        tx = Some(Arc::clone(&published.tx));
                    }
                    is_published = true;
                    completion = published.completion.take();
                }
            }
            if is_published {
                relay_count = State::<F::Peer>::list_add(
                    &mut state.tx_relays,
                    tx_hash,
                    addr,
                );
            }

            if !state.has_pending_publish_other_than(tx_hash)
                && (state.sync_start_height == 0
                    || state.download_peer != Some(id))
            {
                handle.schedule_disconnect(None);
                state.connected[pos].timer = TimerKind::None;
            }

            if let Some(tx) = tx {
                let is_wallet_tx =
                    self.wallet.register_transaction((*tx).clone());

                if state.sync_start_height > 0
                    && state.download_peer == Some(id)
                    && is_wallet_tx
                {
                    handle.schedule_disconnect(Some(PROTOCOL_TIMEOUT));
                    state.connected[pos].timer = TimerKind::Sync;
                }

                if state.sync_start_height == 0 {
                    relay_count = State::<F::Peer>::list_add(
                        &mut state.tx_relays,
                        tx_hash,
                        addr,
                    );
                }

                if relay_count >= state.max_connect_count {
                    if let Some(known) =
                        self.wallet.transaction_for_hash(tx_hash)
                    {
                        if known.block_height == TX_UNCONFIRMED
                            && known.timestamp == 0
                        {
                            self.update_tx(
                                &mut state,
                                &[tx_hash],
                                TX_UNCONFIRMED,
                                unix_time(),
                                &mut completions,
                            );
                        }
                    }
                }

                State::<F::Peer>::list_remove(
                    &mut state.tx_requests,
                    tx_hash,
                    addr,
                );
            }

            if let Some(completion) = completion {
                completions.push((completion, Ok(())));
            }
        }
        self.deliver(Vec::new(), completions);
    }

    fn handle_rejected_tx(
        &self,
        id: PeerId,
        tx_hash: TxId,
        code: u8,
    ) {
        let mut notices = Vec::new();
        let mut completions = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(pos) = state.peer_pos(id) else { return };
            let addr = state.connected[pos].info.addr();
            debug!(peer = id, txid = %tx_hash, code, "rejected tx");

            State::<F::Peer>::list_remove(
                &mut state.tx_requests,
                tx_hash,
                addr,
            );

            if let Some(tx) = self.wallet.transaction_for_hash(tx_hash) {
                let removed = State::<F::Peer>::list_remove(
                    &mut state.tx_relays,
                    tx_hash,
                    addr,
                );
                if removed && tx.block_height == TX_UNCONFIRMED {
                    // back to unverified
                    self.update_tx(
                        &mut state,
                        &[tx_hash],
                        TX_UNCONFIRMED,
                        0,
                        &mut completions,
                    );
                }

                // rejecting our send for anything but a double-spend means
                // the peer is likely misconfigured
                if code != REJECT_SPENT
                    && self.wallet.amount_sent_by_tx(&tx) > 0
                {
                    let all_inputs_confirmed = tx.inputs.iter().all(|input| {
                        self.wallet
                            .transaction_for_hash(input.prev_hash)
                            .is_some_and(|t| {
                                t.block_height != TX_UNCONFIRMED
                            })
                    });
                    if all_inputs_confirmed {
                        self.peer_misbehaving(&mut state, pos);
                    }
                }
            }

            notices.push(HostNotice::TxStatusUpdate);
        }
        self.deliver(notices, completions);
    }

    fn handle_not_found(&self, id: PeerId, tx_hashes: Vec<TxId>) {
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state.peer_pos(id) else { return };
        let addr = state.connected[pos].info.addr();
        for tx_hash in tx_hashes {
            State::<F::Peer>::list_remove(&mut state.tx_relays, tx_hash, addr);
            State::<F::Peer>::list_remove(
                &mut state.tx_requests,
                tx_hash,
                addr,
            );
        }
    }

    fn handle_fee_filter(&self, id: PeerId, fee_per_kb: u64) {
        let state = self.state.lock().unwrap();
        debug!(peer = id, fee_per_kb, "feefilter");

        // find the second-highest advertised rate across connected peers
        let mut max_fee = 0u64;
        let mut second_fee = 0u64;
        for peer in &state.connected {
            if peer.handle.connect_status() != PeerStatus::Connected {
                continue;
            }
            let fee = peer.handle.fee_per_kb();
            if fee > max_fee {
                second_fee = max_fee;
                max_fee = fee;
            }
        }

        let raised = second_fee * 3 / 2;
        if raised > DEFAULT_FEE_PER_KB
            && raised <= MAX_FEE_PER_KB
            && raised > self.wallet.fee_per_kb()
        {
            info!(fee_per_kb = raised, "increasing feePerKb from feefilter");
            self.wallet.set_fee_per_kb(raised);
        }
    }

    fn handle_requested_tx(
        &self,
        id: PeerId,
        tx_hash: TxId,
        responder: oneshot::Sender<Option<Transaction>>,
    ) {
        let mut completions: Vec<Completion> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(pos) = state.peer_pos(id) else { return };
            let addr = state.connected[pos].info.addr();
            let handle = Arc::clone(&state.connected[pos].handle);
            debug!(peer = id, txid = %tx_hash, "requested tx");

            let mut tx = self.wallet.transaction_for_hash(tx_hash);
            let mut completion = None;
            let mut error = None;

            let mut keep = Vec::new();
            for mut published in state.published.drain(..) {
                if published.tx.txid == tx_hash {
                    if tx.is_none() {
                        tx = Some(Arc::clone(&published.tx));
                    }
                    if completion.is_none() {
                        completion = published.completion.take();
                    }
                    // a known-invalid publish is dropped on request
                    let invalid = tx
                        .as_ref()
                        .is_some_and(|t| !self.wallet.transaction_is_valid(t));
                    if invalid {
                        error = Some(Error::InvalidTx);
                        if self.wallet.transaction_for_hash(tx_hash).is_none()
                        {
                            tx = None;
                        }
                        continue; // drop the entry
                    }
                }
                keep.push(published);
            }
            state.published = keep;

            if !state.has_pending_publish_other_than(tx_hash)
                && (state.sync_start_height == 0
                    || state.download_peer != Some(id))
            {
                handle.schedule_disconnect(None);
                state.connected[pos].timer = TimerKind::None;
            }

            if error.is_none() {
                if let Some(tx) = &tx {
                    State::<F::Peer>::list_add(
                        &mut state.tx_relays,
                        tx_hash,
                        addr,
                    );
                    self.wallet.register_transaction((**tx).clone());
                }
            }

            let response = match (&error, tx) {
                (None, Some(tx)) => Some((*tx).clone()),
                _ => None,
            };
            let _ = responder.send(response);

            if let Some(completion) = completion {
                let result = match error {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
                completions.push((completion, result));
            }
        }
        self.deliver(Vec::new(), completions);
    }

    // --- blocks --- //

    fn handle_relayed_block(&self, id: PeerId, block: MerkleBlock) {
        let mut notices = Vec::new();
        let mut completions: Vec<Completion> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let mut queue = VecDeque::from([block]);

            while let Some(block) = queue.pop_front() {
                let Some(pos) = state.peer_pos(id) else { break };
                self.process_block(
                    &mut state,
                    pos,
                    block,
                    &mut queue,
                    &mut notices,
                    &mut completions,
                );
            }
        }
        self.deliver(notices, completions);
    }

    #[allow(clippy::too_many_arguments)]
    fn process_block(
        &self,
        state: &mut State<F::Peer>,
        pos: usize,
        mut block: MerkleBlock,
        queue: &mut VecDeque<MerkleBlock>,
        notices: &mut Vec<HostNotice>,
        completions: &mut Vec<Completion>,
    ) {
        let id = state.connected[pos].id;
        let addr_handle = Arc::clone(&state.connected[pos].handle);
        let now = unix_time();
        let tx_hashes = block.tx_hashes();

        let prev = state.store.get(&block.prev_block).cloned();
        let mut tx_time = block.timestamp;
        if let Some(prev) = &prev {
            tx_time = block.timestamp / 2 + prev.timestamp / 2;
            block.height = prev.height + 1;
        }

        // track the filter's observed false-positive rate with a low-pass
        // filter weighted by the block's total transaction count
        if state.download_peer == Some(id) && block.total_tx > 0 {
            let fp_count = tx_hashes
                .iter()
                .filter(|h| self.wallet.transaction_for_hash(**h).is_none())
                .count();

            state.average_tx_per_block = state.average_tx_per_block * 0.999
                + block.total_tx as f64 * 0.001;
            state.fp_rate = state.fp_rate
                * (1.0
                    - 0.01 * block.total_tx as f64
                        / state.average_tx_per_block)
                + 0.01 * fp_count as f64 / state.average_tx_per_block;

            if addr_handle.connect_status() == PeerStatus::Connected
                && state.fp_rate > BLOOM_DEFAULT_FALSEPOSITIVE_RATE * 10.0
            {
                let blocks_on_filter = state
                    .store
                    .last_block()
                    .height
                    .saturating_sub(state.filter_update_height)
                    + 1;
                warn!(
                    peer = id,
                    fp_rate = state.fp_rate,
                    blocks_on_filter,
                    "bloom filter false positive rate too high, disconnecting"
                );
                state.fp_rate = BLOOM_REDUCED_FALSEPOSITIVE_RATE;
                addr_handle.disconnect();
            } else if state.store.last_block().height + 500
                < addr_handle.last_block()
                && state.fp_rate > BLOOM_REDUCED_FALSEPOSITIVE_RATE * 10.0
            {
                // rebuild before the filter degrades further
                self.update_filter(state);
            }
        }

        let mut save_count = 0usize;
        let accepted: Option<Arc<MerkleBlock>>;

        if block.total_tx == 0
            && block.timestamp + ONE_WEEK
                > self.earliest_key_time + 2 * 60 * 60
        {
            // a bare header in the merkle-block range carries nothing to scan
            accepted = None;
        } else if state.bloom_filter.is_none() {
            // a filter update is in flight; this block may be incomplete
            accepted = None;
            if state.download_peer == Some(id)
                && state.store.last_block().height < state.estimated_height
            {
                addr_handle.schedule_disconnect(Some(PROTOCOL_TIMEOUT));
                state.connected[pos].timer = TimerKind::Sync;
                state.connect_failure_count = 0;
            }
        } else if prev.is_none() {
            // an orphan
            if block.timestamp + ONE_WEEK < now {
                accepted = None; // too old to matter
            } else {
                debug!(
                    hash = %block.block_hash,
                    "relayed orphan block"
                );
                // ask for the gap, unless this chains on the previous orphan
                // or we're mid-sync anyway
                if state.store.last_block().height
                    >= addr_handle.last_block()
                    && state.store.last_orphan() != Some(block.prev_block)
                {
                    let locators = state.store.locators();
                    addr_handle.send_getblocks(locators, BlockHash::ZERO);
                }
                state.store.add_orphan(Arc::new(block));
                accepted = None;
            }
        } else if !state.store.verify_block(
            &block,
            prev.as_deref().expect("prev checked above"),
            &self.params,
        ) {
            warn!(peer = id, "relayed invalid block");
            accepted = None;
            self.peer_misbehaving(state, pos);
        } else if block.prev_block == state.store.last_block().block_hash {
            // extends the main chain
            let height = block.height;
            if height % 500 == 0 || !tx_hashes.is_empty() {
                debug!(height, fp_rate = state.fp_rate, "adding block");
            }
            let arc = Arc::new(block);
            state.store.insert(Arc::clone(&arc));
            state.store.set_last_block(Arc::clone(&arc));
            if !tx_hashes.is_empty() {
                self.update_tx(state, &tx_hashes, height, tx_time, completions);
            }
            if let Some(dl) = state.download_peer {
                if let Some(dl_pos) = state.peer_pos(dl) {
                    state.connected[dl_pos]
                        .handle
                        .set_current_block_height(height);
                }
            }

            if height < state.estimated_height
                && state.download_peer == Some(id)
            {
                addr_handle.schedule_disconnect(Some(PROTOCOL_TIMEOUT));
                state.connected[pos].timer = TimerKind::Sync;
                state.connect_failure_count = 0;
            }

            if height % BLOCK_DIFFICULTY_INTERVAL == 0 {
                save_count = 1; // persist transition blocks immediately
                // headers below the prior transition are no longer needed
                // for retarget verification
                state.store.prune_below(height);
            }

            if height == state.estimated_height {
                // sync complete: persist enough context to resume retarget
                // verification, then go after mempools
                save_count = (height % BLOCK_DIFFICULTY_INTERVAL) as usize
                    + BLOCK_DIFFICULTY_INTERVAL as usize
                    + 1;
                self.load_mempools(state);
            }
            accepted = Some(arc);
        } else if state.store.contains(&block.block_hash) {
            // a duplicate, possibly now with known height
            let arc = Arc::new(block);
            let on_main = state.store.on_main_chain(&arc);
            if on_main {
                if !tx_hashes.is_empty() {
                    self.update_tx(
                        state,
                        &tx_hashes,
                        arc.height,
                        tx_time,
                        completions,
                    );
                }
                if arc.height == state.store.last_block().height {
                    state.store.set_last_block(Arc::clone(&arc));
                }
            }
            state.store.insert(Arc::clone(&arc));
            state.store.remove_orphan_by_hash(arc.block_hash);
            accepted = Some(arc);
        } else if state.store.last_block().height < addr_handle.last_block()
            && block.height > state.store.last_block().height + 1
        {
            // a new block mined mid-rescan; orphan it until we catch up
            debug!(height = block.height, "marking new block as orphan until rescan completes");
            state.store.add_orphan(Arc::new(block));
            accepted = None;
        } else if block.height <= state.store.last_checkpoint_height() {
            debug!(height = block.height, "ignoring fork below the last checkpoint");
            accepted = None;
        } else {
            // a fork
            info!(height = block.height, "chain fork");
            let arc = Arc::new(block);
            state.store.insert(Arc::clone(&arc));

            if arc.height > state.store.last_block().height {
                // the fork is now the best chain; reorg onto it
                let Some(join) = state.store.fork_join_point(&arc) else {
                    return;
                };
                info!(
                    from = join.height,
                    to = arc.height,
                    "reorganizing chain"
                );

                self.wallet.set_tx_unconfirmed_after(join.height);

                // replay the new main segment, restoring confirmations
                let segment = state.store.fork_segment(&arc, &join);
                for fork_block in &segment {
                    let hashes = fork_block.tx_hashes();
                    let parent_time = state
                        .store
                        .get(&fork_block.prev_block)
                        .map(|p| p.timestamp)
                        .unwrap_or(fork_block.timestamp);
                    let timestamp =
                        fork_block.timestamp / 2 + parent_time / 2;
                    if !hashes.is_empty() {
                        self.wallet.update_transactions(
                            &hashes,
                            fork_block.height,
                            timestamp,
                        );
                    }
                }

                state.store.set_last_block(Arc::clone(&arc));

                if arc.height == state.estimated_height {
                    save_count =
                        (arc.height % BLOCK_DIFFICULTY_INTERVAL) as usize
                            + BLOCK_DIFFICULTY_INTERVAL as usize
                            + 1;
                    self.load_mempools(state);
                }
            }
            accepted = Some(arc);
        }

        if let Some(arc) = &accepted {
            if arc.height != BLOCK_UNKNOWN_HEIGHT {
                if arc.height > state.estimated_height {
                    state.estimated_height = arc.height;
                }
                // the next block may have arrived first
                if let Some(next) =
                    state.store.take_orphan_child(arc.block_hash)
                {
                    queue.push_back((*next).clone());
                }
            }

            if save_count > 0 {
                let batch = state.store.save_batch(arc, save_count);
                if !batch.is_empty() {
                    notices.push(HostNotice::SaveBlocks(
                        batch.len() > 1,
                        batch,
                    ));
                }
            }

            if arc.height != BLOCK_UNKNOWN_HEIGHT
                && arc.height >= addr_handle.last_block()
            {
                notices.push(HostNotice::TxStatusUpdate);
            }
        }
    }

    // --- pings, mempools, filters --- //

    fn handle_ping_done(
        &self,
        id: PeerId,
        purpose: PingPurpose,
        success: bool,
    ) {
        match purpose {
            PingPurpose::FilterUpdateBegin =>
                self.on_filter_update_begin(id, success),
            PingPurpose::FilterLoaded => self.on_filter_loaded(id, success),
            PingPurpose::Rerequested => self.on_rerequested(id, success),
            PingPurpose::FilterThenMempool =>
                self.on_filter_then_mempool(id, success),
            PingPurpose::PublishedInv => self.on_published_inv(id, success),
            PingPurpose::UnrelayedGetdata =>
                self.on_unrelayed_getdata(id, success),
        }
    }

    /// The peer has flushed everything it already sent; rebuild the filter.
    fn on_filter_update_begin(&self, id: PeerId, success: bool) {
        if !success {
            return;
        }
        let mut state = self.state.lock().unwrap();
        debug!(peer = id, "updating filter with new wallet addresses");
        state.bloom_filter = None;

        if state.store.last_block().height < state.estimated_height {
            // mid-sync, only the download peer needs the fresh filter
            if let Some(dl) = state.download_peer {
                if let Some(dl_pos) = state.peer_pos(dl) {
                    self.load_bloom_filter(&mut state, dl_pos);
                    let handle =
                        Arc::clone(&state.connected[dl_pos].handle);
                    self.send_ping_tagged(
                        &handle,
                        dl,
                        PingPurpose::FilterLoaded,
                    );
                }
            }
        } else {
            for pos in 0..state.connected.len() {
                if state.connected[pos].handle.connect_status()
                    != PeerStatus::Connected
                {
                    continue;
                }
                self.load_bloom_filter(&mut state, pos);
                let (peer_id, handle) = (
                    state.connected[pos].id,
                    Arc::clone(&state.connected[pos].handle),
                );
                self.send_ping_tagged(
                    &handle,
                    peer_id,
                    PingPurpose::FilterLoaded,
                );
            }
        }
    }

    /// The rebuilt filter is confirmed loaded on the peer.
    fn on_filter_loaded(&self, id: PeerId, success: bool) {
        if !success {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state.peer_pos(id) else { return };
        let handle = Arc::clone(&state.connected[pos].handle);
        handle.set_needs_filter_update(false);
        state.connected[pos].needs_filter_update = false;

        if state.store.last_block().height < state.estimated_height {
            // still syncing: re-request blocks from the tip on the new filter
            if let Some(dl) = state.download_peer {
                if let Some(dl_pos) = state.peer_pos(dl) {
                    let dl_handle =
                        Arc::clone(&state.connected[dl_pos].handle);
                    dl_handle.rerequest_blocks(
                        state.store.last_block().block_hash,
                    );
                    self.send_ping_tagged(
                        &dl_handle,
                        dl,
                        PingPurpose::Rerequested,
                    );
                }
            }
        } else {
            // completion is unused; mempool responses arrive as tx events
            let _ = handle.send_mempool(state.published_hashes());
        }
    }

    fn on_rerequested(&self, id: PeerId, success: bool) {
        if !success {
            return;
        }
        let state = self.state.lock().unwrap();
        let Some(pos) = state.peer_pos(id) else { return };
        if !state.connected[pos].needs_filter_update {
            let locators = state.store.locators();
            state.connected[pos]
                .handle
                .send_getblocks(locators, BlockHash::ZERO);
        }
    }

    /// The filter is installed; go after the peer's mempool.
    fn on_filter_then_mempool(&self, id: PeerId, success: bool) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(pos) = state.peer_pos(id) else { return };
            if success {
                let handle = Arc::clone(&state.connected[pos].handle);
                self.send_mempool_tagged(
                    &handle,
                    id,
                    state.published_hashes(),
                );
            } else if state.download_peer == Some(id) {
                info!(peer = id, "sync succeeded");
                Self::sync_stopped_locked(&mut state);
                notices.push(HostNotice::SyncStopped(None));
            }
        }
        self.deliver(notices, Vec::new());
    }

    fn on_published_inv(&self, id: PeerId, _success: bool) {
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state.peer_pos(id) else { return };
        self.request_unrelayed_tx(&mut state, pos);
    }

    /// A mempool round-trip finished on this peer.
    fn handle_mempool_done(&self, id: PeerId, success: bool) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(pos) = state.peer_pos(id) else { return };
            if success {
                debug!(peer = id, "mempool request finished");
                if state.sync_start_height > 0 {
                    info!(peer = id, "sync succeeded");
                    Self::sync_stopped_locked(&mut state);
                    notices.push(HostNotice::SyncStopped(None));
                }
                self.request_unrelayed_tx(&mut state, pos);
                state.connected[pos].handle.send_getaddr();
                notices.push(HostNotice::TxStatusUpdate);
            } else {
                debug!(peer = id, "mempool request failed");
            }
        }
        self.deliver(notices, Vec::new());
    }

    /// Unconfirmed wallet transactions no peer knows about have likely been
    /// dropped from the network; forget or unverify them.
    fn on_unrelayed_getdata(&self, id: PeerId, success: bool) {
        let mut completions: Vec<Completion> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if success {
                if let Some(pos) = state.peer_pos(id) {
                    state.connected[pos].synced = true;
                }
            }

            let mut count = 0usize;
            for peer in &state.connected {
                if peer.handle.connect_status() == PeerStatus::Connected {
                    count += 1;
                }
                if !peer.synced {
                    count = 0;
                    break;
                }
            }

            // wait until a full set of peers has finished relaying mempools
            if count >= state.max_connect_count {
                for tx in self
                    .wallet
                    .tx_unconfirmed_before(TX_UNCONFIRMED)
                    .iter()
                    .rev()
                {
                    let tx_hash = tx.txid;
                    let is_publishing = state.published.iter().any(|p| {
                        p.tx.txid == tx_hash && p.completion.is_some()
                    });
                    if is_publishing {
                        continue;
                    }

                    let relays = State::<F::Peer>::list_count(
                        &state.tx_relays,
                        tx_hash,
                    );
                    let requests = State::<F::Peer>::list_count(
                        &state.tx_requests,
                        tx_hash,
                    );
                    if relays == 0 && requests == 0 {
                        info!(txid = %tx_hash, "removing unrelayed tx");
                        self.wallet.remove_transaction(tx_hash);
                    } else if relays < state.max_connect_count {
                        // not seen widely enough: back to unverified
                        self.update_tx(
                            &mut state,
                            &[tx_hash],
                            TX_UNCONFIRMED,
                            0,
                            &mut completions,
                        );
                    }
                }
            }
        }
        self.deliver(Vec::new(), completions);
    }

    // --- helpers (state lock held) --- //

    fn update_activity(&self, state: &State<F::Peer>) {
        let _ = self
            .activity
            .send((state.connected.len(), state.dns_tasks));
    }

    fn sync_stopped_locked(state: &mut State<F::Peer>) {
        state.sync_start_height = 0;

        if let Some(dl) = state.download_peer {
            // keep the timeout armed while a publish is pending
            if state.published.iter().any(|p| p.completion.is_some()) {
                return;
            }
            if let Some(pos) = state.peer_pos(dl) {
                state.connected[pos].handle.schedule_disconnect(None);
                state.connected[pos].timer = TimerKind::None;
            }
        }
    }

    fn peer_misbehaving(&self, state: &mut State<F::Peer>, pos: usize) {
        let addr = state.connected[pos].info.addr();
        state.known_peers.retain(|p| p.addr() != addr);

        state.misbehaving_count += 1;
        if state.misbehaving_count >= MISBEHAVING_THRESHOLD {
            // get a fresh peer list from DNS on the next connect
            state.misbehaving_count = 0;
            state.known_peers.clear();
        }

        state.connected[pos].handle.disconnect();
    }

    /// Installs a filter on the peer covering wallet addresses, UTXOs, and
    /// outpoints spent within the last 100 blocks.
    fn load_bloom_filter(&self, state: &mut State<F::Peer>, pos: usize) {
        // addresses are single-use; derive well past the gap limit so chain
        // discovery doesn't force constant filter rebuilds
        self.wallet
            .unused_addrs(GAP_LIMIT_EXTERNAL + 100, false);
        self.wallet.unused_addrs(GAP_LIMIT_INTERNAL + 100, true);

        // orphans matched against the old filter may be incomplete
        state.store.clear_orphans();
        state.filter_update_height = state.store.last_block().height;

        let addrs = self.wallet.all_addrs();
        let utxos = self.wallet.utxos();
        let cutoff = state.store.last_block().height.saturating_sub(100);
        let recent = self.wallet.tx_unconfirmed_before(cutoff);

        let peer = &state.connected[pos];
        let tweak = (peer.id as u32) ^ ((peer.id >> 32) as u32);
        // element count is an over-approximation of the spent outpoints,
        // which only makes the filter larger than strictly needed
        let mut filter = BloomFilter::new(
            state.fp_rate,
            addrs.len() + utxos.len() + recent.len() + 100,
            tweak,
            BLOOM_UPDATE_ALL,
        );

        for addr in addrs {
            if let Some(hash) = addr.hash160() {
                filter.insert_unique(&hash);
            }
        }

        for utxo in utxos {
            filter.insert_unique(&outpoint_bytes(utxo.tx_hash, utxo.index));
        }

        for tx in recent {
            for input in &tx.inputs {
                let spends_wallet = self
                    .wallet
                    .transaction_for_hash(input.prev_hash)
                    .and_then(|prev| {
                        prev.outputs
                            .get(input.prev_index as usize)
                            .and_then(|o| o.address.clone())
                    })
                    .is_some_and(|addr| self.wallet.contains_address(&addr));
                if spends_wallet {
                    filter.insert_unique(&outpoint_bytes(
                        input.prev_hash,
                        input.prev_index,
                    ));
                }
            }
        }

        let payload = filter.serialize();
        state.bloom_filter = Some(filter);
        state.connected[pos].handle.send_filterload(payload);
    }

    /// Rebuilds the filter behind a ping/pong barrier so any tx the peer
    /// already matched is accounted for first.
    fn update_filter(&self, state: &mut State<F::Peer>) {
        let Some(dl) = state.download_peer else { return };
        let Some(pos) = state.peer_pos(dl) else { return };
        if state.connected[pos].needs_filter_update {
            return;
        }

        let handle = Arc::clone(&state.connected[pos].handle);
        handle.set_needs_filter_update(true);
        state.connected[pos].needs_filter_update = true;
        debug!(peer = dl, "filter update needed, waiting for pong");
        self.send_ping_tagged(&handle, dl, PingPurpose::FilterUpdateBegin);
    }

    /// Rebuild the filter if the next gap-limit window of addresses is no
    /// longer covered.
    fn refresh_filter_if_needed(&self, state: &mut State<F::Peer>) {
        if state.bloom_filter.is_none() {
            return;
        }
        let mut fresh = self.wallet.unused_addrs(GAP_LIMIT_EXTERNAL, false);
        fresh.extend(self.wallet.unused_addrs(GAP_LIMIT_INTERNAL, true));

        let stale = {
            let filter = state.bloom_filter.as_ref().expect("checked above");
            fresh.iter().any(|addr| {
                addr.hash160()
                    .is_some_and(|hash| !filter.contains(&hash))
            })
        };
        if stale {
            state.bloom_filter = None;
            self.update_filter(state);
        }
    }

    /// After sync, install filters and pull mempools from every peer.
    fn load_mempools(&self, state: &mut State<F::Peer>) {
        for pos in 0..state.connected.len() {
            let peer = &state.connected[pos];
            if peer.handle.connect_status() != PeerStatus::Connected {
                continue;
            }
            let (id, handle) = (peer.id, Arc::clone(&peer.handle));

            if state.download_peer != Some(id)
                || state.fp_rate > BLOOM_REDUCED_FALSEPOSITIVE_RATE * 5.0
            {
                self.load_bloom_filter(state, pos);
                self.publish_pending_tx(state, pos);
                self.send_ping_tagged(
                    &handle,
                    id,
                    PingPurpose::FilterThenMempool,
                );
            } else {
                self.send_mempool_tagged(
                    &handle,
                    id,
                    state.published_hashes(),
                );
            }
        }
    }

    /// Announces the publish queue to a peer, arming the publish timeout if
    /// any completion is still pending.
    fn publish_pending_tx(&self, state: &mut State<F::Peer>, pos: usize) {
        let has_pending =
            state.published.iter().any(|p| p.completion.is_some());
        if has_pending {
            state.connected[pos]
                .handle
                .schedule_disconnect(Some(PROTOCOL_TIMEOUT));
            state.connected[pos].timer = TimerKind::Publish;
        }

        let hashes = state.published_hashes();
        if !hashes.is_empty() {
            state.connected[pos].handle.send_inv(hashes);
        }
    }

    /// Adds `tx` (and, recursively, its unconfirmed wallet inputs) to the
    /// publish queue.
    fn add_to_publish_list(
        &self,
        state: &mut State<F::Peer>,
        tx: Transaction,
        completion: Option<oneshot::Sender<Result<(), Error>>>,
    ) {
        if tx.block_height != TX_UNCONFIRMED {
            return;
        }

        if let Some(existing) =
            state.published.iter_mut().find(|p| p.tx.txid == tx.txid)
        {
            // keep at most one completion per tx, first come first served
            if existing.completion.is_none() {
                existing.completion = completion;
            }
            return;
        }

        let inputs: Vec<TxId> =
            tx.inputs.iter().map(|i| i.prev_hash).collect();
        state.published.push(PublishedTx {
            tx: Arc::new(tx),
            completion,
        });

        for prev_hash in inputs {
            if let Some(prev) = self.wallet.transaction_for_hash(prev_hash) {
                if prev.block_height == TX_UNCONFIRMED {
                    self.add_to_publish_list(state, (*prev).clone(), None);
                }
            }
        }
    }

    /// Asks a peer for any unconfirmed wallet tx it hasn't relayed, to learn
    /// whether the network still knows them.
    fn request_unrelayed_tx(
        &self,
        state: &mut State<F::Peer>,
        pos: usize,
    ) {
        let addr = state.connected[pos].info.addr();
        let mut hashes = Vec::new();

        for tx in self.wallet.tx_unconfirmed_before(TX_UNCONFIRMED) {
            let tx_hash = tx.txid;
            if !State::<F::Peer>::list_has(&state.tx_relays, tx_hash, addr)
                && !State::<F::Peer>::list_has(
                    &state.tx_requests,
                    tx_hash,
                    addr,
                )
            {
                hashes.push(tx_hash);
                State::<F::Peer>::list_add(
                    &mut state.tx_requests,
                    tx_hash,
                    addr,
                );
            }
        }

        if hashes.is_empty() {
            state.connected[pos].synced = true;
            return;
        }

        let (id, handle) =
            (state.connected[pos].id, Arc::clone(&state.connected[pos].handle));
        handle.send_getdata(hashes, Vec::new());
        if !state.connected[pos].synced {
            self.send_ping_tagged(&handle, id, PingPurpose::UnrelayedGetdata);
        }
    }

    /// Applies confirmation updates, retiring confirmed entries from the
    /// publish queue and relay counts before telling the wallet.
    fn update_tx(
        &self,
        state: &mut State<F::Peer>,
        tx_hashes: &[TxId],
        block_height: u32,
        timestamp: u32,
        completions: &mut Vec<Completion>,
    ) {
        if block_height != TX_UNCONFIRMED {
            for tx_hash in tx_hashes {
                let mut kept = Vec::new();
                for mut published in state.published.drain(..) {
                    if published.tx.txid == *tx_hash {
                        // confirmation settles any still-pending publish
                        if let Some(completion) = published.completion.take()
                        {
                            completions.push((completion, Ok(())));
                        }
                    } else {
                        kept.push(published);
                    }
                }
                state.published = kept;
                state.tx_relays.remove(tx_hash);
            }
        }

        self.wallet
            .update_transactions(tx_hashes, block_height, timestamp);
    }

    // --- async plumbing --- //

    fn send_ping_tagged(
        &self,
        handle: &Arc<F::Peer>,
        id: PeerId,
        purpose: PingPurpose,
    ) {
        let pong = handle.send_ping();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let success = pong.await.unwrap_or(false);
            let _ = internal.send(Internal::PingDone {
                peer: id,
                purpose,
                success,
            });
        });
    }

    fn send_mempool_tagged(
        &self,
        handle: &Arc<F::Peer>,
        id: PeerId,
        known: Vec<TxId>,
    ) {
        let done = handle.send_mempool(known);
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let success = done.await.unwrap_or(false);
            let _ = internal.send(Internal::MempoolDone { peer: id, success });
        });
    }

    /// DNS discovery: fixed peer wins; otherwise the first seed resolves
    /// inline and the rest on spawned tasks, waiting until enough peers are
    /// known or every lookup finished.
    async fn find_peers(&self) {
        let now = unix_time();
        let services = self.params.required_services();
        let port = self.params.standard_port;

        {
            let mut state = self.state.lock().unwrap();
            if let Some(mut fixed) = state.fixed_peer {
                fixed.services = services;
                fixed.timestamp = now;
                state.known_peers = vec![fixed];
                return;
            }
        }

        let seeds = self.params.dns_seeds.clone();
        let Some((first, rest)) = seeds.split_first() else { return };

        for seed in rest {
            let Some(manager) = self.weak.upgrade() else { return };
            {
                let mut state = self.state.lock().unwrap();
                state.dns_tasks += 1;
                self.update_activity(&state);
            }
            let seed = seed.clone();
            tokio::spawn(async move {
                let addrs = resolve_seed(&seed, port).await;
                let mut state = manager.state.lock().unwrap();
                for ip in addrs {
                    // stagger timestamps so seed peers don't all look new
                    let age = 24 * 60 * 60
                        + rng::next_upto(&mut state.rng, 2 * 24 * 60 * 60);
                    state.known_peers.push(PeerInfo::new(
                        ip,
                        port,
                        services,
                        now.saturating_sub(age),
                    ));
                }
                state.dns_tasks -= 1;
                manager.update_activity(&state);
            });
        }

        let addrs = resolve_seed(first, port).await;
        {
            let mut state = self.state.lock().unwrap();
            for ip in addrs {
                state
                    .known_peers
                    .push(PeerInfo::new(ip, port, services, now));
            }
        }

        // wait for enough candidates or for every lookup to finish
        let mut activity = self.activity.subscribe();
        loop {
            let (enough, dns_tasks) = {
                let state = self.state.lock().unwrap();
                (
                    state.known_peers.len() >= PEER_MAX_CONNECTIONS,
                    state.dns_tasks,
                )
            };
            if enough || dns_tasks == 0 {
                break;
            }
            if activity.changed().await.is_err() {
                break;
            }
        }

        let mut state = self.state.lock().unwrap();
        state
            .known_peers
            .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }

    fn deliver(
        &self,
        notices: Vec<HostNotice>,
        completions: Vec<Completion>,
    ) {
        for (completion, result) in completions {
            let _ = completion.send(result);
        }
        for notice in notices {
            match notice {
                HostNotice::SyncStarted => self.hooks.sync_started(),
                HostNotice::SyncStopped(error) =>
                    self.hooks.sync_stopped(error),
                HostNotice::TxStatusUpdate => self.hooks.tx_status_update(),
                HostNotice::SaveBlocks(replace, blocks) =>
                    self.hooks.save_blocks(replace, &blocks),
                HostNotice::SavePeers(replace, peers) =>
                    self.hooks.save_peers(replace, &peers),
            }
        }
    }
}

fn outpoint_bytes(tx_hash: TxId, index: u32) -> [u8; 36] {
    let mut bytes = [0u8; 36];
    bytes[..32].copy_from_slice(&tx_hash.0);
    bytes[32..].copy_from_slice(&index.to_le_bytes());
    bytes
}

async fn resolve_seed(seed: &str, port: u16) -> Vec<IpAddr> {
    match tokio::net::lookup_host((seed, port)).await {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(err) => {
            warn!(seed, "dns lookup failed: {err}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Mutex as StdMutex,
    };

    use keel_core::{
        constants::{SERVICES_NODE_BLOOM, TXIN_SEQUENCE},
        keys::MasterPubKey,
        params::Checkpoint,
        rng::FastRng,
        tx::{TxIn, TxOut},
    };
    use tokio::task::yield_now;

    use super::*;

    const SEED: &[u8] = b"keel p2p test seed 00000000000000";

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        FilterLoad,
        GetBlocks,
        GetHeaders,
        GetData(Vec<TxId>),
        Inv(Vec<TxId>),
        Mempool,
        GetAddr,
        Rerequest,
    }

    struct MockPeer {
        id: PeerId,
        events: PeerEventSender,
        status: Arc<StdMutex<PeerStatus>>,
        best_height: AtomicU32,
        fee_rate: AtomicU64,
        sent: StdMutex<Vec<Sent>>,
        /// Answer getdata for txs with notfound, as a peer that has never
        /// seen them would.
        notfound_on_getdata: bool,
        /// Arm real (tokio) disconnect timers.
        real_timers: bool,
        timer: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    }

    impl MockPeer {
        fn emit(&self, event: PeerEvent) {
            let _ = self.events.try_send((self.id, event));
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        fn sent_contains(&self, wanted: &Sent) -> bool {
            self.sent().iter().any(|s| s == wanted)
        }
    }

    impl Peer for MockPeer {
        fn connect(&self) {
            *self.status.lock().unwrap() = PeerStatus::Connected;
            self.emit(PeerEvent::Connected);
        }

        fn disconnect(&self) {
            let mut status = self.status.lock().unwrap();
            if *status != PeerStatus::Disconnected {
                *status = PeerStatus::Disconnected;
                drop(status);
                self.emit(PeerEvent::Disconnected(None));
            }
        }

        fn connect_status(&self) -> PeerStatus {
            *self.status.lock().unwrap()
        }

        fn version(&self) -> u32 {
            70015
        }

        fn last_block(&self) -> u32 {
            self.best_height.load(Ordering::SeqCst)
        }

        fn ping_time(&self) -> f64 {
            0.1
        }

        fn fee_per_kb(&self) -> u64 {
            self.fee_rate.load(Ordering::SeqCst)
        }

        fn host(&self) -> String {
            "mock-peer".to_owned()
        }

        fn send_filterload(&self, _filter: Vec<u8>) {
            self.sent.lock().unwrap().push(Sent::FilterLoad);
        }

        fn send_getblocks(
            &self,
            _locators: Vec<BlockHash>,
            _stop: BlockHash,
        ) {
            self.sent.lock().unwrap().push(Sent::GetBlocks);
        }

        fn send_getheaders(
            &self,
            _locators: Vec<BlockHash>,
            _stop: BlockHash,
        ) {
            self.sent.lock().unwrap().push(Sent::GetHeaders);
        }

        fn send_getdata(
            &self,
            tx_hashes: Vec<TxId>,
            _block_hashes: Vec<BlockHash>,
        ) {
            self.sent
                .lock()
                .unwrap()
                .push(Sent::GetData(tx_hashes.clone()));
            if self.notfound_on_getdata {
                self.emit(PeerEvent::NotFound {
                    tx_hashes,
                    block_hashes: Vec::new(),
                });
            }
        }

        fn send_inv(&self, tx_hashes: Vec<TxId>) {
            self.sent.lock().unwrap().push(Sent::Inv(tx_hashes));
        }

        fn send_ping(&self) -> oneshot::Receiver<bool> {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(true);
            rx
        }

        fn send_mempool(
            &self,
            _known_tx_hashes: Vec<TxId>,
        ) -> oneshot::Receiver<bool> {
            self.sent.lock().unwrap().push(Sent::Mempool);
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(true);
            rx
        }

        fn send_getaddr(&self) {
            self.sent.lock().unwrap().push(Sent::GetAddr);
        }

        fn rerequest_blocks(&self, _from: BlockHash) {
            self.sent.lock().unwrap().push(Sent::Rerequest);
        }

        fn schedule_disconnect(&self, timeout: Option<Duration>) {
            let mut timer = self.timer.lock().unwrap();
            if let Some(armed) = timer.take() {
                armed.abort();
            }
            let Some(timeout) = timeout else { return };
            if !self.real_timers {
                return;
            }
            let events = self.events.clone();
            let id = self.id;
            let status = Arc::clone(&self.status);
            *timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                *status.lock().unwrap() = PeerStatus::Disconnected;
                let _ = events
                    .try_send((id, PeerEvent::Disconnected(Some(Error::TimedOut))));
            }));
        }

        fn set_needs_filter_update(&self, _needs: bool) {}

        fn set_current_block_height(&self, _height: u32) {}

        fn set_earliest_key_time(&self, _time: u32) {}
    }

    struct MockFactory {
        peers: StdMutex<Vec<Arc<MockPeer>>>,
        best_height: u32,
        notfound_on_getdata: bool,
        real_timers: bool,
    }

    impl MockFactory {
        fn new(best_height: u32) -> Self {
            Self {
                peers: StdMutex::new(Vec::new()),
                best_height,
                notfound_on_getdata: false,
                real_timers: false,
            }
        }

        fn peer(&self, index: usize) -> Arc<MockPeer> {
            Arc::clone(&self.peers.lock().unwrap()[index])
        }

        fn created(&self) -> usize {
            self.peers.lock().unwrap().len()
        }
    }

    impl PeerFactory for Arc<MockFactory> {
        type Peer = MockPeer;

        fn create(
            &self,
            _info: &PeerInfo,
            _magic: u32,
            id: PeerId,
            events: PeerEventSender,
        ) -> Arc<MockPeer> {
            let peer = Arc::new(MockPeer {
                id,
                events,
                status: Arc::new(StdMutex::new(PeerStatus::Connecting)),
                best_height: AtomicU32::new(self.best_height),
                fee_rate: AtomicU64::new(0),
                sent: StdMutex::new(Vec::new()),
                notfound_on_getdata: self.notfound_on_getdata,
                real_timers: self.real_timers,
                timer: StdMutex::new(None),
            });
            self.peers.lock().unwrap().push(Arc::clone(&peer));
            peer
        }
    }

    #[derive(Default)]
    struct HookRecorder {
        sync_started: AtomicU32,
        sync_stopped: StdMutex<Vec<Option<Error>>>,
        saved_peer_batches: AtomicU32,
        saved_block_batches: AtomicU32,
    }

    impl NodeHooks for HookRecorder {
        fn sync_started(&self) {
            self.sync_started.fetch_add(1, Ordering::SeqCst);
        }
        fn sync_stopped(&self, error: Option<Error>) {
            self.sync_stopped.lock().unwrap().push(error);
        }
        fn save_blocks(&self, _replace: bool, _blocks: &[Arc<MerkleBlock>]) {
            self.saved_block_batches.fetch_add(1, Ordering::SeqCst);
        }
        fn save_peers(&self, _replace: bool, _peers: &[PeerInfo]) {
            self.saved_peer_batches.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        wallet: Arc<Wallet>,
        manager: Arc<PeerManager<Arc<MockFactory>>>,
        factory: Arc<MockFactory>,
        hooks: Arc<HookRecorder>,
        genesis: Checkpoint,
    }

    fn genesis_checkpoint(now: u32) -> Checkpoint {
        Checkpoint {
            height: 0,
            hash: BlockHash([0x10; 32]),
            timestamp: now - 24 * 60 * 60,
            target: 0x207f_ffff,
        }
    }

    fn saved_peer(tag: u8, now: u32) -> PeerInfo {
        PeerInfo::new(
            IpAddr::from([127, 0, 0, tag]),
            18333,
            SERVICES_NODE_NETWORK | SERVICES_NODE_BLOOM,
            now,
        )
    }

    fn fixture(factory: MockFactory, peer_count: u8) -> Fixture {
        let now = unix_time();
        let genesis = genesis_checkpoint(now);
        let params = ChainParams::test(genesis.clone());

        let mpk = MasterPubKey::from_seed(SEED).unwrap();
        let wallet = Wallet::new(
            mpk,
            Vec::new(),
            Arc::new(()),
            Box::new(FastRng::from_u64(3)),
        )
        .unwrap();

        let factory = Arc::new(factory);
        let hooks = Arc::new(HookRecorder::default());
        let config = PeerManagerConfig::new(params, now - 12 * 60 * 60);
        let saved_peers =
            (1..=peer_count).map(|i| saved_peer(i, now)).collect();

        let manager = PeerManager::start(
            Arc::clone(&wallet),
            config,
            Vec::new(),
            saved_peers,
            Arc::clone(&factory),
            Arc::clone(&hooks) as Arc<dyn NodeHooks>,
            Box::new(FastRng::from_u64(9)),
        );

        Fixture {
            wallet,
            manager,
            factory,
            hooks,
            genesis,
        }
    }

    async fn settle() {
        for _ in 0..128 {
            yield_now().await;
        }
    }

    /// A single-leaf merkle block; `matched` controls whether the tx hash is
    /// reported as a filter match.
    fn make_block(
        prev: BlockHash,
        timestamp: u32,
        leaf: TxId,
        matched: bool,
    ) -> MerkleBlock {
        let mut block = MerkleBlock {
            block_hash: BlockHash::ZERO,
            version: 2,
            prev_block: prev,
            merkle_root: leaf.0,
            timestamp,
            target: 0x207f_ffff,
            nonce: 0,
            total_tx: 1,
            hashes: vec![leaf],
            flags: vec![u8::from(matched)],
            height: BLOCK_UNKNOWN_HEIGHT,
        };
        block.block_hash = block.compute_block_hash();
        block
    }

    /// A chain of simple blocks above `genesis`; block i's leaf is tagged.
    fn make_chain(genesis: &Checkpoint, count: u32) -> Vec<MerkleBlock> {
        let mut blocks = Vec::new();
        let mut prev = genesis.hash;
        for i in 1..=count {
            let block = make_block(
                prev,
                genesis.timestamp + i * 600,
                TxId([0xc0 + i as u8; 32]),
                false,
            );
            prev = block.block_hash;
            blocks.push(block);
        }
        blocks
    }

    /// An unconfirmed "signed" tx paying the wallet's first receive address.
    fn wallet_tx(wallet: &Wallet, id: u8) -> keel_core::tx::Transaction {
        let addr = wallet.receive_address().unwrap();
        let mut tx = Transaction::new();
        tx.add_input(TxIn::new(
            TxId([0xf0 ^ id; 32]),
            0,
            0,
            Vec::new(),
            vec![0x01],
            TXIN_SEQUENCE,
        ));
        tx.add_output(TxOut::to_address(50_000_000, &addr).unwrap());
        tx.txid = TxId([id; 32]);
        tx.block_height = TX_UNCONFIRMED;
        tx.timestamp = 0;
        tx
    }

    #[tokio::test(start_paused = true)]
    async fn connect_syncs_to_peer_tip() {
        let fx = fixture(MockFactory::new(3), 1);
        fx.manager.connect().await;
        settle().await;

        assert!(fx.manager.is_connected());
        assert_eq!(fx.hooks.sync_started.load(Ordering::SeqCst), 1);
        let peer = fx.factory.peer(0);
        assert!(peer.sent_contains(&Sent::GetBlocks));
        assert!(peer.sent_contains(&Sent::FilterLoad));

        for block in make_chain(&fx.genesis, 3) {
            peer.emit(PeerEvent::RelayedBlock(block));
        }
        settle().await;

        assert_eq!(fx.manager.last_block_height(), 3);
        assert_eq!(fx.manager.estimated_block_height(), 3);
        assert!((fx.manager.sync_progress(0) - 1.0).abs() < f64::EPSILON);
        assert!(peer.sent_contains(&Sent::Mempool));
        assert!(peer.sent_contains(&Sent::GetAddr));
        assert_eq!(
            fx.hooks.sync_stopped.lock().unwrap().as_slice(),
            &[None]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn orphan_insertion_is_order_independent() {
        let fx = fixture(MockFactory::new(2), 1);
        fx.manager.connect().await;
        settle().await;

        let chain = make_chain(&fx.genesis, 2);
        let peer = fx.factory.peer(0);
        // child first, then parent
        peer.emit(PeerEvent::RelayedBlock(chain[1].clone()));
        settle().await;
        assert_eq!(fx.manager.last_block_height(), 0);

        peer.emit(PeerEvent::RelayedBlock(chain[0].clone()));
        settle().await;
        assert_eq!(fx.manager.last_block_height(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reorg_marks_wallet_tx_unconfirmed() {
        let fx = fixture(MockFactory::new(4), 1);
        fx.manager.connect().await;
        settle().await;
        let peer = fx.factory.peer(0);

        // the wallet learns of an incoming tx during sync
        let tx = wallet_tx(&fx.wallet, 0x31);
        let tx_hash = tx.txid;
        peer.emit(PeerEvent::RelayedTx(tx));
        settle().await;
        assert!(fx.wallet.transaction_for_hash(tx_hash).is_some());

        // main chain: b1, b2, b3(contains tx), b4
        let b1 = make_block(
            fx.genesis.hash,
            fx.genesis.timestamp + 600,
            TxId([0xd1; 32]),
            false,
        );
        let b2 = make_block(
            b1.block_hash,
            fx.genesis.timestamp + 1200,
            TxId([0xd2; 32]),
            false,
        );
        let b3 =
            make_block(b2.block_hash, fx.genesis.timestamp + 1800, tx_hash, true);
        let b4 = make_block(
            b3.block_hash,
            fx.genesis.timestamp + 2400,
            TxId([0xd4; 32]),
            false,
        );
        for block in [&b1, &b2, &b3, &b4] {
            peer.emit(PeerEvent::RelayedBlock(block.clone()));
        }
        settle().await;

        assert_eq!(fx.manager.last_block_height(), 4);
        let confirmed = fx.wallet.transaction_for_hash(tx_hash).unwrap();
        assert_eq!(confirmed.block_height, 3);

        // a longer fork splits off after b2 and does not contain the tx
        let f3 = make_block(
            b2.block_hash,
            fx.genesis.timestamp + 1900,
            TxId([0xe3; 32]),
            false,
        );
        let f4 = make_block(
            f3.block_hash,
            fx.genesis.timestamp + 2500,
            TxId([0xe4; 32]),
            false,
        );
        let f5 = make_block(
            f4.block_hash,
            fx.genesis.timestamp + 3100,
            TxId([0xe5; 32]),
            false,
        );
        for block in [&f3, &f4, &f5] {
            peer.emit(PeerEvent::RelayedBlock(block.clone()));
        }
        settle().await;

        assert_eq!(fx.manager.last_block_height(), 5);
        let reorged = fx.wallet.transaction_for_hash(tx_hash).unwrap();
        assert_eq!(reorged.block_height, TX_UNCONFIRMED);
        assert!(fx.wallet.transaction_is_valid(&reorged));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_resolves_once_a_peer_relays() {
        let fx = fixture(MockFactory::new(0), 1);
        fx.manager.connect().await;
        settle().await;
        assert!(fx.manager.is_connected());

        let mut tx = wallet_tx(&fx.wallet, 0x42);
        tx.timestamp = 0;
        let tx_hash = tx.txid;
        assert!(fx.wallet.register_transaction(tx.clone()));

        let result = fx.manager.publish_transaction(tx);
        settle().await;

        let peer = fx.factory.peer(0);
        assert!(peer
            .sent()
            .iter()
            .any(|s| matches!(s, Sent::Inv(hashes) if hashes.contains(&tx_hash))));

        peer.emit(PeerEvent::HasTx(tx_hash));
        settle().await;

        assert_eq!(result.await.unwrap(), Ok(()));
        assert_eq!(fx.manager.relay_count(tx_hash), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_times_out_exactly_once() {
        let mut factory = MockFactory::new(0);
        factory.real_timers = true;
        let fx = fixture(factory, 1);
        fx.manager.connect().await;
        settle().await;
        assert!(fx.manager.is_connected());

        let tx = wallet_tx(&fx.wallet, 0x43);
        let tx_hash = tx.txid;
        assert!(fx.wallet.register_transaction(tx.clone()));

        let result = fx.manager.publish_transaction(tx);
        settle().await;

        // nobody ever acknowledges; the publish deadline fires
        tokio::time::sleep(PROTOCOL_TIMEOUT + Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(result.await.unwrap(), Err(Error::TimedOut));
        // the transaction is not removed from the wallet
        assert!(fx.wallet.transaction_for_hash(tx_hash).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unsigned_publish_is_rejected() {
        let fx = fixture(MockFactory::new(0), 1);
        let mut tx = wallet_tx(&fx.wallet, 0x44);
        tx.inputs[0].signature = Vec::new();
        let result = fx.manager.publish_transaction(tx);
        assert_eq!(result.await.unwrap(), Err(Error::InvalidTx));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_while_disconnected_fails_fast() {
        let fx = fixture(MockFactory::new(0), 0);
        // exhaust failures so publish refuses immediately
        fx.manager.disconnect().await;
        let tx = wallet_tx(&fx.wallet, 0x45);
        let result = fx.manager.publish_transaction(tx);
        assert_eq!(result.await.unwrap(), Err(Error::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn high_false_positive_rate_drops_download_peer() {
        let fx = fixture(MockFactory::new(2000), 1);
        fx.manager.connect().await;
        settle().await;
        let peer = fx.factory.peer(0);

        let mut prev = fx.genesis.hash;
        let mut timestamp = fx.genesis.timestamp;
        'outer: for round in 0..20u32 {
            for i in 0..50u32 {
                timestamp += 1;
                // every block delivers one non-wallet (false positive) tx
                let tag = (round * 50 + i) as u16;
                let mut leaf = [0xa0u8; 32];
                leaf[..2].copy_from_slice(&tag.to_le_bytes());
                let block = make_block(prev, timestamp, TxId(leaf), true);
                prev = block.block_hash;
                peer.emit(PeerEvent::RelayedBlock(block));
            }
            settle().await;
            if peer.connect_status() == PeerStatus::Disconnected {
                break 'outer;
            }
        }

        assert_eq!(peer.connect_status(), PeerStatus::Disconnected);
        let fp_rate = fx.manager.false_positive_rate();
        assert!(fp_rate >= BLOOM_REDUCED_FALSEPOSITIVE_RATE);
        assert!(fp_rate < BLOOM_DEFAULT_FALSEPOSITIVE_RATE * 10.0);

        // a replacement session is attempted
        settle().await;
        assert!(fx.factory.created() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn feefilter_raises_wallet_fee_from_second_highest() {
        let fx = fixture(MockFactory::new(0), 3);
        fx.manager.connect().await;
        settle().await;
        assert_eq!(fx.manager.peer_count(), 3);

        fx.factory.peer(0).fee_rate.store(20_000, Ordering::SeqCst);
        fx.factory.peer(1).fee_rate.store(15_000, Ordering::SeqCst);
        fx.factory.peer(2).fee_rate.store(1_000, Ordering::SeqCst);

        let before = fx.wallet.fee_per_kb();
        fx.factory.peer(0).emit(PeerEvent::FeeFilter(20_000));
        settle().await;

        assert!(before < 22_500);
        assert_eq!(fx.wallet.fee_per_kb(), 15_000 * 3 / 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unrelayed_tx_is_garbage_collected() {
        // a single-peer pool so a full set of peers is one notfound away
        let now = unix_time();
        let genesis = genesis_checkpoint(now);
        let mpk = MasterPubKey::from_seed(SEED).unwrap();
        let wallet = Wallet::new(
            mpk,
            Vec::new(),
            Arc::new(()),
            Box::new(FastRng::from_u64(3)),
        )
        .unwrap();

        let mut factory = MockFactory::new(0);
        factory.notfound_on_getdata = true;
        let factory = Arc::new(factory);
        let mut config =
            PeerManagerConfig::new(ChainParams::test(genesis), now - 12 * 60 * 60);
        config.max_connections = 1;

        let manager = PeerManager::start(
            Arc::clone(&wallet),
            config,
            Vec::new(),
            vec![saved_peer(1, now)],
            Arc::clone(&factory),
            Arc::new(()),
            Box::new(FastRng::from_u64(9)),
        );

        let tx = wallet_tx(&wallet, 0x66);
        let tx_hash = tx.txid;
        assert!(wallet.register_transaction(tx));

        manager.connect().await;
        settle().await;
        settle().await;

        // the peer answered notfound and finished its mempool; the tx has
        // evidently dropped off the network
        assert!(wallet.transaction_for_hash(tx_hash).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoint_mismatch_evicts_peer() {
        let now = unix_time();
        let genesis = genesis_checkpoint(now);
        let mut params = ChainParams::test(genesis.clone());
        // pin height 1 to a block the peer will not deliver
        params.checkpoints.push(Checkpoint {
            height: 1,
            hash: BlockHash([0x77; 32]),
            timestamp: genesis.timestamp + 600,
            target: 0x207f_ffff,
        });

        let mpk = MasterPubKey::from_seed(SEED).unwrap();
        let wallet = Wallet::new(
            mpk,
            Vec::new(),
            Arc::new(()),
            Box::new(FastRng::from_u64(3)),
        )
        .unwrap();
        let factory = Arc::new(MockFactory::new(2));
        let hooks = Arc::new(HookRecorder::default());
        let manager = PeerManager::start(
            Arc::clone(&wallet),
            PeerManagerConfig::new(params, now - 12 * 60 * 60),
            Vec::new(),
            vec![saved_peer(1, now)],
            Arc::clone(&factory),
            Arc::clone(&hooks) as Arc<dyn NodeHooks>,
            Box::new(FastRng::from_u64(9)),
        );

        manager.connect().await;
        settle().await;
        let peer = factory.peer(0);

        let bad = make_block(
            genesis.hash,
            genesis.timestamp + 600,
            TxId([0xbb; 32]),
            false,
        );
        peer.emit(PeerEvent::RelayedBlock(bad));
        settle().await;

        assert_eq!(peer.connect_status(), PeerStatus::Disconnected);
        assert_eq!(manager.last_block_height(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_waits_for_sessions_and_suppresses_reconnect() {
        let fx = fixture(MockFactory::new(0), 1);
        fx.manager.connect().await;
        settle().await;
        assert!(fx.manager.is_connected());

        fx.manager.disconnect().await;
        assert_eq!(fx.manager.peer_count(), 0);
        assert!(!fx.manager.is_connected());

        settle().await;
        // no automatic reconnect after an explicit disconnect
        assert_eq!(fx.factory.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relayed_peers_are_cached_and_saved() {
        let fx = fixture(MockFactory::new(0), 1);
        fx.manager.connect().await;
        settle().await;

        let now = unix_time();
        let peers: Vec<PeerInfo> =
            (2..12).map(|i| saved_peer(i, now)).collect();
        fx.factory.peer(0).emit(PeerEvent::RelayedPeers(peers));
        settle().await;

        assert!(fx.hooks.saved_peer_batches.load(Ordering::SeqCst) >= 1);
    }
}
