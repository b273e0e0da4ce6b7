use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use keel_core::{
    address::Address,
    constants::{
        DEFAULT_FEE_PER_KB, GAP_LIMIT_EXTERNAL, GAP_LIMIT_INTERNAL,
        MIN_FEE_PER_KB, TXIN_SEQUENCE, TX_INPUT_SIZE, TX_MAX_LOCK_HEIGHT,
        TX_MAX_SIZE, TX_MIN_OUTPUT_AMOUNT, TX_OUTPUT_SIZE, TX_UNCONFIRMED,
    },
    hashes::TxId,
    keys::{derive_signing_keys, KeyError, MasterPubKey, CHAIN_EXTERNAL, CHAIN_INTERNAL},
    rng::RngCore,
    script::{OP_CHECKSIG, OP_DUP, OP_EQUALVERIFY, OP_HASH160},
    tx::{Transaction, TxIn, TxOut},
    varint,
};
use thiserror::Error;
use tracing::warn;

use crate::events::{self, Notice, WalletDelegate};

/// Default bound on retained non-wallet unconfirmed transactions.
const DEFAULT_UNCONFIRMED_CACHE_LIMIT: usize = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WalletError {
    #[error("invalid address")]
    InvalidAddress,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("transaction has no outputs")]
    NoOutputs,
    #[error("transaction could not be fully signed")]
    SigningFailed,
    #[error("restored transactions do not match the master public key")]
    WrongMasterPubKey,
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// An unspent transaction output reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Utxo {
    pub tx_hash: TxId,
    pub index: u32,
}

impl Utxo {
    pub fn new(tx_hash: TxId, index: u32) -> Self {
        Self { tx_hash, index }
    }
}

struct WalletState {
    fee_per_kb: u64,
    /// Best chain height the wallet has been told about.
    block_height: u32,
    balance: u64,
    total_sent: u64,
    total_received: u64,
    /// Unspent outputs, in wallet (sorted tx) order.
    utxos: Vec<Utxo>,
    /// Registered wallet transactions, topologically and temporally sorted.
    transactions: Vec<TxId>,
    /// `balance_hist[i]` is the balance immediately after `transactions[i]`.
    balance_hist: Vec<u64>,
    internal_chain: Vec<Address>,
    external_chain: Vec<Address>,
    /// Every known transaction: the wallet's own, plus retained non-wallet
    /// unconfirmed ones used for double-spend and dependency checks.
    all_tx: HashMap<TxId, Arc<Transaction>>,
    invalid_tx: HashSet<TxId>,
    pending_tx: HashSet<TxId>,
    spent_outputs: HashSet<Utxo>,
    used_addrs: HashSet<Address>,
    all_addrs: HashSet<Address>,
    /// Insertion order of retained non-wallet transactions, oldest first.
    unconfirmed_cache: VecDeque<TxId>,
    unconfirmed_cache_limit: usize,
    rng: Box<dyn RngCore + Send>,
}

/// The wallet state engine.
///
/// Every public operation takes a single internal lock, mutates, and
/// delivers host notifications after release, so a host sees each operation
/// as one consistent state transition.
pub struct Wallet {
    /// Immutable; readable without the lock.
    master_pub_key: MasterPubKey,
    state: Mutex<WalletState>,
    delegate: Arc<dyn WalletDelegate>,
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The fee rule: the larger of the per-kb standard fee and the wallet's
/// fee rate, the latter rounded up to the nearest 100 satoshi.
fn tx_fee(fee_per_kb: u64, size: usize) -> u64 {
    let standard = (size as u64).div_ceil(1000) * keel_core::constants::TX_FEE_PER_KB;
    let fee = (size as u64 * fee_per_kb / 1000).div_ceil(100) * 100;
    fee.max(standard)
}

impl Wallet {
    /// Builds a wallet around a master public key, restoring previously
    /// registered transactions.
    ///
    /// Fails with [`WalletError::WrongMasterPubKey`] when the restored
    /// transactions evidently belong to a different wallet.
    pub fn new(
        master_pub_key: MasterPubKey,
        transactions: Vec<Transaction>,
        delegate: Arc<dyn WalletDelegate>,
        rng: Box<dyn RngCore + Send>,
    ) -> Result<Arc<Self>, WalletError> {
        let mut state = WalletState {
            fee_per_kb: DEFAULT_FEE_PER_KB,
            block_height: 0,
            balance: 0,
            total_sent: 0,
            total_received: 0,
            utxos: Vec::new(),
            transactions: Vec::new(),
            balance_hist: Vec::new(),
            internal_chain: Vec::new(),
            external_chain: Vec::new(),
            all_tx: HashMap::new(),
            invalid_tx: HashSet::new(),
            pending_tx: HashSet::new(),
            spent_outputs: HashSet::new(),
            used_addrs: HashSet::new(),
            all_addrs: HashSet::new(),
            unconfirmed_cache: VecDeque::new(),
            unconfirmed_cache_limit: DEFAULT_UNCONFIRMED_CACHE_LIMIT,
            rng,
        };

        let first_txid = transactions.first().map(|tx| tx.txid);
        for tx in transactions {
            if !tx.is_signed() || state.all_tx.contains_key(&tx.txid) {
                continue;
            }
            let txid = tx.txid;
            state.all_tx.insert(txid, Arc::new(tx));
            Self::insert_sorted(&mut state, txid);
            let arc = Arc::clone(&state.all_tx[&txid]);
            for output in &arc.outputs {
                if let Some(addr) = &output.address {
                    state.used_addrs.insert(addr.clone());
                }
            }
        }

        Self::ensure_addrs(&mut state, &master_pub_key, GAP_LIMIT_EXTERNAL, false);
        Self::ensure_addrs(&mut state, &master_pub_key, GAP_LIMIT_INTERNAL, true);
        Self::update_balance(&mut state);

        // restored transactions must match the master pubkey
        if let Some(txid) = first_txid {
            let matches = state
                .all_tx
                .get(&txid)
                .is_some_and(|tx| Self::contains_tx(&state, tx));
            if !matches {
                return Err(WalletError::WrongMasterPubKey);
            }
        }

        Ok(Arc::new(Self {
            master_pub_key,
            state: Mutex::new(state),
            delegate,
        }))
    }

    pub fn master_pub_key(&self) -> &MasterPubKey {
        &self.master_pub_key
    }

    // --- simple accessors --- //

    pub fn balance(&self) -> u64 {
        self.state.lock().unwrap().balance
    }

    pub fn total_sent(&self) -> u64 {
        self.state.lock().unwrap().total_sent
    }

    pub fn total_received(&self) -> u64 {
        self.state.lock().unwrap().total_received
    }

    pub fn fee_per_kb(&self) -> u64 {
        self.state.lock().unwrap().fee_per_kb
    }

    pub fn set_fee_per_kb(&self, fee_per_kb: u64) {
        self.state.lock().unwrap().fee_per_kb = fee_per_kb;
    }

    /// The host-facing chain height the wallet classifies against.
    pub fn block_height(&self) -> u32 {
        self.state.lock().unwrap().block_height
    }

    pub fn utxos(&self) -> Vec<Utxo> {
        self.state.lock().unwrap().utxos.clone()
    }

    /// Registered wallet transactions, oldest first.
    pub fn transactions(&self) -> Vec<Arc<Transaction>> {
        let state = self.state.lock().unwrap();
        state
            .transactions
            .iter()
            .map(|txid| Arc::clone(&state.all_tx[txid]))
            .collect()
    }

    /// Wallet transactions that were *not* confirmed before `block_height`,
    /// oldest first.
    pub fn tx_unconfirmed_before(
        &self,
        block_height: u32,
    ) -> Vec<Arc<Transaction>> {
        let state = self.state.lock().unwrap();
        let mut n = 0;
        let total = state.transactions.len();
        while n < total {
            let txid = &state.transactions[total - n - 1];
            if state.all_tx[txid].block_height < block_height {
                break;
            }
            n += 1;
        }
        state.transactions[total - n..]
            .iter()
            .map(|txid| Arc::clone(&state.all_tx[txid]))
            .collect()
    }

    pub fn transaction_for_hash(&self, tx_hash: TxId) -> Option<Arc<Transaction>> {
        self.state.lock().unwrap().all_tx.get(&tx_hash).cloned()
    }

    // --- addresses --- //

    /// Extends the external or internal chain until `gap_limit` contiguous
    /// unused addresses follow the last used one, and returns them. Newly
    /// derived addresses become part of the watched set.
    pub fn unused_addrs(&self, gap_limit: u32, internal: bool) -> Vec<Address> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_addrs(&mut state, &self.master_pub_key, gap_limit, internal)
    }

    /// The first unused receive address.
    pub fn receive_address(&self) -> Option<Address> {
        self.unused_addrs(1, false).into_iter().next()
    }

    /// The first unused change address.
    pub fn change_address(&self) -> Option<Address> {
        self.unused_addrs(1, true).into_iter().next()
    }

    /// All generated addresses, internal chain first.
    pub fn all_addrs(&self) -> Vec<Address> {
        let state = self.state.lock().unwrap();
        state
            .internal_chain
            .iter()
            .chain(state.external_chain.iter())
            .cloned()
            .collect()
    }

    /// True if the address was generated by this wallet (used or not).
    pub fn contains_address(&self, addr: &Address) -> bool {
        self.state.lock().unwrap().all_addrs.contains(addr)
    }

    /// True if the address has appeared as an output of any known tx.
    pub fn address_is_used(&self, addr: &Address) -> bool {
        self.state.lock().unwrap().used_addrs.contains(addr)
    }

    // --- transaction creation and signing --- //

    /// An unsigned transaction sending `amount` to `addr`, funded from the
    /// wallet's UTXOs in wallet order, with change returned to a fresh
    /// internal address.
    pub fn create_transaction(
        &self,
        amount: u64,
        addr: &Address,
    ) -> Result<Transaction, WalletError> {
        let output = TxOut::to_address(amount, addr)
            .ok_or(WalletError::InvalidAddress)?;
        self.create_tx_for_outputs(&[output])
    }

    /// As [`Wallet::create_transaction`], with an additional operations-fee
    /// output prepended.
    pub fn create_ops_transaction(
        &self,
        amount: u64,
        addr: &Address,
        ops_fee: u64,
        ops_addr: &Address,
    ) -> Result<Transaction, WalletError> {
        let ops_output = TxOut::to_address(ops_fee, ops_addr)
            .ok_or(WalletError::InvalidAddress)?;
        let main_output = TxOut::to_address(amount, addr)
            .ok_or(WalletError::InvalidAddress)?;
        self.create_tx_for_outputs(&[ops_output, main_output])
    }

    /// An unsigned transaction satisfying `outputs`.
    pub fn create_tx_for_outputs(
        &self,
        outputs: &[TxOut],
    ) -> Result<Transaction, WalletError> {
        let mut state = self.state.lock().unwrap();
        Self::create_inner(&mut state, &self.master_pub_key, outputs)
    }

    /// Signs any inputs whose prior output lies on one of the wallet's
    /// address chains, deriving the keys from `seed` and erasing them after.
    pub fn sign_transaction(
        &self,
        tx: &mut Transaction,
        fork_id: u32,
        seed: &[u8],
    ) -> Result<(), WalletError> {
        let (internal_idx, external_idx) = {
            let state = self.state.lock().unwrap();
            let mut internal_idx = Vec::new();
            let mut external_idx = Vec::new();
            for input in &tx.inputs {
                let Some(addr) = &input.address else { continue };
                if let Some(i) =
                    state.internal_chain.iter().position(|a| a == addr)
                {
                    internal_idx.push(i as u32);
                }
                if let Some(i) =
                    state.external_chain.iter().position(|a| a == addr)
                {
                    external_idx.push(i as u32);
                }
            }
            (internal_idx, external_idx)
        };

        let mut keys =
            derive_signing_keys(seed, CHAIN_INTERNAL, &internal_idx)?;
        keys.extend(derive_signing_keys(
            seed,
            CHAIN_EXTERNAL,
            &external_idx,
        )?);

        let signed = tx.sign(fork_id, &keys);
        for key in &mut keys {
            key.erase();
        }
        if signed {
            Ok(())
        } else {
            Err(WalletError::SigningFailed)
        }
    }

    // --- registration and lifecycle --- //

    /// True if the transaction touches the wallet: pays one of its addresses
    /// or spends one of its outputs.
    pub fn contains_transaction(&self, tx: &Transaction) -> bool {
        let state = self.state.lock().unwrap();
        Self::contains_tx(&state, tx)
    }

    /// Registers a signed transaction.
    ///
    /// Returns true if the tx belongs to the wallet (or already did). A
    /// non-wallet unconfirmed tx returns false but is retained for later
    /// double-spend detection; a non-wallet confirmed tx is dropped.
    pub fn register_transaction(&self, tx: Transaction) -> bool {
        if !tx.is_signed() || tx.inputs.is_empty() {
            return false;
        }

        let mut notices = Vec::new();
        let r;
        {
            let mut state = self.state.lock().unwrap();
            let txid = tx.txid;

            if state.all_tx.contains_key(&txid) {
                r = true;
            } else if Self::contains_tx(&state, &tx) {
                let arc = Arc::new(tx);
                state.all_tx.insert(txid, Arc::clone(&arc));
                Self::insert_sorted(&mut state, txid);
                Self::update_balance(&mut state);

                // a used address is never reused: top the chains back up
                Self::ensure_addrs(
                    &mut state,
                    &self.master_pub_key,
                    GAP_LIMIT_EXTERNAL,
                    false,
                );
                Self::ensure_addrs(
                    &mut state,
                    &self.master_pub_key,
                    GAP_LIMIT_INTERNAL,
                    true,
                );

                notices.push(Notice::BalanceChanged(state.balance));
                notices.push(Notice::TxAdded(arc));
                r = true;
            } else if tx.block_height == TX_UNCONFIRMED {
                Self::cache_unconfirmed(&mut state, tx);
                r = false;
            } else {
                r = false;
            }
        }

        events::deliver(&*self.delegate, notices);
        r
    }

    /// Removes a transaction along with every transaction spending its
    /// outputs. The deletion set is computed up front so the lock is taken
    /// once, not re-entered per dependent.
    pub fn remove_transaction(&self, tx_hash: TxId) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if !state.all_tx.contains_key(&tx_hash) {
                return;
            }

            // transitive closure of dependents
            let mut closure: HashSet<TxId> = HashSet::from([tx_hash]);
            let mut changed = true;
            while changed {
                changed = false;
                for txid in state.transactions.clone() {
                    if closure.contains(&txid) {
                        continue;
                    }
                    let tx = &state.all_tx[&txid];
                    if tx
                        .inputs
                        .iter()
                        .any(|input| closure.contains(&input.prev_hash))
                    {
                        closure.insert(txid);
                        changed = true;
                    }
                }
            }

            // dependents first (they sort after what they spend)
            let mut order: Vec<TxId> = state
                .transactions
                .iter()
                .filter(|txid| closure.contains(txid))
                .copied()
                .collect();
            if order.is_empty() {
                // a retained non-wallet tx
                order.push(tx_hash);
            }
            order.reverse();

            for txid in order {
                let tx = Arc::clone(&state.all_tx[&txid]);
                let was_send = Self::amount_sent(&state, &tx) > 0;
                let was_valid = !state.invalid_tx.contains(&txid);
                let notify_user = was_send && was_valid;
                let recommend_rescan = notify_user
                    && tx.inputs.iter().all(|input| {
                        state
                            .all_tx
                            .get(&input.prev_hash)
                            .is_some_and(|t| t.block_height != TX_UNCONFIRMED)
                    });

                state.all_tx.remove(&txid);
                state.transactions.retain(|id| *id != txid);
                state.unconfirmed_cache.retain(|id| *id != txid);
                notices.push(Notice::TxDeleted {
                    tx_hash: txid,
                    notify_user,
                    recommend_rescan,
                });
            }

            Self::update_balance(&mut state);
            notices.insert(0, Notice::BalanceChanged(state.balance));
        }

        events::deliver(&*self.delegate, notices);
    }

    /// Sets block height and timestamp for the given transactions,
    /// reinserting them to keep the wallet sorted. Confirmed non-wallet
    /// transactions expire out of the cache here.
    pub fn update_transactions(
        &self,
        tx_hashes: &[TxId],
        block_height: u32,
        timestamp: u32,
    ) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if block_height != TX_UNCONFIRMED
                && block_height > state.block_height
            {
                state.block_height = block_height;
            }

            let mut updated = Vec::new();
            let mut needs_update = false;

            for tx_hash in tx_hashes {
                let Some(arc) = state.all_tx.get(tx_hash) else { continue };
                if arc.block_height == block_height
                    && arc.timestamp == timestamp
                {
                    continue;
                }

                let mut tx = (**arc).clone();
                tx.block_height = block_height;
                tx.timestamp = timestamp;
                state.all_tx.insert(*tx_hash, Arc::new(tx));

                if let Some(pos) =
                    state.transactions.iter().position(|id| id == tx_hash)
                {
                    state.transactions.remove(pos);
                    Self::insert_sorted(&mut state, *tx_hash);
                    updated.push(*tx_hash);
                    if state.pending_tx.contains(tx_hash)
                        || state.invalid_tx.contains(tx_hash)
                    {
                        needs_update = true;
                    }
                } else if block_height != TX_UNCONFIRMED {
                    // confirmed non-wallet tx: nothing left to learn from it
                    state.all_tx.remove(tx_hash);
                    state.unconfirmed_cache.retain(|id| id != tx_hash);
                }
            }

            if needs_update {
                Self::update_balance(&mut state);
                notices.push(Notice::BalanceChanged(state.balance));
            }
            if !updated.is_empty() {
                notices.push(Notice::TxUpdated {
                    tx_hashes: updated,
                    block_height,
                    timestamp,
                });
            }
        }

        events::deliver(&*self.delegate, notices);
    }

    /// Marks every transaction above `block_height` unconfirmed, for reorgs.
    pub fn set_tx_unconfirmed_after(&self, block_height: u32) {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.block_height = block_height;

            let affected: Vec<TxId> = state
                .transactions
                .iter()
                .rev()
                .take_while(|txid| {
                    state.all_tx[*txid].block_height > block_height
                })
                .copied()
                .collect();

            // heights reset; timestamps stay so 0-conf verification holds
            for txid in &affected {
                let arc = &state.all_tx[txid];
                let mut tx = (**arc).clone();
                tx.block_height = TX_UNCONFIRMED;
                state.all_tx.insert(*txid, Arc::new(tx));
            }

            if !affected.is_empty() {
                Self::update_balance(&mut state);
                notices.push(Notice::BalanceChanged(state.balance));
                notices.push(Notice::TxUpdated {
                    tx_hashes: affected,
                    block_height: TX_UNCONFIRMED,
                    timestamp: 0,
                });
            }
        }

        events::deliver(&*self.delegate, notices);
    }

    // --- classification queries --- //

    /// True if no earlier wallet transaction spends any of `tx`'s inputs and
    /// no input derives from an invalid transaction.
    pub fn transaction_is_valid(&self, tx: &Transaction) -> bool {
        let state = self.state.lock().unwrap();
        Self::is_valid_inner(&state, tx, 0)
    }

    /// True if `tx` cannot be immediately mined: oversized, dusty,
    /// replaceable, time-locked into the future, or built on such a tx.
    pub fn transaction_is_pending(&self, tx: &Transaction) -> bool {
        let state = self.state.lock().unwrap();
        Self::is_pending_inner(&state, tx, unix_time(), 0)
    }

    /// True if `tx` is considered 0-conf safe.
    pub fn transaction_is_verified(&self, tx: &Transaction) -> bool {
        let state = self.state.lock().unwrap();
        Self::is_verified_inner(&state, tx, unix_time(), 0)
    }

    // --- amounts --- //

    /// Total outputs paying to wallet addresses.
    pub fn amount_received_from_tx(&self, tx: &Transaction) -> u64 {
        let state = self.state.lock().unwrap();
        tx.outputs
            .iter()
            .filter(|output| {
                output
                    .address
                    .as_ref()
                    .is_some_and(|addr| state.all_addrs.contains(addr))
            })
            .map(|output| output.amount)
            .sum()
    }

    /// Total wallet outputs consumed by `tx` (change and fee included).
    pub fn amount_sent_by_tx(&self, tx: &Transaction) -> u64 {
        let state = self.state.lock().unwrap();
        Self::amount_sent(&state, tx)
    }

    /// The transaction's fee, or `None` when any input is unknown.
    pub fn fee_for_tx(&self, tx: &Transaction) -> Option<u64> {
        let state = self.state.lock().unwrap();
        let mut amount: u64 = 0;
        for input in &tx.inputs {
            let prev = state.all_tx.get(&input.prev_hash)?;
            let output = prev.outputs.get(input.prev_index as usize)?;
            amount += output.amount;
        }
        Some(amount - tx.outputs.iter().map(|o| o.amount).sum::<u64>())
    }

    /// The wallet balance immediately after `tx`, or the current balance if
    /// `tx` is not registered.
    pub fn balance_after_tx(&self, tx: &Transaction) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .transactions
            .iter()
            .position(|txid| *txid == tx.txid)
            .map(|i| state.balance_hist[i])
            .unwrap_or(state.balance)
    }

    // --- fees --- //

    pub fn fee_for_tx_size(&self, size: usize) -> u64 {
        let state = self.state.lock().unwrap();
        tx_fee(state.fee_per_kb, size)
    }

    /// The fee the wallet would attach to a transaction sending `amount`.
    pub fn fee_for_tx_amount(&self, amount: u64) -> u64 {
        // an unspendable stand-in scriptPubKey of standard P2PKH size
        let mut dummy_script = vec![OP_DUP, OP_HASH160, 20];
        dummy_script.extend_from_slice(&[0u8; 20]);
        dummy_script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);

        let capped = amount.min(self.max_output_amount().max(1));
        let output = TxOut::new(capped, dummy_script);

        match self.create_tx_for_outputs(&[output]) {
            Ok(tx) => self.fee_for_tx(&tx).unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Outputs below this amount are uneconomical to spend.
    pub fn min_output_amount(&self) -> u64 {
        let state = self.state.lock().unwrap();
        Self::min_output_amount_inner(&state)
    }

    /// The maximum single-output amount spendable after fees.
    pub fn max_output_amount(&self) -> u64 {
        let state = self.state.lock().unwrap();
        let mut amount: u64 = 0;
        let mut in_count = 0usize;
        for utxo in &state.utxos {
            let Some(tx) = state.all_tx.get(&utxo.tx_hash) else { continue };
            let Some(output) = tx.outputs.get(utxo.index as usize) else {
                continue;
            };
            in_count += 1;
            amount += output.amount;
        }

        let tx_size = 8
            + varint::size(in_count as u64)
            + TX_INPUT_SIZE * in_count
            + varint::size(2)
            + TX_OUTPUT_SIZE * 2;
        let fee = tx_fee(state.fee_per_kb, tx_size);
        amount.saturating_sub(fee)
    }

    /// Caps the retained non-wallet unconfirmed transaction cache.
    pub fn set_unconfirmed_cache_limit(&self, limit: usize) {
        let mut state = self.state.lock().unwrap();
        state.unconfirmed_cache_limit = limit.max(1);
        while state.unconfirmed_cache.len() > state.unconfirmed_cache_limit {
            if let Some(evicted) = state.unconfirmed_cache.pop_front() {
                state.all_tx.remove(&evicted);
            }
        }
    }

    // --- internals (state helpers, called with the lock held) --- //

    fn chain(state: &WalletState, internal: bool) -> &Vec<Address> {
        if internal {
            &state.internal_chain
        } else {
            &state.external_chain
        }
    }

    /// Extends a chain until `gap_limit` unused addresses trail the last
    /// used one; returns that window.
    fn ensure_addrs(
        state: &mut WalletState,
        mpk: &MasterPubKey,
        gap_limit: u32,
        internal: bool,
    ) -> Vec<Address> {
        let gap_limit = gap_limit.max(1) as usize;
        let chain_number = if internal { CHAIN_INTERNAL } else { CHAIN_EXTERNAL };

        // trailing run of unused addresses
        let mut first_unused = Self::chain(state, internal).len();
        while first_unused > 0 {
            let addr = &Self::chain(state, internal)[first_unused - 1];
            if state.used_addrs.contains(addr) {
                break;
            }
            first_unused -= 1;
        }

        let mut count = Self::chain(state, internal).len();
        while first_unused + gap_limit > count {
            let addr = match mpk.derive_address(chain_number, count as u32) {
                Ok(addr) => addr,
                Err(err) => {
                    warn!("address derivation failed at {count}: {err}");
                    break;
                }
            };
            let used = state.used_addrs.contains(&addr);
            state.all_addrs.insert(addr.clone());
            if internal {
                state.internal_chain.push(addr);
            } else {
                state.external_chain.push(addr);
            }
            count += 1;
            if used {
                first_unused = count;
            }
        }

        let chain = Self::chain(state, internal);
        if first_unused + gap_limit <= chain.len() {
            chain[first_unused..first_unused + gap_limit].to_vec()
        } else {
            Vec::new()
        }
    }

    fn contains_tx(state: &WalletState, tx: &Transaction) -> bool {
        let receives = tx.outputs.iter().any(|output| {
            output
                .address
                .as_ref()
                .is_some_and(|addr| state.all_addrs.contains(addr))
        });
        if receives {
            return true;
        }

        tx.inputs.iter().any(|input| {
            state
                .all_tx
                .get(&input.prev_hash)
                .and_then(|prev| prev.outputs.get(input.prev_index as usize))
                .and_then(|output| output.address.as_ref())
                .is_some_and(|addr| state.all_addrs.contains(addr))
        })
    }

    fn amount_sent(state: &WalletState, tx: &Transaction) -> u64 {
        tx.inputs
            .iter()
            .filter_map(|input| {
                let prev = state.all_tx.get(&input.prev_hash)?;
                let output = prev.outputs.get(input.prev_index as usize)?;
                let addr = output.address.as_ref()?;
                state.all_addrs.contains(addr).then_some(output.amount)
            })
            .sum()
    }

    fn min_output_amount_inner(state: &WalletState) -> u64 {
        let amount = (TX_MIN_OUTPUT_AMOUNT * state.fee_per_kb)
            .div_ceil(MIN_FEE_PER_KB);
        amount.max(TX_MIN_OUTPUT_AMOUNT)
    }

    /// True when `tx1` must sort after `tx2`: a higher block height, or
    /// `tx1` spends (possibly transitively) from `tx2`.
    fn tx_is_ascending(
        all_tx: &HashMap<TxId, Arc<Transaction>>,
        tx1: &Transaction,
        tx2: &Transaction,
        depth: usize,
    ) -> bool {
        if depth > 64 {
            return false; // dependency chains never legitimately run this deep
        }
        if tx1.block_height > tx2.block_height {
            return true;
        }
        if tx1.block_height < tx2.block_height {
            return false;
        }
        if tx1.inputs.iter().any(|i| i.prev_hash == tx2.txid) {
            return true;
        }
        if tx2.inputs.iter().any(|i| i.prev_hash == tx1.txid) {
            return false;
        }
        tx1.inputs.iter().any(|i| {
            all_tx
                .get(&i.prev_hash)
                .is_some_and(|t| Self::tx_is_ascending(all_tx, t, tx2, depth + 1))
        })
    }

    /// Position of the highest chain address appearing in `tx`'s outputs.
    fn chain_index(tx: &Transaction, chain: &[Address]) -> Option<usize> {
        for i in (0..chain.len()).rev() {
            if tx
                .outputs
                .iter()
                .any(|o| o.address.as_ref() == Some(&chain[i]))
            {
                return Some(i);
            }
        }
        None
    }

    /// > 0 when `tx1` sorts after `tx2`.
    fn tx_compare(
        state: &WalletState,
        tx1: &Transaction,
        tx2: &Transaction,
    ) -> i32 {
        if Self::tx_is_ascending(&state.all_tx, tx1, tx2, 0) {
            return 1;
        }
        if Self::tx_is_ascending(&state.all_tx, tx2, tx1, 0) {
            return -1;
        }

        let mut i = Self::chain_index(tx1, &state.internal_chain);
        let j = Self::chain_index(
            tx2,
            if i.is_none() {
                &state.external_chain
            } else {
                &state.internal_chain
            },
        );
        if i.is_none() && j.is_some() {
            i = Self::chain_index(tx1, &state.external_chain);
        }
        match (i, j) {
            (Some(i), Some(j)) if i != j =>
                if i > j {
                    1
                } else {
                    -1
                },
            _ => 0,
        }
    }

    /// Insertion sort step keeping `transactions` ascending.
    fn insert_sorted(state: &mut WalletState, txid: TxId) {
        let tx = Arc::clone(&state.all_tx[&txid]);
        let mut i = state.transactions.len();
        while i > 0 {
            let prev = Arc::clone(&state.all_tx[&state.transactions[i - 1]]);
            if Self::tx_compare(state, &prev, &tx) > 0 {
                i -= 1;
            } else {
                break;
            }
        }
        state.transactions.insert(i, txid);
    }

    fn cache_unconfirmed(state: &mut WalletState, tx: Transaction) {
        let txid = tx.txid;
        state.all_tx.insert(txid, Arc::new(tx));
        state.unconfirmed_cache.push_back(txid);
        while state.unconfirmed_cache.len() > state.unconfirmed_cache_limit {
            if let Some(evicted) = state.unconfirmed_cache.pop_front() {
                state.all_tx.remove(&evicted);
            }
        }
    }

    /// The single linear pass that rebuilds classification, the UTXO set,
    /// totals, and the balance history from the sorted transaction list.
    fn update_balance(state: &mut WalletState) {
        let now = unix_time();
        state.utxos.clear();
        state.balance_hist.clear();
        state.spent_outputs.clear();
        state.invalid_tx.clear();
        state.pending_tx.clear();
        state.used_addrs.clear();
        state.total_sent = 0;
        state.total_received = 0;

        let mut balance: u64 = 0;
        let mut prev_balance: u64 = 0;
        let order = state.transactions.clone();

        for txid in order {
            let tx = Arc::clone(&state.all_tx[&txid]);

            // a tx that spends an already-spent output, or builds on an
            // invalid tx, is invalid and contributes nothing
            if tx.block_height == TX_UNCONFIRMED {
                let invalid = tx.inputs.iter().any(|input| {
                    state.spent_outputs.contains(&Utxo::new(
                        input.prev_hash,
                        input.prev_index,
                    )) || state.invalid_tx.contains(&input.prev_hash)
                });
                if invalid {
                    state.invalid_tx.insert(txid);
                    state.balance_hist.push(balance);
                    continue;
                }
            }

            for input in &tx.inputs {
                state
                    .spent_outputs
                    .insert(Utxo::new(input.prev_hash, input.prev_index));
            }

            if tx.block_height == TX_UNCONFIRMED {
                let mut pending = tx.size() > TX_MAX_SIZE;
                for output in &tx.outputs {
                    if output.amount < TX_MIN_OUTPUT_AMOUNT {
                        pending = true; // dust output
                    }
                }
                for input in &tx.inputs {
                    if input.sequence < u32::MAX - 1 {
                        pending = true; // replace-by-fee
                    }
                    if input.sequence < u32::MAX
                        && tx.lock_time < TX_MAX_LOCK_HEIGHT
                        && tx.lock_time > state.block_height + 1
                    {
                        pending = true; // future lockTime (height)
                    }
                    if input.sequence < u32::MAX && tx.lock_time as u64 > now {
                        pending = true; // future lockTime (timestamp)
                    }
                    if state.pending_tx.contains(&input.prev_hash) {
                        pending = true; // pending ancestor
                    }
                }
                if pending {
                    state.pending_tx.insert(txid);
                    state.balance_hist.push(balance);
                    continue;
                }
            }

            for (n, output) in tx.outputs.iter().enumerate() {
                if let Some(addr) = &output.address {
                    state.used_addrs.insert(addr.clone());
                    if state.all_addrs.contains(addr) {
                        state.utxos.push(Utxo::new(txid, n as u32));
                        balance += output.amount;
                    }
                }
            }

            // ordering is not guaranteed; sweep the whole UTXO set against
            // the spent set
            let mut j = state.utxos.len();
            while j > 0 {
                j -= 1;
                let utxo = state.utxos[j];
                if state.spent_outputs.contains(&utxo) {
                    let prev = &state.all_tx[&utxo.tx_hash];
                    balance -= prev.outputs[utxo.index as usize].amount;
                    state.utxos.remove(j);
                }
            }

            if prev_balance < balance {
                state.total_received += balance - prev_balance;
            }
            if balance < prev_balance {
                state.total_sent += prev_balance - balance;
            }
            state.balance_hist.push(balance);
            prev_balance = balance;
        }

        debug_assert_eq!(state.balance_hist.len(), state.transactions.len());
        state.balance = balance;
    }

    fn is_valid_inner(
        state: &WalletState,
        tx: &Transaction,
        depth: usize,
    ) -> bool {
        if depth > 64 || tx.block_height != TX_UNCONFIRMED {
            return true;
        }

        if state.all_tx.contains_key(&tx.txid) {
            if state.invalid_tx.contains(&tx.txid) {
                return false;
            }
        } else if tx.inputs.iter().any(|input| {
            state
                .spent_outputs
                .contains(&Utxo::new(input.prev_hash, input.prev_index))
        }) {
            return false;
        }

        tx.inputs.iter().all(|input| {
            state
                .all_tx
                .get(&input.prev_hash)
                .map_or(true, |prev| Self::is_valid_inner(state, prev, depth + 1))
        })
    }

    fn is_pending_inner(
        state: &WalletState,
        tx: &Transaction,
        now: u64,
        depth: usize,
    ) -> bool {
        if depth > 64 || tx.block_height != TX_UNCONFIRMED {
            return false;
        }

        if tx.size() > TX_MAX_SIZE {
            return true;
        }
        for input in &tx.inputs {
            if input.sequence < u32::MAX - 1 {
                return true;
            }
            if input.sequence < u32::MAX
                && tx.lock_time < TX_MAX_LOCK_HEIGHT
                && tx.lock_time > state.block_height + 1
            {
                return true;
            }
            if input.sequence < u32::MAX && tx.lock_time as u64 > now {
                return true;
            }
        }
        for output in &tx.outputs {
            if output.amount < TX_MIN_OUTPUT_AMOUNT {
                return true;
            }
        }
        tx.inputs.iter().any(|input| {
            state
                .all_tx
                .get(&input.prev_hash)
                .is_some_and(|prev| {
                    Self::is_pending_inner(state, prev, now, depth + 1)
                })
        })
    }

    fn is_verified_inner(
        state: &WalletState,
        tx: &Transaction,
        now: u64,
        depth: usize,
    ) -> bool {
        if depth > 64 || tx.block_height != TX_UNCONFIRMED {
            return true;
        }

        if tx.timestamp == 0
            || !Self::is_valid_inner(state, tx, depth)
            || Self::is_pending_inner(state, tx, now, depth)
        {
            return false;
        }

        tx.inputs.iter().all(|input| {
            state.all_tx.get(&input.prev_hash).map_or(true, |prev| {
                Self::is_verified_inner(state, prev, now, depth + 1)
            })
        })
    }

    /// UTXO selection and change construction. Recurses on itself with a
    /// smaller output set when the tx would exceed the size cap.
    fn create_inner(
        state: &mut WalletState,
        mpk: &MasterPubKey,
        outputs: &[TxOut],
    ) -> Result<Transaction, WalletError> {
        if outputs.is_empty() {
            return Err(WalletError::NoOutputs);
        }
        if outputs.iter().any(|o| o.script.is_empty()) {
            return Err(WalletError::InvalidAddress);
        }

        let min_amount = Self::min_output_amount_inner(state);
        let mut tx = Transaction::new();
        let mut amount: u64 = 0;
        for output in outputs {
            tx.add_output(output.clone());
            amount += output.amount;
        }

        let mut fee_amount =
            tx_fee(state.fee_per_kb, tx.size() + TX_OUTPUT_SIZE);
        let mut balance: u64 = 0;

        for utxo in state.utxos.clone() {
            let Some((prev_amount, prev_script)) = state
                .all_tx
                .get(&utxo.tx_hash)
                .and_then(|t| t.outputs.get(utxo.index as usize))
                .map(|o| (o.amount, o.script.clone()))
            else {
                continue;
            };

            tx.add_input(TxIn::new(
                utxo.tx_hash,
                utxo.index,
                prev_amount,
                prev_script,
                Vec::new(),
                TXIN_SEQUENCE,
            ));

            if tx.size() + TX_OUTPUT_SIZE > TX_MAX_SIZE {
                // over the size cap: rebuild with a cheaper output set,
                // after checking total funds could ever cover it
                let rebuilt_fee = tx_fee(
                    state.fee_per_kb,
                    10 + state.utxos.len() * TX_INPUT_SIZE
                        + (outputs.len() + 1) * TX_OUTPUT_SIZE,
                );
                if state.balance < amount + rebuilt_fee {
                    return Err(WalletError::InsufficientFunds);
                }

                let last = outputs.last().expect("outputs is non-empty");
                let shortfall = (amount + fee_amount).saturating_sub(balance);
                return if last.amount > shortfall + min_amount {
                    let mut reduced = outputs.to_vec();
                    reduced.last_mut().expect("non-empty").amount -= shortfall;
                    Self::create_inner(state, mpk, &reduced)
                } else {
                    Self::create_inner(state, mpk, &outputs[..outputs.len() - 1])
                };
            }

            balance += prev_amount;

            // fee amount after adding a change output
            fee_amount =
                tx_fee(state.fee_per_kb, tx.size() + TX_OUTPUT_SIZE);

            // increase fee to round off the remaining wallet balance to the
            // nearest 100 satoshi
            if state.balance > amount + fee_amount {
                fee_amount += (state.balance - (amount + fee_amount)) % 100;
            }

            if balance == amount + fee_amount
                || balance >= amount + fee_amount + min_amount
            {
                break;
            }
        }

        if balance < amount + fee_amount {
            return Err(WalletError::InsufficientFunds);
        }

        if balance - (amount + fee_amount) > min_amount {
            let change = Self::ensure_addrs(state, mpk, 1, true)
                .into_iter()
                .next()
                .ok_or(WalletError::Key(KeyError::BadDerivation))?;
            let change_output =
                TxOut::to_address(balance - (amount + fee_amount), &change)
                    .ok_or(WalletError::InvalidAddress)?;
            tx.add_output(change_output);
            tx.shuffle_outputs(&mut state.rng);
        }

        Ok(tx)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex as StdMutex;

    use keel_core::rng::FastRng;
    use proptest::prelude::*;

    use super::*;

    const SEED: &[u8] = b"keel wallet test seed 00000000000";

    /// Captures delivered notifications for assertions.
    #[derive(Default)]
    struct Recorder {
        balances: StdMutex<Vec<u64>>,
        added: StdMutex<Vec<TxId>>,
        deleted: StdMutex<Vec<(TxId, bool, bool)>>,
        updated: StdMutex<Vec<(Vec<TxId>, u32)>>,
    }

    impl WalletDelegate for Recorder {
        fn balance_changed(&self, balance: u64) {
            self.balances.lock().unwrap().push(balance);
        }
        fn tx_added(&self, tx: &Transaction) {
            self.added.lock().unwrap().push(tx.txid);
        }
        fn tx_updated(
            &self,
            tx_hashes: &[TxId],
            block_height: u32,
            _timestamp: u32,
        ) {
            self.updated
                .lock()
                .unwrap()
                .push((tx_hashes.to_vec(), block_height));
        }
        fn tx_deleted(
            &self,
            tx_hash: TxId,
            notify_user: bool,
            recommend_rescan: bool,
        ) {
            self.deleted
                .lock()
                .unwrap()
                .push((tx_hash, notify_user, recommend_rescan));
        }
    }

    fn new_wallet() -> (Arc<Wallet>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mpk = MasterPubKey::from_seed(SEED).unwrap();
        let wallet = Wallet::new(
            mpk,
            Vec::new(),
            Arc::clone(&recorder) as Arc<dyn WalletDelegate>,
            Box::new(FastRng::from_u64(7)),
        )
        .unwrap();
        (wallet, recorder)
    }

    fn outside_address(tag: u8) -> Address {
        Address::from_pubkey_hash([tag; 20])
    }

    /// A "signed" incoming transaction paying `amount` to `addr`.
    fn incoming_tx(
        id: u8,
        addr: &Address,
        amount: u64,
        block_height: u32,
    ) -> Transaction {
        let mut tx = Transaction::new();
        tx.add_input(TxIn::new(
            TxId([0xf0 + id; 32]),
            0,
            0,
            Vec::new(),
            vec![0x01], // opaque scriptSig; the wallet does not verify
            TXIN_SEQUENCE,
        ));
        tx.add_output(TxOut::to_address(amount, addr).unwrap());
        tx.txid = TxId([id; 32]);
        tx.block_height = block_height;
        tx.timestamp = 1_700_000_000;
        tx
    }

    /// A "signed" tx spending `prev:prev_index`, paying `amount` to `addr`.
    fn spend_tx(
        id: u8,
        prev: TxId,
        prev_index: u32,
        addr: &Address,
        amount: u64,
    ) -> Transaction {
        let mut tx = Transaction::new();
        tx.add_input(TxIn::new(
            prev,
            prev_index,
            0,
            Vec::new(),
            vec![0x01],
            TXIN_SEQUENCE,
        ));
        tx.add_output(TxOut::to_address(amount, addr).unwrap());
        tx.txid = TxId([id; 32]);
        tx.block_height = TX_UNCONFIRMED;
        tx.timestamp = 0;
        tx
    }

    #[test]
    fn empty_wallet_receive() {
        let (wallet, recorder) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(!wallet.address_is_used(&a0));
        assert!(wallet.contains_address(&a0));

        let t1 = incoming_tx(1, &a0, 100_000_000, 100);
        assert!(wallet.register_transaction(t1));

        assert_eq!(wallet.balance(), 100_000_000);
        assert_eq!(wallet.total_received(), 100_000_000);
        assert_eq!(wallet.total_sent(), 0);
        assert!(wallet.address_is_used(&a0));

        let a1 = wallet.receive_address().unwrap();
        assert_ne!(a1, a0);

        assert_eq!(recorder.balances.lock().unwrap().as_slice(), &[100_000_000]);
        assert_eq!(recorder.added.lock().unwrap().as_slice(), &[TxId([1; 32])]);
    }

    #[test]
    fn duplicate_registration_is_a_noop() {
        let (wallet, recorder) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        let t1 = incoming_tx(1, &a0, 100_000_000, 100);
        assert!(wallet.register_transaction(t1.clone()));
        assert!(wallet.register_transaction(t1));
        assert_eq!(wallet.balance(), 100_000_000);
        assert_eq!(recorder.added.lock().unwrap().len(), 1);
    }

    #[test]
    fn non_wallet_unconfirmed_tx_is_cached_not_registered() {
        let (wallet, _) = new_wallet();
        let t = incoming_tx(9, &outside_address(0x44), 5_000_000, TX_UNCONFIRMED);
        assert!(!wallet.register_transaction(t.clone()));
        assert_eq!(wallet.balance(), 0);
        assert!(wallet.transactions().is_empty());
        // but it is retained for double-spend detection
        assert!(wallet.transaction_for_hash(t.txid).is_some());

        // confirmed non-wallet tx is not retained
        let t2 = incoming_tx(10, &outside_address(0x45), 5_000_000, 50);
        assert!(!wallet.register_transaction(t2.clone()));
        assert!(wallet.transaction_for_hash(t2.txid).is_none());
    }

    #[test]
    fn unconfirmed_cache_is_bounded() {
        let (wallet, _) = new_wallet();
        wallet.set_unconfirmed_cache_limit(4);
        for i in 0..8u8 {
            let t = incoming_tx(
                100 + i,
                &outside_address(0x50 + i),
                5_000_000,
                TX_UNCONFIRMED,
            );
            assert!(!wallet.register_transaction(t));
        }
        // the four oldest were evicted
        assert!(wallet.transaction_for_hash(TxId([100; 32])).is_none());
        assert!(wallet.transaction_for_hash(TxId([103; 32])).is_none());
        assert!(wallet.transaction_for_hash(TxId([104; 32])).is_some());
        assert!(wallet.transaction_for_hash(TxId([107; 32])).is_some());
    }

    #[test]
    fn create_sign_register_spend() {
        let (wallet, _) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 100_000_000, 100)));

        let dest = outside_address(0x77);
        let mut tx = wallet.create_transaction(50_000_000, &dest).unwrap();

        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].prev_hash, TxId([1; 32]));
        assert_eq!(tx.outputs.len(), 2); // payment + change
        assert!(!tx.is_signed());

        let fee = wallet.fee_for_tx(&tx).unwrap();
        assert!(fee >= wallet.fee_for_tx_size(tx.size()) - 99);

        wallet.sign_transaction(&mut tx, 0, SEED).unwrap();
        assert!(tx.is_signed());

        let txid = tx.txid;
        assert!(wallet.register_transaction(tx));
        assert_eq!(wallet.balance(), 100_000_000 - 50_000_000 - fee);
        assert_eq!(wallet.total_sent(), 50_000_000 + fee);

        let utxos = wallet.utxos();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].tx_hash, txid);
    }

    #[test]
    fn signing_fails_for_foreign_inputs() {
        let (wallet, _) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 100_000_000, 100)));

        let mut tx = wallet
            .create_transaction(50_000_000, &outside_address(0x66))
            .unwrap();
        let wrong_seed = b"a different seed 0000000000000000";
        assert_eq!(
            wallet.sign_transaction(&mut tx, 0, wrong_seed),
            Err(WalletError::SigningFailed)
        );
    }

    #[test]
    fn insufficient_funds_is_an_error() {
        let (wallet, _) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 1_000_000, 100)));
        assert_eq!(
            wallet.create_transaction(2_000_000, &outside_address(0x55)),
            Err(WalletError::InsufficientFunds)
        );
    }

    #[test]
    fn double_spend_classification_flips_on_confirmation() {
        let (wallet, _) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 100_000_000, 100)));

        let t2a = spend_tx(2, TxId([1; 32]), 0, &outside_address(0xa0), 99_000_000);
        let t2b = spend_tx(3, TxId([1; 32]), 0, &outside_address(0xb0), 98_000_000);
        assert!(wallet.register_transaction(t2a.clone()));
        assert!(wallet.register_transaction(t2b.clone()));

        assert!(wallet.transaction_is_valid(&t2a));
        assert!(!wallet.transaction_is_valid(&t2b));
        // balance reflects only T2a: the receive was fully spent
        assert_eq!(wallet.balance(), 0);

        // T2b confirms; the conflict resolves the other way
        wallet.update_transactions(&[t2b.txid], 101, 1_700_000_500);
        let t2a_now = wallet.transaction_for_hash(t2a.txid).unwrap();
        let t2b_now = wallet.transaction_for_hash(t2b.txid).unwrap();
        assert!(!wallet.transaction_is_valid(&t2a_now));
        assert!(wallet.transaction_is_valid(&t2b_now));
    }

    #[test]
    fn pending_classification() {
        let (wallet, _) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 100_000_000, 100)));

        // dust output makes a tx pending
        let dusty = spend_tx(4, TxId([1; 32]), 0, &outside_address(0xc0), 100);
        assert!(wallet.transaction_is_pending(&dusty));
        assert!(wallet.register_transaction(dusty.clone()));
        // pending tx does not contribute spends or UTXOs
        assert_eq!(wallet.balance(), 100_000_000);

        // replace-by-fee sequence makes a tx pending
        let mut rbf =
            spend_tx(5, TxId([1; 32]), 0, &outside_address(0xc1), 99_000_000);
        rbf.inputs[0].sequence = 0;
        assert!(wallet.transaction_is_pending(&rbf));

        // a clean spend is not pending
        let clean =
            spend_tx(6, TxId([1; 32]), 0, &outside_address(0xc2), 99_000_000);
        assert!(!wallet.transaction_is_pending(&clean));
    }

    #[test]
    fn remove_transaction_takes_dependents() {
        let (wallet, recorder) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 100_000_000, 100)));

        // a chain: T2 spends T1, T3 spends T2
        let a_change = wallet.change_address().unwrap();
        let t2 = spend_tx(2, TxId([1; 32]), 0, &a_change, 99_000_000);
        let t3 = spend_tx(3, TxId([2; 32]), 0, &outside_address(0xd0), 98_000_000);
        assert!(wallet.register_transaction(t2));
        assert!(wallet.register_transaction(t3));
        assert_eq!(wallet.transactions().len(), 3);

        wallet.remove_transaction(TxId([1; 32]));
        assert!(wallet.transactions().is_empty());
        assert_eq!(wallet.balance(), 0);

        let deleted = recorder.deleted.lock().unwrap();
        // dependents deleted first, root last
        let order: Vec<TxId> = deleted.iter().map(|(h, _, _)| *h).collect();
        assert_eq!(order, vec![TxId([3; 32]), TxId([2; 32]), TxId([1; 32])]);
    }

    #[test]
    fn removed_confirmed_send_recommends_rescan() {
        let (wallet, recorder) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 100_000_000, 100)));

        let mut t2 =
            spend_tx(2, TxId([1; 32]), 0, &outside_address(0xd1), 99_000_000);
        t2.block_height = 101; // a confirmed send with confirmed inputs
        assert!(wallet.register_transaction(t2));

        wallet.remove_transaction(TxId([2; 32]));
        let deleted = recorder.deleted.lock().unwrap();
        assert_eq!(deleted.len(), 1);
        let (hash, notify_user, recommend_rescan) = deleted[0];
        assert_eq!(hash, TxId([2; 32]));
        assert!(notify_user);
        assert!(recommend_rescan);
    }

    #[test]
    fn reorg_marks_later_txs_unconfirmed() {
        let (wallet, recorder) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        let a1 = wallet.unused_addrs(2, false)[1].clone();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 50_000_000, 100)));
        assert!(wallet.register_transaction(incoming_tx(2, &a1, 60_000_000, 198)));

        wallet.set_tx_unconfirmed_after(197);

        let t1 = wallet.transaction_for_hash(TxId([1; 32])).unwrap();
        let t2 = wallet.transaction_for_hash(TxId([2; 32])).unwrap();
        assert_eq!(t1.block_height, 100);
        assert_eq!(t2.block_height, TX_UNCONFIRMED);
        assert!(wallet.transaction_is_valid(&t2));
        assert_eq!(wallet.balance(), 110_000_000);

        let updated = recorder.updated.lock().unwrap();
        assert_eq!(
            updated.last().unwrap(),
            &(vec![TxId([2; 32])], TX_UNCONFIRMED)
        );
    }

    #[test]
    fn balance_history_tracks_each_transaction() {
        let (wallet, _) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 100_000_000, 100)));
        let t1 = wallet.transaction_for_hash(TxId([1; 32])).unwrap();
        assert_eq!(wallet.balance_after_tx(&t1), 100_000_000);

        let t2 = spend_tx(2, TxId([1; 32]), 0, &outside_address(0xe0), 99_000_000);
        assert!(wallet.register_transaction(t2.clone()));
        assert_eq!(wallet.balance_after_tx(&t1), 100_000_000);
        assert_eq!(wallet.balance_after_tx(&t2), 0);
        assert_eq!(wallet.balance(), 0);

        // received minus sent equals the balance delta around each tx
        assert_eq!(
            wallet.amount_received_from_tx(&t1) - wallet.amount_sent_by_tx(&t1),
            100_000_000
        );
        assert_eq!(wallet.amount_sent_by_tx(&t2), 100_000_000);
        assert_eq!(wallet.amount_received_from_tx(&t2), 0);
    }

    #[test]
    fn max_output_amount_is_exactly_spendable() {
        let (wallet, _) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 100_000_000, 100)));

        let max = wallet.max_output_amount();
        assert!(max > 0);
        let dest = outside_address(0x88);
        assert!(wallet.create_transaction(max, &dest).is_ok());
        assert_eq!(
            wallet.create_transaction(max + 1, &dest),
            Err(WalletError::InsufficientFunds)
        );
    }

    #[test]
    fn fee_for_tx_amount_matches_created_tx() {
        let (wallet, _) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 100_000_000, 100)));

        let amount = 30_000_000;
        let fee = wallet.fee_for_tx_amount(amount);
        let tx = wallet
            .create_transaction(amount, &outside_address(0x99))
            .unwrap();
        assert_eq!(wallet.fee_for_tx(&tx), Some(fee));
    }

    #[test]
    fn ops_transaction_carries_both_outputs() {
        let (wallet, _) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 100_000_000, 100)));

        let dest = outside_address(0xaa);
        let ops = outside_address(0xbb);
        let tx = wallet
            .create_ops_transaction(30_000_000, &dest, 1_000_000, &ops)
            .unwrap();
        let amounts: Vec<u64> = tx.outputs.iter().map(|o| o.amount).collect();
        assert!(amounts.contains(&30_000_000));
        assert!(amounts.contains(&1_000_000));
        assert_eq!(tx.outputs.len(), 3); // ops + payment + change
    }

    #[test]
    fn ordering_invariant_holds() {
        let (wallet, _) = new_wallet();
        let addrs = wallet.unused_addrs(3, false);
        // register out of order: a spend chain and an unrelated receive
        assert!(wallet.register_transaction(incoming_tx(1, &addrs[0], 100_000_000, 100)));
        let t2 = spend_tx(2, TxId([1; 32]), 0, &addrs[1], 99_000_000);
        let t3 = spend_tx(3, TxId([2; 32]), 0, &outside_address(0xcc), 98_000_000);
        assert!(wallet.register_transaction(t3.clone()));
        assert!(wallet.register_transaction(t2.clone()));
        assert!(wallet.register_transaction(incoming_tx(4, &addrs[2], 10_000_000, 90)));

        let txs = wallet.transactions();
        for (i, tx) in txs.iter().enumerate() {
            for earlier in &txs[..i] {
                // no earlier tx has a higher block height
                assert!(earlier.block_height <= tx.block_height);
                // no earlier tx spends this one
                assert!(!earlier
                    .inputs
                    .iter()
                    .any(|input| input.prev_hash == tx.txid));
            }
        }
    }

    #[test]
    fn wrong_master_pubkey_restore_fails() {
        let other_seed = b"some other wallet seed 0000000000";
        let other_mpk = MasterPubKey::from_seed(other_seed).unwrap();
        let other_addr = other_mpk.derive_address(CHAIN_EXTERNAL, 0).unwrap();
        let tx = incoming_tx(1, &other_addr, 100_000_000, 100);

        let mpk = MasterPubKey::from_seed(SEED).unwrap();
        let result = Wallet::new(
            mpk,
            vec![tx],
            Arc::new(()),
            Box::new(FastRng::from_u64(7)),
        );
        assert!(matches!(result, Err(WalletError::WrongMasterPubKey)));
    }

    #[test]
    fn restore_rebuilds_state() {
        let (wallet, _) = new_wallet();
        let a0 = wallet.receive_address().unwrap();
        assert!(wallet.register_transaction(incoming_tx(1, &a0, 100_000_000, 100)));
        let txs: Vec<Transaction> =
            wallet.transactions().iter().map(|t| (**t).clone()).collect();

        let mpk = MasterPubKey::from_seed(SEED).unwrap();
        let restored = Wallet::new(
            mpk,
            txs,
            Arc::new(()),
            Box::new(FastRng::from_u64(7)),
        )
        .unwrap();
        assert_eq!(restored.balance(), 100_000_000);
        assert!(restored.address_is_used(&a0));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Balance equals the sum of UTXO amounts for any registration order.
        #[test]
        fn balance_is_utxo_sum(order in Just((0u8..6).collect::<Vec<_>>()).prop_shuffle()) {
            let (wallet, _) = new_wallet();
            let addrs = wallet.unused_addrs(6, false);
            let txs: Vec<Transaction> = (0..6u8)
                .map(|i| {
                    if i < 3 {
                        incoming_tx(i + 1, &addrs[i as usize], 10_000_000 * (i as u64 + 1), 100 + i as u32)
                    } else {
                        // spend the matching receive
                        spend_tx(i + 1, TxId([i - 2; 32]), 0, &outside_address(i), 9_000_000)
                    }
                })
                .collect();

            for i in order {
                wallet.register_transaction(txs[i as usize].clone());
            }

            let state_balance = wallet.balance();
            let utxo_sum: u64 = wallet
                .utxos()
                .iter()
                .map(|utxo| {
                    let tx = wallet.transaction_for_hash(utxo.tx_hash).unwrap();
                    tx.outputs[utxo.index as usize].amount
                })
                .sum();
            prop_assert_eq!(state_balance, utxo_sum);

            let txs = wallet.transactions();
            if let Some(last) = txs.last() {
                prop_assert_eq!(wallet.balance_after_tx(last), state_balance);
            }
        }
    }
}
