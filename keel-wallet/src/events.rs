use std::sync::Arc;

use keel_core::{hashes::TxId, tx::Transaction};

/// Host callbacks for wallet state changes.
///
/// All methods default to no-ops so hosts implement only what they care
/// about. Callbacks are always delivered *after* the wallet's internal lock
/// has been released; it is safe to call back into the wallet from them.
pub trait WalletDelegate: Send + Sync {
    fn balance_changed(&self, _balance: u64) {}

    fn tx_added(&self, _tx: &Transaction) {}

    fn tx_updated(
        &self,
        _tx_hashes: &[TxId],
        _block_height: u32,
        _timestamp: u32,
    ) {
    }

    /// `recommend_rescan` is set when a previously-valid send with fully
    /// confirmed inputs was removed; the host should offer a chain rescan.
    fn tx_deleted(
        &self,
        _tx_hash: TxId,
        _notify_user: bool,
        _recommend_rescan: bool,
    ) {
    }
}

/// The "do nothing" delegate.
impl WalletDelegate for () {}

/// A state change recorded under the wallet lock, delivered after release.
pub(crate) enum Notice {
    BalanceChanged(u64),
    TxAdded(Arc<Transaction>),
    TxUpdated {
        tx_hashes: Vec<TxId>,
        block_height: u32,
        timestamp: u32,
    },
    TxDeleted {
        tx_hash: TxId,
        notify_user: bool,
        recommend_rescan: bool,
    },
}

pub(crate) fn deliver(delegate: &dyn WalletDelegate, notices: Vec<Notice>) {
    for notice in notices {
        match notice {
            Notice::BalanceChanged(balance) =>
                delegate.balance_changed(balance),
            Notice::TxAdded(tx) => delegate.tx_added(&tx),
            Notice::TxUpdated {
                tx_hashes,
                block_height,
                timestamp,
            } => delegate.tx_updated(&tx_hashes, block_height, timestamp),
            Notice::TxDeleted {
                tx_hash,
                notify_user,
                recommend_rescan,
            } => delegate.tx_deleted(tx_hash, notify_user, recommend_rescan),
        }
    }
}
