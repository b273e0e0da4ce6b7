//! The `keel-wallet` crate owns the wallet state engine: the ordered
//! transaction set, UTXO reconciliation, invalid/pending classification,
//! balance history, and the create/sign flows.

/// Host notifications.
pub mod events;
/// The wallet state engine.
pub mod wallet;

pub use events::WalletDelegate;
pub use wallet::{Utxo, Wallet, WalletError};
