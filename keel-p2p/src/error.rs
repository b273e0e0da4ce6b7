use thiserror::Error;

/// Error codes surfaced to the host. The variants mirror the POSIX codes
/// historically used by SPV wallets for these conditions.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Publish attempted while offline or after connect failures exhausted.
    #[error("not connected to the network")]
    NotConnected,
    /// A protocol or publish timeout elapsed.
    #[error("operation timed out")]
    TimedOut,
    /// A peer violated the protocol and was evicted.
    #[error("peer violated protocol")]
    Protocol,
    /// The transaction was unsigned or known-invalid when requested.
    #[error("transaction invalid or unsigned")]
    InvalidTx,
    /// No peer was reachable at connect time.
    #[error("network unreachable")]
    NetworkUnreachable,
}
