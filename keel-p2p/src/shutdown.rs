//! A one-shot broadcast used to stop background tasks.
//!
//! Unlike [`tokio::sync::broadcast`], receivers subscribing after the signal
//! was sent still observe it, which is exactly what a shutdown flag needs.

use tokio::sync::watch;

/// Sender half. Cloneable; any clone can signal.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Receiver half. Cloneable; every clone observes the signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (Shutdown, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (Shutdown { tx }, ShutdownSignal { rx })
}

impl Shutdown {
    /// Signals shutdown. Safe to call more than once.
    pub fn send(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_sent(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ShutdownSignal {
    /// Completes once shutdown has been signalled (immediately if it already
    /// was).
    pub async fn recv(&mut self) {
        // wait_for never errs while a Shutdown sender is alive; if all
        // senders are gone, treat that as a shutdown too
        let _ = self.rx.wait_for(|&sent| sent).await;
    }

    pub fn try_recv(&self) -> bool {
        *self.rx.borrow()
    }
}
