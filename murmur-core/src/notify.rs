//! Edge-triggered, coalescing notification channel.
//!
//! Models an interrupt handler handing a wakeup to a task through a
//! depth-1 queue: at most one signal is pending, and edges that arrive
//! while one is pending are folded into it. The receiver learns that
//! *something* happened and re-samples the source, it does not count edges.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

/// Create a connected sender/receiver pair carrying payloads of type `T`.
///
/// The payload of a coalesced edge is the first one posted.
pub fn edge_channel<T>() -> (EdgeSender<T>, EdgeReceiver<T>) {
    let (tx, rx) = bounded(1);
    (EdgeSender { tx }, EdgeReceiver { rx })
}

/// Posting side. Cheap to clone, never blocks.
pub struct EdgeSender<T> {
    tx: Sender<T>,
}

impl<T> Clone for EdgeSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> EdgeSender<T> {
    /// Post an edge. Returns `false` when it was coalesced into a pending
    /// one or the receiver is gone.
    pub fn notify(&self, value: T) -> bool {
        match self.tx.try_send(value) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Waiting side.
pub struct EdgeReceiver<T> {
    rx: Receiver<T>,
}

impl<T> EdgeReceiver<T> {
    /// Block until an edge arrives or every sender is dropped.
    pub fn wait(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// `Ok(None)` on timeout, `Err(())` once every sender is dropped.
    #[allow(clippy::result_unit_err)]
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>, ()> {
        match self.rx.recv_timeout(timeout) {
            Ok(v) => Ok(Some(v)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(()),
        }
    }

    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
