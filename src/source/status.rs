use std::sync::Arc;

use tokio::sync::watch;

use super::{ConnectionStatus, SourceListener};

/// Connection status owned by one source.
///
/// Consumers get a read-only `watch::Receiver`; the listener hears about a
/// transition only when the value actually changes, so converging paths
/// (user disconnect racing a hardware unplug) report `disconnected` once.
pub struct StatusCell {
    tx: watch::Sender<ConnectionStatus>,
    listener: Arc<dyn SourceListener>,
}

impl StatusCell {
    pub fn new(listener: Arc<dyn SourceListener>) -> Self {
        let (tx, _rx) = watch::channel(ConnectionStatus::Disconnected);
        Self { tx, listener }
    }

    pub fn current(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    pub fn listener(&self) -> &Arc<dyn SourceListener> {
        &self.listener
    }

    /// Returns whether the status changed.
    pub fn transition(&self, next: ConnectionStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        if changed {
            self.listener.on_status_change(next);
        }
        changed
    }
}
