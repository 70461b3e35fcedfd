//! Network reachability signal.

use tokio::sync::watch;
use tracing::debug;

/// Publishes whether the network is reachable.
///
/// The platform layer calls [`set_reachable`](Self::set_reachable) from its
/// own path monitor; the engine and scheduler only hold receivers.
#[derive(Debug)]
pub struct ReachabilityMonitor {
    tx: watch::Sender<bool>,
}

impl ReachabilityMonitor {
    pub fn new(initially_reachable: bool) -> Self {
        let (tx, _) = watch::channel(initially_reachable);
        Self { tx }
    }

    pub fn set_reachable(&self, reachable: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });
        if changed {
            debug!("Network reachability changed: {}", reachable);
        }
    }

    pub fn is_reachable(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
