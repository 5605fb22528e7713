use std::sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicBool, Ordering},
};
use tracing::debug;

use doclink_core::connectivity::{ConnectivityListener, ConnectivityMonitor};

/// A connectivity monitor driven by hand.
///
/// Clones share state, so a test can keep one handle and give another to the client.
#[derive(Clone)]
pub struct ManualConnectivity {
    connected: Arc<AtomicBool>,
    listeners: Arc<RwLock<Vec<ConnectivityListener>>>,
}

impl std::fmt::Debug for ManualConnectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualConnectivity")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ManualConnectivity {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(connected)),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Changes the reported state. Listeners hear about transitions only, not repeats.
    pub fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) == connected {
            return;
        }

        debug!(connected, "connectivity changed");

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(connected);
        }
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn subscribe(&self, listener: ConnectivityListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_listeners_hear_transitions_only() {
        let monitor = ManualConnectivity::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        monitor.subscribe(Arc::new(move |connected| sink.lock().unwrap().push(connected)));

        monitor.set_connected(true);
        monitor.set_connected(false);
        monitor.set_connected(false);
        monitor.set_connected(true);

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
        assert!(monitor.is_connected());
    }
}
