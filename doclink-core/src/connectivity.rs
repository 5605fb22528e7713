//! Network reachability boundary.
//!
//! The access layer does not test the network itself. A [`ConnectivityMonitor`] tells it
//! whether the service is currently reachable and notifies it of transitions, which is what
//! triggers a drain of queued writes.

use std::sync::Arc;

/// Callback invoked with the new state on every reachability transition.
pub type ConnectivityListener = Arc<dyn Fn(bool) + Send + Sync>;

pub trait ConnectivityMonitor: Send + Sync {
    /// Registers `listener` for every future transition.
    fn subscribe(&self, listener: ConnectivityListener);

    /// Current reachability.
    fn is_connected(&self) -> bool;
}

/// A monitor that always reports the network as reachable and never transitions.
///
/// Used when no monitor is configured: every request is attempted and transport failures are
/// still handled, but queued writes only drain on an explicit `drain` call.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysConnected;

impl ConnectivityMonitor for AlwaysConnected {
    fn subscribe(&self, _listener: ConnectivityListener) {}

    fn is_connected(&self) -> bool {
        true
    }
}

pub type SharedMonitor = Arc<dyn ConnectivityMonitor>;
