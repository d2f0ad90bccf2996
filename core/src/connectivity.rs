/// Network reachability reporting
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Receives a call each time the network becomes reachable again.
pub trait ConnectivityListener: Send + Sync {
    fn on_connectivity_restored(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Reports reachability. None of these calls may block.
pub trait ConnectivityMonitor: Send + Sync {
    fn is_connected(&self) -> bool;
    fn subscribe(&self, listener: Arc<dyn ConnectivityListener>) -> ListenerId;
    fn unsubscribe(&self, id: ListenerId);
}

/// Monitor driven by whoever owns the platform network callbacks.
pub struct ManualConnectivity {
    connected: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<HashMap<ListenerId, Arc<dyn ConnectivityListener>>>,
}

impl ManualConnectivity {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Record a reachability change; listeners hear about offline -> online only.
    pub fn set_connected(&self, connected: bool) {
        let was_connected = self.connected.swap(connected, Ordering::SeqCst);
        if connected && !was_connected {
            info!("Network reachable again");
            // Call out without holding the lock, listeners may subscribe/unsubscribe.
            let listeners: Vec<_> = match self.listeners.lock() {
                Ok(listeners) => listeners.values().cloned().collect(),
                Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
            };
            for listener in listeners {
                listener.on_connectivity_restored();
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, listener: Arc<dyn ConnectivityListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(id, listener);
        }
        id
    }

    fn unsubscribe(&self, id: ListenerId) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(&id);
        }
    }
}
