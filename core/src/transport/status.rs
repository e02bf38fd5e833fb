// Network status reporting

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkStatus {
    NotStarted,
    Connecting,
    Connected,
    Error(String),
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkStatus::NotStarted => write!(f, "Not started"),
            NetworkStatus::Connecting => write!(f, "Connecting"),
            NetworkStatus::Connected => write!(f, "Connected"),
            NetworkStatus::Error(e) => write!(f, "Error: {}", e),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait NetworkStatusListener: Send + Sync {
    fn on_status_changed(&self, status: &NetworkStatus);
}

/// Holds the current status and notifies listeners on change
pub struct StatusNotifier {
    status: RwLock<NetworkStatus>,
    listeners: RwLock<Vec<Arc<dyn NetworkStatusListener>>>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(NetworkStatus::NotStarted),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn NetworkStatusListener>) {
        self.listeners.write().push(listener);
    }

    pub fn status(&self) -> NetworkStatus {
        self.status.read().clone()
    }

    /// Update the status; listeners are only called if it actually changed
    pub fn set(&self, status: NetworkStatus) {
        {
            let mut current = self.status.write();
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        tracing::info!("🌐 Network status: {}", status);
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            listener.on_status_changed(&status);
        }
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}
