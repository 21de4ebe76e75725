//! Connection Listener Protocol
//!
//! A persistent backend's connection manager tells interested stores when its
//! connection drops and when it comes back. Stores never poll.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;

/// Callbacks fired by a persistent backend's connection manager.
///
/// Implementations take their own locks, so backends must fire these from
/// their connection management path and never from inside a data operation
/// issued by the listener itself.
pub trait ConnectionListener: Send + Sync {
    /// The backing connection is lost
    fn on_disconnected(&self);

    /// The backing connection is usable again
    fn on_reconnected(&self);
}

/// Connection state of a tiered store's persistent tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn from_connected(connected: bool) -> Self {
        if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Registered listeners, held weakly so a dropped store unregisters itself
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Weak<dyn ConnectionListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn add(&self, listener: Weak<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of live listeners
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|listener| listener.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire `on_disconnected` on every live listener
    pub fn notify_disconnected(&self) {
        for listener in self.live() {
            listener.on_disconnected();
        }
    }

    /// Fire `on_reconnected` on every live listener
    pub fn notify_reconnected(&self) {
        for listener in self.live() {
            listener.on_reconnected();
        }
    }

    /// Upgrade live listeners and prune dead ones; callbacks run without the lock held
    fn live(&self) -> Vec<Arc<dyn ConnectionListener>> {
        let mut listeners = self.listeners.write();
        listeners.retain(|listener| listener.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }
}
