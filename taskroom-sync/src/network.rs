//! Network status monitor.
//!
//! Fed by the platform connectivity signal through [`NetworkMonitor::set_online`].
//! No reachability probing is done, so a captive portal reads as online.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTransition {
    Online,
    Offline,
}

impl NetworkTransition {
    fn from_online(online: bool) -> Self {
        if online {
            NetworkTransition::Online
        } else {
            NetworkTransition::Offline
        }
    }
}

/// Current connectivity plus a change feed. Clones share state.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the platform signal. Returns the transition it caused, or
    /// `None` when the signal repeats the current state.
    pub fn set_online(&self, online: bool) -> Option<NetworkTransition> {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if !changed {
            return None;
        }
        let transition = NetworkTransition::from_online(online);
        tracing::info!(?transition, "Network status changed");
        Some(transition)
    }

    pub fn subscribe(&self) -> NetworkWatcher {
        let rx = self.tx.subscribe();
        let last = *rx.borrow();
        NetworkWatcher { rx, last }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Receiver of connectivity transitions.
///
/// Transitions are derived from state changes, so a flap that reverts before
/// the watcher looks is collapsed into no transition at all.
#[derive(Debug)]
pub struct NetworkWatcher {
    rx: watch::Receiver<bool>,
    last: bool,
}

impl NetworkWatcher {
    pub fn is_online(&self) -> bool {
        self.last
    }

    /// Wait for the next transition. Returns `None` once every monitor
    /// handle has been dropped.
    pub async fn next_transition(&mut self) -> Option<NetworkTransition> {
        loop {
            self.rx.changed().await.ok()?;
            let online = *self.rx.borrow_and_update();
            if online != self.last {
                self.last = online;
                return Some(NetworkTransition::from_online(online));
            }
        }
    }
}
