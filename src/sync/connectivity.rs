//! Connectivity Observer
//!
//! Holds the host runtime's online/offline signal and turns it into
//! edge-triggered events. Built on a tokio `watch` channel: readers always
//! see the latest value, and rapid flapping may coalesce into fewer edges
//! (the periodic drain timer covers anything missed).

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    BecameOnline,
    BecameOffline,
}

impl ConnectivityEvent {
    fn from_online(online: bool) -> Self {
        if online {
            Self::BecameOnline
        } else {
            Self::BecameOffline
        }
    }
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Report the current network status. Returns the edge, if the status
    /// actually changed.
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEvent> {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if !changed {
            return None;
        }

        let event = ConnectivityEvent::from_online(online);
        log::info!("Connectivity changed: {:?}", event);
        Some(event)
    }

    /// Subscribe to future transitions
    pub fn subscribe(&self) -> ConnectivitySubscription {
        let mut rx = self.tx.subscribe();
        let last = *rx.borrow_and_update();
        ConnectivitySubscription { rx, last }
    }
}

/// Stream of connectivity edges. Dropping it unsubscribes.
pub struct ConnectivitySubscription {
    rx: watch::Receiver<bool>,
    last: bool,
}

impl ConnectivitySubscription {
    /// Wait for the next transition. `None` once the monitor is gone.
    pub async fn next_event(&mut self) -> Option<ConnectivityEvent> {
        loop {
            self.rx.changed().await.ok()?;
            let online = *self.rx.borrow_and_update();
            if online != self.last {
                self.last = online;
                return Some(ConnectivityEvent::from_online(online));
            }
        }
    }
}
