use crate::codec::address_key;
use crate::error::{PoolError, PoolResult};
use crate::transport::AddressChange;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Correlates in-flight address adds with the kernel's "no longer tentative"
/// notifications.
///
/// Binding a socket to a freshly added address fails with EADDRNOTAVAIL until
/// duplicate address detection has cleared it, so every add blocks on the
/// matching notification instead of polling. One dispatch task per pool reads
/// the shared subscription and resolves waiters by address key; each waiter
/// removes its own pending entry on timeout or cancellation.
pub struct TentativeTracker {
    iface_index: u32,
    pending: Arc<DashMap<String, oneshot::Sender<()>>>,
}

impl TentativeTracker {
    pub fn new(iface_index: u32) -> Self {
        Self {
            iface_index,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Consume address-change notifications, resolving pending waiters whose
    /// address key matches a non-tentative report on the tracked interface.
    pub fn spawn_dispatch(
        &self,
        mut events: mpsc::UnboundedReceiver<AddressChange>,
    ) -> tokio::task::JoinHandle<()> {
        let iface_index = self.iface_index;
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            while let Some(change) = events.recv().await {
                if change.index != iface_index || change.tentative {
                    continue;
                }
                let key = address_key(&change.bytes, change.prefix_len);
                if let Some((_, waiter)) = pending.remove(&key) {
                    tracing::debug!("address is not tentative anymore: {}", key);
                    // the waiter may have timed out in the meantime
                    let _ = waiter.send(());
                }
            }
        })
    }

    /// Register a waiter for `key`. At most one pending entry per key.
    pub fn register(&self, key: String) -> PoolResult<PendingClearance> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(PoolError::AlreadyExists(key));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }
        Ok(PendingClearance {
            key,
            rx,
            pending: Arc::clone(&self.pending),
            resolved: false,
        })
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// A registered wait for DAD clearance of one address. Dropping it (timeout,
/// cancellation, adoption of an existing address) removes the pending entry.
pub struct PendingClearance {
    key: String,
    rx: oneshot::Receiver<()>,
    pending: Arc<DashMap<String, oneshot::Sender<()>>>,
    resolved: bool,
}

impl PendingClearance {
    /// Block until the kernel reports the address non-tentative, or fail with
    /// `TentativeTimeout` after `timeout`.
    pub async fn wait(mut self, timeout: Duration, canonical: &str) -> PoolResult<()> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(())) => {
                self.resolved = true;
                Ok(())
            }
            Ok(Err(_)) => Err(PoolError::Transport(format!(
                "address-change subscription closed while waiting for {}",
                canonical
            ))),
            Err(_) => Err(PoolError::TentativeTimeout(canonical.to_string())),
        }
    }
}

impl Drop for PendingClearance {
    fn drop(&mut self) {
        // On resolution the dispatcher has already removed the entry; removing
        // here as well could tear down a waiter re-registered for the same key.
        if !self.resolved {
            self.pending.remove(&self.key);
        }
    }
}
