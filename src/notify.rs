//! Records-changed publish/subscribe.
//!
//! Collaborators subscribe with a callback; the sync engine and the vault
//! facade publish after local writes, pulls and conflict handling. Dropping
//! the [`Subscription`] unsubscribes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::records::VaultRecord;

/// Decrypted records that changed, plus ids that became tombstones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordsChanged {
    pub upserted: Vec<VaultRecord>,
    pub deleted: Vec<String>,
}

impl RecordsChanged {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.deleted.is_empty()
    }
}

pub type RecordsChangedCallback = Arc<dyn Fn(&RecordsChanged) + Send + Sync>;

#[derive(Default)]
pub struct Notifier {
    listeners: Mutex<Vec<(u64, RecordsChangedCallback)>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, callback: RecordsChangedCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, callback));
        Subscription {
            notifier: Arc::downgrade(self),
            id,
        }
    }

    /// Deliver `event` to every listener. Empty events are dropped.
    pub fn publish(&self, event: &RecordsChanged) {
        if event.is_empty() {
            return;
        }
        // Callbacks run without the lock so they may subscribe or drop.
        let listeners: Vec<RecordsChangedCallback> =
            self.listeners.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }
}

/// Handle returned by [`Notifier::subscribe`].
pub struct Subscription {
    notifier: Weak<Notifier>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.unsubscribe(self.id);
        }
    }
}
