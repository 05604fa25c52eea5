//! Append subscriptions.
//!
//! Callbacks run synchronously inside the writer's `append`, after the
//! measurement is stored. A slow callback slows its writer down.

use crate::meas::{Flag, Id, Measurement};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback invoked with every matching appended measurement.
pub type Callback = Arc<dyn Fn(&Measurement) + Send + Sync>;

/// Handle returned by [`Subscriptions::add`].
pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    ids: Vec<Id>,
    flag: Flag,
    callback: Callback,
}

/// Registry of active subscriptions.
#[derive(Default)]
pub struct Subscriptions {
    next_id: AtomicU64,
    active: RwLock<Vec<Subscription>>,
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriptions")
            .field("active", &self.len())
            .finish()
    }
}

impl Subscriptions {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for measurements of `ids` (all if empty) matching `flag`.
    pub fn add(&self, ids: Vec<Id>, flag: Flag, callback: Callback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.write().push(Subscription {
            id,
            ids,
            flag,
            callback,
        });
        id
    }

    /// Removes a subscription. Returns false if it was not registered.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut active = self.active.write();
        let before = active.len();
        active.retain(|s| s.id != id);
        active.len() != before
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.active.read().len()
    }

    /// Returns true if nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.active.read().is_empty()
    }

    /// Invokes every subscription matching `m`.
    ///
    /// Callbacks run after the registry lock is released, so they may
    /// subscribe or unsubscribe.
    pub fn notify(&self, m: &Measurement) {
        let matching: Vec<Callback> = self
            .active
            .read()
            .iter()
            .filter(|s| m.in_ids(&s.ids) && m.in_flag(s.flag))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in matching {
            callback(m);
        }
    }
}
