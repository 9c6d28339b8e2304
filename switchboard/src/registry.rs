//! Per-address handler registry with round-robin choice.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::AbortHandle;

use crate::context::Context;
use crate::message::MessageHandler;

/// One registered handler and its delivery state.
pub(crate) struct HandlerHolder {
    /// Registry-unique id; unregistration matches on it.
    pub id: u64,
    pub handler: Arc<dyn MessageHandler>,
    /// Execution lane deliveries to this handler run on.
    pub context: Context,
    /// Auto-unregisters after its first delivery.
    pub reply_handler: bool,
    /// Registration was not propagated into the subscription map.
    pub local_only: bool,
    /// Reply-timeout task, when one is armed for this holder.
    timeout: Mutex<Option<AbortHandle>>,
    /// Set under the bucket lock on unregistration; deliveries already
    /// scheduled re-check it on their context before invoking.
    pub removed: AtomicBool,
}

impl HandlerHolder {
    /// Arm the reply-timeout task. Unregistration aborts it.
    pub(crate) fn set_timeout(&self, handle: AbortHandle) {
        *self.timeout.lock().unwrap() = Some(handle);
    }

    /// Abort the reply-timeout task, if armed.
    pub(crate) fn cancel_timeout(&self) {
        if let Some(handle) = self.timeout.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// The handlers bucket for one address.
///
/// Invariant: a bucket present in the registry has a non-empty list; the
/// removal that empties it also deletes it from the map, under the map
/// entry's lock.
pub(crate) struct Handlers {
    list: RwLock<Vec<Arc<HandlerHolder>>>,
    pos: AtomicUsize,
}

impl Handlers {
    fn new() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
            pos: AtomicUsize::new(0),
        }
    }

    /// Next holder round-robin, or `None` when the bucket emptied under us.
    pub(crate) fn choose(&self) -> Option<Arc<HandlerHolder>> {
        let list = self.list.read().unwrap();
        if list.is_empty() {
            return None;
        }
        let p = self.pos.fetch_add(1, Ordering::Relaxed);
        list.get(p % list.len()).cloned()
    }

    /// Snapshot of the current holders, for publish fan-out.
    pub(crate) fn snapshot(&self) -> Vec<Arc<HandlerHolder>> {
        self.list.read().unwrap().clone()
    }
}

/// Concurrent map from address to handlers bucket.
pub(crate) struct HandlerRegistry {
    buckets: DashMap<String, Arc<Handlers>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a holder to the address's bucket, creating the bucket when
    /// absent. Returns the holder and whether it is the first handler on
    /// this address (the caller propagates first registrations into the
    /// subscription map).
    pub(crate) fn register(
        &self,
        address: &str,
        handler: Arc<dyn MessageHandler>,
        reply_handler: bool,
        local_only: bool,
        context: Context,
    ) -> (Arc<HandlerHolder>, bool) {
        let holder = Arc::new(HandlerHolder {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            handler,
            context,
            reply_handler,
            local_only,
            timeout: Mutex::new(None),
            removed: AtomicBool::new(false),
        });
        let first = match self.buckets.entry(address.to_string()) {
            Entry::Occupied(e) => {
                e.get().list.write().unwrap().push(holder.clone());
                false
            }
            Entry::Vacant(e) => {
                let bucket = Arc::new(Handlers::new());
                bucket.list.write().unwrap().push(holder.clone());
                e.insert(bucket);
                true
            }
        };
        (holder, first)
    }

    /// Remove the holder with `id` from the address's bucket.
    ///
    /// Marks it removed, cancels its timeout, and deletes the bucket when
    /// this removal emptied it — all under the entry's lock, so a send
    /// never observes an empty bucket.
    ///
    /// Returns `None` when no such holder exists, otherwise whether the
    /// caller must also remove the address from the subscription map
    /// (bucket emptied and the holder was cluster-propagated).
    pub(crate) fn unregister(&self, address: &str, id: u64) -> Option<bool> {
        let entry = self.buckets.entry(address.to_string());
        let Entry::Occupied(e) = entry else {
            return None;
        };
        let bucket = e.get().clone();
        let mut list = bucket.list.write().unwrap();
        let idx = list.iter().position(|h| h.id == id)?;
        let holder = list.remove(idx);
        holder.removed.store(true, Ordering::Release);
        holder.cancel_timeout();
        let emptied = list.is_empty();
        drop(list);
        if emptied {
            e.remove();
            Some(!holder.local_only)
        } else {
            Some(false)
        }
    }

    /// The bucket for an address, if any handler is registered there.
    pub(crate) fn bucket(&self, address: &str) -> Option<Arc<Handlers>> {
        self.buckets.get(address).map(|e| Arc::clone(e.value()))
    }

    /// Drop every registration: mark holders removed, cancel their timers.
    /// Used on close; in-flight deliveries observe `removed` and skip.
    pub(crate) fn clear(&self) {
        for entry in self.buckets.iter() {
            for holder in entry.value().list.read().unwrap().iter() {
                holder.removed.store(true, Ordering::Release);
                holder.cancel_timeout();
            }
        }
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn noop_handler() -> Arc<dyn MessageHandler> {
        Arc::new(|_msg: Message| {})
    }

    fn context() -> Context {
        Context::new(&tokio::runtime::Handle::current())
    }

    #[tokio::test]
    async fn test_register_and_choose_round_robin() {
        let registry = HandlerRegistry::new();
        let (a, first_a) = registry.register("x", noop_handler(), false, false, context());
        let (b, first_b) = registry.register("x", noop_handler(), false, false, context());
        let (c, _) = registry.register("x", noop_handler(), false, false, context());
        assert!(first_a);
        assert!(!first_b);

        let bucket = registry.bucket("x").unwrap();
        let picks: Vec<u64> = (0..6).map(|_| bucket.choose().unwrap().id).collect();
        assert_eq!(picks, vec![a.id, b.id, c.id, a.id, b.id, c.id]);
    }

    #[tokio::test]
    async fn test_unregister_empties_bucket() {
        let registry = HandlerRegistry::new();
        let (holder, _) = registry.register("x", noop_handler(), false, false, context());

        assert_eq!(registry.unregister("x", holder.id), Some(true));
        assert!(holder.removed.load(Ordering::Acquire));
        assert!(registry.bucket("x").is_none());
        assert_eq!(registry.unregister("x", holder.id), None);
    }

    #[tokio::test]
    async fn test_unregister_local_only_skips_subs_removal() {
        let registry = HandlerRegistry::new();
        let (holder, _) = registry.register("x", noop_handler(), false, true, context());
        assert_eq!(registry.unregister("x", holder.id), Some(false));
    }

    #[tokio::test]
    async fn test_unregister_keeps_bucket_while_others_remain() {
        let registry = HandlerRegistry::new();
        let (a, _) = registry.register("x", noop_handler(), false, false, context());
        let (b, _) = registry.register("x", noop_handler(), false, false, context());

        assert_eq!(registry.unregister("x", a.id), Some(false));
        let bucket = registry.bucket("x").unwrap();
        assert_eq!(bucket.choose().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn test_choose_on_empty_address() {
        let registry = HandlerRegistry::new();
        assert!(registry.bucket("nothing").is_none());
    }

    #[tokio::test]
    async fn test_clear_marks_holders_removed() {
        let registry = HandlerRegistry::new();
        let (a, _) = registry.register("x", noop_handler(), false, false, context());
        let (b, _) = registry.register("y", noop_handler(), true, true, context());
        registry.clear();
        assert!(a.removed.load(Ordering::Acquire));
        assert!(b.removed.load(Ordering::Acquire));
        assert!(registry.bucket("x").is_none());
    }
}
