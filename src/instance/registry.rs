//! Instance Registry
//!
//! Owned map from instance id to runtime slot. Each slot serializes its own
//! transitions behind a `tokio::sync::Mutex`; different instances never
//! contend. Readers use the slot's `watch` view and readiness flag and never
//! take the per-instance lock.

use super::readiness::AppStateReadiness;
use super::Instance;
use crate::transport::TransportSession;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

/// Mutable runtime state of one instance, guarded by the slot lock
pub struct InstanceRuntime {
    pub instance: Instance,
    pub session: Option<Arc<dyn TransportSession>>,
    /// Bumped every time the session is torn down. Events and timers tagged
    /// with an older generation are ignored.
    pub generation: u64,
    /// Cancels the event loop and timers of the current generation.
    pub cancel: CancellationToken,
    /// Set under the lock just before the slot leaves the registry. A caller
    /// that finds it set must look the id up again.
    pub removed: bool,
}

impl InstanceRuntime {
    fn new(instance: Instance) -> Self {
        Self {
            instance,
            session: None,
            generation: 0,
            cancel: CancellationToken::new(),
            removed: false,
        }
    }

    /// Close the current session (without logging out), cancel its event
    /// loop and timers, and start a new generation.
    ///
    /// Returns the new generation and its cancellation token.
    pub fn reset_session(&mut self) -> (u64, CancellationToken) {
        self.cancel.cancel();
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.generation += 1;
        self.cancel = CancellationToken::new();
        (self.generation, self.cancel.clone())
    }
}

/// One registry entry
pub struct InstanceSlot {
    id: String,
    runtime: Mutex<InstanceRuntime>,
    view: watch::Sender<Instance>,
    readiness: AppStateReadiness,
}

impl InstanceSlot {
    fn new(instance: Instance) -> Self {
        let (view, _) = watch::channel(instance.clone());
        Self {
            id: instance.id().to_string(),
            runtime: Mutex::new(InstanceRuntime::new(instance)),
            view,
            readiness: AppStateReadiness::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Take the per-instance lock.
    pub async fn lock(&self) -> MutexGuard<'_, InstanceRuntime> {
        self.runtime.lock().await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Instance {
        self.view.borrow().clone()
    }

    /// Publish `instance` to readers.
    pub fn publish(&self, instance: &Instance) {
        self.view.send_replace(instance.clone());
    }

    pub fn subscribe(&self) -> watch::Receiver<Instance> {
        self.view.subscribe()
    }

    pub fn readiness(&self) -> &AppStateReadiness {
        &self.readiness
    }
}

/// Concurrency-safe set of live instances
#[derive(Default)]
pub struct InstanceRegistry {
    slots: RwLock<HashMap<String, Arc<InstanceSlot>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<InstanceSlot>> {
        self.slots.read().await.get(id).cloned()
    }

    /// Return the existing slot, or insert one built from `make`.
    ///
    /// When two callers race, the first insert wins and the other's
    /// instance is discarded.
    pub async fn get_or_insert_with(
        &self,
        id: &str,
        make: impl FnOnce() -> Instance,
    ) -> Arc<InstanceSlot> {
        let mut slots = self.slots.write().await;
        Arc::clone(
            slots
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(InstanceSlot::new(make()))),
        )
    }

    /// Return the existing slot, or insert one built by `load`.
    ///
    /// The registry write lock is held while `load` runs, so a slot removed
    /// concurrently is never replaced with state read before its removal.
    pub async fn get_or_load<F, Fut>(&self, id: &str, load: F) -> Arc<InstanceSlot>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Instance>,
    {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get(id) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(InstanceSlot::new(load().await));
        slots.insert(id.to_string(), Arc::clone(&slot));
        slot
    }

    /// Drop the slot for `id`. The caller holds the slot lock, has marked
    /// the runtime `removed` and is responsible for tearing down its session.
    pub async fn remove(&self, id: &str) -> Option<Arc<InstanceSlot>> {
        self.slots.write().await.remove(id)
    }

    #[cfg(test)]
    pub async fn contains(&self, id: &str) -> bool {
        self.slots.read().await.contains_key(id)
    }

    /// Sorted instance ids
    #[cfg(test)]
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.slots.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshots of every instance, sorted by id
    pub async fn snapshots(&self) -> Vec<Instance> {
        let mut all: Vec<_> = self
            .slots
            .read()
            .await
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceStatus;
    use crate::transport::{ConnectOptions, MockTransport, TransportAdapter};

    #[tokio::test]
    async fn test_get_or_insert_keeps_first() {
        let registry = InstanceRegistry::new();
        let first = registry
            .get_or_insert_with("inst-1", || Instance::new("inst-1"))
            .await;
        let second = registry
            .get_or_insert_with("inst-1", || panic!("must not build a second instance"))
            .await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.ids().await, vec!["inst-1"]);
    }

    #[tokio::test]
    async fn test_get_or_load_only_loads_missing() {
        let registry = InstanceRegistry::new();
        let loaded = registry
            .get_or_load("inst-1", || async { Instance::new("inst-1") })
            .await;
        let again = registry
            .get_or_load("inst-1", || async { Instance::new("replacement") })
            .await;
        assert!(Arc::ptr_eq(&loaded, &again));
        assert_eq!(again.snapshot().id(), "inst-1");
        assert!(registry.contains("inst-1").await);
    }

    #[tokio::test]
    async fn test_remove_and_ids() {
        let registry = InstanceRegistry::new();
        for id in ["b", "a", "c"] {
            registry.get_or_insert_with(id, || Instance::new(id)).await;
        }
        assert_eq!(registry.ids().await, vec!["a", "b", "c"]);

        assert!(registry.remove("b").await.is_some());
        assert!(registry.remove("b").await.is_none());
        assert!(!registry.contains("b").await);
        assert_eq!(registry.snapshots().await.len(), 2);
    }

    #[tokio::test]
    async fn test_publish_updates_view_and_subscribers() {
        let registry = InstanceRegistry::new();
        let slot = registry
            .get_or_insert_with("inst-1", || Instance::new("inst-1"))
            .await;
        let mut rx = slot.subscribe();

        {
            let mut runtime = slot.lock().await;
            runtime.instance.status = InstanceStatus::Connecting;
            slot.publish(&runtime.instance);
        }

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().status(), InstanceStatus::Connecting);
        assert_eq!(slot.snapshot().status(), InstanceStatus::Connecting);
    }

    #[tokio::test]
    async fn test_reset_session_closes_and_cancels() {
        let transport = MockTransport::new();
        let handle = transport
            .connect("inst-1", ConnectOptions::default())
            .await
            .unwrap();

        let mut runtime = InstanceRuntime::new(Instance::new("inst-1"));
        runtime.session = Some(handle.session);
        let old_token = runtime.cancel.clone();

        let (generation, token) = runtime.reset_session();
        assert_eq!(generation, 1);
        assert!(old_token.is_cancelled());
        assert!(!token.is_cancelled());
        assert!(runtime.session.is_none());
        assert!(!transport.is_open("inst-1"));
    }
}
