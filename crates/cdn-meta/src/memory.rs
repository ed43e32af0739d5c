//! In-memory metadata store for testing and embedding.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use cdn_types::{Clock, Item, ItemId, ItemUnit, SystemClock, UnitId};

use crate::error::MetaResult;
use crate::state::MetadataState;
use crate::traits::MetadataStore;
use crate::types::SyncFailure;

/// An in-memory implementation of [`MetadataStore`].
///
/// All state lives behind one `Mutex`, so every operation (lease claims in
/// particular) is atomic. Lease expiry is evaluated against the injected
/// [`Clock`].
pub struct InMemoryMetadataStore {
    state: Mutex<MetadataState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryMetadataStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MetadataState::default()),
            clock,
        }
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMetadataStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn put_item(&self, item: &Item) -> MetaResult<()> {
        self.state.lock().expect("lock poisoned").put_item(item)
    }

    async fn remove_incoming_item(&self, id: ItemId) -> MetaResult<bool> {
        Ok(self.state.lock().expect("lock poisoned").remove_incoming_item(id))
    }

    async fn get_item(&self, id: ItemId) -> MetaResult<Option<Item>> {
        Ok(self.state.lock().expect("lock poisoned").get_item(id))
    }

    async fn lookup_binding(&self, item: ItemId, unit: &UnitId) -> MetaResult<Option<ItemUnit>> {
        Ok(self.state.lock().expect("lock poisoned").lookup_binding(item, unit))
    }

    async fn insert_binding(&self, binding: &ItemUnit) -> MetaResult<()> {
        self.state.lock().expect("lock poisoned").insert_binding(binding)
    }

    async fn remove_binding(&self, item: ItemId, unit: &UnitId) -> MetaResult<bool> {
        Ok(self.state.lock().expect("lock poisoned").remove_binding(item, unit))
    }

    async fn bindings_for_item(&self, item: ItemId) -> MetaResult<Vec<ItemUnit>> {
        Ok(self.state.lock().expect("lock poisoned").bindings_for_item(item))
    }

    async fn items_in_unit(&self, unit: &UnitId) -> MetaResult<Vec<ItemId>> {
        Ok(self.state.lock().expect("lock poisoned").items_in_unit(unit))
    }

    async fn items_missing_from(
        &self,
        source: &UnitId,
        target: &UnitId,
    ) -> MetaResult<Vec<ItemId>> {
        Ok(self
            .state
            .lock()
            .expect("lock poisoned")
            .items_missing_from(source, target))
    }

    async fn acquire_lease(
        &self,
        item: ItemId,
        unit: &UnitId,
        owner: &str,
        ttl: Duration,
    ) -> MetaResult<bool> {
        let now = self.clock.now();
        Ok(self
            .state
            .lock()
            .expect("lock poisoned")
            .acquire_lease(item, unit, owner, ttl, now))
    }

    async fn release_lease(&self, item: ItemId, unit: &UnitId, owner: &str) -> MetaResult<()> {
        self.state
            .lock()
            .expect("lock poisoned")
            .release_lease(item, unit, owner);
        Ok(())
    }

    async fn record_failure(
        &self,
        item: ItemId,
        unit: &UnitId,
        reason: &str,
        max_attempts: u32,
        fatal: bool,
    ) -> MetaResult<SyncFailure> {
        let now = self.clock.now();
        Ok(self
            .state
            .lock()
            .expect("lock poisoned")
            .record_failure(item, unit, reason, max_attempts, fatal, now))
    }

    async fn failure(&self, item: ItemId, unit: &UnitId) -> MetaResult<Option<SyncFailure>> {
        Ok(self.state.lock().expect("lock poisoned").failure(item, unit))
    }

    async fn clear_failure(&self, item: ItemId, unit: &UnitId) -> MetaResult<bool> {
        Ok(self.state.lock().expect("lock poisoned").clear_failure(item, unit))
    }

    async fn failures(&self) -> MetaResult<Vec<SyncFailure>> {
        Ok(self.state.lock().expect("lock poisoned").failures())
    }
}
