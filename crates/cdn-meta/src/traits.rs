//! The [`MetadataStore`] trait: everything the storage core needs from
//! persistence.

use std::time::Duration;

use async_trait::async_trait;

use cdn_types::{Item, ItemId, ItemUnit, UnitId};

use crate::error::MetaResult;
use crate::types::SyncFailure;

/// Lookup and binding service for items and their physical copies.
///
/// Implementations must be thread-safe and make each operation atomic. In
/// particular `acquire_lease` must be a single conditional write, never a
/// read followed by a separate write.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Register or update an item. A finalized item cannot be changed.
    async fn put_item(&self, item: &Item) -> MetaResult<()>;

    /// Delete an item that was never finalized. Returns `true` if it was
    /// removed; finalized items are left untouched.
    async fn remove_incoming_item(&self, id: ItemId) -> MetaResult<bool>;

    /// Read an item. Returns `Ok(None)` if it was never registered.
    async fn get_item(&self, id: ItemId) -> MetaResult<Option<Item>>;

    /// The binding of `item` on `unit`, if any.
    async fn lookup_binding(&self, item: ItemId, unit: &UnitId) -> MetaResult<Option<ItemUnit>>;

    /// Persist a binding. Fails with `BindingExists` if the pair is bound.
    async fn insert_binding(&self, binding: &ItemUnit) -> MetaResult<()>;

    /// Delete a binding. Returns `true` if it existed.
    async fn remove_binding(&self, item: ItemId, unit: &UnitId) -> MetaResult<bool>;

    /// Every binding of `item`, across all units.
    async fn bindings_for_item(&self, item: ItemId) -> MetaResult<Vec<ItemUnit>>;

    /// Items bound on `unit`, ordered by item ID.
    async fn items_in_unit(&self, unit: &UnitId) -> MetaResult<Vec<ItemId>>;

    /// Items bound on `source` that have no binding on `target`, ordered by
    /// item ID.
    async fn items_missing_from(&self, source: &UnitId, target: &UnitId)
        -> MetaResult<Vec<ItemId>>;

    /// Claim the (item, unit) lease for `owner` if it is free or expired.
    ///
    /// Returns `false` when another owner holds an unexpired lease.
    /// Re-acquiring a lease already held by `owner` extends it.
    async fn acquire_lease(
        &self,
        item: ItemId,
        unit: &UnitId,
        owner: &str,
        ttl: Duration,
    ) -> MetaResult<bool>;

    /// Release the lease if `owner` holds it; otherwise a no-op.
    async fn release_lease(&self, item: ItemId, unit: &UnitId, owner: &str) -> MetaResult<()>;

    /// Record a failed attempt and return the updated record.
    ///
    /// The record is flagged `needs_attention` when `fatal` is set or the
    /// attempt count reaches `max_attempts`.
    async fn record_failure(
        &self,
        item: ItemId,
        unit: &UnitId,
        reason: &str,
        max_attempts: u32,
        fatal: bool,
    ) -> MetaResult<SyncFailure>;

    /// The failure record for (item, unit), if any.
    async fn failure(&self, item: ItemId, unit: &UnitId) -> MetaResult<Option<SyncFailure>>;

    /// Delete a failure record. Returns `true` if it existed.
    async fn clear_failure(&self, item: ItemId, unit: &UnitId) -> MetaResult<bool>;

    /// All failure records, ordered by (item, unit).
    async fn failures(&self) -> MetaResult<Vec<SyncFailure>>;
}
