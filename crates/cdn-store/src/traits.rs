use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use cdn_meta::MetadataStore;
use cdn_types::{Item, ItemUnit, MonitoringStatusLine, UnitId, UnitRole};

use crate::config::UnitConfig;
use crate::error::StoreResult;
use crate::handle::{ItemReader, ItemWriter};

/// Upper bound on a single driver health probe.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// One configured storage backend.
///
/// Every driver lays objects out as `<root>/<first 3 chars>/<locator>` and
/// opens a fresh session for each handle it returns. Handles must be closed
/// (or aborted) by the caller.
#[async_trait]
pub trait StorageUnit: Send + Sync {
    fn id(&self) -> &UnitId;

    fn role(&self) -> UnitRole;

    /// Registry key of the driver behind this unit.
    fn driver(&self) -> &'static str;

    /// True only when the metadata store holds a binding for `item` on this
    /// unit and the physical object is present.
    async fn item_exists(&self, item: &Item) -> StoreResult<bool>;

    /// Physical size of the bound object, ignoring metadata.
    async fn stat(&self, binding: &ItemUnit) -> StoreResult<Option<u64>>;

    async fn new_reader(&self, binding: &ItemUnit) -> StoreResult<Box<dyn ItemReader>>;

    async fn new_writer(&self, binding: &ItemUnit) -> StoreResult<Box<dyn ItemWriter>>;

    /// Delete the physical object. A missing object is `NotFound`.
    async fn remove(&self, binding: &ItemUnit) -> StoreResult<()>;

    /// Best-effort health lines. Must not block indefinitely.
    async fn status(&self) -> Vec<MonitoringStatusLine>;
}

/// Shared services handed to every driver at init.
#[derive(Clone)]
pub struct UnitContext {
    pub metadata: Arc<dyn MetadataStore>,
}

impl UnitContext {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }
}

/// Builds a storage unit from its configuration.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Key matched against [`DriverConfig::driver_name`](crate::DriverConfig::driver_name).
    fn name(&self) -> &'static str;

    /// Validate the configuration shape, resolve secrets, and perform
    /// one-time setup such as creating the root subpath.
    async fn init(&self, ctx: UnitContext, config: &UnitConfig)
        -> StoreResult<Arc<dyn StorageUnit>>;
}

/// Two-phase existence check shared by every driver: metadata first, then
/// the physical object.
pub async fn bound_and_present(
    unit: &dyn StorageUnit,
    metadata: &dyn MetadataStore,
    item: &Item,
) -> StoreResult<bool> {
    let Some(binding) = metadata.lookup_binding(item.id(), unit.id()).await? else {
        return Ok(false);
    };
    match unit.stat(&binding).await? {
        Some(_) => Ok(true),
        None => {
            warn!(
                unit = %unit.id(),
                item = %item.id(),
                locator = %binding.locator,
                "binding present but object missing"
            );
            Ok(false)
        }
    }
}
