//! Explicit driver registry, built once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::config::UnitConfig;
use crate::error::{StoreError, StoreResult};
use crate::local::LocalFactory;
use crate::memory::MemoryFactory;
use crate::nfs::NfsFactory;
use crate::traits::{DriverFactory, StorageUnit, UnitContext};

/// Map from driver name to factory.
#[derive(Default)]
pub struct DriverRegistry {
    factories: BTreeMap<&'static str, Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `local`, `nfs`, and `memory` drivers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalFactory));
        registry.register(Arc::new(NfsFactory::default()));
        registry.register(Arc::new(MemoryFactory::default()));
        registry
    }

    /// Add a factory, replacing any previous one with the same name.
    pub fn register(&mut self, factory: Arc<dyn DriverFactory>) -> Option<Arc<dyn DriverFactory>> {
        self.factories.insert(factory.name(), factory)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DriverFactory>> {
        self.factories.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Validate `config` and initialize the unit with its driver.
    pub async fn init_unit(
        &self,
        ctx: UnitContext,
        config: &UnitConfig,
    ) -> StoreResult<Arc<dyn StorageUnit>> {
        config.validate()?;
        let name = config.driver.driver_name();
        let factory = self.get(name).ok_or_else(|| {
            StoreError::config(&config.name, format!("no driver registered as {name:?}"))
        })?;
        let unit = factory.init(ctx, config).await?;
        info!(unit = %unit.id(), role = %unit.role(), driver = name, "storage unit initialized");
        Ok(unit)
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}
