//! Service configuration file.
//!
//! ```toml
//! [metadata]
//! type = "file"
//! path = "/var/lib/cdn/metadata.json"
//!
//! [sync]
//! max_attempts = 5
//!
//! [[units]]
//! name = "buffer"
//! role = "buffer"
//! driver = { type = "local", root = "/var/lib/cdn/buffer" }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use cdn_store::UnitConfig;
use cdn_sync::SyncConfig;
use cdn_types::UnitRole;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CdnConfig {
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub units: Vec<UnitConfig>,
}

/// Backing store for item and binding records.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// JSON snapshot file. Single process only.
    File { path: PathBuf },
    /// Process-local; everything is lost on exit.
    Memory,
}

impl CdnConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::parse(&text).with_context(|| format!("in {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text).context("parsing config")?;
        config.validate()?;
        Ok(config)
    }

    /// Topology checks. Driver-level checks run again when units start.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.sync.validate()?;

        let mut names = HashSet::new();
        for unit in &self.units {
            if !names.insert(unit.name.clone()) {
                bail!("unit {} configured twice", unit.name);
            }
            unit.validate()?;
        }

        let buffers = self.units_with(UnitRole::Buffer).count();
        if buffers != 1 {
            bail!("exactly one buffer unit is required, found {buffers}");
        }
        let durable = self.units_with(UnitRole::Durable).count();
        if durable == 0 {
            bail!("at least one durable unit is required");
        }
        let policy = self.buffer().map(UnitConfig::buffer_policy).unwrap_or_default();
        let required = policy.required(durable);
        if required == 0 || required > durable {
            bail!("required_replicas must be between 1 and {durable}, got {required}");
        }
        Ok(())
    }

    pub fn buffer(&self) -> Option<&UnitConfig> {
        self.units_with(UnitRole::Buffer).next()
    }

    pub fn units_with(&self, role: UnitRole) -> impl Iterator<Item = &UnitConfig> {
        self.units.iter().filter(move |u| u.role == role)
    }
}
