//! Per-unit configuration, deserialized from the `[[units]]` tables of the
//! service configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cdn_crypto::{ConvergentEncryption, Secret};
use cdn_types::{UnitId, UnitRole};

use crate::error::{StoreError, StoreResult};
use crate::layout;

/// Default grace period before a replicated buffer copy may be evicted.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 3600;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnitConfig {
    pub name: UnitId,
    pub role: UnitRole,
    pub driver: DriverConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionConfig>,
    /// Eviction policy. Only meaningful on the buffer unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferPolicy>,
}

/// Driver-specific settings, tagged by driver name.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DriverConfig {
    Local(LocalConfig),
    Nfs(NfsConfig),
    Memory(MemoryConfig),
}

impl DriverConfig {
    /// Registry key of the driver this configuration is for.
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Nfs(_) => "nfs",
            Self::Memory(_) => "memory",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalConfig {
    pub root: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NfsConfig {
    /// Server to dial. Its meaning is up to the configured dialer.
    pub host: String,
    /// Export (target partition) to mount.
    pub export: String,
    /// Root subpath inside the export. Relative, no `..`.
    #[serde(default)]
    pub sub_path: String,
    #[serde(default = "default_machine_name")]
    pub machine_name: String,
    pub uid: u32,
    pub gid: u32,
}

fn default_machine_name() -> String {
    "cdn-storage".to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Units naming the same bucket share one keyspace.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
}

fn default_bucket() -> String {
    "default".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub secret: SecretRef,
}

/// Where an encryption secret comes from.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretRef {
    /// Hex-encoded secret stored in the configuration file.
    Inline(String),
    /// Name of an environment variable holding the hex-encoded secret.
    Env(String),
}

impl std::fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline(_) => write!(f, "Inline([REDACTED])"),
            Self::Env(var) => f.debug_tuple("Env").field(var).finish(),
        }
    }
}

impl SecretRef {
    pub fn resolve(&self, unit: &UnitId) -> StoreResult<Secret> {
        let hex = match self {
            Self::Inline(hex) => hex.clone(),
            Self::Env(var) => std::env::var(var).map_err(|e| {
                StoreError::config(unit, format!("secret variable {var}: {e}"))
            })?,
        };
        Secret::from_hex(&hex).map_err(|e| StoreError::config(unit, e.to_string()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BufferPolicy {
    /// Durable copies needed before eviction. `None` means every durable unit.
    #[serde(default)]
    pub required_replicas: Option<usize>,
    #[serde(default = "default_grace")]
    pub grace_period_secs: u64,
}

fn default_grace() -> u64 {
    DEFAULT_GRACE_PERIOD_SECS
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            required_replicas: None,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
        }
    }
}

impl BufferPolicy {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Required durable copies given `durable_units` configured targets.
    pub fn required(&self, durable_units: usize) -> usize {
        self.required_replicas.unwrap_or(durable_units)
    }
}

impl UnitConfig {
    /// Checks that do not depend on which driver is registered.
    pub fn validate(&self) -> StoreResult<()> {
        if self.buffer.is_some() && self.role != UnitRole::Buffer {
            return Err(StoreError::config(
                &self.name,
                "buffer policy is only valid on the buffer unit",
            ));
        }
        match &self.driver {
            DriverConfig::Local(c) if c.root.as_os_str().is_empty() => {
                Err(StoreError::config(&self.name, "local root must not be empty"))
            }
            DriverConfig::Nfs(c) if c.host.trim().is_empty() => {
                Err(StoreError::config(&self.name, "nfs host must not be empty"))
            }
            DriverConfig::Nfs(c) if c.export.trim().is_empty() => {
                Err(StoreError::config(&self.name, "nfs export must not be empty"))
            }
            DriverConfig::Nfs(c) if !layout::is_contained(&c.sub_path) => Err(StoreError::config(
                &self.name,
                format!("nfs sub_path {:?} escapes the export", c.sub_path),
            )),
            DriverConfig::Memory(c) if !layout::is_contained(&c.prefix) => Err(StoreError::config(
                &self.name,
                format!("memory prefix {:?} escapes the bucket", c.prefix),
            )),
            _ => Ok(()),
        }
    }

    /// Resolve the configured secret into an encryption component.
    pub fn encryption(&self) -> StoreResult<Option<ConvergentEncryption>> {
        self.encryption
            .as_ref()
            .map(|e| e.secret.resolve(&self.name).map(ConvergentEncryption::new))
            .transpose()
    }

    /// Eviction policy; the default when the buffer unit names none.
    pub fn buffer_policy(&self) -> BufferPolicy {
        self.buffer.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const SECRET: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn parse(s: &str) -> UnitConfig {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn parses_nfs_unit() {
        let cfg = parse(&format!(
            r#"
            name = "nfs-a"
            role = "durable"
            [driver]
            type = "nfs"
            host = "/mnt/filer1"
            export = "exports/cdn"
            sub_path = "blobs"
            uid = 1000
            gid = 1000
            [encryption]
            secret = {{ inline = "{SECRET}" }}
            "#
        ));
        assert_eq!(cfg.name.as_str(), "nfs-a");
        assert_eq!(cfg.driver.driver_name(), "nfs");
        match &cfg.driver {
            DriverConfig::Nfs(n) => {
                assert_eq!(n.machine_name, "cdn-storage");
                assert_eq!(n.sub_path, "blobs");
            }
            other => panic!("unexpected driver {other:?}"),
        }
        cfg.validate().unwrap();
        assert!(cfg.encryption().unwrap().is_some());
    }

    #[test]
    fn parses_buffer_unit_with_policy() {
        let cfg = parse(
            r#"
            name = "buffer"
            role = "buffer"
            [driver]
            type = "local"
            root = "/var/lib/cdn/buffer"
            [buffer]
            required_replicas = 1
            "#,
        );
        cfg.validate().unwrap();
        let policy = cfg.buffer_policy();
        assert_eq!(policy.required(3), 1);
        assert_eq!(policy.grace_period(), Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS));
        assert!(cfg.encryption().unwrap().is_none());
    }

    #[test]
    fn policy_on_durable_unit_is_rejected() {
        let cfg = parse(
            r#"
            name = "disk"
            role = "durable"
            [driver]
            type = "memory"
            [buffer]
            grace_period_secs = 5
            "#,
        );
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn escaping_sub_path_is_rejected() {
        let cfg = parse(
            r#"
            name = "nfs"
            role = "durable"
            [driver]
            type = "nfs"
            host = "h"
            export = "e"
            sub_path = "../etc"
            uid = 0
            gid = 0
            "#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn short_or_missing_secret_is_configuration_error() {
        let unit = UnitId::new("u").unwrap();
        let short = SecretRef::Inline("abcd".into());
        assert_eq!(short.resolve(&unit).unwrap_err().kind(), ErrorKind::Configuration);
        let missing = SecretRef::Env("CDN_TEST_SECRET_THAT_IS_NOT_SET".into());
        assert_eq!(missing.resolve(&unit).unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn default_policy_requires_every_durable_unit() {
        assert_eq!(BufferPolicy::default().required(2), 2);
    }

    #[test]
    fn inline_secret_is_redacted_in_debug() {
        let s = SecretRef::Inline(SECRET.into());
        assert!(!format!("{s:?}").contains("0001"));
    }
}
