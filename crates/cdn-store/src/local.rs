//! Local-disk driver over `tokio::fs`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error};

use cdn_crypto::ConvergentEncryption;
use cdn_meta::MetadataStore;
use cdn_types::{Item, ItemUnit, MonitoringStatusLine, UnitId, UnitRole};

use crate::config::{DriverConfig, UnitConfig};
use crate::error::{StoreError, StoreResult};
use crate::handle::{ItemReader, ItemWriter, READ_CHUNK};
use crate::layout;
use crate::pipeline::{open_reader, seal_writer};
use crate::traits::{bound_and_present, DriverFactory, StorageUnit, UnitContext, STATUS_TIMEOUT};

pub(crate) const DIR_MODE: u32 = 0o700;
pub(crate) const FILE_MODE: u32 = 0o640;

pub struct LocalDriver {
    id: UnitId,
    role: UnitRole,
    root: PathBuf,
    encryption: Option<ConvergentEncryption>,
    metadata: Arc<dyn MetadataStore>,
}

impl LocalDriver {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl std::fmt::Debug for LocalDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDriver")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("encrypted", &self.encryption.is_some())
            .finish()
    }
}

pub(crate) async fn create_dir_all(path: &Path, mode: u32) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path).await
}

pub(crate) async fn create_new_file(path: &Path, mode: u32) -> std::io::Result<File> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    opts.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    opts.open(path).await
}

#[async_trait]
impl StorageUnit for LocalDriver {
    fn id(&self) -> &UnitId {
        &self.id
    }

    fn role(&self) -> UnitRole {
        self.role
    }

    fn driver(&self) -> &'static str {
        "local"
    }

    async fn item_exists(&self, item: &Item) -> StoreResult<bool> {
        bound_and_present(self, self.metadata.as_ref(), item).await
    }

    async fn stat(&self, binding: &ItemUnit) -> StoreResult<Option<u64>> {
        let path = layout::object_path(&self.root, &binding.locator);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io("stat")(e)),
        }
    }

    async fn new_reader(&self, binding: &ItemUnit) -> StoreResult<Box<dyn ItemReader>> {
        let path = layout::object_path(&self.root, &binding.locator);
        let file = File::open(&path).await.map_err(StoreError::io("open"))?;
        debug!(unit = %self.id, locator = %binding.locator, "reader opened");
        open_reader(
            Box::new(LocalReader { file }),
            self.encryption.as_ref(),
            &binding.locator,
        )
    }

    async fn new_writer(&self, binding: &ItemUnit) -> StoreResult<Box<dyn ItemWriter>> {
        let shard = layout::shard_dir(&self.root, &binding.locator);
        create_dir_all(&shard, DIR_MODE)
            .await
            .map_err(StoreError::io("create shard directory"))?;
        let staging = shard.join(layout::staging_name(&binding.locator));
        let file = create_new_file(&staging, FILE_MODE)
            .await
            .map_err(StoreError::io("create staging file"))?;
        debug!(unit = %self.id, locator = %binding.locator, "writer opened");
        let raw = LocalWriter {
            file,
            staging,
            target: layout::object_path(&self.root, &binding.locator),
            written: 0,
        };
        seal_writer(Box::new(raw), self.encryption.as_ref(), &binding.locator)
    }

    async fn remove(&self, binding: &ItemUnit) -> StoreResult<()> {
        let path = layout::object_path(&self.root, &binding.locator);
        fs::remove_file(&path).await.map_err(StoreError::io("remove"))?;
        debug!(unit = %self.id, locator = %binding.locator, "object removed");
        Ok(())
    }

    async fn status(&self) -> Vec<MonitoringStatusLine> {
        let component = format!("unit/{}", self.id);
        let line = match tokio::time::timeout(STATUS_TIMEOUT, fs::metadata(&self.root)).await {
            Ok(Ok(meta)) if meta.is_dir() => {
                MonitoringStatusLine::ok(component, format!("reachable {}", self.root.display()))
            }
            Ok(Ok(_)) => MonitoringStatusLine::alert(
                component,
                format!("{} is not a directory", self.root.display()),
            ),
            Ok(Err(e)) => {
                MonitoringStatusLine::alert(component, format!("{}: {e}", self.root.display()))
            }
            Err(_) => MonitoringStatusLine::alert(component, "status probe timed out"),
        };
        vec![line]
    }
}

struct LocalReader {
    file: File,
}

#[async_trait]
impl ItemReader for LocalReader {
    async fn read_chunk(&mut self) -> StoreResult<Option<Bytes>> {
        let mut buf = vec![0u8; READ_CHUNK];
        let n = self.file.read(&mut buf).await.map_err(StoreError::io("read"))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

struct LocalWriter {
    file: File,
    staging: PathBuf,
    target: PathBuf,
    written: u64,
}

impl LocalWriter {
    async fn discard(staging: &Path) {
        match fs::remove_file(staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!(path = %staging.display(), error = %e, "unable to remove staging file"),
        }
    }
}

#[async_trait]
impl ItemWriter for LocalWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> StoreResult<()> {
        self.file
            .write_all(data)
            .await
            .map_err(StoreError::io("write"))?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn close(self: Box<Self>) -> StoreResult<u64> {
        let Self {
            mut file,
            staging,
            target,
            written,
        } = *self;
        let flushed = match file.flush().await {
            Ok(()) => file.sync_all().await,
            Err(e) => Err(e),
        };
        drop(file);
        if let Err(e) = flushed {
            Self::discard(&staging).await;
            return Err(StoreError::ResourceRelease {
                step: "file",
                source: Box::new(StoreError::io("flush")(e)),
            });
        }
        if let Err(e) = fs::rename(&staging, &target).await {
            Self::discard(&staging).await;
            return Err(StoreError::io("publish")(e));
        }
        Ok(written)
    }

    async fn abort(self: Box<Self>) -> StoreResult<()> {
        let Self { file, staging, .. } = *self;
        drop(file);
        Self::discard(&staging).await;
        Ok(())
    }
}

/// Factory for [`LocalDriver`].
#[derive(Debug, Default)]
pub struct LocalFactory;

#[async_trait]
impl DriverFactory for LocalFactory {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn init(
        &self,
        ctx: UnitContext,
        config: &UnitConfig,
    ) -> StoreResult<Arc<dyn StorageUnit>> {
        let DriverConfig::Local(local) = &config.driver else {
            return Err(StoreError::config(
                &config.name,
                format!("local driver given {} configuration", config.driver.driver_name()),
            ));
        };
        let encryption = config.encryption()?;
        create_dir_all(&local.root, DIR_MODE)
            .await
            .map_err(|e| StoreError::config(&config.name, format!("{}: {e}", local.root.display())))?;
        Ok(Arc::new(LocalDriver {
            id: config.name.clone(),
            role: config.role,
            root: local.root.clone(),
            encryption,
            metadata: ctx.metadata,
        }))
    }
}
