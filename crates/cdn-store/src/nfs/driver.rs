use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error};

use cdn_crypto::ConvergentEncryption;
use cdn_meta::MetadataStore;
use cdn_types::{Item, ItemUnit, Locator, MonitoringStatusLine, UnitId, UnitRole};

use crate::config::{DriverConfig, NfsConfig, UnitConfig};
use crate::error::{StoreError, StoreResult};
use crate::handle::{ItemReader, ItemWriter, ReleaseChain, READ_CHUNK};
use crate::layout;
use crate::local::{DIR_MODE, FILE_MODE};
use crate::nfs::net::RpcDialer;
use crate::nfs::session::{AuthUnix, Mount, MountDialer, RemoteFile, Target};
use crate::pipeline::{open_reader, seal_writer};
use crate::traits::{bound_and_present, DriverFactory, StorageUnit, UnitContext, STATUS_TIMEOUT};

/// A connection plus a mounted export, owned by exactly one handle or
/// operation.
struct Session {
    mount: Box<dyn Mount>,
    target: Box<dyn Target>,
}

impl Session {
    async fn close(self, chain: &mut ReleaseChain) {
        chain.step("target", self.target.close().await);
        chain.step("mount", self.mount.close().await);
    }
}

pub struct NfsDriver {
    id: UnitId,
    role: UnitRole,
    config: NfsConfig,
    auth: AuthUnix,
    dialer: Arc<dyn MountDialer>,
    encryption: Option<ConvergentEncryption>,
    metadata: Arc<dyn MetadataStore>,
}

impl std::fmt::Debug for NfsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfsDriver")
            .field("id", &self.id)
            .field("host", &self.config.host)
            .field("export", &self.config.export)
            .field("sub_path", &self.config.sub_path)
            .field("encrypted", &self.encryption.is_some())
            .finish()
    }
}

impl NfsDriver {
    async fn connect(&self) -> StoreResult<Session> {
        let mut mount = self.dialer.dial(&self.config.host).await?;
        match mount.mount(&self.config.export, &self.auth).await {
            Ok(target) => Ok(Session { mount, target }),
            Err(e) => {
                if let Err(close_err) = mount.close().await {
                    error!(unit = %self.id, error = %close_err, "unable to close connection after failed mount");
                }
                Err(e)
            }
        }
    }

    /// Release a short-lived session, keeping the operation's own error first.
    async fn finish<T>(&self, session: Session, result: StoreResult<T>) -> StoreResult<T> {
        let mut chain = ReleaseChain::new("session");
        session.close(&mut chain).await;
        let value = result?;
        chain.finish()?;
        Ok(value)
    }

    fn key(&self, locator: &Locator) -> String {
        layout::object_key(&self.config.sub_path, locator)
    }

    /// Create `path` one level at a time; existing levels are fine.
    async fn ensure_dirs(target: &dyn Target, path: &str) -> StoreResult<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            match target.mkdir(&current, DIR_MODE).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageUnit for NfsDriver {
    fn id(&self) -> &UnitId {
        &self.id
    }

    fn role(&self) -> UnitRole {
        self.role
    }

    fn driver(&self) -> &'static str {
        "nfs"
    }

    async fn item_exists(&self, item: &Item) -> StoreResult<bool> {
        bound_and_present(self, self.metadata.as_ref(), item).await
    }

    async fn stat(&self, binding: &ItemUnit) -> StoreResult<Option<u64>> {
        let session = self.connect().await?;
        let result = session.target.lookup(&self.key(&binding.locator)).await;
        let attr = self.finish(session, result).await?;
        Ok(attr.filter(|a| !a.is_dir).map(|a| a.size))
    }

    async fn new_reader(&self, binding: &ItemUnit) -> StoreResult<Box<dyn ItemReader>> {
        let session = self.connect().await?;
        let file = match session.target.open(&self.key(&binding.locator)).await {
            Ok(file) => file,
            Err(e) => return self.finish(session, Err(e)).await,
        };
        debug!(unit = %self.id, locator = %binding.locator, "reader opened");
        open_reader(
            Box::new(NfsReader { file, session }),
            self.encryption.as_ref(),
            &binding.locator,
        )
    }

    async fn new_writer(&self, binding: &ItemUnit) -> StoreResult<Box<dyn ItemWriter>> {
        let session = self.connect().await?;
        let shard = layout::shard_key(&self.config.sub_path, &binding.locator);
        if let Err(e) = Self::ensure_dirs(session.target.as_ref(), &shard).await {
            return self.finish(session, Err(e)).await;
        }
        let staging = format!("{shard}/{}", layout::staging_name(&binding.locator));
        let file = match session.target.create(&staging, FILE_MODE).await {
            Ok(file) => file,
            Err(e) => return self.finish(session, Err(e)).await,
        };
        debug!(unit = %self.id, locator = %binding.locator, "writer opened");
        let raw = NfsWriter {
            file,
            session,
            staging,
            key: self.key(&binding.locator),
            written: 0,
        };
        seal_writer(Box::new(raw), self.encryption.as_ref(), &binding.locator)
    }

    async fn remove(&self, binding: &ItemUnit) -> StoreResult<()> {
        let session = self.connect().await?;
        let result = session.target.remove(&self.key(&binding.locator)).await;
        self.finish(session, result).await?;
        debug!(unit = %self.id, locator = %binding.locator, "object removed");
        Ok(())
    }

    async fn status(&self) -> Vec<MonitoringStatusLine> {
        let component = format!("unit/{}", self.id);
        let location = format!(
            "{}:{}/{}",
            self.config.host, self.config.export, self.config.sub_path
        );
        let probe = async {
            let session = self.connect().await?;
            let result = session.target.lookup(&self.config.sub_path).await;
            self.finish(session, result).await
        };
        let line = match tokio::time::timeout(STATUS_TIMEOUT, probe).await {
            Ok(Ok(Some(attr))) if attr.is_dir => {
                MonitoringStatusLine::ok(component, format!("reachable {location}"))
            }
            Ok(Ok(_)) => MonitoringStatusLine::alert(component, format!("{location} missing")),
            Ok(Err(e)) => MonitoringStatusLine::alert(component, format!("{location}: {e}")),
            Err(_) => MonitoringStatusLine::alert(component, format!("{location}: probe timed out")),
        };
        vec![line]
    }
}

struct NfsReader {
    file: Box<dyn RemoteFile>,
    session: Session,
}

#[async_trait]
impl ItemReader for NfsReader {
    async fn read_chunk(&mut self) -> StoreResult<Option<Bytes>> {
        let chunk = self.file.read(READ_CHUNK).await?;
        Ok((!chunk.is_empty()).then_some(chunk))
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        let Self { file, session } = *self;
        let mut chain = ReleaseChain::new("reader");
        chain.step("file", file.close().await);
        session.close(&mut chain).await;
        chain.finish()
    }
}

struct NfsWriter {
    file: Box<dyn RemoteFile>,
    session: Session,
    staging: String,
    key: String,
    written: u64,
}

impl NfsWriter {
    async fn discard(target: &dyn Target, staging: &str) {
        match target.remove(staging).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => error!(path = %staging, error = %e, "unable to remove staging file"),
        }
    }
}

#[async_trait]
impl ItemWriter for NfsWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> StoreResult<()> {
        self.file.write(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn close(self: Box<Self>) -> StoreResult<u64> {
        let Self {
            file,
            session,
            staging,
            key,
            written,
        } = *self;
        let mut chain = ReleaseChain::new("writer");
        chain.step("file", file.close().await);
        if chain.is_clean() {
            if let Err(e) = session.target.rename(&staging, &key).await {
                chain.fail(e);
            }
        }
        if !chain.is_clean() {
            Self::discard(session.target.as_ref(), &staging).await;
        }
        session.close(&mut chain).await;
        chain.finish().map(|()| written)
    }

    async fn abort(self: Box<Self>) -> StoreResult<()> {
        let Self {
            file,
            session,
            staging,
            ..
        } = *self;
        let mut chain = ReleaseChain::new("writer");
        chain.step("file", file.close().await);
        Self::discard(session.target.as_ref(), &staging).await;
        session.close(&mut chain).await;
        chain.finish()
    }
}

/// Factory for [`NfsDriver`], holding the dialer its units connect with.
#[derive(Clone)]
pub struct NfsFactory {
    dialer: Arc<dyn MountDialer>,
}

impl NfsFactory {
    pub fn new(dialer: Arc<dyn MountDialer>) -> Self {
        Self { dialer }
    }
}

impl Default for NfsFactory {
    fn default() -> Self {
        Self::new(Arc::new(RpcDialer::default()))
    }
}

#[async_trait]
impl DriverFactory for NfsFactory {
    fn name(&self) -> &'static str {
        "nfs"
    }

    async fn init(
        &self,
        ctx: UnitContext,
        config: &UnitConfig,
    ) -> StoreResult<Arc<dyn StorageUnit>> {
        let DriverConfig::Nfs(nfs) = &config.driver else {
            return Err(StoreError::config(
                &config.name,
                format!("nfs driver given {} configuration", config.driver.driver_name()),
            ));
        };
        let driver = NfsDriver {
            id: config.name.clone(),
            role: config.role,
            auth: AuthUnix {
                machine_name: nfs.machine_name.clone(),
                uid: nfs.uid,
                gid: nfs.gid,
            },
            config: nfs.clone(),
            dialer: self.dialer.clone(),
            encryption: config.encryption()?,
            metadata: ctx.metadata,
        };

        let session = driver.connect().await?;
        let result = NfsDriver::ensure_dirs(session.target.as_ref(), &nfs.sub_path).await;
        driver.finish(session, result).await?;
        Ok(Arc::new(driver))
    }
}
