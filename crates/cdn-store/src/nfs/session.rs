use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreResult;

/// AUTH_UNIX credentials presented when mounting an export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUnix {
    pub machine_name: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub size: u64,
    pub is_dir: bool,
}

/// Opens connections to a file server.
#[async_trait]
pub trait MountDialer: Send + Sync {
    async fn dial(&self, host: &str) -> StoreResult<Box<dyn Mount>>;
}

/// One connection to a file server.
#[async_trait]
pub trait Mount: Send {
    async fn mount(&mut self, export: &str, auth: &AuthUnix) -> StoreResult<Box<dyn Target>>;

    async fn close(self: Box<Self>) -> StoreResult<()>;
}

/// A mounted export. Paths are `/`-separated and relative to the export root.
#[async_trait]
pub trait Target: Send + Sync {
    /// Create one directory level. An existing directory is reported as an
    /// I/O error of kind `AlreadyExists`.
    async fn mkdir(&self, path: &str, mode: u32) -> StoreResult<()>;

    /// Attributes of `path`, or `None` if it does not exist.
    async fn lookup(&self, path: &str) -> StoreResult<Option<FileAttr>>;

    async fn open(&self, path: &str) -> StoreResult<Box<dyn RemoteFile>>;

    /// Create a new file. Fails if `path` exists.
    async fn create(&self, path: &str, mode: u32) -> StoreResult<Box<dyn RemoteFile>>;

    async fn rename(&self, from: &str, to: &str) -> StoreResult<()>;

    async fn remove(&self, path: &str) -> StoreResult<()>;

    /// Unmount.
    async fn close(self: Box<Self>) -> StoreResult<()>;
}

/// An open file on a mounted export.
#[async_trait]
pub trait RemoteFile: Send {
    /// Up to `max` bytes; empty at end of file.
    async fn read(&mut self, max: usize) -> StoreResult<Bytes>;

    async fn write(&mut self, data: &[u8]) -> StoreResult<()>;

    /// Flush and release the file.
    async fn close(self: Box<Self>) -> StoreResult<()>;
}
