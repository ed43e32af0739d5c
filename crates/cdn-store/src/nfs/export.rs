use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::local::create_new_file;
use crate::nfs::session::{AuthUnix, FileAttr, Mount, MountDialer, RemoteFile, Target};

/// Dialer for servers whose exports are reachable as local directories.
///
/// `host` is resolved under `base` and each export under the host
/// directory, so with the default base of `/` a unit configured with
/// `host = "/mnt/filer1"` and `export = "cdn"` works in `/mnt/filer1/cdn`.
#[derive(Clone, Debug)]
pub struct ExportDialer {
    base: PathBuf,
}

impl ExportDialer {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl Default for ExportDialer {
    fn default() -> Self {
        Self::new("/")
    }
}

fn unreachable(op: &'static str, what: String) -> StoreError {
    StoreError::Io {
        op,
        source: io::Error::new(io::ErrorKind::ConnectionRefused, what),
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

#[async_trait]
impl MountDialer for ExportDialer {
    async fn dial(&self, host: &str) -> StoreResult<Box<dyn Mount>> {
        let host_dir = self.base.join(host.trim_start_matches('/'));
        if !is_dir(&host_dir).await {
            return Err(unreachable("dial", format!("{} not reachable", host_dir.display())));
        }
        Ok(Box::new(ExportMount { host_dir }))
    }
}

struct ExportMount {
    host_dir: PathBuf,
}

#[async_trait]
impl Mount for ExportMount {
    async fn mount(&mut self, export: &str, auth: &AuthUnix) -> StoreResult<Box<dyn Target>> {
        let root = self.host_dir.join(export.trim_start_matches('/'));
        if !is_dir(&root).await {
            return Err(unreachable("mount", format!("export {} not available", root.display())));
        }
        debug!(
            export = %root.display(),
            machine = %auth.machine_name,
            uid = auth.uid,
            gid = auth.gid,
            "export mounted"
        );
        Ok(Box::new(ExportTarget { root }))
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

struct ExportTarget {
    root: PathBuf,
}

impl ExportTarget {
    fn resolve(&self, path: &str) -> PathBuf {
        let mut out = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            out.push(part);
        }
        out
    }
}

#[async_trait]
impl Target for ExportTarget {
    async fn mkdir(&self, path: &str, mode: u32) -> StoreResult<()> {
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;
        builder
            .create(self.resolve(path))
            .await
            .map_err(StoreError::io("mkdir"))
    }

    async fn lookup(&self, path: &str) -> StoreResult<Option<FileAttr>> {
        match fs::metadata(self.resolve(path)).await {
            Ok(meta) => Ok(Some(FileAttr {
                size: meta.len(),
                is_dir: meta.is_dir(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io("lookup")(e)),
        }
    }

    async fn open(&self, path: &str) -> StoreResult<Box<dyn RemoteFile>> {
        let file = File::open(self.resolve(path))
            .await
            .map_err(StoreError::io("open"))?;
        Ok(Box::new(ExportFile {
            file,
            writable: false,
        }))
    }

    async fn create(&self, path: &str, mode: u32) -> StoreResult<Box<dyn RemoteFile>> {
        let file = create_new_file(&self.resolve(path), mode)
            .await
            .map_err(StoreError::io("create"))?;
        Ok(Box::new(ExportFile {
            file,
            writable: true,
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        fs::rename(self.resolve(from), self.resolve(to))
            .await
            .map_err(StoreError::io("rename"))
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        fs::remove_file(self.resolve(path))
            .await
            .map_err(StoreError::io("remove"))
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

struct ExportFile {
    file: File,
    writable: bool,
}

#[async_trait]
impl RemoteFile for ExportFile {
    async fn read(&mut self, max: usize) -> StoreResult<Bytes> {
        let mut buf = vec![0u8; max];
        let n = self.file.read(&mut buf).await.map_err(StoreError::io("read"))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write(&mut self, data: &[u8]) -> StoreResult<()> {
        self.file.write_all(data).await.map_err(StoreError::io("write"))
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        let Self { mut file, writable } = *self;
        if writable {
            file.flush().await.map_err(StoreError::io("flush"))?;
            file.sync_all().await.map_err(StoreError::io("sync"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn auth() -> AuthUnix {
        AuthUnix {
            machine_name: "test".into(),
            uid: 1000,
            gid: 1000,
        }
    }

    #[tokio::test]
    async fn dial_unknown_host_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExportDialer::new(dir.path()).dial("nowhere").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
    }

    #[tokio::test]
    async fn mount_missing_export_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("filer")).unwrap();
        let mut mount = ExportDialer::new(dir.path()).dial("filer").await.unwrap();
        let err = mount.mount("exports", &auth()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
    }

    #[tokio::test]
    async fn target_operations_work_inside_export() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("filer/exports")).unwrap();
        let mut mount = ExportDialer::new(dir.path()).dial("/filer").await.unwrap();
        let target = mount.mount("/exports", &auth()).await.unwrap();

        target.mkdir("abc", 0o700).await.unwrap();
        assert!(target.mkdir("abc", 0o700).await.unwrap_err().is_already_exists());

        let mut f = target.create("abc/tmp", 0o640).await.unwrap();
        f.write(b"hello").await.unwrap();
        f.close().await.unwrap();
        target.rename("abc/tmp", "abc/abcdef").await.unwrap();

        let attr = target.lookup("abc/abcdef").await.unwrap().unwrap();
        assert_eq!(attr, FileAttr { size: 5, is_dir: false });
        assert!(target.lookup("abc/tmp").await.unwrap().is_none());

        let mut f = target.open("abc/abcdef").await.unwrap();
        assert_eq!(&f.read(64).await.unwrap()[..], b"hello");
        assert!(f.read(64).await.unwrap().is_empty());
        f.close().await.unwrap();

        target.remove("abc/abcdef").await.unwrap();
        assert_eq!(
            target.remove("abc/abcdef").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        target.close().await.unwrap();
        mount.close().await.unwrap();
        assert!(dir.path().join("filer/exports/abc").is_dir());
    }
}
