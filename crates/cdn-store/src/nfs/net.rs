//! NFSv3 over TCP: portmapper lookup, MOUNT v3, and the NFS procedures the
//! driver needs.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::nfs::rpc::{Credential, Program, RpcClient, MOUNT3, NFS3, PORTMAP};
use crate::nfs::session::{AuthUnix, FileAttr, Mount, MountDialer, RemoteFile, Target};
use crate::nfs::xdr::{malformed, XdrDecoder, XdrEncoder};

pub const PORTMAP_PORT: u16 = 111;
const IPPROTO_TCP: u32 = 6;

const PMAPPROC_GETPORT: u32 = 3;
const MOUNTPROC3_MNT: u32 = 1;
const MOUNTPROC3_UMNT: u32 = 3;

const NFSPROC3_GETATTR: u32 = 1;
const NFSPROC3_LOOKUP: u32 = 3;
const NFSPROC3_READ: u32 = 6;
const NFSPROC3_WRITE: u32 = 7;
const NFSPROC3_CREATE: u32 = 8;
const NFSPROC3_MKDIR: u32 = 9;
const NFSPROC3_REMOVE: u32 = 12;
const NFSPROC3_RENAME: u32 = 14;

const NF3DIR: u32 = 2;
const FILE_SYNC: u32 = 2;
const GUARDED: u32 = 1;
const FHSIZE3: usize = 64;
/// type, mode, nlink, uid, gid, size, used, rdev, fsid, fileid, 3 times.
const FATTR3_LEN: usize = 84;
const WCC_ATTR_LEN: usize = 24;

/// Largest payload sent in one WRITE call.
const MAX_WRITE: usize = 64 * 1024;

/// Map an `nfsstat3` or `mountstat3` to an I/O error kind.
fn status_kind(status: u32) -> io::ErrorKind {
    match status {
        1 | 13 => io::ErrorKind::PermissionDenied,
        2 => io::ErrorKind::NotFound,
        17 => io::ErrorKind::AlreadyExists,
        20 | 21 | 22 | 63 => io::ErrorKind::InvalidInput,
        _ => io::ErrorKind::Other,
    }
}

fn check(op: &'static str, status: u32, path: &str) -> StoreResult<()> {
    if status == 0 {
        return Ok(());
    }
    Err(StoreError::io(op)(io::Error::new(
        status_kind(status),
        format!("{path}: server status {status}"),
    )))
}

fn skip_post_op_attr(dec: &mut XdrDecoder) -> StoreResult<()> {
    if dec.bool()? {
        dec.skip(FATTR3_LEN)?;
    }
    Ok(())
}

fn skip_wcc_data(dec: &mut XdrDecoder) -> StoreResult<()> {
    if dec.bool()? {
        dec.skip(WCC_ATTR_LEN)?;
    }
    skip_post_op_attr(dec)
}

fn decode_fattr(dec: &mut XdrDecoder) -> StoreResult<FileAttr> {
    let kind = dec.u32()?;
    // mode, nlink, uid, gid
    dec.skip(16)?;
    let size = dec.u64()?;
    dec.skip(FATTR3_LEN - 28)?;
    Ok(FileAttr {
        size,
        is_dir: kind == NF3DIR,
    })
}

/// `sattr3` setting only the mode.
fn encode_mode(enc: &mut XdrEncoder, mode: u32) {
    enc.bool(true).u32(mode);
    // uid, gid, size, atime, mtime left unchanged
    enc.u32(0).u32(0).u32(0).u32(0).u32(0);
}

/// Split `a/b/c` into (`["a", "b"]`, `"c"`).
fn split_parent(path: &str) -> StoreResult<(Vec<&str>, &str)> {
    let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let name = parts.pop().ok_or_else(|| {
        StoreError::io("resolve")(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path names the export root",
        ))
    })?;
    Ok((parts, name))
}

/// Dials file servers over the network.
///
/// The portmapper on each host is asked for the MOUNT and NFS ports, then
/// both programs are spoken over TCP. Servers must accept requests from
/// unprivileged source ports.
#[derive(Clone, Debug)]
pub struct RpcDialer {
    portmap_port: u16,
    timeout: Duration,
}

impl RpcDialer {
    pub fn new() -> Self {
        Self {
            portmap_port: PORTMAP_PORT,
            timeout: Duration::from_secs(30),
        }
    }

    /// Ask the portmapper on `port` instead of 111.
    pub fn with_portmap_port(mut self, port: u16) -> Self {
        self.portmap_port = port;
        self
    }

    /// Limit on connecting and on each call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn port_of(&self, portmap: &mut RpcClient, host: &str, program: Program) -> StoreResult<u16> {
        let mut args = XdrEncoder::new();
        args.u32(program.number)
            .u32(program.version)
            .u32(IPPROTO_TCP)
            .u32(0);
        let port = portmap
            .call(PORTMAP, PMAPPROC_GETPORT, &args.finish())
            .await?
            .u32()?;
        match u16::try_from(port) {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(StoreError::io("dial")(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} v{} not registered on {host}", program.name, program.version),
            ))),
        }
    }
}

impl Default for RpcDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MountDialer for RpcDialer {
    async fn dial(&self, host: &str) -> StoreResult<Box<dyn Mount>> {
        let mut portmap = RpcClient::connect(host, self.portmap_port, self.timeout).await?;
        let ports = async {
            let mount = self.port_of(&mut portmap, host, MOUNT3).await?;
            let nfs = self.port_of(&mut portmap, host, NFS3).await?;
            Ok::<_, StoreError>((mount, nfs))
        }
        .await;
        if let Err(e) = portmap.shutdown().await {
            debug!(host, error = %e, "portmapper connection not shut down cleanly");
        }
        let (mount_port, nfs_port) = ports?;

        let client = RpcClient::connect(host, mount_port, self.timeout).await?;
        debug!(host, mount_port, nfs_port, "file server dialed");
        Ok(Box::new(RpcMount {
            host: host.to_string(),
            nfs_port,
            timeout: self.timeout,
            client,
            mounted: Vec::new(),
        }))
    }
}

struct RpcMount {
    host: String,
    nfs_port: u16,
    timeout: Duration,
    client: RpcClient,
    /// Export paths to unmount on close.
    mounted: Vec<String>,
}

#[async_trait]
impl Mount for RpcMount {
    async fn mount(&mut self, export: &str, auth: &AuthUnix) -> StoreResult<Box<dyn Target>> {
        let dirpath = format!("/{}", export.trim_start_matches('/'));
        let cred = Credential::Unix(auth.clone());
        self.client.set_credential(cred.clone());

        let mut args = XdrEncoder::new();
        args.string(&dirpath);
        let mut res = self.client.call(MOUNT3, MOUNTPROC3_MNT, &args.finish()).await?;
        check("mount", res.u32()?, &dirpath)?;
        let root = res.opaque(FHSIZE3)?;
        self.mounted.push(dirpath.clone());

        let mut nfs = RpcClient::connect(&self.host, self.nfs_port, self.timeout).await?;
        nfs.set_credential(cred);
        debug!(
            host = %self.host,
            export = %dirpath,
            machine = %auth.machine_name,
            uid = auth.uid,
            gid = auth.gid,
            "export mounted"
        );
        Ok(Box::new(RpcTarget {
            client: Arc::new(Mutex::new(nfs)),
            root,
        }))
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        let Self {
            mut client,
            mounted,
            host,
            ..
        } = *self;
        let mut result = Ok(());
        for dirpath in mounted {
            let mut args = XdrEncoder::new();
            args.string(&dirpath);
            if let Err(e) = client.call(MOUNT3, MOUNTPROC3_UMNT, &args.finish()).await {
                warn!(host = %host, export = %dirpath, error = %e, "unmount failed");
                result = Err(e);
            }
        }
        let shutdown = client.shutdown().await;
        result.and(shutdown)
    }
}

type SharedClient = Arc<Mutex<RpcClient>>;

struct RpcTarget {
    client: SharedClient,
    root: Bytes,
}

impl RpcTarget {
    async fn call(&self, procedure: u32, args: XdrEncoder) -> StoreResult<XdrDecoder> {
        self.client
            .lock()
            .await
            .call(NFS3, procedure, &args.finish())
            .await
    }

    async fn lookup_in(&self, dir: &Bytes, name: &str) -> StoreResult<Bytes> {
        let mut args = XdrEncoder::new();
        args.opaque(dir).string(name);
        let mut res = self.call(NFSPROC3_LOOKUP, args).await?;
        let status = res.u32()?;
        check("lookup", status, name)?;
        res.opaque(FHSIZE3)
    }

    /// Handle of the directory holding `parts`, walked from the root.
    async fn walk(&self, parts: &[&str]) -> StoreResult<Bytes> {
        let mut fh = self.root.clone();
        for part in parts {
            fh = self.lookup_in(&fh, part).await?;
        }
        Ok(fh)
    }

    async fn resolve(&self, path: &str) -> StoreResult<Bytes> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        self.walk(&parts).await
    }

    async fn getattr(&self, fh: &Bytes) -> StoreResult<FileAttr> {
        let mut args = XdrEncoder::new();
        args.opaque(fh);
        let mut res = self.call(NFSPROC3_GETATTR, args).await?;
        check("getattr", res.u32()?, "")?;
        decode_fattr(&mut res)
    }

    fn file(&self, fh: Bytes) -> Box<dyn RemoteFile> {
        Box::new(RpcFile {
            client: self.client.clone(),
            fh,
            offset: 0,
        })
    }
}

#[async_trait]
impl Target for RpcTarget {
    async fn mkdir(&self, path: &str, mode: u32) -> StoreResult<()> {
        let (parents, name) = split_parent(path)?;
        let dir = self.walk(&parents).await?;
        let mut args = XdrEncoder::new();
        args.opaque(&dir).string(name);
        encode_mode(&mut args, mode);
        let mut res = self.call(NFSPROC3_MKDIR, args).await?;
        check("mkdir", res.u32()?, path)
    }

    async fn lookup(&self, path: &str) -> StoreResult<Option<FileAttr>> {
        let fh = match self.resolve(path).await {
            Ok(fh) => fh,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        self.getattr(&fh).await.map(Some)
    }

    async fn open(&self, path: &str) -> StoreResult<Box<dyn RemoteFile>> {
        let fh = self.resolve(path).await?;
        Ok(self.file(fh))
    }

    async fn create(&self, path: &str, mode: u32) -> StoreResult<Box<dyn RemoteFile>> {
        let (parents, name) = split_parent(path)?;
        let dir = self.walk(&parents).await?;
        let mut args = XdrEncoder::new();
        args.opaque(&dir).string(name).u32(GUARDED);
        encode_mode(&mut args, mode);
        let mut res = self.call(NFSPROC3_CREATE, args).await?;
        check("create", res.u32()?, path)?;
        let fh = if res.bool()? {
            res.opaque(FHSIZE3)?
        } else {
            self.lookup_in(&dir, name).await?
        };
        Ok(self.file(fh))
    }

    async fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let (from_parents, from_name) = split_parent(from)?;
        let (to_parents, to_name) = split_parent(to)?;
        let from_dir = self.walk(&from_parents).await?;
        let to_dir = if from_parents == to_parents {
            from_dir.clone()
        } else {
            self.walk(&to_parents).await?
        };
        let mut args = XdrEncoder::new();
        args.opaque(&from_dir)
            .string(from_name)
            .opaque(&to_dir)
            .string(to_name);
        let mut res = self.call(NFSPROC3_RENAME, args).await?;
        check("rename", res.u32()?, from)
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        let (parents, name) = split_parent(path)?;
        let dir = self.walk(&parents).await?;
        let mut args = XdrEncoder::new();
        args.opaque(&dir).string(name);
        let mut res = self.call(NFSPROC3_REMOVE, args).await?;
        check("remove", res.u32()?, path)
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        match Arc::try_unwrap(self.client) {
            Ok(client) => client.into_inner().shutdown().await,
            // An open file still holds the connection; it closes with the last handle.
            Err(_) => Ok(()),
        }
    }
}

struct RpcFile {
    client: SharedClient,
    fh: Bytes,
    offset: u64,
}

#[async_trait]
impl RemoteFile for RpcFile {
    async fn read(&mut self, max: usize) -> StoreResult<Bytes> {
        let count = u32::try_from(max).unwrap_or(u32::MAX);
        let mut args = XdrEncoder::new();
        args.opaque(&self.fh).u64(self.offset).u32(count);
        let mut res = self
            .client
            .lock()
            .await
            .call(NFS3, NFSPROC3_READ, &args.finish())
            .await?;
        check("read", res.u32()?, "")?;
        skip_post_op_attr(&mut res)?;
        let _count = res.u32()?;
        let _eof = res.bool()?;
        let data = res.opaque(max)?;
        self.offset += data.len() as u64;
        Ok(data)
    }

    async fn write(&mut self, data: &[u8]) -> StoreResult<()> {
        for piece in data.chunks(MAX_WRITE) {
            let mut rest = piece;
            while !rest.is_empty() {
                let mut args = XdrEncoder::new();
                args.opaque(&self.fh)
                    .u64(self.offset)
                    .u32(rest.len() as u32)
                    .u32(FILE_SYNC)
                    .opaque(rest);
                let mut res = self
                    .client
                    .lock()
                    .await
                    .call(NFS3, NFSPROC3_WRITE, &args.finish())
                    .await?;
                check("write", res.u32()?, "")?;
                skip_wcc_data(&mut res)?;
                let written = res.u32()? as usize;
                if written == 0 || written > rest.len() {
                    return Err(malformed(format!(
                        "server acknowledged {written} of {} bytes",
                        rest.len()
                    )));
                }
                self.offset += written as u64;
                rest = &rest[written..];
            }
        }
        Ok(())
    }

    /// Writes are sent `FILE_SYNC`, so nothing is pending here.
    async fn close(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
