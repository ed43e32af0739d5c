//! ONC RPC v2 (RFC 5531) calls over TCP with record marking.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::{StoreError, StoreResult};
use crate::nfs::session::AuthUnix;
use crate::nfs::xdr::{malformed, XdrDecoder, XdrEncoder};

const LAST_FRAGMENT: u32 = 0x8000_0000;
/// Largest reply accepted, summed over all fragments.
pub(crate) const MAX_RECORD: usize = 4 * 1024 * 1024;

const RPC_VERSION: u32 = 2;
const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const MSG_ACCEPTED: u32 = 0;
const MSG_DENIED: u32 = 1;

const AUTH_NONE: u32 = 0;
const AUTH_UNIX: u32 = 1;
const MAX_AUTH_BODY: usize = 400;

/// An RPC program and version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Program {
    pub(crate) number: u32,
    pub(crate) version: u32,
    pub(crate) name: &'static str,
}

pub(crate) const PORTMAP: Program = Program {
    number: 100_000,
    version: 2,
    name: "portmap",
};

pub(crate) const MOUNT3: Program = Program {
    number: 100_005,
    version: 3,
    name: "mount",
};

pub(crate) const NFS3: Program = Program {
    number: 100_003,
    version: 3,
    name: "nfs",
};

fn rpc_error(kind: io::ErrorKind, what: String) -> StoreError {
    StoreError::Io {
        op: "rpc call",
        source: io::Error::new(kind, what),
    }
}

/// Write `body` as a single last fragment.
pub(crate) async fn write_record<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|n| *n < LAST_FRAGMENT)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "record too large"))?;
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.extend_from_slice(&(LAST_FRAGMENT | len).to_be_bytes());
    frame.extend_from_slice(body);
    w.write_all(&frame).await?;
    w.flush().await
}

/// Read fragments until the last one and return their concatenation.
pub(crate) async fn read_record<R: AsyncRead + Unpin>(r: &mut R, max: usize) -> io::Result<Bytes> {
    let mut record = BytesMut::new();
    loop {
        let header = r.read_u32().await?;
        let len = (header & !LAST_FRAGMENT) as usize;
        if record.len() + len > max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record exceeds {max} bytes"),
            ));
        }
        let start = record.len();
        record.resize(start + len, 0);
        r.read_exact(&mut record[start..]).await?;
        if header & LAST_FRAGMENT != 0 {
            return Ok(record.freeze());
        }
    }
}

/// Credentials sent with every call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Credential {
    None,
    Unix(AuthUnix),
}

impl Credential {
    fn encode(&self, enc: &mut XdrEncoder) {
        match self {
            Self::None => {
                enc.u32(AUTH_NONE).opaque(&[]);
            }
            Self::Unix(auth) => {
                let mut body = XdrEncoder::new();
                body.u32(0)
                    .string(&auth.machine_name)
                    .u32(auth.uid)
                    .u32(auth.gid)
                    .u32(0);
                enc.u32(AUTH_UNIX).opaque(&body.finish());
            }
        }
    }
}

pub(crate) fn encode_call(
    xid: u32,
    program: Program,
    procedure: u32,
    cred: &Credential,
    args: &[u8],
) -> Bytes {
    let mut enc = XdrEncoder::new();
    enc.u32(xid)
        .u32(MSG_CALL)
        .u32(RPC_VERSION)
        .u32(program.number)
        .u32(program.version)
        .u32(procedure);
    cred.encode(&mut enc);
    Credential::None.encode(&mut enc);
    let mut msg = BytesMut::from(&enc.finish()[..]);
    msg.extend_from_slice(args);
    msg.freeze()
}

/// Check the reply header for `xid` and return a decoder over the results.
pub(crate) fn accept_reply(xid: u32, program: Program, record: Bytes) -> StoreResult<XdrDecoder> {
    let mut dec = XdrDecoder::new(record);
    let got = dec.u32()?;
    if got != xid {
        return Err(malformed(format!("reply xid {got}, expected {xid}")));
    }
    if dec.u32()? != MSG_REPLY {
        return Err(malformed("expected a reply message"));
    }
    match dec.u32()? {
        MSG_ACCEPTED => {
            dec.u32()?;
            dec.opaque(MAX_AUTH_BODY)?;
            match dec.u32()? {
                0 => Ok(dec),
                1 => Err(rpc_error(
                    io::ErrorKind::ConnectionRefused,
                    format!("{} program unavailable", program.name),
                )),
                2 => {
                    let (low, high) = (dec.u32()?, dec.u32()?);
                    Err(rpc_error(
                        io::ErrorKind::Unsupported,
                        format!(
                            "{} version {} unsupported, server offers {low}..={high}",
                            program.name, program.version
                        ),
                    ))
                }
                3 => Err(rpc_error(
                    io::ErrorKind::Unsupported,
                    format!("{} procedure unavailable", program.name),
                )),
                4 => Err(rpc_error(
                    io::ErrorKind::InvalidInput,
                    format!("{} rejected the call arguments", program.name),
                )),
                stat => Err(rpc_error(
                    io::ErrorKind::Other,
                    format!("{} system error (accept status {stat})", program.name),
                )),
            }
        }
        MSG_DENIED => match dec.u32()? {
            0 => Err(rpc_error(
                io::ErrorKind::Unsupported,
                "RPC version mismatch".to_string(),
            )),
            _ => {
                let stat = dec.u32().unwrap_or(0);
                Err(rpc_error(
                    io::ErrorKind::PermissionDenied,
                    format!("{} denied credentials (auth status {stat})", program.name),
                ))
            }
        },
        other => Err(malformed(format!("reply status {other}"))),
    }
}

/// One TCP connection carrying sequential calls.
#[derive(Debug)]
pub(crate) struct RpcClient {
    stream: TcpStream,
    peer: String,
    next_xid: u32,
    cred: Credential,
    timeout: Duration,
}

impl RpcClient {
    pub(crate) async fn connect(host: &str, port: u16, timeout: Duration) -> StoreResult<Self> {
        let peer = format!("{host}:{port}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(peer.as_str()))
            .await
            .map_err(|_| {
                StoreError::io("connect")(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {peer} timed out"),
                ))
            })?
            .map_err(StoreError::io("connect"))?;
        stream.set_nodelay(true).map_err(StoreError::io("connect"))?;
        Ok(Self {
            stream,
            peer,
            next_xid: rand_xid(),
            cred: Credential::None,
            timeout,
        })
    }

    pub(crate) fn set_credential(&mut self, cred: Credential) {
        self.cred = cred;
    }

    pub(crate) async fn call(
        &mut self,
        program: Program,
        procedure: u32,
        args: &[u8],
    ) -> StoreResult<XdrDecoder> {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);
        let msg = encode_call(xid, program, procedure, &self.cred, args);
        trace!(peer = %self.peer, program = program.name, procedure, xid, "rpc call");

        let timeout = self.timeout;
        let stream = &mut self.stream;
        let exchange = async move {
            write_record(stream, &msg).await?;
            read_record(stream, MAX_RECORD).await
        };
        let record = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| {
                StoreError::io("rpc call")(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} call to {} timed out", program.name, self.peer),
                ))
            })?
            .map_err(StoreError::io("rpc call"))?;
        accept_reply(xid, program, record)
    }

    pub(crate) async fn shutdown(mut self) -> StoreResult<()> {
        self.stream
            .shutdown()
            .await
            .map_err(StoreError::io("disconnect"))
    }
}

/// Random starting transaction ID.
fn rand_xid() -> u32 {
    let id = uuid::Uuid::now_v7();
    let b = id.as_bytes();
    u32::from_be_bytes([b[12], b[13], b[14], b[15]])
}
