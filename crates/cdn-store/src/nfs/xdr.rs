//! XDR (RFC 4506) primitives: big-endian 4-byte units, variable-length
//! data padded to a multiple of four.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{StoreError, StoreResult};

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

pub(crate) fn malformed(what: impl Into<String>) -> StoreError {
    StoreError::Io {
        op: "decode reply",
        source: io::Error::new(io::ErrorKind::InvalidData, what.into()),
    }
}

#[derive(Debug, Default)]
pub(crate) struct XdrEncoder {
    buf: BytesMut,
}

impl XdrEncoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub(crate) fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }

    pub(crate) fn bool(&mut self, v: bool) -> &mut Self {
        self.u32(u32::from(v))
    }

    /// Variable-length opaque: length, bytes, padding.
    pub(crate) fn opaque(&mut self, data: &[u8]) -> &mut Self {
        self.u32(data.len() as u32);
        self.fixed(data)
    }

    /// Fixed-length opaque: bytes and padding, no length.
    pub(crate) fn fixed(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self.buf.put_bytes(0, padding(data.len()));
        self
    }

    pub(crate) fn string(&mut self, s: &str) -> &mut Self {
        self.opaque(s.as_bytes())
    }

    pub(crate) fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[derive(Debug)]
pub(crate) struct XdrDecoder {
    buf: Bytes,
}

impl XdrDecoder {
    pub(crate) fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> StoreResult<()> {
        if self.buf.remaining() < n {
            return Err(malformed(format!(
                "{what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn u32(&mut self) -> StoreResult<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(&mut self) -> StoreResult<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn bool(&mut self) -> StoreResult<bool> {
        match self.u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(malformed(format!("bool out of range: {other}"))),
        }
    }

    /// Variable-length opaque of at most `max` bytes.
    pub(crate) fn opaque(&mut self, max: usize) -> StoreResult<Bytes> {
        let len = self.u32()? as usize;
        if len > max {
            return Err(malformed(format!("opaque of {len} bytes exceeds {max}")));
        }
        self.fixed(len)
    }

    pub(crate) fn fixed(&mut self, len: usize) -> StoreResult<Bytes> {
        let padded = len + padding(len);
        self.need(padded, "opaque")?;
        let data = self.buf.split_to(len);
        self.buf.advance(padded - len);
        Ok(data)
    }

    pub(crate) fn skip(&mut self, n: usize) -> StoreResult<()> {
        self.need(n, "skip")?;
        self.buf.advance(n);
        Ok(())
    }
}
