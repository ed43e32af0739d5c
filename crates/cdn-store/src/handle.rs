//! Streaming handles returned by storage units, and the ordered release of
//! the resources behind them.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::error;

use crate::error::{StoreError, StoreResult};

/// Size of chunks handed out by raw readers.
pub const READ_CHUNK: usize = 64 * 1024;

/// Read side of one object. Owns its session until closed.
#[async_trait]
pub trait ItemReader: Send {
    /// Next chunk of plaintext, or `None` at end of stream.
    async fn read_chunk(&mut self) -> StoreResult<Option<Bytes>>;

    /// Release the stream, the session, and the connection, in that order.
    async fn close(self: Box<Self>) -> StoreResult<()>;
}

/// Write side of one object.
///
/// Content is staged until [`close`](ItemWriter::close) publishes it, so a
/// reader never sees a partially written object at its final path.
#[async_trait]
pub trait ItemWriter: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> StoreResult<()>;

    /// Publish the object and release every resource. Returns the number of
    /// bytes stored on the backend.
    async fn close(self: Box<Self>) -> StoreResult<u64>;

    /// Discard the staged content and release every resource.
    async fn abort(self: Box<Self>) -> StoreResult<()>;
}

/// Drain a reader into memory and close it.
pub async fn read_to_end(mut reader: Box<dyn ItemReader>) -> StoreResult<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match reader.read_chunk().await {
            Ok(Some(chunk)) => out.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => {
                if let Err(close_err) = reader.close().await {
                    error!(error = %close_err, "reader close failed after read error");
                }
                return Err(e);
            }
        }
    }
    reader.close().await?;
    Ok(out)
}

/// Ordered release of nested resources.
///
/// Every step is attempted even after a failure. The first failure is
/// returned from [`finish`](ReleaseChain::finish); every failure is logged.
#[derive(Debug)]
pub struct ReleaseChain {
    handle: &'static str,
    first: Option<StoreError>,
}

impl ReleaseChain {
    pub fn new(handle: &'static str) -> Self {
        Self {
            handle,
            first: None,
        }
    }

    /// Record the outcome of one release step.
    pub fn step(&mut self, step: &'static str, result: StoreResult<()>) {
        let Err(e) = result else { return };
        error!(handle = self.handle, step, error = %e, "resource release failed");
        if self.first.is_none() {
            self.first = Some(StoreError::ResourceRelease {
                step,
                source: Box::new(e),
            });
        }
    }

    /// Record a failure that is not itself a release step, such as a
    /// failed publish. It takes precedence only if nothing failed before it.
    pub fn fail(&mut self, e: StoreError) {
        if self.first.is_none() {
            self.first = Some(e);
        } else {
            error!(handle = self.handle, error = %e, "additional failure during release");
        }
    }

    pub fn is_clean(&self) -> bool {
        self.first.is_none()
    }

    pub fn finish(self) -> StoreResult<()> {
        match self.first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io;

    fn broken(op: &'static str) -> StoreResult<()> {
        Err(StoreError::io(op)(io::Error::from(io::ErrorKind::BrokenPipe)))
    }

    #[test]
    fn clean_chain_is_ok() {
        let mut chain = ReleaseChain::new("reader");
        chain.step("file", Ok(()));
        chain.step("target", Ok(()));
        assert!(chain.is_clean());
        assert!(chain.finish().is_ok());
    }

    #[test]
    fn first_failure_wins() {
        let mut chain = ReleaseChain::new("writer");
        chain.step("file", broken("close file"));
        chain.step("target", broken("close target"));
        chain.step("mount", Ok(()));
        match chain.finish() {
            Err(StoreError::ResourceRelease { step, .. }) => assert_eq!(step, "file"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn later_failure_reported_when_first_steps_succeed() {
        let mut chain = ReleaseChain::new("writer");
        chain.step("file", Ok(()));
        chain.step("mount", broken("unmount"));
        let err = chain.finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceRelease);
        assert!(err.to_string().contains("mount"));
    }

    #[test]
    fn fail_does_not_override_earlier_error() {
        let mut chain = ReleaseChain::new("writer");
        chain.step("file", broken("close"));
        chain.fail(StoreError::Integrity("late".into()));
        assert_eq!(chain.finish().unwrap_err().kind(), ErrorKind::ResourceRelease);
    }

    // ----------------------------------------------------------------------
    // read_to_end
    // ----------------------------------------------------------------------

    struct Chunks(Vec<&'static [u8]>);

    #[async_trait]
    impl ItemReader for Chunks {
        async fn read_chunk(&mut self) -> StoreResult<Option<Bytes>> {
            if self.0.is_empty() {
                return Ok(None);
            }
            Ok(Some(Bytes::from_static(self.0.remove(0))))
        }

        async fn close(self: Box<Self>) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn read_to_end_concatenates_chunks() {
        let reader = Box::new(Chunks(vec![b"hello ", b"world"]));
        assert_eq!(read_to_end(reader).await.unwrap(), b"hello world");
    }
}
