//! Chunked copy from a source reader into a target writer.

use tokio_util::sync::CancellationToken;
use tracing::error;

use cdn_store::{ItemReader, ItemWriter};
use cdn_types::UnitId;

use crate::error::{SyncError, SyncResult};

/// Byte counts from a completed copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transferred {
    /// Plaintext bytes that passed between the two handles.
    pub plaintext: u64,
    /// Bytes the target reports having stored.
    pub stored: u64,
}

/// Stream everything from `reader` into `writer` and close both.
///
/// On error or cancellation the writer is aborted, so nothing is published
/// on the target. The reader is always closed.
pub async fn copy(
    mut reader: Box<dyn ItemReader>,
    mut writer: Box<dyn ItemWriter>,
    source: &UnitId,
    target: &UnitId,
    cancel: &CancellationToken,
) -> SyncResult<Transferred> {
    let pumped = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = pump(reader.as_mut(), writer.as_mut(), source, target) => result,
    };
    let reader_closed = reader
        .close()
        .await
        .map_err(SyncError::unit(source, "close reader"));

    let failure = match (pumped, reader_closed) {
        (Ok(plaintext), Ok(())) => {
            let stored = writer
                .close()
                .await
                .map_err(SyncError::unit(target, "close writer"))?;
            return Ok(Transferred { plaintext, stored });
        }
        (Err(e), Ok(())) | (Ok(_), Err(e)) => e,
        (Err(e), Err(close_err)) => {
            error!(unit = %source, error = %close_err, "reader close failed after transfer error");
            e
        }
    };
    if let Err(abort_err) = writer.abort().await {
        error!(unit = %target, error = %abort_err, "writer abort failed");
    }
    Err(failure)
}

async fn pump(
    reader: &mut dyn ItemReader,
    writer: &mut dyn ItemWriter,
    source: &UnitId,
    target: &UnitId,
) -> SyncResult<u64> {
    let mut total = 0u64;
    while let Some(chunk) = reader
        .read_chunk()
        .await
        .map_err(SyncError::unit(source, "read"))?
    {
        writer
            .write_chunk(&chunk)
            .await
            .map_err(SyncError::unit(target, "write"))?;
        total += chunk.len() as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use cdn_store::{ErrorKind, StoreError, StoreResult};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        written: Vec<u8>,
        closed: bool,
        aborted: bool,
        reader_closed: bool,
    }

    struct Source {
        chunks: Vec<&'static [u8]>,
        fail_at: Option<usize>,
        stall: bool,
        log: Arc<Mutex<Log>>,
    }

    #[async_trait]
    impl ItemReader for Source {
        async fn read_chunk(&mut self) -> StoreResult<Option<Bytes>> {
            if self.fail_at == Some(0) {
                return Err(StoreError::io("read")(std::io::Error::from(
                    std::io::ErrorKind::ConnectionReset,
                )));
            }
            if self.chunks.is_empty() {
                if self.stall {
                    std::future::pending::<()>().await;
                }
                return Ok(None);
            }
            self.fail_at = self.fail_at.map(|n| n - 1);
            Ok(Some(Bytes::from_static(self.chunks.remove(0))))
        }

        async fn close(self: Box<Self>) -> StoreResult<()> {
            self.log.lock().unwrap().reader_closed = true;
            Ok(())
        }
    }

    struct Sink {
        log: Arc<Mutex<Log>>,
    }

    #[async_trait]
    impl ItemWriter for Sink {
        async fn write_chunk(&mut self, data: &[u8]) -> StoreResult<()> {
            self.log.lock().unwrap().written.extend_from_slice(data);
            Ok(())
        }

        async fn close(self: Box<Self>) -> StoreResult<u64> {
            let mut log = self.log.lock().unwrap();
            log.closed = true;
            Ok(log.written.len() as u64 + 100)
        }

        async fn abort(self: Box<Self>) -> StoreResult<()> {
            self.log.lock().unwrap().aborted = true;
            Ok(())
        }
    }

    fn handles(
        chunks: Vec<&'static [u8]>,
        fail_at: Option<usize>,
        stall: bool,
    ) -> (Box<dyn ItemReader>, Box<dyn ItemWriter>, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let reader = Box::new(Source {
            chunks,
            fail_at,
            stall,
            log: log.clone(),
        });
        let writer = Box::new(Sink { log: log.clone() });
        (reader, writer, log)
    }

    fn ids() -> (UnitId, UnitId) {
        (UnitId::new("buffer").unwrap(), UnitId::new("nfs").unwrap())
    }

    #[tokio::test]
    async fn copies_all_chunks_and_closes_both() {
        let (r, w, log) = handles(vec![b"hello ", b"world"], None, false);
        let (src, dst) = ids();
        let t = copy(r, w, &src, &dst, &CancellationToken::new()).await.unwrap();
        assert_eq!(t, Transferred { plaintext: 11, stored: 111 });
        let log = log.lock().unwrap();
        assert_eq!(log.written, b"hello world");
        assert!(log.closed && log.reader_closed && !log.aborted);
    }

    #[tokio::test]
    async fn read_error_aborts_writer() {
        let (r, w, log) = handles(vec![b"a", b"b"], Some(1), false);
        let (src, dst) = ids();
        let err = copy(r, w, &src, &dst, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
        assert!(matches!(err, SyncError::Unit { op: "read", .. }));
        let log = log.lock().unwrap();
        assert!(log.aborted && log.reader_closed && !log.closed);
    }

    #[tokio::test]
    async fn cancellation_aborts_writer() {
        let (r, w, log) = handles(vec![b"a"], None, true);
        let (src, dst) = ids();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = copy(r, w, &src, &dst, &cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        let log = log.lock().unwrap();
        assert!(log.aborted && log.reader_closed && !log.closed);
    }
}
