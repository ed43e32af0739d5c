//! Transparent encryption layered over raw driver handles.
//!
//! Drivers produce raw handles that move stored bytes. When a unit has
//! encryption configured, [`seal_writer`] and [`open_reader`] wrap those
//! handles so callers always see plaintext.
//!
//! The content key is derived from the locator, so a sealed write is only
//! published if the plaintext actually hashes to that locator. Two different
//! contents can never be sealed under one key.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::error;

use cdn_crypto::{ContentHasher, ConvergentEncryption, Opener, Sealer, StreamingHasher};
use cdn_types::Locator;

use crate::error::{StoreError, StoreResult};
use crate::handle::{ItemReader, ItemWriter};

/// Wrap a raw writer so plaintext written to it is stored encrypted.
///
/// Closing fails with [`StoreError::Integrity`], and the raw writer is
/// aborted, when the plaintext does not hash to `locator`.
pub fn seal_writer(
    raw: Box<dyn ItemWriter>,
    encryption: Option<&ConvergentEncryption>,
    locator: &Locator,
) -> StoreResult<Box<dyn ItemWriter>> {
    match encryption {
        None => Ok(raw),
        Some(enc) => Ok(Box::new(SealingWriter {
            inner: raw,
            sealer: enc.sealer(locator)?,
            hasher: ContentHasher::ITEM.streaming(),
            locator: locator.clone(),
        })),
    }
}

/// Wrap a raw reader so stored ciphertext comes back as plaintext.
pub fn open_reader(
    raw: Box<dyn ItemReader>,
    encryption: Option<&ConvergentEncryption>,
    locator: &Locator,
) -> StoreResult<Box<dyn ItemReader>> {
    match encryption {
        None => Ok(raw),
        Some(enc) => Ok(Box::new(OpeningReader {
            inner: raw,
            opener: Some(enc.opener(locator)?),
        })),
    }
}

struct SealingWriter {
    inner: Box<dyn ItemWriter>,
    sealer: Sealer,
    hasher: StreamingHasher,
    locator: Locator,
}

#[async_trait]
impl ItemWriter for SealingWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> StoreResult<()> {
        self.hasher.update(data);
        let frames = self.sealer.update(data)?;
        if !frames.is_empty() {
            self.inner.write_chunk(&frames).await?;
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> StoreResult<u64> {
        let Self {
            mut inner,
            sealer,
            hasher,
            locator,
        } = *self;
        let actual = hasher.finalize_locator();
        if actual != locator {
            abort_quietly(inner).await;
            return Err(StoreError::Integrity(format!(
                "content of {} bytes hashes to {actual}, not {locator}",
                hasher.bytes()
            )));
        }
        let tail = match sealer.finish() {
            Ok(tail) => tail,
            Err(e) => {
                abort_quietly(inner).await;
                return Err(e.into());
            }
        };
        if let Err(e) = inner.write_chunk(&tail).await {
            abort_quietly(inner).await;
            return Err(e);
        }
        inner.close().await
    }

    async fn abort(self: Box<Self>) -> StoreResult<()> {
        self.inner.abort().await
    }
}

async fn abort_quietly(writer: Box<dyn ItemWriter>) {
    if let Err(e) = writer.abort().await {
        error!(error = %e, "writer abort failed");
    }
}

struct OpeningReader {
    inner: Box<dyn ItemReader>,
    /// `None` once the final frame has been verified.
    opener: Option<Opener>,
}

#[async_trait]
impl ItemReader for OpeningReader {
    async fn read_chunk(&mut self) -> StoreResult<Option<Bytes>> {
        loop {
            let Some(opener) = self.opener.as_mut() else {
                return Ok(None);
            };
            match self.inner.read_chunk().await? {
                Some(stored) => {
                    let plain = opener.update(&stored)?;
                    if !plain.is_empty() {
                        return Ok(Some(Bytes::from(plain)));
                    }
                }
                None => {
                    if let Some(opener) = self.opener.take() {
                        opener.finish()?;
                    }
                    return Ok(None);
                }
            }
        }
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        self.inner.close().await
    }
}

impl std::fmt::Debug for OpeningReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpeningReader")
            .field("finished", &self.opener.is_none())
            .finish()
    }
}
