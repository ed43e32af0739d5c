//! Object-store style driver backed by in-process buckets.
//!
//! Objects are whole values under `/`-separated keys and become visible in
//! one `put` when the writer closes, the way blob stores behave. Units that
//! name the same bucket through one [`MemoryFactory`] share a keyspace.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use cdn_crypto::ConvergentEncryption;
use cdn_meta::MetadataStore;
use cdn_types::{Item, ItemUnit, MonitoringStatusLine, UnitId, UnitRole};

use crate::config::{DriverConfig, UnitConfig};
use crate::error::{StoreError, StoreResult};
use crate::handle::{ItemReader, ItemWriter, READ_CHUNK};
use crate::layout;
use crate::pipeline::{open_reader, seal_writer};
use crate::traits::{bound_and_present, DriverFactory, StorageUnit, UnitContext};

/// A flat keyspace of immutable values.
#[derive(Debug, Default)]
pub struct Bucket {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl Bucket {
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.read().expect("lock poisoned").get(key).cloned()
    }

    pub fn put(&self, key: String, value: Bytes) {
        self.objects.write().expect("lock poisoned").insert(key, value);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.objects.write().expect("lock poisoned").remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.read().expect("lock poisoned").keys().cloned().collect()
    }

    /// Object count and total stored bytes.
    pub fn usage(&self) -> (usize, u64) {
        let objects = self.objects.read().expect("lock poisoned");
        let bytes = objects.values().map(|v| v.len() as u64).sum();
        (objects.len(), bytes)
    }
}

pub struct MemoryDriver {
    id: UnitId,
    role: UnitRole,
    bucket_name: String,
    bucket: Arc<Bucket>,
    prefix: String,
    encryption: Option<ConvergentEncryption>,
    metadata: Arc<dyn MetadataStore>,
}

impl MemoryDriver {
    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }
}

#[async_trait]
impl StorageUnit for MemoryDriver {
    fn id(&self) -> &UnitId {
        &self.id
    }

    fn role(&self) -> UnitRole {
        self.role
    }

    fn driver(&self) -> &'static str {
        "memory"
    }

    async fn item_exists(&self, item: &Item) -> StoreResult<bool> {
        bound_and_present(self, self.metadata.as_ref(), item).await
    }

    async fn stat(&self, binding: &ItemUnit) -> StoreResult<Option<u64>> {
        let key = layout::object_key(&self.prefix, &binding.locator);
        Ok(self.bucket.get(&key).map(|v| v.len() as u64))
    }

    async fn new_reader(&self, binding: &ItemUnit) -> StoreResult<Box<dyn ItemReader>> {
        let key = layout::object_key(&self.prefix, &binding.locator);
        let data = self
            .bucket
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{}/{key}", self.bucket_name)))?;
        open_reader(
            Box::new(MemoryReader { data }),
            self.encryption.as_ref(),
            &binding.locator,
        )
    }

    async fn new_writer(&self, binding: &ItemUnit) -> StoreResult<Box<dyn ItemWriter>> {
        let raw = MemoryWriter {
            bucket: self.bucket.clone(),
            key: layout::object_key(&self.prefix, &binding.locator),
            buf: Vec::new(),
        };
        seal_writer(Box::new(raw), self.encryption.as_ref(), &binding.locator)
    }

    async fn remove(&self, binding: &ItemUnit) -> StoreResult<()> {
        let key = layout::object_key(&self.prefix, &binding.locator);
        if !self.bucket.delete(&key) {
            return Err(StoreError::NotFound(format!("{}/{key}", self.bucket_name)));
        }
        debug!(unit = %self.id, key = %key, "object deleted");
        Ok(())
    }

    async fn status(&self) -> Vec<MonitoringStatusLine> {
        let (objects, bytes) = self.bucket.usage();
        vec![MonitoringStatusLine::ok(
            format!("unit/{}", self.id),
            format!("bucket {}: {objects} objects, {bytes} bytes", self.bucket_name),
        )]
    }
}

struct MemoryReader {
    data: Bytes,
}

#[async_trait]
impl ItemReader for MemoryReader {
    async fn read_chunk(&mut self) -> StoreResult<Option<Bytes>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let n = self.data.len().min(READ_CHUNK);
        Ok(Some(self.data.split_to(n)))
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

struct MemoryWriter {
    bucket: Arc<Bucket>,
    key: String,
    buf: Vec<u8>,
}

#[async_trait]
impl ItemWriter for MemoryWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> StoreResult<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> StoreResult<u64> {
        let len = self.buf.len() as u64;
        self.bucket.put(self.key, Bytes::from(self.buf));
        Ok(len)
    }

    async fn abort(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

/// Factory for [`MemoryDriver`]. Owns the buckets its units share.
#[derive(Debug, Default)]
pub struct MemoryFactory {
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
}

impl MemoryFactory {
    /// The named bucket, created on first use.
    pub fn bucket(&self, name: &str) -> Arc<Bucket> {
        self.buckets
            .lock()
            .expect("lock poisoned")
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl DriverFactory for MemoryFactory {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn init(
        &self,
        ctx: UnitContext,
        config: &UnitConfig,
    ) -> StoreResult<Arc<dyn StorageUnit>> {
        let DriverConfig::Memory(memory) = &config.driver else {
            return Err(StoreError::config(
                &config.name,
                format!("memory driver given {} configuration", config.driver.driver_name()),
            ));
        };
        Ok(Arc::new(MemoryDriver {
            id: config.name.clone(),
            role: config.role,
            bucket_name: memory.bucket.clone(),
            bucket: self.bucket(&memory.bucket),
            prefix: memory.prefix.clone(),
            encryption: config.encryption()?,
            metadata: ctx.metadata,
        }))
    }
}
