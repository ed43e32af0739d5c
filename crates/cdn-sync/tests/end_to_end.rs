//! Replication scenarios against real drivers on temporary directories.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use cdn_meta::{InMemoryMetadataStore, MetaError, MetaResult, MetadataStore, SyncFailure};
use cdn_store::{
    BufferPolicy, DriverConfig, DriverFactory, EncryptionConfig, ErrorKind, ExportDialer,
    ItemReader, ItemWriter, LocalConfig, LocalFactory, NfsConfig, NfsFactory, SecretRef,
    StorageUnit, StoreError, StoreResult, UnitConfig, UnitContext,
};
use cdn_sync::{
    ingest, read_item, EvictionDecision, SyncConfig, SyncEngine, SyncError, SyncOutcome,
};
use cdn_types::{
    Item, ItemId, ItemType, ItemUnit, ManualClock, MonitoringStatusLine, StatusLevel, UnitId,
    UnitRole,
};

const SECRET: &str = "5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e";

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    dir: tempfile::TempDir,
    metadata: Arc<InMemoryMetadataStore>,
    clock: Arc<ManualClock>,
    buffer: Arc<dyn StorageUnit>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let metadata = Arc::new(InMemoryMetadataStore::with_clock(clock.clone()));
        let buffer = local_unit(&dir.path().join("buffer"), "buffer", UnitRole::Buffer, &metadata).await;
        Self {
            dir,
            metadata,
            clock,
            buffer,
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    async fn durable_local(&self, name: &str) -> Arc<dyn StorageUnit> {
        local_unit(&self.path(name), name, UnitRole::Durable, &self.metadata).await
    }

    async fn durable_nfs(&self, name: &str) -> Arc<dyn StorageUnit> {
        std::fs::create_dir_all(self.path("server/exports/cdn")).unwrap();
        let cfg = UnitConfig {
            name: UnitId::new(name).unwrap(),
            role: UnitRole::Durable,
            driver: DriverConfig::Nfs(NfsConfig {
                host: "server".into(),
                export: "exports/cdn".into(),
                sub_path: name.into(),
                machine_name: "ci".into(),
                uid: 1000,
                gid: 1000,
            }),
            encryption: Some(EncryptionConfig {
                secret: SecretRef::Inline(SECRET.into()),
            }),
            buffer: None,
        };
        NfsFactory::new(Arc::new(ExportDialer::new(self.dir.path())))
            .init(UnitContext::new(self.metadata.clone()), &cfg)
            .await
            .unwrap()
    }

    fn engine(
        &self,
        targets: Vec<Arc<dyn StorageUnit>>,
        config: SyncConfig,
        policy: BufferPolicy,
    ) -> Arc<SyncEngine> {
        Arc::new(
            SyncEngine::new(
                self.buffer.clone(),
                targets,
                self.metadata.clone(),
                self.clock.clone(),
                config,
                policy,
            )
            .unwrap(),
        )
    }

    async fn ingest(&self, content: &[u8]) -> Item {
        ingest(
            self.buffer.as_ref(),
            self.metadata.as_ref(),
            self.clock.as_ref(),
            ItemType::StepLog,
            content,
        )
        .await
        .unwrap()
    }
}

async fn local_unit(
    root: &Path,
    name: &str,
    role: UnitRole,
    metadata: &Arc<InMemoryMetadataStore>,
) -> Arc<dyn StorageUnit> {
    let cfg = UnitConfig {
        name: UnitId::new(name).unwrap(),
        role,
        driver: DriverConfig::Local(LocalConfig {
            root: root.to_path_buf(),
        }),
        encryption: None,
        buffer: None,
    };
    LocalFactory
        .init(UnitContext::new(metadata.clone()), &cfg)
        .await
        .unwrap()
}

fn fast_retries() -> SyncConfig {
    SyncConfig {
        backoff_base_secs: 0,
        backoff_max_secs: 0,
        ..SyncConfig::default()
    }
}

fn grace(secs: u64) -> BufferPolicy {
    BufferPolicy {
        required_replicas: None,
        grace_period_secs: secs,
    }
}

/// Every file below `dir`, as paths relative to it.
fn files(dir: &Path) -> Vec<PathBuf> {
    fn walk(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(base, &path, out);
            } else {
                out.push(path.strip_prefix(base).unwrap().to_path_buf());
            }
        }
    }
    let mut out = Vec::new();
    walk(dir, dir, &mut out);
    out.sort();
    out
}

// ---------------------------------------------------------------------------
// Fault-injecting unit
// ---------------------------------------------------------------------------

/// Wraps a real unit and misbehaves on request.
struct FlakyUnit {
    inner: Arc<dyn StorageUnit>,
    /// Writers still to fail mid-stream.
    failing_writes: AtomicU32,
    stall_writes: AtomicBool,
    misreport_size: AtomicBool,
    writers_opened: AtomicU32,
}

impl FlakyUnit {
    fn wrap(inner: Arc<dyn StorageUnit>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing_writes: AtomicU32::new(0),
            stall_writes: AtomicBool::new(false),
            misreport_size: AtomicBool::new(false),
            writers_opened: AtomicU32::new(0),
        })
    }
}

enum Fault {
    FailAfterPartialWrite,
    Stall,
}

struct FaultyWriter {
    inner: Box<dyn ItemWriter>,
    fault: Fault,
}

#[async_trait]
impl ItemWriter for FaultyWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> StoreResult<()> {
        match self.fault {
            Fault::FailAfterPartialWrite => {
                self.inner.write_chunk(&data[..data.len() / 2]).await?;
                Err(StoreError::io("write")(std::io::Error::from(
                    std::io::ErrorKind::ConnectionReset,
                )))
            }
            Fault::Stall => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn close(self: Box<Self>) -> StoreResult<u64> {
        self.inner.close().await
    }

    async fn abort(self: Box<Self>) -> StoreResult<()> {
        self.inner.abort().await
    }
}

#[async_trait]
impl StorageUnit for FlakyUnit {
    fn id(&self) -> &UnitId {
        self.inner.id()
    }

    fn role(&self) -> UnitRole {
        self.inner.role()
    }

    fn driver(&self) -> &'static str {
        self.inner.driver()
    }

    async fn item_exists(&self, item: &Item) -> StoreResult<bool> {
        self.inner.item_exists(item).await
    }

    async fn stat(&self, binding: &ItemUnit) -> StoreResult<Option<u64>> {
        let size = self.inner.stat(binding).await?;
        if self.misreport_size.load(Ordering::SeqCst) {
            return Ok(size.map(|n| n + 1));
        }
        Ok(size)
    }

    async fn new_reader(&self, binding: &ItemUnit) -> StoreResult<Box<dyn ItemReader>> {
        self.inner.new_reader(binding).await
    }

    async fn new_writer(&self, binding: &ItemUnit) -> StoreResult<Box<dyn ItemWriter>> {
        let inner = self.inner.new_writer(binding).await?;
        self.writers_opened.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Ok(Box::new(FaultyWriter {
                inner,
                fault: Fault::FailAfterPartialWrite,
            }));
        }
        if self.stall_writes.load(Ordering::SeqCst) {
            return Ok(Box::new(FaultyWriter {
                inner,
                fault: Fault::Stall,
            }));
        }
        Ok(inner)
    }

    async fn remove(&self, binding: &ItemUnit) -> StoreResult<()> {
        self.inner.remove(binding).await
    }

    async fn status(&self) -> Vec<MonitoringStatusLine> {
        self.inner.status().await
    }
}

// ---------------------------------------------------------------------------
// Instrumented metadata store
// ---------------------------------------------------------------------------

/// Delegates to an in-memory store, remembers registered items, and can
/// refuse to clear failure records.
struct InstrumentedMetadata {
    inner: Arc<InMemoryMetadataStore>,
    registered: Mutex<Vec<ItemId>>,
    refuse_clear: AtomicBool,
}

impl InstrumentedMetadata {
    fn wrap(inner: Arc<InMemoryMetadataStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            registered: Mutex::new(Vec::new()),
            refuse_clear: AtomicBool::new(false),
        })
    }

    fn registered(&self) -> Vec<ItemId> {
        self.registered.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataStore for InstrumentedMetadata {
    async fn put_item(&self, item: &Item) -> MetaResult<()> {
        self.inner.put_item(item).await?;
        let mut registered = self.registered.lock().unwrap();
        if !registered.contains(&item.id()) {
            registered.push(item.id());
        }
        Ok(())
    }

    async fn remove_incoming_item(&self, id: ItemId) -> MetaResult<bool> {
        self.inner.remove_incoming_item(id).await
    }

    async fn get_item(&self, id: ItemId) -> MetaResult<Option<Item>> {
        self.inner.get_item(id).await
    }

    async fn lookup_binding(&self, item: ItemId, unit: &UnitId) -> MetaResult<Option<ItemUnit>> {
        self.inner.lookup_binding(item, unit).await
    }

    async fn insert_binding(&self, binding: &ItemUnit) -> MetaResult<()> {
        self.inner.insert_binding(binding).await
    }

    async fn remove_binding(&self, item: ItemId, unit: &UnitId) -> MetaResult<bool> {
        self.inner.remove_binding(item, unit).await
    }

    async fn bindings_for_item(&self, item: ItemId) -> MetaResult<Vec<ItemUnit>> {
        self.inner.bindings_for_item(item).await
    }

    async fn items_in_unit(&self, unit: &UnitId) -> MetaResult<Vec<ItemId>> {
        self.inner.items_in_unit(unit).await
    }

    async fn items_missing_from(
        &self,
        source: &UnitId,
        target: &UnitId,
    ) -> MetaResult<Vec<ItemId>> {
        self.inner.items_missing_from(source, target).await
    }

    async fn acquire_lease(
        &self,
        item: ItemId,
        unit: &UnitId,
        owner: &str,
        ttl: Duration,
    ) -> MetaResult<bool> {
        self.inner.acquire_lease(item, unit, owner, ttl).await
    }

    async fn release_lease(&self, item: ItemId, unit: &UnitId, owner: &str) -> MetaResult<()> {
        self.inner.release_lease(item, unit, owner).await
    }

    async fn record_failure(
        &self,
        item: ItemId,
        unit: &UnitId,
        reason: &str,
        max_attempts: u32,
        fatal: bool,
    ) -> MetaResult<SyncFailure> {
        self.inner
            .record_failure(item, unit, reason, max_attempts, fatal)
            .await
    }

    async fn failure(&self, item: ItemId, unit: &UnitId) -> MetaResult<Option<SyncFailure>> {
        self.inner.failure(item, unit).await
    }

    async fn clear_failure(&self, item: ItemId, unit: &UnitId) -> MetaResult<bool> {
        if self.refuse_clear.load(Ordering::SeqCst) {
            return Err(MetaError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        self.inner.clear_failure(item, unit).await
    }

    async fn failures(&self) -> MetaResult<Vec<SyncFailure>> {
        self.inner.failures().await
    }
}

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hello_world_replicates_and_keeps_buffer_copy() {
    let h = Harness::new().await;
    let nfs = h.durable_nfs("nfs").await;
    let engine = h.engine(vec![nfs.clone()], SyncConfig::default(), grace(3600));

    let item = h.ingest(b"hello-world").await;
    assert!(h.buffer.item_exists(&item).await.unwrap());

    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.bound, 1);
    assert_eq!(report.failed, 0);

    assert!(nfs.item_exists(&item).await.unwrap());
    assert!(h.buffer.item_exists(&item).await.unwrap());
    assert_eq!(
        read_item(nfs.as_ref(), h.metadata.as_ref(), item.id()).await.unwrap(),
        b"hello-world"
    );

    // Encrypted at rest under the sharded layout.
    let loc = item.locator().unwrap();
    let on_disk = std::fs::read(
        h.path("server/exports/cdn/nfs")
            .join(loc.shard_prefix())
            .join(loc.as_str()),
    )
    .unwrap();
    assert_ne!(on_disk, b"hello-world");

    // Nothing left to do on the next cycle.
    let again = engine.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(again.total(), 0);

    // Still inside the grace period.
    assert_eq!(
        engine.evict_item(item.id()).await.unwrap(),
        EvictionDecision::InGracePeriod {
            remaining: Duration::from_secs(3600)
        }
    );
}

#[tokio::test]
async fn flaky_target_succeeds_after_three_failures() {
    let h = Harness::new().await;
    let flaky = FlakyUnit::wrap(h.durable_local("disk").await);
    flaky.failing_writes.store(3, Ordering::SeqCst);
    let target: Arc<dyn StorageUnit> = flaky.clone();
    let engine = h.engine(vec![target.clone()], fast_retries(), grace(0));
    let item = h.ingest(&b"log line\n".repeat(1000)).await;
    let cancel = CancellationToken::new();

    for attempt in 1..=3 {
        let err = engine.sync_item(item.id(), target.id(), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
        let record = h.metadata.failure(item.id(), target.id()).await.unwrap().unwrap();
        assert_eq!(record.attempts, attempt);
        assert!(!record.needs_attention);
        assert!(!target.item_exists(&item).await.unwrap());
    }

    let outcome = engine.sync_item(item.id(), target.id(), &cancel).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Bound { .. }));
    assert!(target.item_exists(&item).await.unwrap());
    assert!(h.metadata.failure(item.id(), target.id()).await.unwrap().is_none());

    // Exactly the published object; no staging leftovers.
    let loc = item.locator().unwrap();
    assert_eq!(
        files(&h.path("disk")),
        vec![Path::new(loc.shard_prefix()).join(loc.as_str())]
    );
}

#[tokio::test]
async fn exhausted_attempts_need_attention_until_retried() {
    let h = Harness::new().await;
    let flaky = FlakyUnit::wrap(h.durable_local("disk").await);
    flaky.failing_writes.store(2, Ordering::SeqCst);
    let target: Arc<dyn StorageUnit> = flaky.clone();
    let config = SyncConfig {
        max_attempts: 2,
        ..fast_retries()
    };
    let engine = h.engine(vec![target.clone()], config, grace(0));
    let item = h.ingest(b"needs attention").await;
    let cancel = CancellationToken::new();

    assert_eq!(engine.run_cycle(&cancel).await.unwrap().failed, 1);
    assert_eq!(engine.run_cycle(&cancel).await.unwrap().failed, 1);

    let skipped = engine.run_cycle(&cancel).await.unwrap();
    assert_eq!(skipped.needs_attention, 1);
    assert_eq!(skipped.bound, 0);

    let alerts: Vec<_> = engine
        .status()
        .await
        .into_iter()
        .filter(|l| l.status == StatusLevel::Alert)
        .collect();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].component.contains(&item.id().to_string()));

    assert!(engine.retry(item.id(), target.id()).await.unwrap());
    assert_eq!(engine.run_cycle(&cancel).await.unwrap().bound, 1);
}

#[tokio::test]
async fn retries_wait_for_backoff() {
    let h = Harness::new().await;
    let flaky = FlakyUnit::wrap(h.durable_local("disk").await);
    flaky.failing_writes.store(1, Ordering::SeqCst);
    let target: Arc<dyn StorageUnit> = flaky.clone();
    let config = SyncConfig {
        backoff_base_secs: 30,
        backoff_max_secs: 600,
        ..SyncConfig::default()
    };
    let engine = h.engine(vec![target], config, grace(0));
    h.ingest(b"backoff").await;
    let cancel = CancellationToken::new();

    assert_eq!(engine.run_cycle(&cancel).await.unwrap().failed, 1);
    assert_eq!(engine.run_cycle(&cancel).await.unwrap().deferred, 1);
    h.clock.advance(Duration::from_secs(31));
    assert_eq!(engine.run_cycle(&cancel).await.unwrap().bound, 1);
}

#[tokio::test]
async fn size_mismatch_is_never_bound() {
    let h = Harness::new().await;
    let flaky = FlakyUnit::wrap(h.durable_local("disk").await);
    flaky.misreport_size.store(true, Ordering::SeqCst);
    let target: Arc<dyn StorageUnit> = flaky.clone();
    let engine = h.engine(vec![target.clone()], fast_retries(), grace(0));
    let item = h.ingest(b"verify me").await;

    let err = engine
        .sync_item(item.id(), target.id(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Integrity { .. }));
    assert!(h.metadata.lookup_binding(item.id(), target.id()).await.unwrap().is_none());
    assert!(files(&h.path("disk")).is_empty());
}

#[tokio::test]
async fn missing_buffer_object_needs_attention() {
    let h = Harness::new().await;
    let disk = h.durable_local("disk").await;
    let engine = h.engine(vec![disk.clone()], fast_retries(), grace(0));
    let item = h.ingest(b"vanished").await;
    let binding = h
        .metadata
        .lookup_binding(item.id(), h.buffer.id())
        .await
        .unwrap()
        .unwrap();
    h.buffer.remove(&binding).await.unwrap();

    let err = engine
        .sync_item(item.id(), disk.id(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let record = h.metadata.failure(item.id(), disk.id()).await.unwrap().unwrap();
    assert!(record.needs_attention);
}

#[tokio::test]
async fn cancellation_aborts_without_recording_failure() {
    let h = Harness::new().await;
    let flaky = FlakyUnit::wrap(h.durable_local("disk").await);
    flaky.stall_writes.store(true, Ordering::SeqCst);
    let target: Arc<dyn StorageUnit> = flaky.clone();
    let engine = h.engine(vec![target.clone()], fast_retries(), grace(0));
    let item = h.ingest(b"slow").await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let outcome = engine.sync_item(item.id(), target.id(), &cancel).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Cancelled);

    assert!(h.metadata.failure(item.id(), target.id()).await.unwrap().is_none());
    assert!(files(&h.path("disk")).is_empty());
    // Lease released: another owner can claim the pair right away.
    assert!(h
        .metadata
        .acquire_lease(item.id(), target.id(), "someone-else", Duration::from_secs(60))
        .await
        .unwrap());
}

#[tokio::test]
async fn concurrent_workers_bind_exactly_once() {
    let h = Harness::new().await;
    let disk = h.durable_local("disk").await;
    let item = h.ingest(&vec![42u8; 300_000]).await;

    let mut tasks = Vec::new();
    for n in 0..8 {
        let engine = Arc::new(
            SyncEngine::new(
                h.buffer.clone(),
                vec![disk.clone()],
                h.metadata.clone(),
                h.clock.clone(),
                SyncConfig::default(),
                grace(0),
            )
            .unwrap()
            .with_owner(format!("worker-{n}")),
        );
        let unit = disk.id().clone();
        let id = item.id();
        tasks.push(tokio::spawn(async move {
            engine
                .sync_item(id, &unit, &CancellationToken::new())
                .await
                .unwrap()
        }));
    }

    let mut bound = 0;
    for task in tasks {
        match task.await.unwrap() {
            SyncOutcome::Bound { .. } => bound += 1,
            SyncOutcome::LeaseHeld | SyncOutcome::AlreadyBound => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(bound, 1);
    let bindings = h.metadata.bindings_for_item(item.id()).await.unwrap();
    assert_eq!(bindings.iter().filter(|b| b.unit_id == *disk.id()).count(), 1);
}

#[tokio::test]
async fn workers_of_one_engine_transfer_once() {
    let h = Harness::new().await;
    let disk = FlakyUnit::wrap(h.durable_local("disk").await);
    let target: Arc<dyn StorageUnit> = disk.clone();
    let engine = h.engine(vec![target], SyncConfig::default(), grace(0));
    let item = h.ingest(&vec![7u8; 300_000]).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let unit = disk.id().clone();
        let id = item.id();
        tasks.push(tokio::spawn(async move {
            engine
                .sync_item(id, &unit, &CancellationToken::new())
                .await
                .unwrap()
        }));
    }

    let mut bound = 0;
    for task in tasks {
        match task.await.unwrap() {
            SyncOutcome::Bound { .. } => bound += 1,
            SyncOutcome::LeaseHeld | SyncOutcome::AlreadyBound => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(bound, 1);
    assert_eq!(disk.writers_opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bind_stands_when_failure_record_cannot_be_cleared() {
    let h = Harness::new().await;
    let metadata = InstrumentedMetadata::wrap(h.metadata.clone());
    let flaky = FlakyUnit::wrap(h.durable_local("disk").await);
    let target: Arc<dyn StorageUnit> = flaky.clone();
    let engine = SyncEngine::new(
        h.buffer.clone(),
        vec![target],
        metadata.clone(),
        h.clock.clone(),
        fast_retries(),
        grace(0),
    )
    .unwrap();
    let item = h.ingest(b"bound despite bookkeeping").await;
    let cancel = CancellationToken::new();

    flaky.failing_writes.store(1, Ordering::SeqCst);
    assert!(engine.sync_item(item.id(), flaky.id(), &cancel).await.is_err());
    assert!(h.metadata.failure(item.id(), flaky.id()).await.unwrap().is_some());

    metadata.refuse_clear.store(true, Ordering::SeqCst);
    let outcome = engine.sync_item(item.id(), flaky.id(), &cancel).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Bound { .. }), "{outcome:?}");
    assert!(h
        .metadata
        .lookup_binding(item.id(), flaky.id())
        .await
        .unwrap()
        .is_some());

    // The stale record goes away on the next successful clear.
    metadata.refuse_clear.store(false, Ordering::SeqCst);
    assert!(metadata.clear_failure(item.id(), flaky.id()).await.unwrap());
}

#[tokio::test]
async fn failed_ingest_leaves_no_incoming_item() {
    let h = Harness::new().await;
    let metadata = InstrumentedMetadata::wrap(h.metadata.clone());
    let buffer = FlakyUnit::wrap(h.buffer.clone());
    buffer.failing_writes.store(1, Ordering::SeqCst);

    let err = ingest(
        buffer.as_ref(),
        metadata.as_ref(),
        h.clock.as_ref(),
        ItemType::StepLog,
        b"never lands",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SyncError::Unit { .. }), "{err:?}");

    let registered = metadata.registered();
    assert_eq!(registered.len(), 1);
    assert!(h.metadata.get_item(registered[0]).await.unwrap().is_none());
    assert!(files(&h.path("buffer")).is_empty());
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn grace_elapsed_evicts_buffer_copy() {
    let h = Harness::new().await;
    let nfs = h.durable_nfs("nfs").await;
    let engine = h.engine(vec![nfs.clone()], SyncConfig::default(), grace(60));
    let item = h.ingest(b"hello world").await;
    let cancel = CancellationToken::new();
    engine.run_cycle(&cancel).await.unwrap();

    assert_eq!(engine.evict_cycle(&cancel).await.unwrap().evicted, 0);
    h.clock.advance(Duration::from_secs(61));
    let report = engine.evict_cycle(&cancel).await.unwrap();
    assert_eq!(report.evicted, 1);

    assert!(!h.buffer.item_exists(&item).await.unwrap());
    assert!(h.metadata.lookup_binding(item.id(), h.buffer.id()).await.unwrap().is_none());
    assert!(files(&h.path("buffer")).is_empty());
    assert!(nfs.item_exists(&item).await.unwrap());
    assert_eq!(
        read_item(nfs.as_ref(), h.metadata.as_ref(), item.id()).await.unwrap(),
        b"hello world"
    );
}

#[tokio::test]
async fn eviction_requires_every_durable_copy_by_default() {
    let h = Harness::new().await;
    let disk = h.durable_local("disk").await;
    let flaky = FlakyUnit::wrap(h.durable_local("flaky").await);
    flaky.failing_writes.store(u32::MAX, Ordering::SeqCst);
    let flaky: Arc<dyn StorageUnit> = flaky;
    let engine = h.engine(vec![disk, flaky], fast_retries(), grace(0));
    let item = h.ingest(b"two copies please").await;
    engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        engine.evict_item(item.id()).await.unwrap(),
        EvictionDecision::InsufficientReplicas {
            confirmed: 1,
            required: 2
        }
    );
    assert!(h.buffer.item_exists(&item).await.unwrap());
}

#[tokio::test]
async fn eviction_honors_lower_replica_requirement() {
    let h = Harness::new().await;
    let disk = h.durable_local("disk").await;
    let flaky = FlakyUnit::wrap(h.durable_local("flaky").await);
    flaky.failing_writes.store(u32::MAX, Ordering::SeqCst);
    let flaky: Arc<dyn StorageUnit> = flaky;
    let policy = BufferPolicy {
        required_replicas: Some(1),
        grace_period_secs: 0,
    };
    let engine = h.engine(vec![disk, flaky], fast_retries(), policy);
    let item = h.ingest(b"one copy is enough").await;
    engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(engine.evict_item(item.id()).await.unwrap(), EvictionDecision::Evicted);
}

#[tokio::test]
async fn orphaned_durable_binding_blocks_eviction() {
    let h = Harness::new().await;
    let disk = h.durable_local("disk").await;
    let engine = h.engine(vec![disk.clone()], fast_retries(), grace(0));
    let item = h.ingest(b"orphan").await;
    engine.run_cycle(&CancellationToken::new()).await.unwrap();

    // Physical copy lost behind the metadata's back.
    let binding = h.metadata.lookup_binding(item.id(), disk.id()).await.unwrap().unwrap();
    disk.remove(&binding).await.unwrap();

    assert_eq!(
        engine.evict_item(item.id()).await.unwrap(),
        EvictionDecision::InsufficientReplicas {
            confirmed: 0,
            required: 1
        }
    );
}

#[tokio::test]
async fn missing_buffer_object_still_clears_binding_on_eviction() {
    let h = Harness::new().await;
    let disk = h.durable_local("disk").await;
    let engine = h.engine(vec![disk], fast_retries(), grace(0));
    let item = h.ingest(b"already gone").await;
    engine.run_cycle(&CancellationToken::new()).await.unwrap();

    let binding = h.metadata.lookup_binding(item.id(), h.buffer.id()).await.unwrap().unwrap();
    h.buffer.remove(&binding).await.unwrap();
    assert_eq!(engine.evict_item(item.id()).await.unwrap(), EvictionDecision::Evicted);
    assert!(h.metadata.lookup_binding(item.id(), h.buffer.id()).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Engine assembly and runner
// ---------------------------------------------------------------------------

#[tokio::test]
async fn engine_rejects_bad_topology() {
    let h = Harness::new().await;
    let disk = h.durable_local("disk").await;

    let no_targets = SyncEngine::new(
        h.buffer.clone(),
        vec![],
        h.metadata.clone(),
        h.clock.clone(),
        SyncConfig::default(),
        grace(0),
    );
    assert!(matches!(no_targets, Err(SyncError::Configuration(_))));

    let too_many = SyncEngine::new(
        h.buffer.clone(),
        vec![disk.clone()],
        h.metadata.clone(),
        h.clock.clone(),
        SyncConfig::default(),
        BufferPolicy {
            required_replicas: Some(2),
            grace_period_secs: 0,
        },
    );
    assert!(matches!(too_many, Err(SyncError::Configuration(_))));

    let swapped = SyncEngine::new(
        disk.clone(),
        vec![h.buffer.clone()],
        h.metadata.clone(),
        h.clock.clone(),
        SyncConfig::default(),
        grace(0),
    );
    assert!(matches!(swapped, Err(SyncError::Configuration(_))));
}

#[tokio::test]
async fn runner_replicates_until_cancelled() {
    let h = Harness::new().await;
    let disk = h.durable_local("disk").await;
    let config = SyncConfig {
        interval_secs: 1,
        ..SyncConfig::default()
    };
    let engine = h.engine(vec![disk.clone()], config, grace(3600));
    let item = h.ingest(b"background").await;

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(engine.clone().run(cancel.clone()));
    for _ in 0..100 {
        if disk.item_exists(&item).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    runner.await.unwrap();
    assert!(disk.item_exists(&item).await.unwrap());
}

#[tokio::test]
async fn status_covers_units_and_backlog() {
    let h = Harness::new().await;
    let disk = h.durable_local("disk").await;
    let engine = h.engine(vec![disk], SyncConfig::default(), grace(0));
    h.ingest(b"pending").await;

    let lines = engine.status().await;
    let find = |component: &str| {
        lines
            .iter()
            .find(|l| l.component == component)
            .unwrap_or_else(|| panic!("missing {component}"))
            .clone()
    };
    assert_eq!(find("unit/buffer").status, StatusLevel::Ok);
    assert_eq!(find("unit/disk").status, StatusLevel::Ok);
    assert_eq!(find("buffer/buffer").value, "1 items held");
    let backlog = find("sync/disk");
    assert_eq!(backlog.status, StatusLevel::Warn);
    assert_eq!(backlog.value, "1 items pending");
}
