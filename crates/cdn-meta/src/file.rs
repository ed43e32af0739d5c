//! JSON-file metadata store.
//!
//! [`FileMetadataStore`] keeps the full state in memory and rewrites a JSON
//! snapshot after every mutation. The snapshot is written to a temporary file
//! in the same directory and atomically renamed over the previous one, so a
//! crash leaves either the old or the new snapshot, never a torn file.
//! A mutation becomes visible only after its snapshot is on disk; if the
//! write fails the in-memory state is left as it was.
//!
//! Atomicity of lease claims holds within one process. Several processes
//! sharing a snapshot file need a real database behind [`MetadataStore`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use cdn_types::{Clock, Item, ItemId, ItemUnit, UnitId};

use crate::error::{MetaError, MetaResult};
use crate::state::{MetadataState, Snapshot};
use crate::traits::MetadataStore;
use crate::types::SyncFailure;

pub struct FileMetadataStore {
    path: PathBuf,
    /// Committed state. The guard is held across the snapshot write so
    /// mutations land on disk in the order they were applied.
    state: Mutex<MetadataState>,
    clock: Arc<dyn Clock>,
}

impl FileMetadataStore {
    /// Open the snapshot at `path`, or start empty if it does not exist.
    pub fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> MetaResult<Self> {
        let path = path.into();
        let snapshot = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)
                .map_err(|e| MetaError::Serialization(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), "metadata store opened");
        Ok(Self {
            path,
            state: Mutex::new(MetadataState::from_snapshot(snapshot)),
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<T>(&self, f: impl FnOnce(&MetadataState) -> T) -> T {
        f(&*self.state.lock().await)
    }

    /// Apply `f` to a copy of the state and commit the copy only once its
    /// snapshot is on disk. `f` returns whether it changed anything; an
    /// unchanged state is not rewritten.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut MetadataState, DateTime<Utc>) -> MetaResult<(T, bool)>,
    ) -> MetaResult<T> {
        let mut committed = self.state.lock().await;
        let mut next = committed.clone();
        let (out, changed) = f(&mut next, self.clock.now())?;
        if changed {
            let path = self.path.clone();
            let snapshot = next.snapshot();
            tokio::task::spawn_blocking(move || write_snapshot(&path, &snapshot))
                .await
                .map_err(|e| MetaError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
            *committed = next;
        }
        Ok(out)
    }
}

/// Write `snapshot` to a temporary sibling of `path`, then rename it over.
fn write_snapshot(path: &Path, snapshot: &Snapshot) -> MetaResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    let bytes =
        serde_json::to_vec_pretty(snapshot).map_err(|e| MetaError::Serialization(e.to_string()))?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| MetaError::Io(e.error))?;
    debug!(path = %path.display(), bytes = bytes.len(), "metadata snapshot written");
    Ok(())
}

impl std::fmt::Debug for FileMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMetadataStore")
            .field("path", &self.path)
            .finish()
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn put_item(&self, item: &Item) -> MetaResult<()> {
        self.mutate(|state, _| state.put_item(item).map(|()| ((), true)))
            .await
    }

    async fn remove_incoming_item(&self, id: ItemId) -> MetaResult<bool> {
        self.mutate(|state, _| {
            let removed = state.remove_incoming_item(id);
            Ok((removed, removed))
        })
        .await
    }

    async fn get_item(&self, id: ItemId) -> MetaResult<Option<Item>> {
        Ok(self.read(|state| state.get_item(id)).await)
    }

    async fn lookup_binding(&self, item: ItemId, unit: &UnitId) -> MetaResult<Option<ItemUnit>> {
        Ok(self.read(|state| state.lookup_binding(item, unit)).await)
    }

    async fn insert_binding(&self, binding: &ItemUnit) -> MetaResult<()> {
        self.mutate(|state, _| state.insert_binding(binding).map(|()| ((), true)))
            .await
    }

    async fn remove_binding(&self, item: ItemId, unit: &UnitId) -> MetaResult<bool> {
        self.mutate(|state, _| {
            let removed = state.remove_binding(item, unit);
            Ok((removed, removed))
        })
        .await
    }

    async fn bindings_for_item(&self, item: ItemId) -> MetaResult<Vec<ItemUnit>> {
        Ok(self.read(|state| state.bindings_for_item(item)).await)
    }

    async fn items_in_unit(&self, unit: &UnitId) -> MetaResult<Vec<ItemId>> {
        Ok(self.read(|state| state.items_in_unit(unit)).await)
    }

    async fn items_missing_from(
        &self,
        source: &UnitId,
        target: &UnitId,
    ) -> MetaResult<Vec<ItemId>> {
        Ok(self
            .read(|state| state.items_missing_from(source, target))
            .await)
    }

    async fn acquire_lease(
        &self,
        item: ItemId,
        unit: &UnitId,
        owner: &str,
        ttl: Duration,
    ) -> MetaResult<bool> {
        self.mutate(|state, now| {
            let acquired = state.acquire_lease(item, unit, owner, ttl, now);
            Ok((acquired, acquired))
        })
        .await
    }

    async fn release_lease(&self, item: ItemId, unit: &UnitId, owner: &str) -> MetaResult<()> {
        self.mutate(|state, _| Ok(((), state.release_lease(item, unit, owner))))
            .await
    }

    async fn record_failure(
        &self,
        item: ItemId,
        unit: &UnitId,
        reason: &str,
        max_attempts: u32,
        fatal: bool,
    ) -> MetaResult<SyncFailure> {
        self.mutate(|state, now| {
            let record = state.record_failure(item, unit, reason, max_attempts, fatal, now);
            Ok((record, true))
        })
        .await
    }

    async fn failure(&self, item: ItemId, unit: &UnitId) -> MetaResult<Option<SyncFailure>> {
        Ok(self.read(|state| state.failure(item, unit)).await)
    }

    async fn clear_failure(&self, item: ItemId, unit: &UnitId) -> MetaResult<bool> {
        self.mutate(|state, _| {
            let cleared = state.clear_failure(item, unit);
            Ok((cleared, cleared))
        })
        .await
    }

    async fn failures(&self) -> MetaResult<Vec<SyncFailure>> {
        Ok(self.read(|state| state.failures()).await)
    }
}
