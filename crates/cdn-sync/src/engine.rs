use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cdn_meta::{MetaError, MetadataStore};
use cdn_store::{BufferPolicy, StorageUnit};
use cdn_types::{delta, Clock, Item, ItemId, ItemUnit, UnitId, UnitRole};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::state::{CycleReport, PairProgress, SyncOutcome, SyncState};
use crate::transfer;

/// A durable target together with its concurrency limit.
pub(crate) struct Target {
    pub(crate) unit: Arc<dyn StorageUnit>,
    permits: Arc<Semaphore>,
}

/// Whether a pair may be attempted now.
#[derive(Debug, PartialEq, Eq)]
enum Eligibility {
    Ready,
    Deferred,
    NeedsAttention,
}

/// Replicates finalized items from the buffer unit to every durable unit
/// and evicts buffer copies once they are safely replicated.
///
/// Several engines, in one process or many, can share a metadata store.
/// Per-pair leases keep them from transferring the same pair at once.
pub struct SyncEngine {
    pub(crate) buffer: Arc<dyn StorageUnit>,
    pub(crate) targets: Vec<Target>,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: SyncConfig,
    pub(crate) policy: BufferPolicy,
    owner: String,
}

impl SyncEngine {
    pub fn new(
        buffer: Arc<dyn StorageUnit>,
        targets: Vec<Arc<dyn StorageUnit>>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
        policy: BufferPolicy,
    ) -> SyncResult<Self> {
        config.validate()?;
        if buffer.role() != UnitRole::Buffer {
            return Err(SyncError::Configuration(format!(
                "unit {} is not a buffer unit",
                buffer.id()
            )));
        }
        if targets.is_empty() {
            return Err(SyncError::Configuration("no durable units configured".into()));
        }
        let mut seen = HashSet::from([buffer.id().clone()]);
        for unit in &targets {
            if unit.role() != UnitRole::Durable {
                return Err(SyncError::Configuration(format!(
                    "unit {} is not a durable unit",
                    unit.id()
                )));
            }
            if !seen.insert(unit.id().clone()) {
                return Err(SyncError::Configuration(format!(
                    "unit {} configured twice",
                    unit.id()
                )));
            }
        }
        let required = policy.required(targets.len());
        if required == 0 || required > targets.len() {
            return Err(SyncError::Configuration(format!(
                "required_replicas must be between 1 and {}, got {required}",
                targets.len()
            )));
        }

        let targets = targets
            .into_iter()
            .map(|unit| Target {
                unit,
                permits: Arc::new(Semaphore::new(config.per_unit_concurrency)),
            })
            .collect();
        Ok(Self {
            buffer,
            targets,
            metadata,
            clock,
            config,
            policy,
            owner: format!("sync-{}", uuid::Uuid::now_v7()),
        })
    }

    /// Use a fixed engine name instead of a generated one. Leases are taken
    /// under `<name>/<attempt id>`.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn buffer(&self) -> &Arc<dyn StorageUnit> {
        &self.buffer
    }

    pub fn targets(&self) -> impl Iterator<Item = &Arc<dyn StorageUnit>> {
        self.targets.iter().map(|t| &t.unit)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Durable copies required before the buffer copy may go.
    pub fn required_replicas(&self) -> usize {
        self.policy.required(self.targets.len())
    }

    fn target(&self, id: &UnitId) -> SyncResult<&Arc<dyn StorageUnit>> {
        self.targets
            .iter()
            .find(|t| t.unit.id() == id)
            .map(|t| &t.unit)
            .ok_or_else(|| SyncError::UnknownUnit(id.to_string()))
    }

    /// Replicate one item to one target.
    ///
    /// Returns `Ok` for every non-failure outcome, including a lease held by
    /// another worker. Failures are recorded in the metadata store before
    /// they are returned.
    pub async fn sync_item(
        &self,
        item_id: ItemId,
        target_id: &UnitId,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncOutcome> {
        let target = self.target(target_id)?;
        let item = self
            .metadata
            .get_item(item_id)
            .await?
            .ok_or(SyncError::UnknownItem(item_id))?;
        if !item.is_finalized() {
            return Ok(SyncOutcome::NotReady);
        }

        // Each attempt leases under its own name so two workers of one
        // engine exclude each other like workers of different engines.
        let lease_owner = format!("{}/{}", self.owner, uuid::Uuid::now_v7());
        let mut progress = PairProgress::new(item_id, target_id);
        let leased = self
            .metadata
            .acquire_lease(item_id, target_id, &lease_owner, self.config.lease_ttl())
            .await?;
        if !leased {
            debug!(item = %item_id, unit = %target_id, "lease held elsewhere");
            return Ok(SyncOutcome::LeaseHeld);
        }
        progress.advance(SyncState::Leased);

        let result = self.replicate(&item, target.as_ref(), &mut progress, cancel).await;

        if let Err(e) = self
            .metadata
            .release_lease(item_id, target_id, &lease_owner)
            .await
        {
            warn!(item = %item_id, unit = %target_id, error = %e, "unable to release lease; it will expire");
        }

        match result {
            Ok(outcome) => {
                if matches!(outcome, SyncOutcome::Bound { .. }) {
                    if let Err(e) = self.metadata.clear_failure(item_id, target_id).await {
                        warn!(item = %item_id, unit = %target_id, error = %e, "bound, but the failure record was not cleared");
                    }
                }
                Ok(outcome)
            }
            Err(SyncError::Cancelled) => {
                info!(item = %item_id, unit = %target_id, "transfer cancelled");
                Ok(SyncOutcome::Cancelled)
            }
            Err(e) => {
                progress.advance(SyncState::Failed);
                let record = self
                    .metadata
                    .record_failure(
                        item_id,
                        target_id,
                        &e.to_string(),
                        self.config.max_attempts,
                        e.is_terminal(),
                    )
                    .await?;
                if record.needs_attention {
                    error!(
                        item = %item_id,
                        unit = %target_id,
                        attempts = record.attempts,
                        error = %e,
                        "replication needs attention"
                    );
                } else {
                    warn!(
                        item = %item_id,
                        unit = %target_id,
                        attempts = record.attempts,
                        retry_in = ?self.config.backoff(record.attempts),
                        error = %e,
                        "replication failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn replicate(
        &self,
        item: &Item,
        target: &dyn StorageUnit,
        progress: &mut PairProgress,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncOutcome> {
        if self
            .metadata
            .lookup_binding(item.id(), target.id())
            .await?
            .is_some()
        {
            progress.advance(SyncState::Bound);
            return Ok(SyncOutcome::AlreadyBound);
        }
        let source = self
            .metadata
            .lookup_binding(item.id(), self.buffer.id())
            .await?
            .ok_or(SyncError::NotInBuffer(item.id()))?;
        let binding = ItemUnit::for_item(item, target.id(), self.clock.now())?;

        progress.advance(SyncState::Transferring);
        let reader = self
            .buffer
            .new_reader(&source)
            .await
            .map_err(SyncError::unit(self.buffer.id(), "open reader"))?;
        let writer = match target.new_writer(&binding).await {
            Ok(writer) => writer,
            Err(e) => {
                if let Err(close_err) = reader.close().await {
                    error!(unit = %self.buffer.id(), error = %close_err, "reader close failed");
                }
                return Err(SyncError::unit(target.id(), "open writer")(e));
            }
        };
        let moved = transfer::copy(reader, writer, self.buffer.id(), target.id(), cancel).await?;

        progress.advance(SyncState::Verifying);
        if let Err(e) = self.verify(item, target, &binding, moved).await {
            if let Err(remove_err) = target.remove(&binding).await {
                if !remove_err.is_not_found() {
                    error!(unit = %target.id(), error = %remove_err, "unable to remove unverified object");
                }
            }
            return Err(e);
        }

        match self.metadata.insert_binding(&binding).await {
            Ok(()) => {}
            Err(MetaError::BindingExists { .. }) => {
                progress.advance(SyncState::Bound);
                return Ok(SyncOutcome::AlreadyBound);
            }
            Err(e) => return Err(e.into()),
        }
        progress.advance(SyncState::Bound);
        info!(
            item = %item.id(),
            unit = %target.id(),
            locator = %binding.locator,
            bytes = moved.stored,
            "item replicated"
        );
        Ok(SyncOutcome::Bound {
            stored_bytes: moved.stored,
        })
    }

    async fn verify(
        &self,
        item: &Item,
        target: &dyn StorageUnit,
        binding: &ItemUnit,
        moved: transfer::Transferred,
    ) -> SyncResult<()> {
        if let Some(size) = item.size() {
            if size != moved.plaintext {
                return Err(SyncError::Integrity {
                    unit: target.id().clone(),
                    reason: format!("copied {} bytes, item has {size}", moved.plaintext),
                });
            }
        }
        let actual = target
            .stat(binding)
            .await
            .map_err(SyncError::unit(target.id(), "stat"))?;
        if actual != Some(moved.stored) {
            return Err(SyncError::Integrity {
                unit: target.id().clone(),
                reason: format!("stored {} bytes, found {actual:?}", moved.stored),
            });
        }
        Ok(())
    }

    async fn eligibility(&self, item: ItemId, target: &UnitId) -> SyncResult<Eligibility> {
        let Some(failure) = self.metadata.failure(item, target).await? else {
            return Ok(Eligibility::Ready);
        };
        if failure.needs_attention {
            return Ok(Eligibility::NeedsAttention);
        }
        let wait = delta(self.config.backoff(failure.attempts));
        let due = failure
            .last_attempt
            .checked_add_signed(wait)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
        if self.clock.now() >= due {
            Ok(Eligibility::Ready)
        } else {
            Ok(Eligibility::Deferred)
        }
    }

    /// One replication pass over every pair missing from a target.
    ///
    /// Pairs run as independent tasks, at most `per_unit_concurrency` at a
    /// time per target. Individual failures are counted, not returned.
    pub async fn run_cycle(self: &Arc<Self>, cancel: &CancellationToken) -> SyncResult<CycleReport> {
        let mut report = CycleReport::default();
        let mut tasks = JoinSet::new();

        for target in &self.targets {
            let target_id = target.unit.id();
            let missing = self
                .metadata
                .items_missing_from(self.buffer.id(), target_id)
                .await?;
            for item in missing {
                match self.eligibility(item, target_id).await? {
                    Eligibility::Ready => {}
                    Eligibility::Deferred => {
                        report.deferred += 1;
                        continue;
                    }
                    Eligibility::NeedsAttention => {
                        report.needs_attention += 1;
                        continue;
                    }
                }
                let engine = Arc::clone(self);
                let permits = Arc::clone(&target.permits);
                let unit = target_id.clone();
                let cancel = cancel.child_token();
                tasks.spawn(async move {
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => None,
                        permit = permits.acquire_owned() => permit.ok(),
                    };
                    let Some(_permit) = permit else {
                        return Ok(SyncOutcome::Cancelled);
                    };
                    engine.sync_item(item, &unit, &cancel).await
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(&outcome),
                Ok(Err(_)) => report.failed += 1,
                Err(e) => {
                    error!(error = %e, "replication task panicked");
                    report.failed += 1;
                }
            }
        }

        info!(
            bound = report.bound,
            failed = report.failed,
            deferred = report.deferred,
            lease_held = report.lease_held,
            needs_attention = report.needs_attention,
            "replication cycle finished"
        );
        Ok(report)
    }

    /// Replicate and evict on a fixed interval until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(owner = %self.owner, interval = ?self.config.interval(), "sync runner started");
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(owner = %self.owner, "sync runner cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle(&cancel).await {
                        error!(error = %e, "replication cycle failed");
                    }
                    if cancel.is_cancelled() {
                        continue;
                    }
                    if let Err(e) = self.evict_cycle(&cancel).await {
                        error!(error = %e, "eviction cycle failed");
                    }
                }
            }
        }
    }

    /// Reset a pair that needs attention so the next cycle retries it.
    /// Returns `false` if there was no failure on record.
    pub async fn retry(&self, item: ItemId, unit: &UnitId) -> SyncResult<bool> {
        self.target(unit)?;
        let cleared = self.metadata.clear_failure(item, unit).await?;
        if cleared {
            info!(item = %item, unit = %unit, "failure cleared for retry");
        }
        Ok(cleared)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("owner", &self.owner)
            .field("buffer", self.buffer.id())
            .field(
                "targets",
                &self.targets.iter().map(|t| t.unit.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
