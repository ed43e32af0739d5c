//! Buffer eviction: drop the buffer copy once enough durable copies exist
//! and the grace period has passed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cdn_types::{delta, ItemId};

use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};

/// Why an item was or was not evicted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum EvictionDecision {
    Evicted,
    NotInBuffer,
    NotFinalized,
    InGracePeriod { remaining: Duration },
    InsufficientReplicas { confirmed: usize, required: usize },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionReport {
    pub evicted: usize,
    pub retained: usize,
    pub errors: usize,
}

impl SyncEngine {
    /// Evict one item's buffer copy if policy allows it.
    pub async fn evict_item(&self, item_id: ItemId) -> SyncResult<EvictionDecision> {
        let item = self
            .metadata
            .get_item(item_id)
            .await?
            .ok_or(SyncError::UnknownItem(item_id))?;
        let Some(binding) = self
            .metadata
            .lookup_binding(item_id, self.buffer.id())
            .await?
        else {
            return Ok(EvictionDecision::NotInBuffer);
        };
        let Some(finalized_at) = item.finalized_at() else {
            return Ok(EvictionDecision::NotFinalized);
        };

        let now = self.clock.now();
        let eligible_at = finalized_at
            .checked_add_signed(delta(self.policy.grace_period()))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
        if now < eligible_at {
            let remaining = (eligible_at - now).to_std().unwrap_or_default();
            return Ok(EvictionDecision::InGracePeriod { remaining });
        }

        let required = self.required_replicas();
        let mut confirmed = 0;
        for target in self.targets() {
            let present = target
                .item_exists(&item)
                .await
                .map_err(SyncError::unit(target.id(), "item_exists"))?;
            if present {
                confirmed += 1;
            }
        }
        if confirmed < required {
            return Ok(EvictionDecision::InsufficientReplicas {
                confirmed,
                required,
            });
        }

        match self.buffer.remove(&binding).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!(item = %item_id, locator = %binding.locator, "buffer object already gone");
            }
            Err(e) => return Err(SyncError::unit(self.buffer.id(), "remove")(e)),
        }
        self.metadata.remove_binding(item_id, self.buffer.id()).await?;
        info!(item = %item_id, locator = %binding.locator, replicas = confirmed, "buffer copy evicted");
        Ok(EvictionDecision::Evicted)
    }

    /// Apply the eviction policy to every item held by the buffer.
    pub async fn evict_cycle(&self, cancel: &CancellationToken) -> SyncResult<EvictionReport> {
        let mut report = EvictionReport::default();
        for item in self.metadata.items_in_unit(self.buffer.id()).await? {
            if cancel.is_cancelled() {
                break;
            }
            match self.evict_item(item).await {
                Ok(EvictionDecision::Evicted) => report.evicted += 1,
                Ok(decision) => {
                    debug!(item = %item, ?decision, "buffer copy retained");
                    report.retained += 1;
                }
                Err(e) => {
                    warn!(item = %item, error = %e, "eviction check failed");
                    report.errors += 1;
                }
            }
        }
        info!(
            evicted = report.evicted,
            retained = report.retained,
            errors = report.errors,
            "eviction cycle finished"
        );
        Ok(report)
    }
}
