use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cdn_types::{ItemId, UnitId};

/// Ephemeral claim on one (item, target unit) replication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub item_id: ItemId,
    pub unit_id: UnitId,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Failed replication attempts recorded for one (item, target unit) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub item_id: ItemId,
    pub unit_id: UnitId,
    pub attempts: u32,
    pub last_error: String,
    pub last_attempt: DateTime<Utc>,
    /// Excluded from automatic retries until an operator clears it.
    pub needs_attention: bool,
}
