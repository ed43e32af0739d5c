use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cdn_types::{delta, Item, ItemId, ItemUnit, UnitId};

use crate::error::{MetaError, MetaResult};
use crate::types::{Lease, SyncFailure};

type PairKey = (ItemId, UnitId);

/// Plain metadata state shared by the in-memory and file-backed stores.
///
/// Callers hold a lock around every method, which is what makes each
/// operation atomic.
#[derive(Clone, Debug, Default)]
pub(crate) struct MetadataState {
    items: HashMap<ItemId, Item>,
    bindings: HashMap<PairKey, ItemUnit>,
    leases: HashMap<PairKey, Lease>,
    failures: HashMap<PairKey, SyncFailure>,
}

/// On-disk form: JSON maps need string keys, so records are flattened.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    items: Vec<Item>,
    bindings: Vec<ItemUnit>,
    leases: Vec<Lease>,
    failures: Vec<SyncFailure>,
}

impl MetadataState {
    pub(crate) fn put_item(&mut self, item: &Item) -> MetaResult<()> {
        if let Some(existing) = self.items.get(&item.id()) {
            if existing.is_finalized() && existing != item {
                return Err(MetaError::ImmutableItem(item.id()));
            }
        }
        self.items.insert(item.id(), item.clone());
        Ok(())
    }

    pub(crate) fn remove_incoming_item(&mut self, id: ItemId) -> bool {
        match self.items.get(&id) {
            Some(item) if !item.is_finalized() => {
                self.items.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn get_item(&self, id: ItemId) -> Option<Item> {
        self.items.get(&id).cloned()
    }

    pub(crate) fn lookup_binding(&self, item: ItemId, unit: &UnitId) -> Option<ItemUnit> {
        self.bindings.get(&(item, unit.clone())).cloned()
    }

    pub(crate) fn insert_binding(&mut self, binding: &ItemUnit) -> MetaResult<()> {
        if !self.items.contains_key(&binding.item_id) {
            return Err(MetaError::UnknownItem(binding.item_id));
        }
        let key = (binding.item_id, binding.unit_id.clone());
        if self.bindings.contains_key(&key) {
            return Err(MetaError::BindingExists {
                item: binding.item_id,
                unit: binding.unit_id.clone(),
            });
        }
        self.bindings.insert(key, binding.clone());
        Ok(())
    }

    pub(crate) fn remove_binding(&mut self, item: ItemId, unit: &UnitId) -> bool {
        self.bindings.remove(&(item, unit.clone())).is_some()
    }

    pub(crate) fn bindings_for_item(&self, item: ItemId) -> Vec<ItemUnit> {
        let mut out: Vec<ItemUnit> = self
            .bindings
            .values()
            .filter(|b| b.item_id == item)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        out
    }

    pub(crate) fn items_in_unit(&self, unit: &UnitId) -> Vec<ItemId> {
        let mut out: Vec<ItemId> = self
            .bindings
            .keys()
            .filter(|(_, u)| u == unit)
            .map(|(i, _)| *i)
            .collect();
        out.sort();
        out
    }

    pub(crate) fn items_missing_from(&self, source: &UnitId, target: &UnitId) -> Vec<ItemId> {
        self.items_in_unit(source)
            .into_iter()
            .filter(|item| !self.bindings.contains_key(&(*item, target.clone())))
            .collect()
    }

    pub(crate) fn acquire_lease(
        &mut self,
        item: ItemId,
        unit: &UnitId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let key = (item, unit.clone());
        if let Some(existing) = self.leases.get(&key) {
            if existing.owner != owner && !existing.is_expired(now) {
                return false;
            }
        }
        let expires_at = now.checked_add_signed(delta(ttl)).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.leases.insert(
            key,
            Lease {
                item_id: item,
                unit_id: unit.clone(),
                owner: owner.to_string(),
                expires_at,
            },
        );
        true
    }

    pub(crate) fn release_lease(&mut self, item: ItemId, unit: &UnitId, owner: &str) -> bool {
        let key = (item, unit.clone());
        match self.leases.get(&key) {
            Some(lease) if lease.owner == owner => {
                self.leases.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn record_failure(
        &mut self,
        item: ItemId,
        unit: &UnitId,
        reason: &str,
        max_attempts: u32,
        fatal: bool,
        now: DateTime<Utc>,
    ) -> SyncFailure {
        let record = self
            .failures
            .entry((item, unit.clone()))
            .or_insert_with(|| SyncFailure {
                item_id: item,
                unit_id: unit.clone(),
                attempts: 0,
                last_error: String::new(),
                last_attempt: now,
                needs_attention: false,
            });
        record.attempts = record.attempts.saturating_add(1);
        record.last_error = reason.to_string();
        record.last_attempt = now;
        record.needs_attention = record.needs_attention || fatal || record.attempts >= max_attempts;
        record.clone()
    }

    pub(crate) fn failure(&self, item: ItemId, unit: &UnitId) -> Option<SyncFailure> {
        self.failures.get(&(item, unit.clone())).cloned()
    }

    pub(crate) fn clear_failure(&mut self, item: ItemId, unit: &UnitId) -> bool {
        self.failures.remove(&(item, unit.clone())).is_some()
    }

    pub(crate) fn failures(&self) -> Vec<SyncFailure> {
        let mut out: Vec<SyncFailure> = self.failures.values().cloned().collect();
        out.sort_by(|a, b| (a.item_id, &a.unit_id).cmp(&(b.item_id, &b.unit_id)));
        out
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            items: self.items.values().cloned().collect(),
            bindings: self.bindings.values().cloned().collect(),
            leases: self.leases.values().cloned().collect(),
            failures: self.failures.values().cloned().collect(),
        }
    }

    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            items: snapshot.items.into_iter().map(|i| (i.id(), i)).collect(),
            bindings: snapshot
                .bindings
                .into_iter()
                .map(|b| ((b.item_id, b.unit_id.clone()), b))
                .collect(),
            leases: snapshot
                .leases
                .into_iter()
                .map(|l| ((l.item_id, l.unit_id.clone()), l))
                .collect(),
            failures: snapshot
                .failures
                .into_iter()
                .map(|f| ((f.item_id, f.unit_id.clone()), f))
                .collect(),
        }
    }
}
