use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::ids::{ItemId, ItemUnitId, UnitId};
use crate::locator::Locator;

/// Kind of content an item carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemType {
    /// Output of a job step.
    StepLog,
    /// Output of a service container attached to a job.
    ServiceLog,
    /// Artifact uploaded by a job.
    RunResult,
    /// Worker cache blob.
    WorkerCache,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepLog => "step-log",
            Self::ServiceLog => "service-log",
            Self::RunResult => "run-result",
            Self::WorkerCache => "worker-cache",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step-log" => Ok(Self::StepLog),
            "service-log" => Ok(Self::ServiceLog),
            "run-result" => Ok(Self::RunResult),
            "worker-cache" => Ok(Self::WorkerCache),
            other => Err(TypeError::UnknownItemType(other.to_string())),
        }
    }
}

/// Lifecycle of an item's content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Content is still being produced; no locator yet.
    Incoming,
    /// Content reference is set and can never change again.
    Completed,
}

/// Logical piece of produced content.
///
/// Fields are private: the content reference can only be set once, through
/// [`Item::finalize`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    id: ItemId,
    item_type: ItemType,
    locator: Option<Locator>,
    size: Option<u64>,
    status: ItemStatus,
    created: DateTime<Utc>,
    finalized_at: Option<DateTime<Utc>>,
}

impl Item {
    /// Create a new incoming item.
    pub fn new(item_type: ItemType, created: DateTime<Utc>) -> Self {
        Self {
            id: ItemId::new(),
            item_type,
            locator: None,
            size: None,
            status: ItemStatus::Incoming,
            created,
            finalized_at: None,
        }
    }

    /// Set the content reference. Fails if the item is already finalized.
    pub fn finalize(
        &mut self,
        locator: Locator,
        size: u64,
        at: DateTime<Utc>,
    ) -> Result<(), TypeError> {
        if self.status == ItemStatus::Completed {
            return Err(TypeError::AlreadyFinalized(self.id.to_string()));
        }
        self.locator = Some(locator);
        self.size = Some(size);
        self.status = ItemStatus::Completed;
        self.finalized_at = Some(at);
        Ok(())
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    pub fn locator(&self) -> Option<&Locator> {
        self.locator.as_ref()
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn finalized_at(&self) -> Option<DateTime<Utc>> {
        self.finalized_at
    }

    pub fn is_finalized(&self) -> bool {
        self.status == ItemStatus::Completed
    }
}

/// Tier a storage unit belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitRole {
    /// Fast, short-lived tier written by running jobs. Eligible for eviction.
    Buffer,
    /// Long-retention tier items are replicated into.
    Durable,
}

impl fmt::Display for UnitRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer => f.write_str("buffer"),
            Self::Durable => f.write_str("durable"),
        }
    }
}

/// Binding of one item to one storage unit.
///
/// At most one binding exists per (item, unit) pair; the metadata store
/// enforces this.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemUnit {
    pub id: ItemUnitId,
    pub item_id: ItemId,
    pub unit_id: UnitId,
    pub locator: Locator,
    pub created: DateTime<Utc>,
}

impl ItemUnit {
    /// Build a binding for a finalized item.
    pub fn for_item(item: &Item, unit: &UnitId, at: DateTime<Utc>) -> Result<Self, TypeError> {
        let locator = item
            .locator()
            .cloned()
            .ok_or_else(|| TypeError::NotFinalized(item.id().to_string()))?;
        Ok(Self {
            id: ItemUnitId::new(),
            item_id: item.id(),
            unit_id: unit.clone(),
            locator,
            created: at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator() -> Locator {
        Locator::new("0a1b2c3d4e5f").unwrap()
    }

    #[test]
    fn new_item_is_incoming() {
        let item = Item::new(ItemType::StepLog, Utc::now());
        assert_eq!(item.status(), ItemStatus::Incoming);
        assert!(item.locator().is_none());
        assert!(!item.is_finalized());
    }

    #[test]
    fn finalize_sets_content_reference_once() {
        let now = Utc::now();
        let mut item = Item::new(ItemType::RunResult, now);
        item.finalize(locator(), 11, now).unwrap();
        assert!(item.is_finalized());
        assert_eq!(item.size(), Some(11));
        assert_eq!(item.finalized_at(), Some(now));

        let again = item.finalize(Locator::new("ffffff").unwrap(), 1, now);
        assert!(matches!(again, Err(TypeError::AlreadyFinalized(_))));
        assert_eq!(item.locator(), Some(&locator()));
    }

    #[test]
    fn binding_requires_finalized_item() {
        let now = Utc::now();
        let unit = UnitId::new("nfs").unwrap();
        let mut item = Item::new(ItemType::StepLog, now);
        assert!(matches!(
            ItemUnit::for_item(&item, &unit, now),
            Err(TypeError::NotFinalized(_))
        ));

        item.finalize(locator(), 3, now).unwrap();
        let iu = ItemUnit::for_item(&item, &unit, now).unwrap();
        assert_eq!(iu.item_id, item.id());
        assert_eq!(iu.unit_id, unit);
        assert_eq!(iu.locator, locator());
    }

    #[test]
    fn item_type_parse_roundtrip() {
        for t in [
            ItemType::StepLog,
            ItemType::ServiceLog,
            ItemType::RunResult,
            ItemType::WorkerCache,
        ] {
            assert_eq!(t.as_str().parse::<ItemType>().unwrap(), t);
        }
        assert!("nope".parse::<ItemType>().is_err());
    }

    #[test]
    fn role_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&UnitRole::Buffer).unwrap(), "\"buffer\"");
        let r: UnitRole = serde_json::from_str("\"durable\"").unwrap();
        assert_eq!(r, UnitRole::Durable);
    }
}
