//! Foundation types for the CDN storage core.
//!
//! This crate provides the identity, addressing, and binding types shared by
//! every other crate in the workspace.
//!
//! # Key Types
//!
//! - [`Item`]: Immutable logical piece of content (log chunk, artifact, cache blob)
//! - [`Locator`]: Content-derived address deciding an item's physical path
//! - [`ItemUnit`]: Binding of one item to one storage unit
//! - [`UnitId`] / [`UnitRole`]: Configured storage unit name and tier
//! - [`MonitoringStatusLine`]: Health line for external monitoring
//! - [`Clock`]: Injectable wall clock for leases and eviction

pub mod clock;
pub mod error;
pub mod ids;
pub mod item;
pub mod locator;
pub mod status;

pub use clock::{delta, Clock, ManualClock, SystemClock};
pub use error::TypeError;
pub use ids::{ItemId, ItemUnitId, UnitId};
pub use item::{Item, ItemStatus, ItemType, ItemUnit, UnitRole};
pub use locator::{Locator, SHARD_PREFIX_LEN};
pub use status::{MonitoringStatusLine, StatusLevel};
