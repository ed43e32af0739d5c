//! Metadata store adapter for the CDN storage core.
//!
//! The relational metadata store is an external collaborator. This crate
//! defines the narrow interface the storage core consumes from it
//! ([`MetadataStore`]) and ships two implementations:
//!
//! - [`InMemoryMetadataStore`]: mutex-guarded maps for tests and embedding
//! - [`FileMetadataStore`]: the same state persisted as a JSON snapshot
//!
//! # Guarantees
//!
//! 1. At most one binding per (item, unit) pair.
//! 2. Lease acquisition is an atomic claim-if-absent-or-expired.
//! 3. Only a lease's owner can release it.
//! 4. A finalized item's content reference can never be replaced.

pub mod error;
pub mod file;
pub mod memory;
mod state;
pub mod traits;
pub mod types;

pub use error::{MetaError, MetaResult};
pub use file::FileMetadataStore;
pub use memory::InMemoryMetadataStore;
pub use traits::MetadataStore;
pub use types::{Lease, SyncFailure};
