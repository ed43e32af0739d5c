//! Replication engine for the CDN storage core.
//!
//! New content lands in a single buffer unit. The [`SyncEngine`] copies each
//! finalized item to every durable unit, verifies the copy, binds it in the
//! metadata store, and evicts the buffer copy once enough durable copies
//! exist and the grace period has passed.
//!
//! # Guarantees
//!
//! 1. An (item, unit) pair is bound only after its physical copy is verified.
//! 2. At most one worker transfers a pair at a time (per-pair leases).
//! 3. A buffer copy is never removed while fewer than the required number of
//!    durable copies are confirmed present.
//! 4. Failed pairs back off exponentially and stop after `max_attempts`,
//!    waiting for an operator [`retry`](SyncEngine::retry).

pub mod config;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod ingest;
pub mod state;
pub mod status;
pub mod transfer;

pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use eviction::{EvictionDecision, EvictionReport};
pub use ingest::{ingest, read_item};
pub use state::{CycleReport, SyncOutcome, SyncState};
pub use transfer::Transferred;
