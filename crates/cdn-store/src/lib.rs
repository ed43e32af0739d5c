//! Storage unit drivers for the CDN storage core.
//!
//! A storage unit is one configured backend (a network filesystem export, a
//! local disk, an object-store bucket) behind the uniform [`StorageUnit`]
//! contract. Units are built from configuration by a [`DriverRegistry`],
//! which maps driver names to [`DriverFactory`] implementations.
//!
//! # Drivers
//!
//! - `local`: [`LocalDriver`], plain files under a root directory
//! - `nfs`: [`NfsDriver`], one mount session per handle via a [`MountDialer`]
//! - `memory`: [`MemoryDriver`], object-store semantics in process
//!
//! # Contract
//!
//! 1. Objects live at `<root>/<first 3 chars of locator>/<locator>` on every driver.
//! 2. Existence is two-phase: a metadata binding and a physical object.
//! 3. Writers stage content and publish it on close; readers never observe a
//!    partial object.
//! 4. Encryption, when configured, is transparent to callers.
//! 5. Handles release stream, session, and connection in order; the first
//!    failure is returned and none is swallowed.

pub mod config;
pub mod error;
pub mod handle;
pub mod layout;
pub mod local;
pub mod memory;
pub mod nfs;
pub mod pipeline;
pub mod registry;
pub mod traits;

pub use config::{
    BufferPolicy, DriverConfig, EncryptionConfig, LocalConfig, MemoryConfig, NfsConfig, SecretRef,
    UnitConfig,
};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use handle::{read_to_end, ItemReader, ItemWriter, ReleaseChain, READ_CHUNK};
pub use local::{LocalDriver, LocalFactory};
pub use memory::{Bucket, MemoryDriver, MemoryFactory};
pub use nfs::{ExportDialer, MountDialer, NfsDriver, NfsFactory, RpcDialer};
pub use registry::DriverRegistry;
pub use traits::{bound_and_present, DriverFactory, StorageUnit, UnitContext, STATUS_TIMEOUT};
