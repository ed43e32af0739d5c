use thiserror::Error;

use cdn_meta::MetaError;
use cdn_store::{ErrorKind, StoreError};
use cdn_types::{ItemId, TypeError, UnitId};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unit {unit}: {op} failed: {source}")]
    Unit {
        unit: UnitId,
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("integrity check failed on {unit}: {reason}")]
    Integrity { unit: UnitId, reason: String },

    #[error("unknown item {0}")]
    UnknownItem(ItemId),

    #[error("item {0} has no copy in the buffer")]
    NotInBuffer(ItemId),

    #[error("unknown unit {0}")]
    UnknownUnit(String),

    #[error("invalid engine configuration: {0}")]
    Configuration(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("metadata error: {0}")]
    Metadata(#[from] MetaError),

    #[error("invalid item: {0}")]
    Type(#[from] TypeError),
}

impl SyncError {
    /// Wrap a driver error with the unit and operation it came from.
    pub fn unit(unit: &UnitId, op: &'static str) -> impl FnOnce(StoreError) -> Self {
        let unit = unit.clone();
        move |source| Self::Unit { unit, op, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unit { source, .. } => source.kind(),
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::UnknownItem(_) | Self::NotInBuffer(_) => ErrorKind::NotFound,
            Self::UnknownUnit(_) | Self::Configuration(_) | Self::Type(_) => {
                ErrorKind::Configuration
            }
            Self::Cancelled => ErrorKind::TransientIo,
            Self::Metadata(MetaError::UnknownItem(_)) => ErrorKind::NotFound,
            Self::Metadata(_) => ErrorKind::TransientIo,
        }
    }

    /// Failures that automatic retries cannot fix.
    pub fn is_terminal(&self) -> bool {
        !self.kind().is_retryable()
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
