use std::fmt;

use cdn_crypto::CryptoError;
use cdn_meta::MetaError;

/// Coarse classification callers branch on, instead of matching strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or mismatched configuration. Fatal for the unit.
    Configuration,
    /// Absent at the queried layer. A normal negative result.
    NotFound,
    /// Connection, mount, or disk failure. Retryable with backoff.
    TransientIo,
    /// Stored data disagrees with what was expected.
    Integrity,
    /// Failure while closing a handle or its session.
    ResourceRelease,
}

impl ErrorKind {
    /// Whether the sync engine may try again automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo | Self::Integrity | Self::ResourceRelease)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::NotFound => "not-found",
            Self::TransientIo => "transient-io",
            Self::Integrity => "integrity",
            Self::ResourceRelease => "resource-release",
        };
        f.write_str(s)
    }
}

/// Errors from storage unit operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid configuration for unit {unit}: {reason}")]
    Configuration { unit: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("unable to release {step}: {source}")]
    ResourceRelease {
        step: &'static str,
        #[source]
        source: Box<StoreError>,
    },

    #[error("metadata error: {0}")]
    Metadata(#[from] MetaError),

    #[error("encryption error: {0}")]
    Crypto(CryptoError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io { .. } => ErrorKind::TransientIo,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::ResourceRelease { .. } => ErrorKind::ResourceRelease,
            Self::Metadata(MetaError::UnknownItem(_)) => ErrorKind::NotFound,
            Self::Metadata(MetaError::ImmutableItem(_)) => ErrorKind::Integrity,
            Self::Metadata(_) => ErrorKind::TransientIo,
            Self::Crypto(CryptoError::Integrity(_)) => ErrorKind::Integrity,
            Self::Crypto(CryptoError::InvalidSecret(_) | CryptoError::KeyDerivation) => {
                ErrorKind::Configuration
            }
            Self::Crypto(CryptoError::Encryption(_)) => ErrorKind::TransientIo,
        }
    }

    pub fn config(unit: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Configuration {
            unit: unit.to_string(),
            reason: reason.into(),
        }
    }

    /// Map an I/O error, turning "does not exist" into [`StoreError::NotFound`].
    pub fn io(op: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                Self::NotFound(format!("{op}: {source}"))
            } else {
                Self::Io { op, source }
            }
        }
    }

    /// True for an I/O error reporting that the target already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<CryptoError> for StoreError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Integrity(reason) => Self::Integrity(reason),
            other => Self::Crypto(other),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
