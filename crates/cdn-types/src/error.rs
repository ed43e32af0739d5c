use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid locator {value:?}: {reason}")]
    InvalidLocator { value: String, reason: &'static str },

    #[error("invalid unit name {0:?}: expected 1-64 characters of [A-Za-z0-9_-]")]
    InvalidUnitName(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("unknown item type: {0}")]
    UnknownItemType(String),

    #[error("item {0} is already finalized")]
    AlreadyFinalized(String),

    #[error("item {0} has no content reference yet")]
    NotFinalized(String),
}
