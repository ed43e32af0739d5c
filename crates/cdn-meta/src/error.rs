use cdn_types::{ItemId, UnitId};
use thiserror::Error;

/// Errors from metadata store operations.
#[derive(Debug, Error)]
pub enum MetaError {
    /// A binding already exists for this (item, unit) pair.
    #[error("item {item} is already bound to unit {unit}")]
    BindingExists { item: ItemId, unit: UnitId },

    /// The item was never registered.
    #[error("unknown item {0}")]
    UnknownItem(ItemId),

    /// Attempted to replace the content reference of a finalized item.
    #[error("item {0} is finalized and cannot be modified")]
    ImmutableItem(ItemId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MetaResult<T> = Result<T, MetaError>;
