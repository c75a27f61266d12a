use thiserror::Error;

use crate::types::ChipId;

/// The descriptor index could not be built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("database chip {chip} has no descriptors (strict mode)")]
    NoDescriptors { chip: ChipId },

    #[error("no descriptors to index: every database chip is empty")]
    EmptyDatabase,

    #[error("chip {chip} has {got}-dimensional descriptors, index expects {expected}")]
    DimensionMismatch {
        chip: ChipId,
        expected: usize,
        got: usize,
    },
}

/// Errors surfaced by the query pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("descriptor index build failed: {0}")]
    Build(#[from] BuildError),

    #[error("unknown score method '{0}'")]
    UnknownScoreMethod(String),

    #[error("unknown chip id {0}")]
    UnknownChip(ChipId),

    #[error("invalid query configuration: {0}")]
    InvalidConfig(String),

    #[error("index holds {available} descriptors, {requested} neighbors requested")]
    NotEnoughNeighbors { requested: usize, available: usize },

    #[error("feature store: {0}")]
    Store(String),
}
