use thiserror::Error;

/// Library-wide error type. Storage, allocation, caller and domain
/// failures are distinct variants so callers can match on the kind.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed file: {0}")]
    FileFormat(String),
    #[error("unrecognised tree-file version {0}")]
    FileVersion(u32),
    #[error("unsupported archive format version {major}.x")]
    UnsupportedFileVersion { major: u32 },

    #[error("out of memory")]
    NoMemory,
    #[error("memory budget of {limit} bytes exceeded")]
    MaxMemoryExceeded { limit: usize },

    #[error("operation not permitted in this mode")]
    BadMode,
    #[error("bad parameter: {0}")]
    BadParameter(&'static str),
    #[error("index out of bounds")]
    OutOfBounds,
    #[error("unknown record ordering")]
    BadOrdering,
    #[error("bad population model")]
    BadPopModel,
    #[error("bad mutation: {0}")]
    BadMutation(&'static str),

    #[error("recombination link count overflow")]
    LinksOverflow,
    #[error("population size overflow")]
    PopulationOverflow,
    #[error("newick precision overflow")]
    NewickOverflow,
    #[error("too many segregating sites")]
    TooManySegregatingSites,

    #[error("population models must be sorted by start time")]
    UnsortedPopModels,
    #[error("operation requires a feature that was not enabled")]
    UnsupportedOperation,
}

pub type Result<T> = std::result::Result<T, Error>;
