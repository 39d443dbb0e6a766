use thiserror::Error;

/// Error kinds surfaced by a segment.
///
/// `init` is the only operation that propagates this type to its caller; every
/// other segment operation encodes failure in its own return shape (`bool`,
/// `Option<ReadSlice>`, an `AppendStatus`) and logs here instead of returning
/// `Err`.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("io failure: {0}")]
    IoFailure(#[from] std::io::Error),

    #[error("segment unavailable")]
    Unavailable,

    #[error("argument out of range: {0}")]
    ArgumentRange(&'static str),

    #[error("staging pool exhausted")]
    PoolExhausted,
}

pub type Result<T> = std::result::Result<T, SegmentError>;
