//! Crate-wide error and result types.

use crate::alarm::ValidationError;
use crate::calc::CalcError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An alarm failed validation before any mutation took place.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The calculation service call failed.
    #[error(transparent)]
    Calc(#[from] CalcError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A backend component is gone (channel closed during shutdown).
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}
