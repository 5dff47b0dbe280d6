//! Error types for the domain model.

use thiserror::Error;

/// Errors raised while interpreting domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A resource quantity string could not be parsed.
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
}
