//! Common types and utilities.

/// Process capture error type.
pub use crate::error::Error;

/// Process capture result type.
pub type Result<T> = core::result::Result<T, Error>;
