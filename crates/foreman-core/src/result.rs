//! Result type aliases for Foreman.

use crate::ForemanError;

/// A specialized `Result` type for broker-level operations.
pub type ForemanResult<T> = Result<T, ForemanError>;
