//! # Foreman Core
//!
//! Shared error definitions and logging initialisation used by every
//! crate of the Foreman job broker.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::{init_logging, LoggingConfig};
