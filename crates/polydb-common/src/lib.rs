//! # PolyDB Common
//!
//! Common types, errors, and configuration shared across PolyDB crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::{Error, Result, TransactionError};
pub use types::*;

/// Re-export commonly used external types
pub mod prelude {
    pub use super::config::*;
    pub use super::error::{Error, Result, TransactionError};
    pub use super::types::*;
    pub use tracing::{debug, error, info, trace, warn};
}
