//! Pokedex Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging for the pokedex-etl workspace.
//!
//! # Example
//!
//! ```no_run
//! use pokedex_common::logging::{init_logging, LogConfig};
//! use pokedex_common::Result;
//!
//! fn start() -> Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{EtlError, Result};
