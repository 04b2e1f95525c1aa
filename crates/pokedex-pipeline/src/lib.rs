//! Pokedex Pipeline Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! One bounded batch run: list the catalog, fetch every entry's detail
//! document into staging with bounded concurrency, provision the Postgres
//! sink in parallel, and once both have finished, append the staged
//! documents to the sink table in a single bulk load.
//!
//! ```text
//!                 ┌─> fetch_detail[1] ─┐
//! list_catalog ───┼─> fetch_detail[2] ─┼──> load_batch
//!                 └─> fetch_detail[N] ─┤
//!                   provision_schema ──┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pokedex_pipeline::{config::PipelineConfig, orchestrator::Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load()?;
//!     let orchestrator = Orchestrator::from_config(&config)?;
//!     let report = orchestrator.run().await?;
//!     println!("loaded {} rows", report.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod graph;
pub mod loader;
pub mod model;
pub mod orchestrator;
pub mod schema;
pub mod sink;
pub mod staging;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use model::{CatalogReference, DetailRecord, SinkRow, SinkSchema};
pub use orchestrator::{Orchestrator, RunReport};
