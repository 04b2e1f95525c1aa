//! Relational sink interface
//!
//! [`SinkBackend`] is the seam between the pipeline and the database driver.
//! The provisioner and the loader only talk to this trait; [`PgSink`] is the
//! Postgres implementation.

pub mod postgres;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::model::{SinkRow, SinkSchema};

pub use postgres::PgSink;

/// Operations the pipeline needs from the sink
#[async_trait]
pub trait SinkBackend: Send + Sync {
    /// Create `database` unless it exists; returns true if this call created it
    async fn ensure_database(&self, database: &str) -> Result<bool, SinkError>;

    /// Create the table unless it exists; returns the table's column names
    async fn ensure_table(&self, schema: &SinkSchema) -> Result<Vec<String>, SinkError>;

    /// Append `rows` in order as one atomic bulk write; returns rows written
    async fn append_rows(&self, schema: &SinkSchema, rows: &[SinkRow]) -> Result<u64, SinkError>;
}
