//! Batch load of staged documents into the sink

use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::{LoadError, SinkError};
use crate::model::{DetailRecord, SinkRow, SinkSchema};
use crate::sink::SinkBackend;

/// Projects documents to sink rows and appends them in one bulk write
pub struct BatchLoader {
    backend: Arc<dyn SinkBackend>,
}

impl BatchLoader {
    pub fn new(backend: Arc<dyn SinkBackend>) -> Self {
        Self { backend }
    }

    /// Project onto the sink columns, ascending by id
    pub fn project(documents: &[DetailRecord]) -> Vec<SinkRow> {
        let mut rows: Vec<SinkRow> = documents.iter().map(SinkRow::from).collect();
        rows.sort_by_key(|row| row.id);
        rows
    }

    /// Append every document; rows never deduplicate against the table
    #[instrument(skip(self, documents, schema), fields(documents = documents.len(), table = schema.table()))]
    pub async fn load(
        &self,
        documents: Vec<DetailRecord>,
        schema: &SinkSchema,
    ) -> Result<u64, LoadError> {
        let rows = Self::project(&documents);
        if rows.is_empty() {
            info!("Nothing staged, skipping load");
            return Ok(0);
        }

        let written = self
            .backend
            .append_rows(schema, &rows)
            .await
            .map_err(|err| match err {
                SinkError::DuplicateKey(detail) => LoadError::DuplicateKey {
                    table: schema.table().to_string(),
                    detail,
                },
                source => LoadError::Sink {
                    table: schema.table().to_string(),
                    source,
                },
            })?;

        info!(rows = written, "Batch loaded");
        Ok(written)
    }
}
