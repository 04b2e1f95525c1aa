//! Idempotent provisioning of the sink schema

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::error::SchemaError;
use crate::model::SinkSchema;
use crate::sink::SinkBackend;

/// Ensures the sink database and table exist
///
/// Safe to call repeatedly: a completed schema turns every later call into a
/// pair of existence checks. Calls sharing one provisioner run one at a time;
/// the backend handles races with other processes.
pub struct SchemaProvisioner {
    backend: Arc<dyn SinkBackend>,
    serial: Mutex<()>,
}

impl SchemaProvisioner {
    pub fn new(backend: Arc<dyn SinkBackend>) -> Self {
        Self {
            backend,
            serial: Mutex::new(()),
        }
    }

    /// Ensure the database, then the table and its required columns
    #[instrument(skip(self, schema), fields(database = schema.database(), table = schema.table()))]
    pub async fn ensure(&self, schema: &SinkSchema) -> Result<(), SchemaError> {
        let _serial = self.serial.lock().await;

        let created = self
            .backend
            .ensure_database(schema.database())
            .await
            .map_err(|source| SchemaError::Database {
                database: schema.database().to_string(),
                source,
            })?;
        info!(created, "Sink database ready");

        let columns = self
            .backend
            .ensure_table(schema)
            .await
            .map_err(|source| SchemaError::Table {
                table: schema.table().to_string(),
                source,
            })?;

        let missing: Vec<String> = SinkSchema::column_names()
            .filter(|required| !columns.iter().any(|c| c == required))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(SchemaError::MissingColumns {
                table: schema.table().to_string(),
                missing,
            });
        }

        info!(columns = columns.len(), "Sink table ready");
        Ok(())
    }
}
