//! Postgres sink
//!
//! Connections are opened per operation: provisioning and loading run at
//! different points of the run and never share one.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Executor, Postgres, QueryBuilder};
use tracing::{debug, info, instrument};

use super::SinkBackend;
use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::model::{validate_identifier, SinkRow, SinkSchema};

/// SQLSTATE duplicate_database
const DUPLICATE_DATABASE: &str = "42P04";

/// Rows per INSERT statement; five binds per row stays far below the
/// 65535 bind parameter limit
const INSERT_CHUNK_ROWS: usize = 1000;

/// [`SinkBackend`] for Postgres
#[derive(Debug, Clone)]
pub struct PgSink {
    config: SinkConfig,
}

impl PgSink {
    pub fn new(config: SinkConfig) -> Self {
        Self { config }
    }

    fn connect_options(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user)
            .password(&self.config.password)
            .database(database)
    }

    async fn connect(&self, database: &str) -> Result<PgConnection, SinkError> {
        let options = self.connect_options(database);
        let target = format!("{}:{}/{}", self.config.host, self.config.port, database);

        match tokio::time::timeout(
            self.config.connect_timeout,
            PgConnection::connect_with(&options),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(SinkError::Connection(format!("{target}: {e}"))),
            Err(_) => Err(SinkError::Connection(format!(
                "{target}: no connection within {:?}",
                self.config.connect_timeout
            ))),
        }
    }
}

#[async_trait]
impl SinkBackend for PgSink {
    #[instrument(skip(self))]
    async fn ensure_database(&self, database: &str) -> Result<bool, SinkError> {
        validate_identifier(database).map_err(|e| SinkError::Statement(e.to_string()))?;

        let mut conn = self.connect(&self.config.maintenance_database).await?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(database)
                .fetch_one(&mut conn)
                .await
                .map_err(classify)?;

        let created = if exists {
            false
        } else {
            let ddl = format!("CREATE DATABASE \"{database}\"");
            match conn.execute(sqlx::raw_sql(&ddl)).await {
                Ok(_) => true,
                // Another provisioner created it between our check and create
                Err(e) if is_already_created(&e) => false,
                Err(e) => return Err(classify(e)),
            }
        };

        close(conn).await;
        if created {
            info!(database, "Created sink database");
        }
        Ok(created)
    }

    #[instrument(skip(self, schema), fields(table = schema.table()))]
    async fn ensure_table(&self, schema: &SinkSchema) -> Result<Vec<String>, SinkError> {
        let mut conn = self.connect(schema.database()).await?;

        let mut tx = conn.begin().await.map_err(classify)?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(schema.table())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            schema.table(),
            SinkSchema::column_definitions()
        );
        tx.execute(sqlx::raw_sql(&ddl))
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;

        let columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema.table())
        .fetch_all(&mut conn)
        .await
        .map_err(classify)?;

        close(conn).await;
        Ok(columns)
    }

    #[instrument(skip(self, schema, rows), fields(table = schema.table(), rows = rows.len()))]
    async fn append_rows(&self, schema: &SinkSchema, rows: &[SinkRow]) -> Result<u64, SinkError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connect(schema.database()).await?;
        let mut tx = conn.begin().await.map_err(classify)?;

        let columns = SinkSchema::column_names().collect::<Vec<_>>().join(", ");
        let mut written = 0u64;

        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO \"{}\" ({}) ", schema.table(), columns));
            builder.push_values(chunk, |mut values, row| {
                values
                    .push_bind(row.id)
                    .push_bind(row.name.clone())
                    .push_bind(row.height)
                    .push_bind(row.weight)
                    .push_bind(row.base_experience);
            });

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
            written += result.rows_affected();
            debug!(chunk_rows = chunk.len(), written, "Inserted chunk");
        }

        tx.commit().await.map_err(classify)?;
        close(conn).await;
        Ok(written)
    }
}

async fn close(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        debug!(error = %e, "Error while closing sink connection");
    }
}

/// Concurrent `CREATE DATABASE` of the same name fails with either
/// duplicate_database or a unique violation on the catalog index
fn is_already_created(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some(DUPLICATE_DATABASE) || db.is_unique_violation()
        },
        _ => false,
    }
}

fn classify(err: sqlx::Error) -> SinkError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            SinkError::DuplicateKey(db.message().to_string())
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::Configuration(_) => SinkError::Connection(err.to_string()),
        _ => SinkError::Statement(err.to_string()),
    }
}
