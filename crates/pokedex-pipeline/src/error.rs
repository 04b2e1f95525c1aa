//! Error types for each pipeline stage

use std::path::PathBuf;
use thiserror::Error;

use crate::graph::{TaskFailure, TaskId};
use crate::orchestrator::PipelineStage;

/// Result type alias for a pipeline run
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Listing the catalog failed; no partial catalog is usable
#[derive(Error, Debug)]
pub enum ListError {
    #[error("Catalog source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Malformed catalog response: {0}")]
    MalformedResponse(String),
}

/// Outcome of a single detail request, classified for the retry loop
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network failure, timeout, 5xx or 429; worth another attempt
    #[error("Transient fetch error: {0}")]
    Transient(String),

    /// Other 4xx or an undecodable document; retrying will not help
    #[error("Permanent fetch error: {0}")]
    Permanent(String),
}

/// Terminal failure of one fetch-and-stage task
#[derive(Error, Debug)]
pub enum FetchTaskError {
    #[error("Permanent fetch error: {0}")]
    Permanent(String),

    #[error("Fetch failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("Abandoned after cancellation")]
    Cancelled,
}

/// Staging read or write failure
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Staging IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Staged document {path} is not a valid detail record: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Staged document {path} holds id {found}, expected {expected}")]
    IdMismatch {
        path: PathBuf,
        expected: i32,
        found: i32,
    },

    #[error("Failed to encode detail record {id}: {source}")]
    Encode {
        id: i32,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reported by a sink backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Sink connection failed: {0}")]
    Connection(String),

    #[error("Primary key already present: {0}")]
    DuplicateKey(String),

    #[error("Sink statement failed: {0}")]
    Statement(String),
}

/// Provisioning the sink schema failed; fatal to the run
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Invalid SQL identifier '{0}': expected [A-Za-z_][A-Za-z0-9_]* of at most 63 bytes")]
    InvalidIdentifier(String),

    #[error("Failed to ensure database '{database}': {source}")]
    Database {
        database: String,
        #[source]
        source: SinkError,
    },

    #[error("Failed to ensure table '{table}': {source}")]
    Table {
        table: String,
        #[source]
        source: SinkError,
    },

    #[error("Table '{table}' exists but lacks required columns: {}", missing.join(", "))]
    MissingColumns { table: String, missing: Vec<String> },
}

/// Loading staged documents into the sink failed; staging is left intact
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read staged documents: {0}")]
    Staging(#[from] StagingError),

    #[error(
        "Table '{table}' already holds some of these ids ({detail}); loads append without \
         deduplication, so re-running over already-loaded entries fails"
    )]
    DuplicateKey { table: String, detail: String },

    #[error("Bulk insert into '{table}' failed: {source}")]
    Sink {
        table: String,
        #[source]
        source: SinkError,
    },
}

/// Invalid task graph construction or state change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task {0} is already part of the graph")]
    DuplicateTask(TaskId),

    #[error("Task {0} is not part of the graph")]
    UnknownTask(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Dependency cycle involving {0}")]
    Cycle(TaskId),

    #[error("Task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: &'static str,
        to: &'static str,
    },
}

/// Terminal failure of a pipeline run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] pokedex_common::EtlError),

    #[error("Task graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Listing failed: {0}")]
    Listing(#[from] ListError),

    #[error("Load barrier not reached, {} task(s) failed: {}", failures.len(), describe(failures))]
    Barrier { failures: Vec<TaskFailure> },

    #[error("Loading failed: {0}")]
    Load(#[from] LoadError),

    #[error("Run cancelled during {stage} ({} task(s) failed, {} never started)", failures.len(), not_started.len())]
    Cancelled {
        stage: PipelineStage,
        failures: Vec<TaskFailure>,
        not_started: Vec<TaskId>,
    },
}

impl PipelineError {
    /// Stage the run was in when it failed
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::Config(_) | PipelineError::Graph(_) => PipelineStage::Pending,
            PipelineError::Listing(_) => PipelineStage::Listing,
            PipelineError::Barrier { .. } => PipelineStage::LoadBarrier,
            PipelineError::Load(_) => PipelineStage::Loading,
            PipelineError::Cancelled { stage, .. } => *stage,
        }
    }

    /// Every task that reached `Failed`
    pub fn failed_tasks(&self) -> Vec<TaskId> {
        match self {
            PipelineError::Barrier { failures } | PipelineError::Cancelled { failures, .. } => {
                failures.iter().map(|f| f.task).collect()
            },
            PipelineError::Listing(_) => vec![TaskId::ListCatalog],
            PipelineError::Load(_) => vec![TaskId::LoadBatch],
            PipelineError::Config(_) | PipelineError::Graph(_) => Vec::new(),
        }
    }

    /// Entity ids whose fetch task failed, ascending
    pub fn failed_entity_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .failed_tasks()
            .into_iter()
            .filter_map(|task| task.entity_id())
            .collect();
        ids.sort_unstable();
        ids
    }
}

fn describe(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.task, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}
