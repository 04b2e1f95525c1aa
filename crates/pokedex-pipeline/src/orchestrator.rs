//! Run orchestration over the task graph
//!
//! One run walks the stages `Pending -> Listing -> FanningOut -> LoadBarrier
//! -> Loading -> {Succeeded, Failed}`. The fetch tasks run through a bounded
//! `buffer_unordered` pool, the provisioning task is joined alongside it
//! outside the bound, and the load starts only when every dependency of
//! `load_batch` has succeeded.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use pokedex_common::EtlError;

use crate::catalog::{CatalogClient, CatalogLister, HttpCatalogClient};
use crate::config::PipelineConfig;
use crate::error::{FetchTaskError, GraphError, LoadError, PipelineError, PipelineResult};
use crate::fetcher::{DetailFetcher, RetryPolicy};
use crate::graph::{TaskGraph, TaskId, TaskState};
use crate::loader::BatchLoader;
use crate::model::{CatalogReference, DetailRecord, SinkSchema};
use crate::schema::SchemaProvisioner;
use crate::sink::{PgSink, SinkBackend};
use crate::staging::StagingStore;

const CANCELLED: &str = "cancelled";

/// Stage of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Pending,
    Listing,
    FanningOut,
    LoadBarrier,
    Loading,
    Succeeded,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Pending => "pending",
            PipelineStage::Listing => "listing",
            PipelineStage::FanningOut => "fanning_out",
            PipelineStage::LoadBarrier => "load_barrier",
            PipelineStage::Loading => "loading",
            PipelineStage::Succeeded => "succeeded",
            PipelineStage::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub stage: PipelineStage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub references_listed: usize,
    /// Documents staged by this run's fetch tasks; for a load-only run, the
    /// documents found in staging
    pub documents_staged: usize,
    pub rows_loaded: u64,
    /// Final state of every task, in task id order
    pub tasks: Vec<(TaskId, TaskState)>,
}

/// Executes the pipeline task graph
pub struct Orchestrator {
    lister: CatalogLister,
    fetcher: DetailFetcher,
    staging: StagingStore,
    provisioner: SchemaProvisioner,
    loader: BatchLoader,
    schema: SinkSchema,
    limit: NonZeroU32,
    concurrency: usize,
    grace_period: Duration,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Wire the pipeline around the given catalog client and sink backend
    pub fn new(
        config: &PipelineConfig,
        client: Arc<dyn CatalogClient>,
        backend: Arc<dyn SinkBackend>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let schema = config.schema()?;
        let limit = NonZeroU32::new(config.source.catalog_limit)
            .ok_or_else(|| EtlError::Config("CATALOG_LIMIT must be greater than 0".to_string()))?;

        let staging = StagingStore::new(&config.staging.path);
        let fetcher = DetailFetcher::new(
            client.clone(),
            staging.clone(),
            RetryPolicy::from(&config.fetch),
            config.fetch.throttle_interval,
        );

        Ok(Self {
            lister: CatalogLister::new(client),
            fetcher,
            staging,
            provisioner: SchemaProvisioner::new(backend.clone()),
            loader: BatchLoader::new(backend),
            schema,
            limit,
            concurrency: config.fetch.concurrency,
            grace_period: config.fetch.request_timeout,
            cancel: CancellationToken::new(),
        })
    }

    /// Production wiring: HTTP catalog client and Postgres sink
    pub fn from_config(config: &PipelineConfig) -> PipelineResult<Self> {
        let client = HttpCatalogClient::new(&config.source, &config.fetch)
            .map_err(|e| EtlError::Config(format!("Failed to build HTTP client: {e}")))?;
        let backend = PgSink::new(config.sink.clone());
        Self::new(config, Arc::new(client), Arc::new(backend))
    }

    /// Token that cancels the run; cancelling before `run` starts makes the
    /// run stop at its first checkpoint
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Full run: list, fan out fetches alongside provisioning, then load
    pub async fn run(&self) -> PipelineResult<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, mode = "full");
        self.execute_full(run_id).instrument(span).await
    }

    /// Load-stage retry: provision and load whatever is already staged
    pub async fn run_load_only(&self) -> PipelineResult<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, mode = "load_only");
        self.execute_load_only(run_id).instrument(span).await
    }

    async fn execute_full(&self, run_id: Uuid) -> PipelineResult<RunReport> {
        let started_at = Utc::now();
        let graph = Mutex::new(TaskGraph::full_run()?);

        enter(PipelineStage::Listing);
        let references = self.listing_stage(&graph).await?;
        lock(&graph).expand_fan_out(&references)?;

        enter(PipelineStage::FanningOut);
        let fan_out = stream::iter(references.iter())
            .map(|reference| self.fetch_task(&graph, reference))
            .buffer_unordered(self.concurrency)
            .collect::<Vec<Result<(), GraphError>>>();
        let provision = self.provision_task(&graph);

        let (fetched, provisioned) = tokio::join!(fan_out, provision);
        fetched.into_iter().collect::<Result<Vec<()>, GraphError>>()?;
        provisioned?;

        if self.cancel.is_cancelled() {
            return Err(self.cancelled(&graph, PipelineStage::FanningOut));
        }

        enter(PipelineStage::LoadBarrier);
        self.check_barrier(&graph)?;

        let documents_staged = lock(&graph)
            .states()
            .iter()
            .filter(|(task, state)| task.entity_id().is_some() && *state == TaskState::Succeeded)
            .count();

        enter(PipelineStage::Loading);
        let (_, rows_loaded) = self.load_stage(&graph).await?;

        enter(PipelineStage::Succeeded);
        let tasks = lock(&graph).states();
        Ok(RunReport {
            run_id,
            stage: PipelineStage::Succeeded,
            started_at,
            finished_at: Utc::now(),
            references_listed: references.len(),
            documents_staged,
            rows_loaded,
            tasks,
        })
    }

    async fn execute_load_only(&self, run_id: Uuid) -> PipelineResult<RunReport> {
        let started_at = Utc::now();
        let graph = Mutex::new(TaskGraph::load_only()?);

        enter(PipelineStage::FanningOut);
        self.provision_task(&graph).await?;
        if self.cancel.is_cancelled() {
            return Err(self.cancelled(&graph, PipelineStage::FanningOut));
        }

        enter(PipelineStage::LoadBarrier);
        self.check_barrier(&graph)?;

        enter(PipelineStage::Loading);
        let (documents_staged, rows_loaded) = self.load_stage(&graph).await?;

        enter(PipelineStage::Succeeded);
        let tasks = lock(&graph).states();
        Ok(RunReport {
            run_id,
            stage: PipelineStage::Succeeded,
            started_at,
            finished_at: Utc::now(),
            references_listed: 0,
            documents_staged,
            rows_loaded,
            tasks,
        })
    }

    async fn listing_stage(
        &self,
        graph: &Mutex<TaskGraph>,
    ) -> PipelineResult<Vec<CatalogReference>> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled(graph, PipelineStage::Listing));
        }
        lock(graph).transition(TaskId::ListCatalog, TaskState::Running)?;

        let listed = tokio::select! {
            result = self.lister.list(self.limit) => result,
            _ = self.cancel.cancelled() => {
                lock(graph).transition(TaskId::ListCatalog, TaskState::Failed(CANCELLED.to_string()))?;
                return Err(self.cancelled(graph, PipelineStage::Listing));
            }
        };

        match listed {
            Ok(references) => {
                lock(graph).transition(TaskId::ListCatalog, TaskState::Succeeded)?;
                Ok(references)
            },
            Err(e) => {
                error!(error = %e, "Catalog listing failed");
                lock(graph).transition(TaskId::ListCatalog, TaskState::Failed(e.to_string()))?;
                Err(PipelineError::Listing(e))
            },
        }
    }

    async fn fetch_task(
        &self,
        graph: &Mutex<TaskGraph>,
        reference: &CatalogReference,
    ) -> Result<(), GraphError> {
        let task = TaskId::FetchDetail(reference.id);
        if self.cancel.is_cancelled() {
            debug!(entity_id = reference.id, "Run cancelled, not starting fetch");
            return Ok(());
        }
        lock(graph).transition(task, TaskState::Running)?;

        let outcome = tokio::select! {
            result = self.fetcher.fetch_and_stage(reference) => result,
            _ = self.grace_elapsed() => Err(FetchTaskError::Cancelled),
        };

        match outcome {
            Ok(()) => {
                lock(graph).transition(task, TaskState::Succeeded)?;
                tokio::select! {
                    _ = self.fetcher.pace() => {},
                    _ = self.cancel.cancelled() => {},
                }
            },
            Err(e) => {
                lock(graph).transition(task, TaskState::Failed(e.to_string()))?;
            },
        }
        Ok(())
    }

    async fn provision_task(&self, graph: &Mutex<TaskGraph>) -> Result<(), GraphError> {
        if self.cancel.is_cancelled() {
            debug!("Run cancelled, not starting provisioning");
            return Ok(());
        }
        lock(graph).transition(TaskId::ProvisionSchema, TaskState::Running)?;

        let outcome = tokio::select! {
            result = self.provisioner.ensure(&self.schema) => result.map_err(|e| e.to_string()),
            _ = self.grace_elapsed() => Err(CANCELLED.to_string()),
        };

        let next = match outcome {
            Ok(()) => TaskState::Succeeded,
            Err(message) => {
                error!(error = %message, "Schema provisioning failed");
                TaskState::Failed(message)
            },
        };
        lock(graph).transition(TaskId::ProvisionSchema, next)
    }

    /// Read everything staged and hand it to the loader; returns
    /// `(documents read, rows written)`
    async fn load_stage(&self, graph: &Mutex<TaskGraph>) -> PipelineResult<(usize, u64)> {
        lock(graph).transition(TaskId::LoadBatch, TaskState::Running)?;

        let loaded = async {
            let documents: Vec<DetailRecord> = self
                .staging
                .list()
                .try_collect()
                .await
                .map_err(LoadError::from)?;
            let count = documents.len();
            info!(documents = count, path = %self.staging.root().display(), "Read staged documents");
            let rows = self.loader.load(documents, &self.schema).await?;
            Ok::<_, LoadError>((count, rows))
        }
        .await;

        match loaded {
            Ok(counts) => {
                lock(graph).transition(TaskId::LoadBatch, TaskState::Succeeded)?;
                Ok(counts)
            },
            Err(e) => {
                error!(error = %e, "Load failed; staged documents are kept");
                lock(graph).transition(TaskId::LoadBatch, TaskState::Failed(e.to_string()))?;
                Err(PipelineError::Load(e))
            },
        }
    }

    fn check_barrier(&self, graph: &Mutex<TaskGraph>) -> PipelineResult<()> {
        let graph = lock(graph);
        if graph.barrier_satisfied(TaskId::LoadBatch) {
            return Ok(());
        }

        let failures = graph.failures();
        let failed: Vec<String> = failures.iter().map(|f| f.task.to_string()).collect();
        error!(failed_tasks = ?failed, "Load barrier not reached, nothing written to the sink");
        Err(PipelineError::Barrier { failures })
    }

    fn cancelled(&self, graph: &Mutex<TaskGraph>, stage: PipelineStage) -> PipelineError {
        let graph = lock(graph);
        let failures = graph.failures();
        let not_started = graph.pending_tasks();
        warn!(
            %stage,
            failed = failures.len(),
            not_started = not_started.len(),
            "Run cancelled"
        );
        PipelineError::Cancelled {
            stage,
            failures,
            not_started,
        }
    }

    /// Resolves once the run is cancelled and the grace period has passed
    async fn grace_elapsed(&self) {
        self.cancel.cancelled().await;
        tokio::time::sleep(self.grace_period).await;
    }
}

fn enter(stage: PipelineStage) {
    info!(%stage, "Pipeline stage");
}

fn lock(graph: &Mutex<TaskGraph>) -> MutexGuard<'_, TaskGraph> {
    graph.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
