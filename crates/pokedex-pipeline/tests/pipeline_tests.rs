//! End-to-end pipeline runs against a mocked catalog and an in-memory sink
//!
//! These tests cover:
//! - listing, fan-out, staging and a single bulk load
//! - local retries of transient detail failures
//! - aggregation of every failed task at the load barrier
//! - ordering of provisioning, fetching and loading
//! - the concurrency bound and cancellation

mod common;

use common::*;
use pokedex_pipeline::catalog::HttpCatalogClient;
use pokedex_pipeline::error::{FetchError, ListError, LoadError, PipelineError};
use pokedex_pipeline::graph::{TaskId, TaskState};
use pokedex_pipeline::model::DetailRecord;
use pokedex_pipeline::orchestrator::PipelineStage;
use pokedex_pipeline::staging::StagingStore;
use pokedex_pipeline::{Orchestrator, PipelineConfig};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

const STARTERS: [(i32, &str); 3] = [(1, "bulbasaur"), (2, "ivysaur"), (3, "venusaur")];

fn http_orchestrator(config: &PipelineConfig, sink: Arc<RecordingSink>) -> Orchestrator {
    let client = HttpCatalogClient::new(&config.source, &config.fetch).unwrap();
    Orchestrator::new(config, Arc::new(client), sink).unwrap()
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_full_run_stages_and_loads_every_entry() {
    init_test_tracing();
    let server = MockServer::start().await;
    let staging = tempfile::tempdir().unwrap();

    mount_catalog(&server, &STARTERS, 3).await;
    for (id, name) in STARTERS {
        mount_detail(&server, id, name).await;
    }

    let config = test_config(&catalog_url(&server), staging.path(), 3);
    let sink = Arc::new(RecordingSink::default());
    let report = http_orchestrator(&config, sink.clone()).run().await.unwrap();

    assert_eq!(report.stage, PipelineStage::Succeeded);
    assert_eq!(report.references_listed, 3);
    assert_eq!(report.documents_staged, 3);
    assert_eq!(report.rows_loaded, 3);
    assert!(report.finished_at >= report.started_at);
    assert!(report
        .tasks
        .iter()
        .all(|(_, state)| *state == TaskState::Succeeded));

    assert_eq!(sink.write_count(), 1);
    assert_eq!(sink.row_ids(), vec![1, 2, 3]);

    // Staging keeps the complete document, not only the projected fields
    let store = StagingStore::new(staging.path());
    assert_eq!(store.ids().await.unwrap(), vec![1, 2, 3]);
    let staged = store.get(2).await.unwrap().unwrap();
    assert_eq!(staged.name, "ivysaur");
    assert_eq!(staged.base_experience, Some(62));
    assert!(staged.extra.contains_key("types"));
}

#[tokio::test]
async fn test_rows_are_loaded_in_ascending_id_order() {
    init_test_tracing();
    let server = MockServer::start().await;
    let staging = tempfile::tempdir().unwrap();

    let entries = [(3, "venusaur"), (1, "bulbasaur"), (2, "ivysaur")];
    mount_catalog(&server, &entries, 3).await;
    for (id, name) in entries {
        mount_detail(&server, id, name).await;
    }

    let config = test_config(&catalog_url(&server), staging.path(), 3);
    let sink = Arc::new(RecordingSink::default());
    http_orchestrator(&config, sink.clone()).run().await.unwrap();

    assert_eq!(sink.row_ids(), vec![1, 2, 3]);
    assert_eq!(sink.log.events().last().map(String::as_str), Some("append:3"));
}

// ============================================================================
// Retries and failure aggregation
// ============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried_locally() {
    init_test_tracing();
    let server = MockServer::start().await;
    let staging = tempfile::tempdir().unwrap();

    mount_catalog(&server, &STARTERS, 3).await;
    mount_detail(&server, 1, "bulbasaur").await;
    mount_detail(&server, 3, "venusaur").await;

    // Two 503s, then the document
    Mock::given(method("GET"))
        .and(path(detail_path(2)))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    mount_detail(&server, 2, "ivysaur").await;

    let config = test_config(&catalog_url(&server), staging.path(), 3);
    let sink = Arc::new(RecordingSink::default());
    let report = http_orchestrator(&config, sink.clone()).run().await.unwrap();

    assert_eq!(report.rows_loaded, 3);
    assert_eq!(sink.row_ids(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_task() {
    init_test_tracing();
    let server = MockServer::start().await;
    let staging = tempfile::tempdir().unwrap();

    mount_catalog(&server, &STARTERS, 3).await;
    mount_detail(&server, 1, "bulbasaur").await;
    mount_detail_status(&server, 2, 500).await;
    mount_detail(&server, 3, "venusaur").await;

    let mut config = test_config(&catalog_url(&server), staging.path(), 3);
    config.fetch.max_retries = 2;
    let sink = Arc::new(RecordingSink::default());
    let err = http_orchestrator(&config, sink.clone()).run().await.unwrap_err();

    assert_eq!(err.failed_entity_ids(), vec![2]);
    match err {
        PipelineError::Barrier { failures } => {
            assert_eq!(failures.len(), 1);
            assert!(failures[0].error.contains("after 3 attempts"), "{}", failures[0].error);
        },
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sink.write_count(), 0);

    let requests = server.received_requests().await.unwrap();
    let detail_two = requests
        .iter()
        .filter(|r| r.url.path() == detail_path(2))
        .count();
    assert_eq!(detail_two, 3);
}

#[tokio::test]
async fn test_every_failed_entity_is_reported_and_nothing_is_loaded() {
    init_test_tracing();
    let server = MockServer::start().await;
    let staging = tempfile::tempdir().unwrap();

    let entries = [
        (1, "bulbasaur"),
        (2, "ivysaur"),
        (3, "venusaur"),
        (4, "charmander"),
        (5, "charmeleon"),
    ];
    mount_catalog(&server, &entries, 5).await;
    for (id, name) in entries {
        if id == 2 || id == 4 {
            mount_detail_status(&server, id, 404).await;
        } else {
            mount_detail(&server, id, name).await;
        }
    }

    let config = test_config(&catalog_url(&server), staging.path(), 5);
    let sink = Arc::new(RecordingSink::default());
    let err = http_orchestrator(&config, sink.clone()).run().await.unwrap_err();

    assert_eq!(err.stage(), PipelineStage::LoadBarrier);
    assert_eq!(err.failed_entity_ids(), vec![2, 4]);
    assert_eq!(
        err.failed_tasks(),
        vec![TaskId::FetchDetail(2), TaskId::FetchDetail(4)]
    );
    assert_eq!(sink.write_count(), 0);

    // Permanent errors are not retried
    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        requests.iter().filter(|r| r.url.path() == detail_path(4)).count(),
        1
    );

    // Successful siblings were still staged
    let store = StagingStore::new(staging.path());
    assert_eq!(store.ids().await.unwrap(), vec![1, 3, 5]);
}

#[tokio::test]
async fn test_detail_with_foreign_id_is_permanent_failure() {
    init_test_tracing();
    let server = MockServer::start().await;
    let staging = tempfile::tempdir().unwrap();

    mount_catalog(&server, &[(7, "squirtle")], 1).await;
    Mock::given(method("GET"))
        .and(path(detail_path(7)))
        .respond_with(ResponseTemplate::new(200).set_body_json(detail_json(8, "wartortle")))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&catalog_url(&server), staging.path(), 1);
    let sink = Arc::new(RecordingSink::default());
    let err = http_orchestrator(&config, sink.clone()).run().await.unwrap_err();

    assert_eq!(err.failed_entity_ids(), vec![7]);
    assert!(StagingStore::new(staging.path()).get(7).await.unwrap().is_none());
}

#[tokio::test]
async fn test_listing_failure_stops_before_fan_out() {
    init_test_tracing();
    let server = MockServer::start().await;
    let staging = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path(CATALOG_PATH))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = test_config(&catalog_url(&server), staging.path(), 3);
    let sink = Arc::new(RecordingSink::default());
    let err = http_orchestrator(&config, sink.clone()).run().await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Listing(ListError::SourceUnavailable(_))
    ));
    assert_eq!(err.stage(), PipelineStage::Listing);
    assert!(sink.log.events().is_empty());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_malformed_listing_is_rejected() {
    init_test_tracing();
    let server = MockServer::start().await;
    let staging = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path(CATALOG_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let config = test_config(&catalog_url(&server), staging.path(), 3);
    let sink = Arc::new(RecordingSink::default());
    let err = http_orchestrator(&config, sink).run().await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Listing(ListError::MalformedResponse(_))
    ));
}

// ============================================================================
// Barrier and provisioning
// ============================================================================

#[tokio::test]
async fn test_load_waits_for_every_fetch_and_provisioning() {
    init_test_tracing();
    let staging = tempfile::tempdir().unwrap();
    let log = EventLog::default();

    let client = Arc::new(ScriptedClient::new(1..=6, Duration::from_millis(10), log.clone()));
    let sink = Arc::new(RecordingSink {
        slow_provisioning: true,
        ..RecordingSink::with_log(log.clone())
    });

    let config = test_config("http://catalog.test/pokemon", staging.path(), 6);
    let orchestrator = Orchestrator::new(&config, client, sink.clone()).unwrap();
    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.rows_loaded, 6);

    let append = log.position("append:6").unwrap();
    let table = log.position("ensure_table:pokemon_pokedex").unwrap();
    assert!(table < append);
    for id in 1..=6 {
        let fetched = log.position(&format!("fetched:{id}")).unwrap();
        assert!(fetched < append, "fetch {id} finished after the load started");
    }
    assert_eq!(log.position("list"), Some(0));
}

#[tokio::test]
async fn test_provisioning_failure_suppresses_load() {
    init_test_tracing();
    let staging = tempfile::tempdir().unwrap();
    let log = EventLog::default();

    let client = Arc::new(ScriptedClient::new(1..=3, Duration::ZERO, log.clone()));
    let sink = Arc::new(RecordingSink::failing_provisioning(log.clone()));

    let config = test_config("http://catalog.test/pokemon", staging.path(), 3);
    let orchestrator = Orchestrator::new(&config, client, sink.clone()).unwrap();
    let err = orchestrator.run().await.unwrap_err();

    assert_eq!(err.failed_tasks(), vec![TaskId::ProvisionSchema]);
    assert!(err.failed_entity_ids().is_empty());
    assert_eq!(sink.write_count(), 0);

    // Fetches ran alongside provisioning and their output stays staged
    let store = StagingStore::new(staging.path());
    assert_eq!(store.ids().await.unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_repeat_run_reports_duplicate_keys() {
    init_test_tracing();
    let staging = tempfile::tempdir().unwrap();
    let log = EventLog::default();

    let client = Arc::new(ScriptedClient::new(1..=3, Duration::ZERO, log.clone()));
    let sink = Arc::new(RecordingSink::with_log(log.clone()));
    let config = test_config("http://catalog.test/pokemon", staging.path(), 3);
    let orchestrator = Orchestrator::new(&config, client, sink.clone()).unwrap();

    orchestrator.run().await.unwrap();
    let err = orchestrator.run().await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Load(LoadError::DuplicateKey { .. })
    ));
    assert_eq!(err.stage(), PipelineStage::Loading);
    assert_eq!(sink.row_ids(), vec![1, 2, 3]);

    // Re-fetching overwrote the same staged documents
    let store = StagingStore::new(staging.path());
    assert_eq!(store.ids().await.unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_load_only_run_uses_existing_staging() {
    init_test_tracing();
    let staging = tempfile::tempdir().unwrap();
    let store = StagingStore::new(staging.path());
    store
        .put(25, &DetailRecord::new(25, "pikachu", 4, 60, Some(112)))
        .await
        .unwrap();
    store
        .put(132, &DetailRecord::new(132, "ditto", 3, 40, None))
        .await
        .unwrap();

    let log = EventLog::default();
    let client = Arc::new(ScriptedClient::new(1..=3, Duration::ZERO, log.clone()));
    let sink = Arc::new(RecordingSink::with_log(log.clone()));
    let config = test_config("http://catalog.test/pokemon", staging.path(), 3);
    let orchestrator = Orchestrator::new(&config, client.clone(), sink.clone()).unwrap();

    let report = orchestrator.run_load_only().await.unwrap();

    assert_eq!(report.documents_staged, 2);
    assert_eq!(report.rows_loaded, 2);
    assert_eq!(sink.row_ids(), vec![25, 132]);
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    assert!(log.position("list").is_none());
}

// ============================================================================
// Concurrency and cancellation
// ============================================================================

#[tokio::test]
async fn test_fan_out_respects_concurrency_bound() {
    init_test_tracing();
    let staging = tempfile::tempdir().unwrap();
    let log = EventLog::default();

    let client = Arc::new(ScriptedClient::new(1..=20, Duration::from_millis(15), log));
    let sink = Arc::new(RecordingSink::default());

    let mut config = test_config("http://catalog.test/pokemon", staging.path(), 20);
    config.fetch.concurrency = 3;
    let orchestrator = Orchestrator::new(&config, client.clone(), sink).unwrap();
    orchestrator.run().await.unwrap();

    let max = client.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 3, "saw {max} concurrent detail requests");
    assert!(max > 1, "fan-out never overlapped requests");
    assert_eq!(client.calls.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn test_failed_fetch_does_not_cancel_siblings() {
    init_test_tracing();
    let staging = tempfile::tempdir().unwrap();
    let log = EventLog::default();

    let client = Arc::new(
        ScriptedClient::new(1..=8, Duration::from_millis(5), log)
            .failing(1, FetchError::Permanent("gone".to_string())),
    );
    let sink = Arc::new(RecordingSink::default());

    let config = test_config("http://catalog.test/pokemon", staging.path(), 8);
    let orchestrator = Orchestrator::new(&config, client.clone(), sink.clone()).unwrap();
    let err = orchestrator.run().await.unwrap_err();

    assert_eq!(err.failed_entity_ids(), vec![1]);
    assert_eq!(client.calls.load(Ordering::SeqCst), 8);
    assert_eq!(sink.write_count(), 0);
}

#[tokio::test]
async fn test_cancellation_stops_scheduling_and_never_loads() {
    init_test_tracing();
    let staging = tempfile::tempdir().unwrap();
    let log = EventLog::default();

    let client = Arc::new(ScriptedClient::new(1..=10, Duration::from_millis(500), log));
    let sink = Arc::new(RecordingSink::default());

    let mut config = test_config("http://catalog.test/pokemon", staging.path(), 10);
    config.fetch.concurrency = 2;
    config.fetch.request_timeout = Duration::from_millis(50);
    let orchestrator = Orchestrator::new(&config, client.clone(), sink.clone()).unwrap();

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let err = orchestrator.run().await.unwrap_err();

    match &err {
        PipelineError::Cancelled {
            stage,
            failures,
            not_started,
        } => {
            assert_eq!(*stage, PipelineStage::FanningOut);
            // The two in-flight fetches were abandoned after the grace period
            assert_eq!(failures.len(), 2);
            assert!(failures.iter().all(|f| f.task.entity_id().is_some()));
            assert_eq!(
                not_started
                    .iter()
                    .filter(|t| t.entity_id().is_some())
                    .count(),
                8
            );
            assert!(not_started.contains(&TaskId::LoadBatch));
        },
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    assert_eq!(sink.write_count(), 0);
}

#[tokio::test]
async fn test_cancelled_before_start_does_nothing() {
    init_test_tracing();
    let staging = tempfile::tempdir().unwrap();
    let log = EventLog::default();

    let client = Arc::new(ScriptedClient::new(1..=3, Duration::ZERO, log.clone()));
    let sink = Arc::new(RecordingSink::with_log(log.clone()));
    let config = test_config("http://catalog.test/pokemon", staging.path(), 3);
    let orchestrator = Orchestrator::new(&config, client, sink).unwrap();

    orchestrator.cancellation_token().cancel();
    let err = orchestrator.run().await.unwrap_err();

    assert_eq!(err.stage(), PipelineStage::Listing);
    assert!(log.events().is_empty());
}
