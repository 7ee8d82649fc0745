// Facade-level integration tests against a mock ClinicalTrials.gov server.

use std::sync::Arc;

use httpmock::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use ctgov2fhir::fhir::Identifier;
use ctgov2fhir::{
    CtGovService, FsConfig, ResearchStudy, RuntimeConfig, ServiceError, SqliteConfig,
    SqliteStore, StorageBackend, StudyStore,
};

fn fs_config(server_url: &str, dir: &TempDir) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.service.endpoint = server_url.to_string();
    config.storage.backend = StorageBackend::Fs;
    config.storage.fs = Some(FsConfig {
        path: dir.path().join("cache").to_string_lossy().into_owned(),
    });
    config.storage.sqlite = None;
    // background sweeping is exercised elsewhere; keep these tests quiet
    config.cleanup.cleanup_interval_ms = 0;
    config
}

fn sqlite_config(server_url: &str, dir: &TempDir) -> RuntimeConfig {
    let mut config = fs_config(server_url, dir);
    config.storage.backend = StorageBackend::Sqlite;
    config.storage.sqlite = Some(SqliteConfig {
        path: dir.path().join("cache.db").to_string_lossy().into_owned(),
    });
    config.storage.fs = None;
    config
}

fn study_object(nct_id: &str) -> ResearchStudy {
    ResearchStudy {
        id: Some(format!("study-{nct_id}")),
        identifier: vec![Identifier {
            use_: None,
            system: Some("http://clinicaltrials.gov/".to_string()),
            value: Some(nct_id.to_string()),
        }],
        ..Default::default()
    }
}

fn upstream_study(nct_id: &str) -> serde_json::Value {
    json!({
        "protocolSection": {
            "identificationModule": {"nctId": nct_id},
            "descriptionModule": {"briefSummary": "Example"},
            "designModule": {"studyType": "INTERVENTIONAL", "phases": ["PHASE3"]},
            "conditionsModule": {"conditions": ["Cancer"]}
        }
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn enriches_absent_fields() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/studies")
                .query_param("filter.ids", "NCT02513394");
            then.status(200)
                .json_body(json!({"studies": [upstream_study("NCT02513394")]}));
        })
        .await;
    let dir = TempDir::new().unwrap();
    let service = CtGovService::new(fs_config(&server.base_url(), &dir));
    service.init().await.unwrap();

    let enriched = service
        .update_research_studies(vec![study_object("NCT02513394")])
        .await
        .unwrap();

    mock.assert_async().await;
    let study = &enriched[0];
    assert_eq!(study.description.as_deref(), Some("Example"));
    assert_eq!(
        study.phase.as_ref().unwrap().coding[0].code.as_deref(),
        Some("phase-3")
    );
    assert!(study
        .category
        .iter()
        .any(|c| c.text.as_deref() == Some("Study Type: Interventional")));
    assert_eq!(study.condition[0].text.as_deref(), Some("Cancer"));

    service.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn populated_fields_are_not_overwritten() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/studies");
            then.status(200)
                .json_body(json!({"studies": [upstream_study("NCT02513394")]}));
        })
        .await;
    let dir = TempDir::new().unwrap();
    let service = CtGovService::new(fs_config(&server.base_url(), &dir));
    service.init().await.unwrap();

    let mut input = study_object("NCT02513394");
    input.description = Some("Existing".to_string());
    let enriched = service.update_research_studies(vec![input]).await.unwrap();

    assert_eq!(enriched[0].description.as_deref(), Some("Existing"));
    assert_eq!(
        enriched[0].phase.as_ref().unwrap().coding[0].code.as_deref(),
        Some("phase-3")
    );

    service.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn batches_are_requested_serially() {
    let server = MockServer::start_async().await;
    let first = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/studies")
                .query_param("filter.ids", "NCT00000001,NCT00000002");
            then.status(200).json_body(json!({
                "studies": [upstream_study("NCT00000001"), upstream_study("NCT00000002")]
            }));
        })
        .await;
    let second = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/studies")
                .query_param("filter.ids", "NCT00000003");
            then.status(200)
                .json_body(json!({"studies": [upstream_study("NCT00000003")]}));
        })
        .await;
    let dir = TempDir::new().unwrap();
    let mut config = fs_config(&server.base_url(), &dir);
    config.service.max_trials_per_request = 2;
    let service = CtGovService::new(config);
    service.init().await.unwrap();

    service
        .ensure_trials_available(["NCT00000001", "NCT00000002", "NCT00000003"])
        .await
        .unwrap();

    first.assert_async().await;
    second.assert_async().await;
    for nct_id in ["NCT00000001", "NCT00000002", "NCT00000003"] {
        assert!(service
            .get_cached_clinical_study(nct_id)
            .await
            .unwrap()
            .is_some());
    }

    service.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn ids_missing_upstream_resolve_to_none() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/studies");
            then.status(200).json_body(json!({
                "studies": [upstream_study("NCT00000001"), upstream_study("NCT00000003")]
            }));
        })
        .await;
    let dir = TempDir::new().unwrap();
    let service = CtGovService::new(fs_config(&server.base_url(), &dir));
    service.init().await.unwrap();

    service
        .ensure_trials_available(["NCT00000001", "NCT00000002", "NCT00000003"])
        .await
        .unwrap();

    assert!(service
        .get_cached_clinical_study("NCT00000001")
        .await
        .unwrap()
        .is_some());
    assert!(service
        .get_cached_clinical_study("NCT00000002")
        .await
        .unwrap()
        .is_none());
    assert!(service
        .get_cached_clinical_study("NCT00000003")
        .await
        .unwrap()
        .is_some());

    service.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_callers_share_one_request() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/studies")
                .query_param("filter.ids", "NCT12345678");
            then.status(200)
                .delay(std::time::Duration::from_millis(300))
                .json_body(json!({"studies": [upstream_study("NCT12345678")]}));
        })
        .await;
    let dir = TempDir::new().unwrap();
    let service = Arc::new(CtGovService::new(fs_config(&server.base_url(), &dir)));
    service.init().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let service = Arc::clone(&service);
        tasks.push(tokio::spawn(async move {
            service
                .update_research_studies(vec![study_object("NCT12345678")])
                .await
        }));
    }
    for task in tasks {
        let enriched = task.await.unwrap().unwrap();
        assert_eq!(enriched[0].description.as_deref(), Some("Example"));
    }

    assert_eq!(mock.hits_async().await, 1);
    service.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_survives_restart() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/studies");
            then.status(200)
                .json_body(json!({"studies": [upstream_study("NCT00000007")]}));
        })
        .await;
    let dir = TempDir::new().unwrap();

    let service = CtGovService::new(sqlite_config(&server.base_url(), &dir));
    service.init().await.unwrap();
    service
        .ensure_trials_available(["NCT00000007"])
        .await
        .unwrap();
    service.destroy().await.unwrap();

    let service = CtGovService::new(sqlite_config(&server.base_url(), &dir));
    service.init().await.unwrap();
    let record = service
        .get_cached_clinical_study("NCT00000007")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.nct_id().unwrap().to_string(), "NCT00000007");
    // the restart answered from the store, not the network
    assert_eq!(mock.hits_async().await, 1);
    service.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_failures_reject_and_allow_retry() {
    let server = MockServer::start_async().await;
    let dir = TempDir::new().unwrap();
    let service = CtGovService::new(fs_config(&server.base_url(), &dir));
    service.init().await.unwrap();

    let failing = server
        .mock_async(|when, then| {
            when.method(GET).path("/studies");
            then.status(503);
        })
        .await;
    let err = service
        .ensure_trials_available(["NCT00000001"])
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Cache(_)));
    failing.delete_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/studies");
            then.status(200)
                .json_body(json!({"studies": [upstream_study("NCT00000001")]}));
        })
        .await;
    service
        .ensure_trials_available(["NCT00000001"])
        .await
        .unwrap();
    assert!(service
        .get_cached_clinical_study("NCT00000001")
        .await
        .unwrap()
        .is_some());

    service.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_ids_are_dropped_silently() {
    let server = MockServer::start_async().await;
    let dir = TempDir::new().unwrap();
    let service = CtGovService::new(fs_config(&server.base_url(), &dir));
    service.init().await.unwrap();

    // none of these are valid, so no request may go out (the server has no
    // mocks and would answer 404)
    service
        .ensure_trials_available(["NCT123", "bogus", ""])
        .await
        .unwrap();
    assert!(service
        .get_cached_clinical_study("not-an-id")
        .await
        .unwrap()
        .is_none());

    // a study object without an NCT id passes through untouched
    let stranger = ResearchStudy {
        id: Some("local-only".to_string()),
        ..Default::default()
    };
    let out = service
        .update_research_studies(vec![stranger.clone()])
        .await
        .unwrap();
    assert_eq!(out[0], stranger);

    service.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_misuse_is_reported() {
    let server = MockServer::start_async().await;
    let dir = TempDir::new().unwrap();
    let service = CtGovService::new(fs_config(&server.base_url(), &dir));

    assert!(matches!(
        service.ensure_trials_available(["NCT00000001"]).await,
        Err(ServiceError::NotInitialized)
    ));

    service.init().await.unwrap();
    assert!(matches!(
        service.init().await,
        Err(ServiceError::AlreadyInitialized)
    ));

    service.destroy().await.unwrap();
    assert!(matches!(
        service.destroy().await,
        Err(ServiceError::NotInitialized)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn caller_supplied_store_is_left_open() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/studies");
            then.status(200)
                .json_body(json!({"studies": [upstream_study("NCT00000042")]}));
        })
        .await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        SqliteStore::open(dir.path().join("external.db"), 128 * 1024 * 1024)
            .await
            .unwrap(),
    );

    let mut config = fs_config(&server.base_url(), &dir);
    config.storage.fs = None;
    config.storage.backend = StorageBackend::Sqlite;
    config.storage.sqlite = Some(SqliteConfig::default());
    let service =
        CtGovService::new(config).with_store(Arc::clone(&store) as Arc<dyn StudyStore>);
    service.init().await.unwrap();
    service
        .ensure_trials_available(["NCT00000042"])
        .await
        .unwrap();
    service.destroy().await.unwrap();

    // the facade did not close what it did not open
    let nct_id = "NCT00000042".parse().unwrap();
    assert!(store.get(nct_id).await.unwrap().is_some());
}
