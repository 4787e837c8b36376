use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use spotguard_orchestrator::api::{self, AppState};
use spotguard_orchestrator::failover_events::FailoverBus;
use spotguard_orchestrator::job_store::MemoryJobStore;
use spotguard_orchestrator::node_transport::LocalTransport;
use spotguard_orchestrator::object_store::LocalObjectStore;
use spotguard_orchestrator::probe::ScriptedProbe;
use spotguard_orchestrator::race::RaceProvisioner;
use spotguard_orchestrator::snapshot_engine::{SnapshotConfig, SnapshotEngine};
use spotguard_orchestrator::snapshot_scheduler::{SchedulerConfig, SnapshotScheduler};
use spotguard_orchestrator::standby_manager::{StandbyConfig, StandbyManager};
use spotguard_providers::mock::MockMarketplace;

async fn spawn_app(root: &std::path::Path) -> String {
    let market = Arc::new(MockMarketplace::new());
    let probe = Arc::new(ScriptedProbe::new());
    let engine = Arc::new(SnapshotEngine::new(
        Arc::new(LocalObjectStore::new(root.join("bucket"))),
        Arc::new(LocalTransport),
        SnapshotConfig {
            num_parts: 4,
            scratch_dir: Some(root.join("scratch")),
            ..Default::default()
        },
    ));
    let standby = Arc::new(StandbyManager::new(
        market.clone(),
        probe.clone(),
        Arc::new(RaceProvisioner::new(market, probe)),
        FailoverBus::default(),
        StandbyConfig::default(),
    ));
    let scheduler = Arc::new(SnapshotScheduler::new(
        engine.clone(),
        Arc::new(MemoryJobStore::new()),
        SchedulerConfig::default(),
    ));
    let app = api::router(Arc::new(AppState {
        standby,
        scheduler,
        engine,
    }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

#[tokio::test]
async fn snapshot_jobs_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let ws = dir.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();
    std::fs::write(ws.join("notes.txt"), b"epoch 3 done").unwrap();
    let base = spawn_app(dir.path()).await;
    let client = reqwest::Client::new();

    let root = client.get(&base).send().await.unwrap().text().await.unwrap();
    assert!(root.contains("Online"));

    let bad = client
        .post(format!("{}/snapshots/jobs", base))
        .json(&json!({ "instance_id": "i-1", "host": "127.0.0.1", "interval_minutes": 3 }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    let created = client
        .post(format!("{}/snapshots/jobs", base))
        .json(&json!({
            "instance_id": "i-1",
            "host": "127.0.0.1",
            "workspace_path": ws.to_str().unwrap(),
            "interval_minutes": 30,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let job: Value = created.json().await.unwrap();
    assert_eq!(job["port"], 22);
    assert_eq!(job["enabled"], true);

    let status: Value = client
        .get(format!("{}/snapshots/jobs", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(status["max_concurrent"], 1);

    let result: Value = client
        .post(format!("{}/snapshots/jobs/i-1/trigger", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result["status"], "success");
    let snapshot_id = result["snapshot_id"].as_str().unwrap().to_string();

    let listed: Value = client
        .get(format!("{}/snapshots?instance_id=i-1", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed[0]["snapshot_id"], snapshot_id.as_str());
    assert_eq!(listed[0]["num_parts"], 4);

    let history: Value = client
        .get(format!("{}/snapshots/history?instance_id=i-1&limit=5", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);

    let patched: Value = client
        .patch(format!("{}/snapshots/jobs/i-1", base))
        .json(&json!({ "enabled": false }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(patched["enabled"], false);
    let skipped: Value = client
        .post(format!("{}/snapshots/jobs/i-1/trigger", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(skipped["status"], "skipped");

    let del = client
        .delete(format!("{}/snapshots/{}", base, snapshot_id))
        .send()
        .await
        .unwrap();
    assert_eq!(del.status(), StatusCode::NO_CONTENT);
    let del = client
        .delete(format!("{}/snapshots/{}", base, snapshot_id))
        .send()
        .await
        .unwrap();
    assert_eq!(del.status(), StatusCode::NOT_FOUND);

    let gone = client
        .delete(format!("{}/snapshots/jobs/i-1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), StatusCode::NO_CONTENT);
    let missing = client
        .post(format!("{}/snapshots/jobs/i-1/trigger", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let paused: Value = client
        .post(format!("{}/snapshots/jobs", base))
        .json(&json!({
            "instance_id": "i-2",
            "host": "127.0.0.1",
            "interval_minutes": 60,
            "enabled": false,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(paused["enabled"], false);
    assert_eq!(paused["workspace_path"], "/workspace");
}

#[tokio::test]
async fn standby_endpoints_report_empty_fleet() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_app(dir.path()).await;
    let client = reqwest::Client::new();

    let status: Value = client
        .get(format!("{}/standby/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(status["machines"].as_array().unwrap().is_empty());
    assert_eq!(status["reprovision_requests"], 0);

    let active = client
        .get(format!("{}/standby/active", base))
        .send()
        .await
        .unwrap();
    assert_eq!(active.status(), StatusCode::NOT_FOUND);

    let assoc = client
        .get(format!("{}/standby/associations/m-404", base))
        .send()
        .await
        .unwrap();
    assert_eq!(assoc.status(), StatusCode::NOT_FOUND);

    let unknown = client
        .post(format!("{}/standby/primary", base))
        .json(&json!({ "instance_id": "ghost" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}
