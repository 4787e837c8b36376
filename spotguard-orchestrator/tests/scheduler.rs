use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use spotguard_common::{SnapshotJobInfo, SnapshotMetadata, SnapshotStatus};
use spotguard_orchestrator::job_store::{MemoryJobStore, SnapshotJobStore};
use spotguard_orchestrator::snapshot_scheduler::{
    SchedulerConfig, SnapshotExecutor, SnapshotScheduler,
};

#[derive(Default)]
struct FakeExecutor {
    fail: AtomicBool,
    runs: AtomicUsize,
    /// Instances whose snapshot waits for `release`.
    held: Mutex<HashSet<String>>,
    release: Notify,
}

impl FakeExecutor {
    fn hold(&self, instance_id: &str) {
        self.held.lock().unwrap().insert(instance_id.to_string());
    }
}

#[async_trait]
impl SnapshotExecutor for FakeExecutor {
    async fn run_snapshot(&self, job: &SnapshotJobInfo) -> Result<SnapshotMetadata> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let held = self.held.lock().unwrap().contains(&job.instance_id);
        if held {
            self.release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("ssh: connection refused");
        }
        let n = self.runs.load(Ordering::SeqCst);
        Ok(SnapshotMetadata {
            snapshot_id: format!("{}-{}", job.instance_id, n),
            instance_id: job.instance_id.clone(),
            name: None,
            created_at: Utc::now(),
            workspace_path: job.workspace_path.clone(),
            size_original: 2048,
            size_compressed: 1024,
            compression_ratio: 2.0,
            num_parts: 32,
            codec: "gzip".to_string(),
            sha256: String::new(),
            r2_path: String::new(),
            parts: Vec::new(),
        })
    }
}

fn scheduler(
    executor: Arc<FakeExecutor>,
    store: Arc<MemoryJobStore>,
    max_concurrent: usize,
) -> Arc<SnapshotScheduler> {
    Arc::new(SnapshotScheduler::new(
        executor,
        store,
        SchedulerConfig {
            max_concurrent,
            ..Default::default()
        },
    ))
}

#[tokio::test]
async fn add_validates_interval_and_persists() {
    let store = Arc::new(MemoryJobStore::new());
    let s = scheduler(Arc::new(FakeExecutor::default()), store.clone(), 1);

    assert!(s.add_instance("i-1", "10.0.0.1", 22, "/workspace", 7, true).await.is_err());
    let job = s.add_instance("i-1", "10.0.0.1", 22, "/workspace", 15, true).await.unwrap();
    assert!(job.enabled);
    assert_eq!(job.last_status, SnapshotStatus::Pending);
    let next = job.next_snapshot_at.unwrap();
    let delta = (next - Utc::now()).num_seconds();
    assert!((14 * 60..=15 * 60).contains(&delta), "next run in {}s", delta);

    assert_eq!(store.load_all().await.unwrap().len(), 1);
    assert!(s.update_instance("i-1", Some(11), None).await.is_err());
    let job = s.update_instance("i-1", Some(60), None).await.unwrap().unwrap();
    assert_eq!(job.interval_minutes, 60);
    assert!(s.update_instance("ghost", Some(5), None).await.unwrap().is_none());

    assert!(s.remove_instance("i-1").await.unwrap());
    assert!(!s.remove_instance("i-1").await.unwrap());
    assert!(store.load_all().await.unwrap().is_empty());
    assert!(s.trigger_snapshot("i-1", true).await.unwrap().is_none());
}

#[tokio::test]
async fn five_failures_open_the_breaker() {
    let exec = Arc::new(FakeExecutor::default());
    exec.fail.store(true, Ordering::SeqCst);
    let s = scheduler(exec.clone(), Arc::new(MemoryJobStore::new()), 1);
    s.add_instance("i-1", "h", 22, "/workspace", 5, true).await.unwrap();

    for attempt in 1..=5u32 {
        let r = s.trigger_snapshot("i-1", false).await.unwrap().unwrap();
        assert_eq!(r.status, SnapshotStatus::Failed);
        assert!(r.error.unwrap().contains("connection refused"));
        let job = s.get_job("i-1").await.unwrap();
        assert_eq!(job.consecutive_failures, attempt);
        assert_eq!(job.enabled, attempt < 5);
    }

    let r = s.trigger_snapshot("i-1", false).await.unwrap().unwrap();
    assert_eq!(r.status, SnapshotStatus::Skipped);
    assert_eq!(exec.runs.load(Ordering::SeqCst), 5);

    // Forced runs bypass the breaker; a success clears the counter but keeps it open.
    exec.fail.store(false, Ordering::SeqCst);
    let r = s.trigger_snapshot("i-1", true).await.unwrap().unwrap();
    assert_eq!(r.status, SnapshotStatus::Success);
    let job = s.get_job("i-1").await.unwrap();
    assert_eq!(job.consecutive_failures, 0);
    assert!(!job.enabled);
    assert_eq!(job.last_status, SnapshotStatus::Success);
    assert!(job.last_snapshot_at.is_some());

    let job = s.update_instance("i-1", None, Some(true)).await.unwrap().unwrap();
    assert!(job.enabled);
}

#[tokio::test]
async fn concurrency_cap_and_duplicate_runs_are_skipped() {
    let exec = Arc::new(FakeExecutor::default());
    exec.hold("slow");
    let s = scheduler(exec.clone(), Arc::new(MemoryJobStore::new()), 1);
    s.add_instance("slow", "h1", 22, "/workspace", 5, true).await.unwrap();
    s.add_instance("other", "h2", 22, "/workspace", 5, true).await.unwrap();

    let running = {
        let s = s.clone();
        tokio::spawn(async move { s.trigger_snapshot("slow", false).await })
    };
    while s.get_status().await.running.is_empty() {
        tokio::task::yield_now().await;
    }
    assert_eq!(s.get_job("slow").await.unwrap().last_status, SnapshotStatus::InProgress);

    let r = s.trigger_snapshot("slow", true).await.unwrap().unwrap();
    assert_eq!(r.status, SnapshotStatus::Skipped);
    assert!(r.error.unwrap().contains("in progress"));

    let r = s.trigger_snapshot("other", false).await.unwrap().unwrap();
    assert_eq!(r.status, SnapshotStatus::Skipped);
    assert!(r.error.unwrap().contains("concurrency"));

    let r = s.trigger_snapshot("other", true).await.unwrap().unwrap();
    assert_eq!(r.status, SnapshotStatus::Success);

    exec.release.notify_one();
    let r = running.await.unwrap().unwrap().unwrap();
    assert_eq!(r.status, SnapshotStatus::Success);
    assert!(s.get_status().await.running.is_empty());
}

#[tokio::test]
async fn history_is_newest_first_and_bounded() {
    let s = scheduler(Arc::new(FakeExecutor::default()), Arc::new(MemoryJobStore::new()), 1);
    s.add_instance("a", "h", 22, "/workspace", 5, true).await.unwrap();
    s.add_instance("b", "h", 22, "/workspace", 5, true).await.unwrap();

    for _ in 0..110 {
        s.trigger_snapshot("a", false).await.unwrap();
    }
    s.trigger_snapshot("b", false).await.unwrap();

    let all = s.get_history(None, 1000).await;
    assert_eq!(all.len(), 100);
    assert_eq!(all[0].instance_id, "b");
    assert_eq!(s.get_status().await.history_len, 100);

    let only_b = s.get_history(Some("b"), 10).await;
    assert_eq!(only_b.len(), 1);
    assert_eq!(s.get_history(Some("a"), 5).await.len(), 5);
}

fn stored_job(id: &str, next_in_ms: i64) -> SnapshotJobInfo {
    SnapshotJobInfo {
        instance_id: id.to_string(),
        host: "10.0.0.1".to_string(),
        port: 22,
        workspace_path: "/workspace".to_string(),
        interval_minutes: 5,
        enabled: true,
        last_snapshot_at: None,
        next_snapshot_at: Some(Utc::now() + chrono::Duration::milliseconds(next_in_ms)),
        last_status: SnapshotStatus::Pending,
        consecutive_failures: 0,
    }
}

#[tokio::test]
async fn warm_restart_does_not_fire_overdue_jobs() {
    let store = Arc::new(MemoryJobStore::new());
    let mut overdue = stored_job("overdue", -3_600_000);
    overdue.last_status = SnapshotStatus::InProgress;
    store.upsert(&overdue).await.unwrap();
    let mut broken = stored_job("broken", 60_000);
    broken.consecutive_failures = 5;
    store.upsert(&broken).await.unwrap();

    let exec = Arc::new(FakeExecutor::default());
    let s = scheduler(exec.clone(), store.clone(), 2);
    assert_eq!(s.load_from_store().await.unwrap(), 2);

    assert!(s.run_due_jobs().await.is_empty());
    assert_eq!(exec.runs.load(Ordering::SeqCst), 0);

    let job = s.get_job("overdue").await.unwrap();
    assert_eq!(job.last_status, SnapshotStatus::Pending);
    assert!(job.next_snapshot_at.unwrap() > Utc::now());
    assert!(!s.get_job("broken").await.unwrap().enabled);

    let persisted = store.load_all().await.unwrap();
    let overdue = persisted.iter().find(|j| j.instance_id == "overdue").unwrap();
    assert!(overdue.next_snapshot_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn due_jobs_fill_only_free_slots() {
    let store = Arc::new(MemoryJobStore::new());
    store.upsert(&stored_job("a", 200)).await.unwrap();
    store.upsert(&stored_job("b", 300)).await.unwrap();
    let exec = Arc::new(FakeExecutor::default());
    let s = scheduler(exec.clone(), store, 1);
    s.load_from_store().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let results = s.run_due_jobs().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].instance_id, "a");
    assert_eq!(results[0].status, SnapshotStatus::Success);

    let results = s.run_due_jobs().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].instance_id, "b");
    assert!(s.run_due_jobs().await.is_empty());
    assert!(s
        .get_history(None, 10)
        .await
        .iter()
        .all(|r| r.status != SnapshotStatus::Skipped));
}

#[tokio::test]
async fn jobs_added_disabled_never_run_on_schedule() {
    let store = Arc::new(MemoryJobStore::new());
    let exec = Arc::new(FakeExecutor::default());
    let s = scheduler(exec.clone(), store.clone(), 1);

    let job = s.add_instance("paused", "h", 22, "/workspace", 5, false).await.unwrap();
    assert!(!job.enabled);
    assert!(!store.load_all().await.unwrap()[0].enabled);

    let r = s.trigger_snapshot("paused", false).await.unwrap().unwrap();
    assert_eq!(r.status, SnapshotStatus::Skipped);
    assert!(r.error.unwrap().contains("disabled"));

    // Same job, due in 200ms, picked up after a restart.
    let mut persisted = store.load_all().await.unwrap().remove(0);
    persisted.next_snapshot_at = Some(Utc::now() + chrono::Duration::milliseconds(200));
    let restarted_store = Arc::new(MemoryJobStore::new());
    restarted_store.upsert(&persisted).await.unwrap();
    let restarted = scheduler(exec.clone(), restarted_store, 1);
    restarted.load_from_store().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(restarted.run_due_jobs().await.is_empty());
    assert_eq!(exec.runs.load(Ordering::SeqCst), 0);

    let job = s.add_instance("paused", "h", 22, "/workspace", 5, true).await.unwrap();
    assert!(job.enabled);
}
