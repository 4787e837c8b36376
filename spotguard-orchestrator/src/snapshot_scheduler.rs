// ============================================================================
// SNAPSHOT SCHEDULER
// ============================================================================

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use spotguard_common::{
    is_valid_snapshot_interval, SnapshotJobInfo, SnapshotMetadata, SnapshotResult,
    SnapshotStatus, MAX_CONSECUTIVE_FAILURES, SNAPSHOT_HISTORY_LIMIT, SNAPSHOT_INTERVALS,
};

use crate::job_store::SnapshotJobStore;
use crate::snapshot_engine::SnapshotEngine;

/// Runs one snapshot for a job.
#[async_trait]
pub trait SnapshotExecutor: Send + Sync {
    async fn run_snapshot(&self, job: &SnapshotJobInfo) -> Result<SnapshotMetadata>;
}

#[async_trait]
impl SnapshotExecutor for SnapshotEngine {
    async fn run_snapshot(&self, job: &SnapshotJobInfo) -> Result<SnapshotMetadata> {
        self.create_snapshot(
            &job.instance_id,
            &job.host,
            job.port,
            &job.workspace_path,
            None,
        )
        .await
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub tick_interval: Duration,
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            tick_interval: Duration::from_secs(30),
            history_limit: SNAPSHOT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub jobs: Vec<SnapshotJobInfo>,
    pub running: Vec<String>,
    pub max_concurrent: usize,
    pub history_len: usize,
}

#[derive(Default)]
struct SchedulerTable {
    jobs: HashMap<String, SnapshotJobInfo>,
    running: HashSet<String>,
    history: VecDeque<SnapshotResult>,
}

fn next_run(from: DateTime<Utc>, interval_minutes: u32) -> DateTime<Utc> {
    from + chrono::Duration::minutes(i64::from(interval_minutes))
}

fn skipped(instance_id: &str, reason: &str) -> SnapshotResult {
    let now = Utc::now();
    SnapshotResult {
        instance_id: instance_id.to_string(),
        status: SnapshotStatus::Skipped,
        started_at: now,
        completed_at: Some(now),
        snapshot_id: None,
        size_bytes: None,
        error: Some(reason.to_string()),
    }
}

pub struct SnapshotScheduler {
    executor: Arc<dyn SnapshotExecutor>,
    store: Arc<dyn SnapshotJobStore>,
    config: SchedulerConfig,
    table: Mutex<SchedulerTable>,
}

impl SnapshotScheduler {
    pub fn new(
        executor: Arc<dyn SnapshotExecutor>,
        store: Arc<dyn SnapshotJobStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            executor,
            store,
            config,
            table: Mutex::new(SchedulerTable::default()),
        }
    }

    fn push_history(&self, t: &mut SchedulerTable, r: SnapshotResult) {
        t.history.push_back(r);
        while t.history.len() > self.config.history_limit.max(1) {
            t.history.pop_front();
        }
    }

    async fn persist(&self, job: &SnapshotJobInfo) {
        if let Err(e) = self.store.upsert(job).await {
            tracing::error!(
                "❌ [snapshot-scheduler] persisting job {} failed: {:?}",
                job.instance_id,
                e
            );
        }
    }

    /// Warm restart: reload persisted jobs. Jobs already overdue are pushed
    /// one interval ahead instead of firing at once.
    pub async fn load_from_store(&self) -> Result<usize> {
        let jobs = self.store.load_all().await?;
        let now = Utc::now();
        let mut t = self.table.lock().await;
        let mut rescheduled = Vec::new();
        for mut job in jobs {
            let mut dirty = false;
            if !is_valid_snapshot_interval(job.interval_minutes) {
                tracing::warn!(
                    "⚠️  [snapshot-scheduler] job {} has invalid interval {}, skipping",
                    job.instance_id,
                    job.interval_minutes
                );
                continue;
            }
            if job.next_snapshot_at.map_or(true, |n| n <= now) {
                job.next_snapshot_at = Some(next_run(now, job.interval_minutes));
                dirty = true;
            }
            if job.last_status == SnapshotStatus::InProgress {
                job.last_status = SnapshotStatus::Pending;
                dirty = true;
            }
            if job.consecutive_failures >= MAX_CONSECUTIVE_FAILURES && job.enabled {
                job.enabled = false;
                dirty = true;
            }
            if dirty {
                rescheduled.push(job.clone());
            }
            t.jobs.insert(job.instance_id.clone(), job);
        }
        let n = t.jobs.len();
        drop(t);
        for job in &rescheduled {
            self.persist(job).await;
        }
        tracing::info!(
            "♻️ [snapshot-scheduler] loaded {} job(s), {} rescheduled",
            n,
            rescheduled.len()
        );
        Ok(n)
    }

    /// Start (or re-point) periodic snapshots of an instance. A job added
    /// disabled is kept but never picked up by the ticker.
    pub async fn add_instance(
        &self,
        instance_id: &str,
        host: &str,
        port: u16,
        workspace_path: &str,
        interval_minutes: u32,
        enabled: bool,
    ) -> Result<SnapshotJobInfo> {
        if !is_valid_snapshot_interval(interval_minutes) {
            anyhow::bail!(
                "invalid snapshot interval {} (allowed: {:?})",
                interval_minutes,
                SNAPSHOT_INTERVALS
            );
        }
        let mut t = self.table.lock().await;
        let job = match t.jobs.get(instance_id) {
            Some(existing) => SnapshotJobInfo {
                host: host.to_string(),
                port,
                workspace_path: workspace_path.to_string(),
                interval_minutes,
                enabled,
                next_snapshot_at: Some(next_run(Utc::now(), interval_minutes)),
                consecutive_failures: if enabled && !existing.enabled {
                    0
                } else {
                    existing.consecutive_failures
                },
                ..existing.clone()
            },
            None => SnapshotJobInfo {
                instance_id: instance_id.to_string(),
                host: host.to_string(),
                port,
                workspace_path: workspace_path.to_string(),
                interval_minutes,
                enabled,
                last_snapshot_at: None,
                next_snapshot_at: Some(next_run(Utc::now(), interval_minutes)),
                last_status: SnapshotStatus::Pending,
                consecutive_failures: 0,
            },
        };
        self.store.upsert(&job).await?;
        t.jobs.insert(instance_id.to_string(), job.clone());
        tracing::info!(
            "📅 [snapshot-scheduler] {} every {} min (enabled={})",
            instance_id,
            interval_minutes,
            enabled
        );
        Ok(job)
    }

    /// Change interval and/or enabled flag. Re-enabling closes the circuit breaker.
    pub async fn update_instance(
        &self,
        instance_id: &str,
        interval_minutes: Option<u32>,
        enabled: Option<bool>,
    ) -> Result<Option<SnapshotJobInfo>> {
        if let Some(i) = interval_minutes {
            if !is_valid_snapshot_interval(i) {
                anyhow::bail!("invalid snapshot interval {} (allowed: {:?})", i, SNAPSHOT_INTERVALS);
            }
        }
        let mut t = self.table.lock().await;
        let Some(mut job) = t.jobs.get(instance_id).cloned() else {
            return Ok(None);
        };
        if let Some(i) = interval_minutes {
            job.interval_minutes = i;
            job.next_snapshot_at = Some(next_run(Utc::now(), i));
        }
        if let Some(e) = enabled {
            if e && !job.enabled {
                job.consecutive_failures = 0;
                job.next_snapshot_at = Some(next_run(Utc::now(), job.interval_minutes));
            }
            job.enabled = e;
        }
        self.store.upsert(&job).await?;
        t.jobs.insert(instance_id.to_string(), job.clone());
        Ok(Some(job))
    }

    pub async fn remove_instance(&self, instance_id: &str) -> Result<bool> {
        let mut t = self.table.lock().await;
        let existed = t.jobs.remove(instance_id).is_some();
        self.store.delete(instance_id).await?;
        if existed {
            tracing::info!("🗑️ [snapshot-scheduler] stopped snapshots of {}", instance_id);
        }
        Ok(existed)
    }

    /// Run one snapshot now. `None` for an unknown instance. Without `force`
    /// the call is skipped when the job is disabled or the concurrency cap is reached.
    pub async fn trigger_snapshot(
        &self,
        instance_id: &str,
        force: bool,
    ) -> Result<Option<SnapshotResult>> {
        let job = {
            let mut t = self.table.lock().await;
            let Some(mut job) = t.jobs.get(instance_id).cloned() else {
                return Ok(None);
            };
            let reason = if t.running.contains(instance_id) {
                Some("snapshot already in progress".to_string())
            } else if !force && !job.enabled {
                Some("job disabled".to_string())
            } else if !force && t.running.len() >= self.config.max_concurrent {
                Some(format!(
                    "concurrency limit reached ({} running)",
                    t.running.len()
                ))
            } else {
                None
            };
            if let Some(reason) = reason {
                tracing::info!("⏭️ [snapshot-scheduler] {} skipped: {}", instance_id, reason);
                let r = skipped(instance_id, &reason);
                self.push_history(&mut t, r.clone());
                return Ok(Some(r));
            }
            t.running.insert(instance_id.to_string());
            job.last_status = SnapshotStatus::InProgress;
            t.jobs.insert(instance_id.to_string(), job.clone());
            job
        };
        self.persist(&job).await;

        let started_at = Utc::now();
        let outcome = self.executor.run_snapshot(&job).await;
        let completed_at = Utc::now();

        let mut result = SnapshotResult {
            instance_id: instance_id.to_string(),
            status: SnapshotStatus::Success,
            started_at,
            completed_at: Some(completed_at),
            snapshot_id: None,
            size_bytes: None,
            error: None,
        };
        match &outcome {
            Ok(meta) => {
                result.snapshot_id = Some(meta.snapshot_id.clone());
                result.size_bytes = Some(meta.size_compressed);
            }
            Err(e) => {
                result.status = SnapshotStatus::Failed;
                result.error = Some(format!("{:#}", e));
            }
        }

        let updated = {
            let mut t = self.table.lock().await;
            t.running.remove(instance_id);
            let updated = t.jobs.get_mut(instance_id).map(|j| {
                match &outcome {
                    Ok(_) => {
                        j.last_snapshot_at = Some(completed_at);
                        j.last_status = SnapshotStatus::Success;
                        j.consecutive_failures = 0;
                    }
                    Err(e) => {
                        j.last_status = SnapshotStatus::Failed;
                        j.consecutive_failures += 1;
                        tracing::warn!(
                            "⚠️  [snapshot-scheduler] {} failed ({} in a row): {:#}",
                            instance_id,
                            j.consecutive_failures,
                            e
                        );
                        if j.consecutive_failures >= MAX_CONSECUTIVE_FAILURES && j.enabled {
                            j.enabled = false;
                            tracing::error!(
                                "🔌 [snapshot-scheduler] {} disabled after {} consecutive failures",
                                instance_id,
                                j.consecutive_failures
                            );
                        }
                    }
                }
                j.next_snapshot_at = Some(next_run(completed_at, j.interval_minutes));
                j.clone()
            });
            self.push_history(&mut t, result.clone());
            updated
        };
        // Removed while running: nothing to persist.
        if let Some(job) = updated {
            self.persist(&job).await;
        }
        Ok(Some(result))
    }

    /// Trigger every enabled job whose time has come, up to the free slots.
    pub async fn run_due_jobs(&self) -> Vec<SnapshotResult> {
        let due: Vec<String> = {
            let t = self.table.lock().await;
            let now = Utc::now();
            let free = self.config.max_concurrent.saturating_sub(t.running.len());
            let mut due: Vec<&SnapshotJobInfo> = t
                .jobs
                .values()
                .filter(|j| j.enabled && !t.running.contains(&j.instance_id))
                .filter(|j| j.next_snapshot_at.map_or(false, |n| n <= now))
                .collect();
            due.sort_by_key(|j| j.next_snapshot_at);
            due.into_iter()
                .take(free)
                .map(|j| j.instance_id.clone())
                .collect()
        };
        if due.is_empty() {
            return Vec::new();
        }
        let runs = due.iter().map(|id| self.trigger_snapshot(id, false));
        futures_util::future::join_all(runs)
            .await
            .into_iter()
            .filter_map(|r| match r {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("❌ [snapshot-scheduler] trigger failed: {:?}", e);
                    None
                }
            })
            .collect()
    }

    pub async fn get_job(&self, instance_id: &str) -> Option<SnapshotJobInfo> {
        self.table.lock().await.jobs.get(instance_id).cloned()
    }

    pub async fn list_jobs(&self) -> Vec<SnapshotJobInfo> {
        let mut jobs: Vec<SnapshotJobInfo> = self.table.lock().await.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        jobs
    }

    /// Most recent results first.
    pub async fn get_history(&self, instance_id: Option<&str>, limit: usize) -> Vec<SnapshotResult> {
        let t = self.table.lock().await;
        t.history
            .iter()
            .rev()
            .filter(|r| instance_id.map_or(true, |i| r.instance_id == i))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_status(&self) -> SchedulerStatus {
        let t = self.table.lock().await;
        let mut jobs: Vec<SnapshotJobInfo> = t.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        let mut running: Vec<String> = t.running.iter().cloned().collect();
        running.sort();
        SchedulerStatus {
            jobs,
            running,
            max_concurrent: self.config.max_concurrent,
            history_len: t.history.len(),
        }
    }

    /// job-snapshot-scheduler
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            "📸 job-snapshot-scheduler started (tick={:?}, max_concurrent={})",
            self.config.tick_interval,
            self.config.max_concurrent
        );
        loop {
            interval.tick().await;
            let this = self.clone();
            // Long snapshots must not delay the next scan.
            tokio::spawn(async move {
                let results = this.run_due_jobs().await;
                if !results.is_empty() {
                    tracing::info!(
                        "📸 [snapshot-scheduler] tick ran {} snapshot(s)",
                        results.len()
                    );
                }
            });
        }
    }
}
