use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use tokio::sync::Mutex;

use spotguard_common::{SnapshotJobInfo, SnapshotStatus};

/// Durable home of the scheduler's job table.
#[async_trait]
pub trait SnapshotJobStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<SnapshotJobInfo>>;
    async fn upsert(&self, job: &SnapshotJobInfo) -> Result<()>;
    async fn delete(&self, instance_id: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, SnapshotJobInfo>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotJobStore for MemoryJobStore {
    async fn load_all(&self) -> Result<Vec<SnapshotJobInfo>> {
        let mut jobs: Vec<SnapshotJobInfo> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(jobs)
    }

    async fn upsert(&self, job: &SnapshotJobInfo) -> Result<()> {
        self.jobs
            .lock()
            .await
            .insert(job.instance_id.clone(), job.clone());
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<bool> {
        Ok(self.jobs.lock().await.remove(instance_id).is_some())
    }
}

pub struct PgJobStore {
    db: Pool<Postgres>,
}

type JobRow = (
    String,                // instance_id
    String,                // host
    i32,                   // port
    String,                // workspace_path
    i32,                   // interval_minutes
    bool,                  // enabled
    Option<DateTime<Utc>>, // last_snapshot_at
    Option<DateTime<Utc>>, // next_snapshot_at
    String,                // last_status
    i32,                   // consecutive_failures
);

impl PgJobStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    fn from_row(row: JobRow) -> SnapshotJobInfo {
        let (
            instance_id,
            host,
            port,
            workspace_path,
            interval_minutes,
            enabled,
            last_snapshot_at,
            next_snapshot_at,
            last_status,
            consecutive_failures,
        ) = row;
        SnapshotJobInfo {
            instance_id,
            host,
            port: u16::try_from(port).unwrap_or(22),
            workspace_path,
            interval_minutes: interval_minutes.max(0) as u32,
            enabled,
            last_snapshot_at,
            next_snapshot_at,
            last_status: SnapshotStatus::parse(&last_status).unwrap_or(SnapshotStatus::Pending),
            consecutive_failures: consecutive_failures.max(0) as u32,
        }
    }
}

#[async_trait]
impl SnapshotJobStore for PgJobStore {
    async fn load_all(&self) -> Result<Vec<SnapshotJobInfo>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT instance_id, host, port, workspace_path, interval_minutes, enabled,
                    last_snapshot_at, next_snapshot_at, last_status, consecutive_failures
             FROM snapshot_jobs
             ORDER BY instance_id",
        )
        .fetch_all(&self.db)
        .await
        .context("loading snapshot_jobs")?;
        Ok(rows.into_iter().map(Self::from_row).collect())
    }

    async fn upsert(&self, job: &SnapshotJobInfo) -> Result<()> {
        sqlx::query(
            "INSERT INTO snapshot_jobs
                (instance_id, host, port, workspace_path, interval_minutes, enabled,
                 last_snapshot_at, next_snapshot_at, last_status, consecutive_failures, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
             ON CONFLICT (instance_id) DO UPDATE SET
                host = EXCLUDED.host,
                port = EXCLUDED.port,
                workspace_path = EXCLUDED.workspace_path,
                interval_minutes = EXCLUDED.interval_minutes,
                enabled = EXCLUDED.enabled,
                last_snapshot_at = EXCLUDED.last_snapshot_at,
                next_snapshot_at = EXCLUDED.next_snapshot_at,
                last_status = EXCLUDED.last_status,
                consecutive_failures = EXCLUDED.consecutive_failures,
                updated_at = NOW()",
        )
        .bind(&job.instance_id)
        .bind(&job.host)
        .bind(i32::from(job.port))
        .bind(&job.workspace_path)
        .bind(job.interval_minutes as i32)
        .bind(job.enabled)
        .bind(job.last_snapshot_at)
        .bind(job.next_snapshot_at)
        .bind(job.last_status.as_str())
        .bind(job.consecutive_failures as i32)
        .execute(&self.db)
        .await
        .with_context(|| format!("upserting snapshot job {}", job.instance_id))?;
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM snapshot_jobs WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.db)
            .await
            .with_context(|| format!("deleting snapshot job {}", instance_id))?;
        Ok(res.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> SnapshotJobInfo {
        SnapshotJobInfo {
            instance_id: id.to_string(),
            host: "10.0.0.1".to_string(),
            port: 2222,
            workspace_path: "/workspace".to_string(),
            interval_minutes: 15,
            enabled: true,
            last_snapshot_at: None,
            next_snapshot_at: Some(Utc::now()),
            last_status: SnapshotStatus::Pending,
            consecutive_failures: 0,
        }
    }

    #[tokio::test]
    async fn memory_store_upsert_and_delete() {
        let store = MemoryJobStore::new();
        store.upsert(&job("b")).await.unwrap();
        store.upsert(&job("a")).await.unwrap();
        let mut updated = job("a");
        updated.interval_minutes = 60;
        store.upsert(&updated).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].instance_id, "a");
        assert_eq!(all[0].interval_minutes, 60);

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn pg_store_roundtrip() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("Skipping pg_store_roundtrip: DATABASE_URL not set");
            return;
        };
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        sqlx::migrate!("../sqlx-migrations").run(&pool).await.unwrap();
        let store = PgJobStore::new(pool);

        let id = format!("test-{}", uuid::Uuid::new_v4());
        let mut j = job(&id);
        store.upsert(&j).await.unwrap();
        j.consecutive_failures = 2;
        j.last_status = SnapshotStatus::Failed;
        store.upsert(&j).await.unwrap();

        let loaded = store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .find(|x| x.instance_id == id)
            .unwrap();
        assert_eq!(loaded.port, 2222);
        assert_eq!(loaded.consecutive_failures, 2);
        assert_eq!(loaded.last_status, SnapshotStatus::Failed);

        assert!(store.delete(&id).await.unwrap());
    }
}
