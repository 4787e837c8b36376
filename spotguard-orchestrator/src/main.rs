use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use spotguard_orchestrator::api::{self, AppState};
use spotguard_orchestrator::config::{OrchestratorConfig, StorageConfig};
use spotguard_orchestrator::failover_events::{spawn_redis_forwarder, FailoverBus};
use spotguard_orchestrator::job_store::{MemoryJobStore, PgJobStore, SnapshotJobStore};
use spotguard_orchestrator::object_store::{LocalObjectStore, ObjectStore, S3ObjectStore};
use spotguard_orchestrator::probe::NetworkProbe;
use spotguard_orchestrator::provider_manager::ProviderManager;
use spotguard_orchestrator::race::RaceProvisioner;
use spotguard_orchestrator::snapshot_engine::SnapshotEngine;
use spotguard_orchestrator::snapshot_scheduler::SnapshotScheduler;
use spotguard_orchestrator::standby_manager::StandbyManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cfg = OrchestratorConfig::from_env();

    let provider = ProviderManager::get_provider(&cfg.provider)
        .with_context(|| format!("provider '{}' is not available", cfg.provider))?;
    tracing::info!("🔧 provider: {}", provider.provider_code());

    let probe = Arc::new(NetworkProbe::new(cfg.probe_timeout, &cfg.app_health_path)?);
    let bus = FailoverBus::default();

    if let Some(redis_url) = cfg.redis_url.as_deref() {
        let client = redis::Client::open(redis_url).context("invalid REDIS_URL")?;
        spawn_redis_forwarder(&bus, client, "spotguard-orchestrator");
        println!("✅ Failover events mirrored to Redis");
    }

    // Snapshot pipeline
    let store: Arc<dyn ObjectStore> = match &cfg.storage {
        StorageConfig::S3(s3) => Arc::new(S3ObjectStore::connect(s3).await),
        StorageConfig::Local(dir) => Arc::new(LocalObjectStore::new(dir.clone())),
    };
    tracing::info!("📦 snapshot store: {}", store.describe());
    let engine = Arc::new(SnapshotEngine::new(
        store,
        Arc::new(cfg.ssh.clone()),
        cfg.snapshot.clone(),
    ));

    // Standby pairs
    let provisioner = Arc::new(RaceProvisioner::new(provider.clone(), probe.clone()));
    let standby = Arc::new(
        StandbyManager::new(
            provider.clone(),
            probe.clone(),
            provisioner,
            bus.clone(),
            cfg.standby.clone(),
        )
        .with_snapshot_restore(engine.clone()),
    );

    // Scheduler jobs survive restarts when Postgres is configured.
    let job_store: Arc<dyn SnapshotJobStore> = match cfg.database_url.as_deref() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("Failed to connect to Postgres")?;
            sqlx::query("SELECT 1").execute(&pool).await?;
            println!("✅ Connected to Database");
            sqlx::migrate!("../sqlx-migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;
            Arc::new(PgJobStore::new(pool))
        }
        None => {
            tracing::warn!("⚠️  DATABASE_URL not set, snapshot jobs are kept in memory only");
            Arc::new(MemoryJobStore::new())
        }
    };
    let scheduler = Arc::new(SnapshotScheduler::new(
        engine.clone(),
        job_store,
        cfg.scheduler.clone(),
    ));
    let restored = scheduler.load_from_store().await?;
    tracing::info!("📸 {} snapshot job(s) restored", restored);

    let standby_loop = tokio::spawn(standby.clone().run());
    let scheduler_loop = tokio::spawn(scheduler.clone().run());

    let app = api::router(Arc::new(AppState {
        standby,
        scheduler,
        engine,
    }));

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    println!("SpotGuard orchestrator listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("🛑 shutdown requested");
        })
        .await?;

    standby_loop.abort();
    scheduler_loop.abort();
    Ok(())
}
