use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;

use spotguard_common::{Target, TargetType};
use spotguard_orchestrator::failover_events::{spawn_redis_forwarder, FailoverBus};
use spotguard_orchestrator::failover_proxy::{resolve_targets, FailoverProxy};
use spotguard_orchestrator::failover_state::FailoverStateStore;
use spotguard_orchestrator::health_monitor::HealthMonitor;
use spotguard_orchestrator::probe::NetworkProbe;
use spotguard_orchestrator::status_api;

/// TCP proxy in front of a GPU/CPU pair with automatic failover.
#[derive(Parser, Debug)]
#[command(name = "failover-proxy", version)]
struct Cli {
    /// Machine whose standby association is looked up on the orchestrator.
    #[arg(long, env = "MACHINE_ID")]
    machine_id: Option<String>,

    #[arg(long, env = "LOCAL_PORT", default_value_t = 2222)]
    local_port: u16,

    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:8001")]
    api_base_url: String,

    /// Seconds between health probes.
    #[arg(long, env = "HEALTH_CHECK_INTERVAL", default_value_t = 5)]
    health_check_interval: u64,

    /// Consecutive failed probes before switching targets.
    #[arg(long, env = "FAILOVER_THRESHOLD", default_value_t = 3)]
    failover_threshold: u32,

    #[arg(long, env = "GPU_HOST")]
    gpu_host: Option<String>,
    #[arg(long, env = "GPU_PORT", default_value_t = 22)]
    gpu_port: u16,
    #[arg(long, env = "CPU_HOST")]
    cpu_host: Option<String>,
    #[arg(long, env = "CPU_PORT", default_value_t = 22)]
    cpu_port: u16,

    #[arg(long, env = "STATE_FILE", default_value = "./data/failover_state.json")]
    state_file: PathBuf,

    #[arg(long, env = "STATUS_PORT", default_value_t = 8081)]
    status_port: u16,

    #[arg(long, env = "PROBE_TIMEOUT", default_value_t = 3)]
    probe_timeout: u64,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let (gpu, cpu) = match (cli.gpu_host.as_deref(), cli.cpu_host.as_deref()) {
        (Some(g), Some(c)) => (
            Target::new(TargetType::Gpu, g, cli.gpu_port),
            Target::new(TargetType::Cpu, c, cli.cpu_port),
        ),
        _ => {
            let machine_id = cli
                .machine_id
                .as_deref()
                .context("either --gpu-host/--cpu-host or --machine-id is required")?;
            resolve_targets(&cli.api_base_url, machine_id).await?
        }
    };
    tracing::info!(
        "🔧 [failover-proxy] GPU {}:{} / CPU {}:{}",
        gpu.host,
        gpu.port,
        cpu.host,
        cpu.port
    );

    let bus = FailoverBus::default();
    if let Ok(redis_url) = std::env::var("REDIS_URL") {
        let client = redis::Client::open(redis_url).context("invalid REDIS_URL")?;
        spawn_redis_forwarder(&bus, client, "failover-proxy");
    }

    let proxy = FailoverProxy::new(
        cli.machine_id.clone(),
        gpu,
        cpu,
        FailoverStateStore::new(cli.state_file.clone()),
        bus,
    );
    if let Err(e) = proxy.restore_state().await {
        tracing::warn!("⚠️  [failover-proxy] ignoring unreadable state file: {:#}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], cli.local_port)))
        .await
        .with_context(|| format!("binding proxy port {}", cli.local_port))?;
    let proxy_task = tokio::spawn(proxy.clone().serve(listener, shutdown_rx.clone()));

    let status_addr = SocketAddr::from(([0, 0, 0, 0], cli.status_port));
    let status_listener = tokio::net::TcpListener::bind(status_addr)
        .await
        .with_context(|| format!("binding status port {}", cli.status_port))?;
    let mut status_shutdown = shutdown_rx.clone();
    let status_router = status_api::router(proxy.clone());
    let status_task = tokio::spawn(async move {
        axum::serve(status_listener, status_router)
            .with_graceful_shutdown(async move {
                let _ = status_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });
    println!("Failover proxy status API on {}", status_addr);

    let monitor = HealthMonitor::new(
        proxy,
        Arc::new(NetworkProbe::new(
            Duration::from_secs(cli.probe_timeout),
            "/",
        )?),
        Duration::from_secs(cli.health_check_interval),
        cli.failover_threshold,
    );
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx));

    shutdown_signal().await;
    tracing::info!("🛑 [failover-proxy] shutting down");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(Duration::from_secs(10), monitor_task)
        .await
        .is_err()
    {
        tracing::warn!("⚠️  [failover-proxy] health monitor did not stop within 10s");
    }
    let _ = proxy_task.await;
    let _ = status_task.await;
    Ok(())
}
