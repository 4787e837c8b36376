// ============================================================================
// FAILOVER PROXY
// ============================================================================
//
// Local TCP listener that forwards each connection to whichever target
// (GPU primary or CPU standby) is active when the connection is accepted.
// Existing connections are never moved; only new ones follow a switch.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, RwLock};

use spotguard_common::{
    FailoverEvent, FailoverReason, FailoverState, Target, TargetEndpoint, TargetType,
};

use crate::failover_events::FailoverBus;
use crate::failover_state::FailoverStateStore;

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Both targets plus the monitor's view of them.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    pub gpu: Target,
    pub cpu: Target,
    pub active: TargetType,
    pub previous: Option<TargetType>,
    /// Consecutive failed probes of the active target.
    pub failed_checks: u32,
    pub failover_count: u64,
    /// Last time the active target was confirmed healthy.
    pub last_sync: Option<DateTime<Utc>>,
    /// Number of successful probes of the active target.
    pub sync_count: u64,
}

impl TargetRegistry {
    pub fn new(gpu: Target, cpu: Target) -> Self {
        Self {
            gpu,
            cpu,
            active: TargetType::Gpu,
            previous: None,
            failed_checks: 0,
            failover_count: 0,
            last_sync: None,
            sync_count: 0,
        }
    }

    pub fn target(&self, t: TargetType) -> &Target {
        match t {
            TargetType::Gpu => &self.gpu,
            TargetType::Cpu => &self.cpu,
        }
    }

    pub fn target_mut(&mut self, t: TargetType) -> &mut Target {
        match t {
            TargetType::Gpu => &mut self.gpu,
            TargetType::Cpu => &mut self.cpu,
        }
    }

    pub fn active_target(&self) -> &Target {
        self.target(self.active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub machine_id: Option<String>,
    pub mode: TargetType,
    pub gpu_host: String,
    pub gpu_port: u16,
    pub gpu_healthy: bool,
    pub cpu_host: String,
    pub cpu_port: u16,
    pub cpu_healthy: bool,
    pub healthy: bool,
    pub failed_checks: u32,
    pub failover_count: u64,
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_count: u64,
}

pub struct FailoverProxy {
    machine_id: Option<String>,
    registry: RwLock<TargetRegistry>,
    /// Serializes target switches; probes never hold it.
    transition: Mutex<()>,
    state_store: FailoverStateStore,
    bus: FailoverBus,
}

impl FailoverProxy {
    pub fn new(
        machine_id: Option<String>,
        gpu: Target,
        cpu: Target,
        state_store: FailoverStateStore,
        bus: FailoverBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            machine_id,
            registry: RwLock::new(TargetRegistry::new(gpu, cpu)),
            transition: Mutex::new(()),
            state_store,
            bus,
        })
    }

    /// Re-apply the persisted active target when it matches one of the configured targets.
    pub async fn restore_state(&self) -> anyhow::Result<bool> {
        let Some(state) = self.state_store.load().await? else {
            return Ok(false);
        };
        let mut reg = self.registry.write().await;
        let t = state.active_target.target_type;
        let configured = reg.target(t).endpoint();
        if configured != state.active_target {
            tracing::warn!(
                "⚠️  [failover-proxy] persisted target {} no longer configured, starting on GPU",
                state.active_target.addr()
            );
            return Ok(false);
        }
        reg.active = t;
        reg.previous = state.previous_target.map(|p| p.target_type);
        reg.failover_count = state.failover_count;
        tracing::info!(
            "♻️ [failover-proxy] restored active target {} ({}), failovers so far: {}",
            t.as_str(),
            state.active_target.addr(),
            state.failover_count
        );
        Ok(true)
    }

    pub fn bus(&self) -> &FailoverBus {
        &self.bus
    }

    pub async fn registry(&self) -> TargetRegistry {
        self.registry.read().await.clone()
    }

    pub async fn active_endpoint(&self) -> TargetEndpoint {
        self.registry.read().await.active_target().endpoint()
    }

    pub async fn status(&self) -> ProxyStatus {
        let reg = self.registry.read().await;
        ProxyStatus {
            machine_id: self.machine_id.clone(),
            mode: reg.active,
            gpu_host: reg.gpu.host.clone(),
            gpu_port: reg.gpu.port,
            gpu_healthy: reg.gpu.healthy,
            cpu_host: reg.cpu.host.clone(),
            cpu_port: reg.cpu.port,
            cpu_healthy: reg.cpu.healthy,
            healthy: reg.active_target().healthy,
            failed_checks: reg.failed_checks,
            failover_count: reg.failover_count,
            last_sync: reg.last_sync,
            sync_count: reg.sync_count,
        }
    }

    /// Record a probe result for `t`. Returns the updated failed-check count
    /// when `t` is the active target.
    pub async fn record_probe(&self, t: TargetType, healthy: bool) -> Option<u32> {
        let mut reg = self.registry.write().await;
        let now = Utc::now();
        {
            let target = reg.target_mut(t);
            target.healthy = healthy;
            target.last_check = Some(now);
        }
        if reg.active != t {
            return None;
        }
        if healthy {
            reg.failed_checks = 0;
            reg.last_sync = Some(now);
            reg.sync_count += 1;
        } else {
            reg.failed_checks += 1;
        }
        Some(reg.failed_checks)
    }

    /// Make `to` the active target. Idempotent: switching to the current target is a no-op.
    /// Returns whether a switch happened.
    pub async fn switch_to(&self, to: TargetType, reason: FailoverReason) -> anyhow::Result<bool> {
        let _transition = self.transition.lock().await;

        let (state, from_ep, to_ep) = {
            let mut reg = self.registry.write().await;
            if reg.active == to {
                return Ok(false);
            }
            let from = reg.active;
            reg.previous = Some(from);
            reg.active = to;
            reg.failed_checks = 0;
            reg.failover_count += 1;
            let from_ep = reg.target(from).endpoint();
            let to_ep = reg.target(to).endpoint();
            let state = FailoverState {
                active_target: to_ep.clone(),
                previous_target: Some(from_ep.clone()),
                timestamp: Utc::now(),
                failover_count: reg.failover_count,
            };
            (state, from_ep, to_ep)
        };

        match reason {
            FailoverReason::GpuRecovered => tracing::info!(
                "🔙 [failover-proxy] failback {} -> {}",
                from_ep.addr(),
                to_ep.addr()
            ),
            _ => tracing::warn!(
                "🔀 [failover-proxy] failover {} -> {} ({})",
                from_ep.addr(),
                to_ep.addr(),
                reason.as_str()
            ),
        }

        // Switch stands even if the write fails; the next transition rewrites the file.
        if let Err(e) = self.state_store.save(&state).await {
            tracing::error!("❌ [failover-proxy] persisting state failed: {:?}", e);
        }
        self.bus.publish(FailoverEvent::new(
            from_ep.target_type.as_str(),
            to_ep.target_type.as_str(),
            reason,
        ));
        Ok(true)
    }

    /// Accept loop. Stops accepting when `shutdown` flips to true; open
    /// connections are closed as well.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        tracing::info!("🔌 [failover-proxy] listening on {}", local);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (inbound, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!("⚠️  [failover-proxy] accept failed: {}", e);
                            continue;
                        }
                    };
                    let target = self.active_endpoint().await;
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forward(inbound, &target, conn_shutdown).await {
                            tracing::debug!("[failover-proxy] {} -> {}: {:#}", peer, target.addr(), e);
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("🛑 [failover-proxy] listener on {} stopping", local);
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Pipe bytes both ways until either side closes.
async fn forward(
    mut inbound: TcpStream,
    target: &TargetEndpoint,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut outbound = tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(target.addr()))
        .await
        .context("upstream connect timed out")?
        .with_context(|| format!("connecting {}", target.addr()))?;
    let _ = inbound.set_nodelay(true);
    let _ = outbound.set_nodelay(true);

    tokio::select! {
        res = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
            let (up, down) = res?;
            tracing::debug!("[failover-proxy] {} closed ({} bytes up, {} down)", target.addr(), up, down);
        }
        _ = shutdown.changed() => {}
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AssociationEndpoint {
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct AssociationResponse {
    gpu: AssociationEndpoint,
    cpu: AssociationEndpoint,
}

/// Fetch the GPU/CPU pair registered for `machine_id` from the orchestrator API.
pub async fn resolve_targets(api_base_url: &str, machine_id: &str) -> anyhow::Result<(Target, Target)> {
    let url = format!(
        "{}/standby/associations/{}",
        api_base_url.trim_end_matches('/'),
        machine_id
    );
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {}", url))?;
    if !resp.status().is_success() {
        anyhow::bail!("association lookup for {} failed: HTTP {}", machine_id, resp.status());
    }
    let body: AssociationResponse = resp.json().await.context("decoding association")?;
    Ok((
        Target::new(TargetType::Gpu, &body.gpu.host, body.gpu.port),
        Target::new(TargetType::Cpu, &body.cpu.host, body.cpu.port),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(dir: &std::path::Path) -> Arc<FailoverProxy> {
        FailoverProxy::new(
            Some("m-1".into()),
            Target::new(TargetType::Gpu, "10.0.0.1", 22),
            Target::new(TargetType::Cpu, "10.0.0.2", 22),
            FailoverStateStore::new(dir.join("state.json")),
            FailoverBus::default(),
        )
    }

    #[tokio::test]
    async fn switch_is_idempotent_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let p = proxy(dir.path());
        let mut rx = p.bus().subscribe();

        assert!(!p.switch_to(TargetType::Gpu, FailoverReason::Manual).await.unwrap());
        assert!(p.switch_to(TargetType::Cpu, FailoverReason::GpuFailure).await.unwrap());
        assert!(!p.switch_to(TargetType::Cpu, FailoverReason::GpuFailure).await.unwrap());

        let evt = rx.recv().await.unwrap();
        assert_eq!((evt.from.as_str(), evt.to.as_str()), ("GPU", "CPU"));
        assert!(rx.try_recv().is_err());

        let st = p.status().await;
        assert_eq!(st.mode, TargetType::Cpu);
        assert_eq!(st.failover_count, 1);

        let saved = FailoverStateStore::new(dir.path().join("state.json"))
            .load()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.active_target.host, "10.0.0.2");
        assert_eq!(saved.previous_target.unwrap().target_type, TargetType::Gpu);
    }

    #[tokio::test]
    async fn restart_restores_active_target() {
        let dir = tempfile::tempdir().unwrap();
        let first = proxy(dir.path());
        first
            .switch_to(TargetType::Cpu, FailoverReason::GpuFailure)
            .await
            .unwrap();

        let second = proxy(dir.path());
        assert!(second.restore_state().await.unwrap());
        assert_eq!(second.active_endpoint().await.host, "10.0.0.2");
        assert_eq!(second.status().await.failover_count, 1);
    }

    #[tokio::test]
    async fn probes_track_last_known_good() {
        let dir = tempfile::tempdir().unwrap();
        let p = proxy(dir.path());
        assert_eq!(p.record_probe(TargetType::Gpu, true).await, Some(0));
        assert_eq!(p.record_probe(TargetType::Gpu, false).await, Some(1));
        assert_eq!(p.record_probe(TargetType::Cpu, true).await, None);

        let st = p.status().await;
        assert!(st.last_sync.is_some());
        assert_eq!(st.sync_count, 1);
        assert!(!st.healthy);
        assert!(st.cpu_healthy);
    }
}
