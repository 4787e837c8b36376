// ============================================================================
// CPU STANDBY MANAGER
// ============================================================================
//
// Pairs every interruptible GPU primary with one cheap CPU standby, watches
// both, swaps the active endpoint to the standby when the primary stops
// answering and races a replacement primary in the background.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use spotguard_common::{
    ActiveEndpoint, FailoverEvent, FailoverReason, MachineRole, MachineStatus, ManagedMachine,
};
use spotguard_providers::inventory::{InstanceStatus, LaunchSpec, Offer, OfferFilters};
use spotguard_providers::MarketplaceProvider;

use crate::failover_events::FailoverBus;
use crate::probe::ReachabilityProbe;
use crate::race::{RaceConfig, RaceProvisioner};
use crate::snapshot_engine::SnapshotEngine;

#[derive(Clone, Debug)]
pub struct StandbyConfig {
    pub health_check_interval: Duration,
    pub max_health_failures: u32,
    pub standby_max_price: f64,
    pub standby_launch: LaunchSpec,
    /// Container port of the application served by the standby.
    pub app_port: u16,
    pub ready_poll_interval: Duration,
    pub ready_timeout: Duration,
    /// Cheapest offers tried, in order, before giving up on a standby.
    pub create_attempts: usize,
    pub primary_race: RaceConfig,
    pub auto_reprovision: bool,
    /// Workspace restored onto a replacement primary.
    pub workspace_path: String,
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(10),
            max_health_failures: 3,
            standby_max_price: 0.10,
            standby_launch: LaunchSpec {
                image: "ubuntu:22.04".to_string(),
                disk_gb: 20,
                ports: vec![22, 8080],
                onstart: None,
                label: Some("spotguard-standby".to_string()),
            },
            app_port: 8080,
            ready_poll_interval: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(300),
            create_attempts: 3,
            primary_race: RaceConfig::default(),
            auto_reprovision: true,
            workspace_path: "/workspace".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StandbyStatus {
    pub machines: Vec<ManagedMachine>,
    pub active_machine_id: Option<String>,
    pub total_hourly_cost: f64,
    pub reprovision_requests: u64,
    pub reprovision_in_flight: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssociationEndpoint {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
}

/// GPU primary and its paired standby, as consumed by the failover proxy.
#[derive(Debug, Clone, Serialize)]
pub struct StandbyAssociation {
    pub machine_id: String,
    pub gpu: AssociationEndpoint,
    pub cpu: AssociationEndpoint,
}

#[derive(Default)]
struct MachineTable {
    machines: HashMap<String, ManagedMachine>,
    active_machine_id: Option<String>,
    reprovision_requests: u64,
    reprovision_in_flight: bool,
}

impl MachineTable {
    fn live_standby_for(&self, primary_id: &str) -> Option<String> {
        self.machines
            .values()
            .filter(|m| m.role == MachineRole::CpuStandby && m.status.is_live())
            .find(|m| m.paired_with.as_deref().map_or(true, |p| p == primary_id))
            .map(|m| m.instance_id.clone())
    }

    fn ready_standby_for(&self, primary_id: &str) -> Option<String> {
        let ready = |m: &&ManagedMachine| {
            m.role == MachineRole::CpuStandby && m.status == MachineStatus::Ready
        };
        self.machines
            .values()
            .filter(ready)
            .find(|m| m.paired_with.as_deref() == Some(primary_id))
            .or_else(|| self.machines.values().find(ready))
            .map(|m| m.instance_id.clone())
    }

    fn pair(&mut self, primary_id: &str, standby_id: &str) {
        if let Some(p) = self.machines.get_mut(primary_id) {
            p.paired_with = Some(standby_id.to_string());
        }
        if let Some(s) = self.machines.get_mut(standby_id) {
            s.paired_with = Some(primary_id.to_string());
        }
    }
}

enum MachineProbe {
    /// Control plane unavailable; no conclusion.
    Unknown,
    Gone,
    NotRunning,
    Running {
        ssh_host: Option<String>,
        ssh_port: Option<u16>,
        healthy: bool,
    },
}

enum FollowUp {
    Failover(String),
    /// Dead standby to destroy; `ensure_standbys` rents the replacement.
    ReplaceStandby(String),
}

pub struct StandbyManager {
    provider: Arc<dyn MarketplaceProvider>,
    probe: Arc<dyn ReachabilityProbe>,
    provisioner: Arc<RaceProvisioner>,
    bus: FailoverBus,
    config: StandbyConfig,
    snapshots: Option<Arc<SnapshotEngine>>,
    table: Mutex<MachineTable>,
}

impl StandbyManager {
    pub fn new(
        provider: Arc<dyn MarketplaceProvider>,
        probe: Arc<dyn ReachabilityProbe>,
        provisioner: Arc<RaceProvisioner>,
        bus: FailoverBus,
        config: StandbyConfig,
    ) -> Self {
        Self {
            provider,
            probe,
            provisioner,
            bus,
            config,
            snapshots: None,
            table: Mutex::new(MachineTable::default()),
        }
    }

    /// Restore the failed primary's latest snapshot onto its replacement.
    pub fn with_snapshot_restore(mut self, engine: Arc<SnapshotEngine>) -> Self {
        self.snapshots = Some(engine);
        self
    }

    pub fn config(&self) -> &StandbyConfig {
        &self.config
    }

    // --- Provisioning ---

    /// Rent the cheapest CPU-only offer under the standby price cap.
    /// Readiness is tracked in the background.
    pub async fn provision_standby(self: &Arc<Self>, owner_id: Option<&str>) -> Result<Option<String>> {
        let filters = OfferFilters {
            cpu_only: true,
            max_price: Some(self.config.standby_max_price),
            ..Default::default()
        };
        let mut offers: Vec<Offer> = self
            .provider
            .search_offers(&filters)
            .await?
            .into_iter()
            .filter(|o| filters.matches(o))
            .collect();
        offers.sort_by(|a, b| {
            a.price_per_hour
                .partial_cmp(&b.price_per_hour)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    b.reliability
                        .partial_cmp(&a.reliability)
                        .unwrap_or(Ordering::Equal)
                })
        });
        if offers.is_empty() {
            tracing::warn!(
                "⚠️  [standby] no CPU offer under ${:.2}/h",
                self.config.standby_max_price
            );
            return Ok(None);
        }

        for offer in offers.iter().take(self.config.create_attempts.max(1)) {
            let id = match self
                .provider
                .create_instance(&offer.id, &self.config.standby_launch)
                .await
            {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("⚠️  [standby] create on offer {} failed: {:?}", offer.id, e);
                    continue;
                }
            };

            {
                let mut t = self.table.lock().await;
                let mut m = ManagedMachine::new(&id, MachineRole::CpuStandby, MachineStatus::Starting);
                m.price_per_hour = offer.price_per_hour;
                m.owner_id = owner_id.map(str::to_string);
                t.machines.insert(id.clone(), m);
                if let Some(owner) = owner_id {
                    t.pair(owner, &id);
                }
            }
            tracing::info!(
                "🧊 [standby] provisioned {} (offer {}, ${:.3}/h) for {}",
                id,
                offer.id,
                offer.price_per_hour,
                owner_id.unwrap_or("-")
            );

            let this = self.clone();
            let wait_id = id.clone();
            tokio::spawn(async move {
                this.wait_until_ready(&wait_id).await;
            });
            return Ok(Some(id));
        }
        tracing::warn!("⚠️  [standby] every candidate offer refused the rental");
        Ok(None)
    }

    /// Poll a standby until it serves the application, or give up and destroy it.
    /// A standby that gives up is replaced by the next health pass.
    pub async fn wait_until_ready(&self, instance_id: &str) -> bool {
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            let Some(machine) = self.machine(instance_id).await else {
                return false;
            };
            match machine.status {
                MachineStatus::Ready => return true,
                MachineStatus::Offline => return false,
                _ => {}
            }
            let probe = self.probe_machine(&machine).await;
            {
                let mut t = self.table.lock().await;
                if let Some(m) = t.machines.get_mut(instance_id) {
                    if let MachineProbe::Gone = probe {
                        tracing::warn!("⚠️  [standby] {} vanished while booting", instance_id);
                        m.status = MachineStatus::Offline;
                        return false;
                    }
                    apply_startup_probe(m, &probe);
                    if m.status == MachineStatus::Ready {
                        tracing::info!("✅ [standby] {} is READY", instance_id);
                        return true;
                    }
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }

        tracing::error!(
            "⏱️ [standby] {} not ready after {:?}, destroying",
            instance_id,
            self.config.ready_timeout
        );
        // Offline first: a failed destroy must not leave it counted as provisioning.
        if let Some(m) = self.table.lock().await.machines.get_mut(instance_id) {
            m.status = MachineStatus::Offline;
        }
        if let Err(e) = self.destroy_machine(instance_id).await {
            tracing::warn!("⚠️  [standby] destroy of {} failed: {:?}", instance_id, e);
        }
        false
    }

    /// Start tracking a GPU primary. Interruptible primaries get a standby
    /// unless one is already live or provisioning for them.
    pub async fn register_primary(
        self: &Arc<Self>,
        instance_id: &str,
        interruptible: bool,
        owner_id: Option<&str>,
    ) -> Result<bool> {
        let Some(st) = self.provider.get_instance_status(instance_id).await? else {
            tracing::warn!("⚠️  [standby] unknown primary {}", instance_id);
            return Ok(false);
        };

        let needs_standby = {
            let mut t = self.table.lock().await;
            let status = if st.is_running() {
                MachineStatus::Running
            } else {
                MachineStatus::Starting
            };
            let mut m = ManagedMachine::new(instance_id, MachineRole::GpuPrimary, status);
            fill_from_status(&mut m, &st);
            m.interruptible = interruptible;
            m.owner_id = owner_id.map(str::to_string);
            t.machines.insert(instance_id.to_string(), m);

            let active_live = t
                .active_machine_id
                .as_ref()
                .and_then(|id| t.machines.get(id))
                .map_or(false, |m| m.status.is_live());
            if !active_live {
                t.active_machine_id = Some(instance_id.to_string());
            }

            if !interruptible {
                false
            } else if let Some(standby) = t.live_standby_for(instance_id) {
                t.pair(instance_id, &standby);
                false
            } else {
                true
            }
        };
        tracing::info!(
            "🖥️ [standby] registered primary {} (interruptible={})",
            instance_id,
            interruptible
        );

        if needs_standby {
            self.provision_standby(Some(instance_id)).await?;
        }
        Ok(true)
    }

    // --- Queries ---

    pub async fn machine(&self, instance_id: &str) -> Option<ManagedMachine> {
        self.table.lock().await.machines.get(instance_id).cloned()
    }

    pub async fn get_active_endpoint(&self) -> Option<ActiveEndpoint> {
        let t = self.table.lock().await;
        let id = t.active_machine_id.as_ref()?;
        let m = t.machines.get(id)?;
        Some(ActiveEndpoint {
            instance_id: m.instance_id.clone(),
            host: m.ssh_host.clone()?,
            port: m.ssh_port.unwrap_or(22),
            role: m.role,
        })
    }

    pub async fn get_status(&self) -> StandbyStatus {
        let t = self.table.lock().await;
        let mut machines: Vec<ManagedMachine> = t.machines.values().cloned().collect();
        machines.sort_by_key(|m| m.created_at);
        let total_hourly_cost = machines
            .iter()
            .filter(|m| !m.status.is_terminal())
            .map(|m| m.price_per_hour)
            .sum();
        StandbyStatus {
            machines,
            active_machine_id: t.active_machine_id.clone(),
            total_hourly_cost,
            reprovision_requests: t.reprovision_requests,
            reprovision_in_flight: t.reprovision_in_flight,
        }
    }

    pub async fn associations(&self, machine_id: &str) -> Option<StandbyAssociation> {
        let t = self.table.lock().await;
        let gpu = t.machines.get(machine_id)?;
        let cpu = t.machines.get(gpu.paired_with.as_ref()?)?;
        Some(StandbyAssociation {
            machine_id: machine_id.to_string(),
            gpu: AssociationEndpoint {
                instance_id: gpu.instance_id.clone(),
                host: gpu.ssh_host.clone()?,
                port: gpu.ssh_port.unwrap_or(22),
            },
            cpu: AssociationEndpoint {
                instance_id: cpu.instance_id.clone(),
                host: cpu.ssh_host.clone()?,
                port: cpu.ssh_port.unwrap_or(22),
            },
        })
    }

    /// Destroy a machine at the marketplace and forget it.
    pub async fn destroy_machine(&self, instance_id: &str) -> Result<bool> {
        let destroyed = self.provider.destroy_instance(instance_id).await?;
        let mut t = self.table.lock().await;
        if let Some(m) = t.machines.remove(instance_id) {
            if let Some(peer) = m.paired_with.as_ref().and_then(|p| t.machines.get_mut(p)) {
                // The peer may already be re-paired with a replacement.
                if peer.paired_with.as_deref() == Some(instance_id) {
                    peer.paired_with = None;
                }
            }
        }
        if t.active_machine_id.as_deref() == Some(instance_id) {
            t.active_machine_id = None;
        }
        tracing::info!("🗑️ [standby] destroyed {}", instance_id);
        Ok(destroyed)
    }

    // --- Health ---

    async fn probe_machine(&self, m: &ManagedMachine) -> MachineProbe {
        let st = match self.provider.get_instance_status(&m.instance_id).await {
            Ok(Some(st)) => st,
            Ok(None) => return MachineProbe::Gone,
            Err(e) => {
                tracing::debug!("[standby] status of {} unavailable: {:?}", m.instance_id, e);
                return MachineProbe::Unknown;
            }
        };
        if !st.is_running() {
            return MachineProbe::NotRunning;
        }
        let ssh_host = st.ssh_host.clone().or_else(|| st.public_ip.clone());
        let ssh_port = st.ssh_port;
        let healthy = match m.role {
            MachineRole::CpuStandby => match st.endpoint_for(self.config.app_port) {
                Some((host, port)) => self.probe.http_healthy(&host, port).await,
                None => false,
            },
            MachineRole::GpuPrimary | MachineRole::GpuPending => match ssh_host.as_deref() {
                Some(host) => self.probe.tcp_reachable(host, ssh_port.unwrap_or(22)).await,
                None => false,
            },
        };
        MachineProbe::Running {
            ssh_host,
            ssh_port,
            healthy,
        }
    }

    /// One pass of the health loop over every non-terminal machine.
    pub async fn health_tick(self: &Arc<Self>) {
        let machines: Vec<ManagedMachine> = {
            let t = self.table.lock().await;
            t.machines
                .values()
                .filter(|m| !m.status.is_terminal())
                .cloned()
                .collect()
        };
        let probes = futures_util::future::join_all(
            machines.iter().map(|m| self.probe_machine(m)),
        )
        .await;

        let mut follow_ups = Vec::new();
        {
            let mut t = self.table.lock().await;
            let active = t.active_machine_id.clone();
            for (snapshot, probe) in machines.iter().zip(probes) {
                let Some(m) = t.machines.get_mut(&snapshot.instance_id) else {
                    continue;
                };
                let is_active = active.as_deref() == Some(m.instance_id.as_str());
                if let Some(f) = apply_health_probe(m, probe, is_active, self.config.max_health_failures) {
                    follow_ups.push(f);
                }
            }
        }

        for f in follow_ups {
            match f {
                FollowUp::Failover(primary) => {
                    if let Err(e) = self.failover(&primary).await {
                        tracing::error!("❌ [standby] failover of {} failed: {:?}", primary, e);
                    }
                }
                FollowUp::ReplaceStandby(dead) => {
                    if let Err(e) = self.destroy_machine(&dead).await {
                        tracing::warn!("⚠️  [standby] destroy of {} failed: {:?}", dead, e);
                    }
                }
            }
        }

        self.ensure_standbys().await;
    }

    /// Rent a standby for every live interruptible primary left without a
    /// live or provisioning one.
    async fn ensure_standbys(self: &Arc<Self>) {
        let orphans: Vec<String> = {
            let t = self.table.lock().await;
            let mut ids: Vec<String> = t
                .machines
                .values()
                .filter(|m| {
                    m.role == MachineRole::GpuPrimary && m.interruptible && m.status.is_live()
                })
                .filter(|m| t.live_standby_for(&m.instance_id).is_none())
                .map(|m| m.instance_id.clone())
                .collect();
            ids.sort();
            ids
        };
        for owner in orphans {
            tracing::info!("🧊 [standby] {} has no standby, provisioning a replacement", owner);
            if let Err(e) = self.provision_standby(Some(&owner)).await {
                tracing::error!("❌ [standby] replacement standby for {} failed: {:?}", owner, e);
            }
        }
    }

    /// Swap the active endpoint from `failed_primary` to a READY standby and
    /// request a replacement primary. Returns false when no standby is READY.
    pub async fn failover(self: &Arc<Self>, failed_primary: &str) -> Result<bool> {
        let (standby, spawn_race) = {
            let mut t = self.table.lock().await;
            if t.active_machine_id.as_deref() != Some(failed_primary) {
                return Ok(false);
            }
            if let Some(p) = t.machines.get_mut(failed_primary) {
                p.status = MachineStatus::Failing;
            }
            let Some(standby) = t.ready_standby_for(failed_primary) else {
                tracing::error!(
                    "🚨 [standby] primary {} failing and no READY standby, keeping endpoint",
                    failed_primary
                );
                return Ok(false);
            };
            t.active_machine_id = Some(standby.clone());
            t.reprovision_requests += 1;
            let spawn_race = self.config.auto_reprovision && !t.reprovision_in_flight;
            if spawn_race {
                t.reprovision_in_flight = true;
            }
            (standby, spawn_race)
        };

        tracing::warn!("🔀 [standby] failover {} -> {}", failed_primary, standby);
        self.bus.publish(FailoverEvent::new(
            failed_primary,
            &standby,
            FailoverReason::GpuFailure,
        ));

        if spawn_race {
            let this = self.clone();
            let failed = failed_primary.to_string();
            tokio::spawn(async move {
                this.reprovision(failed, standby).await;
            });
        }
        Ok(true)
    }

    async fn reprovision(self: Arc<Self>, failed_primary: String, standby: String) {
        tracing::info!("🏁 [standby] racing a replacement for {}", failed_primary);
        let res = self.provisioner.provision(&self.config.primary_race).await;
        let (Some(new_id), Some(host)) = (res.instance_id.clone(), res.ssh_host.clone()) else {
            tracing::error!(
                "❌ [standby] replacement race for {} failed: {}",
                failed_primary,
                res.error.as_deref().unwrap_or("unknown")
            );
            self.table.lock().await.reprovision_in_flight = false;
            return;
        };
        let port = res.ssh_port.unwrap_or(22);

        {
            let mut t = self.table.lock().await;
            let mut m = ManagedMachine::new(&new_id, MachineRole::GpuPending, MachineStatus::Syncing);
            m.ssh_host = Some(host.clone());
            m.ssh_port = Some(port);
            m.gpu_name = res.gpu_name.clone();
            m.price_per_hour = res.price_per_hour.unwrap_or(0.0);
            m.interruptible = true;
            m.owner_id = t.machines.get(&failed_primary).and_then(|p| p.owner_id.clone());
            t.machines.insert(new_id.clone(), m);
        }

        if let Some(engine) = &self.snapshots {
            match engine.latest_snapshot(&failed_primary).await {
                Ok(Some(meta)) => {
                    match engine
                        .restore_snapshot(&meta.snapshot_id, &host, port, &self.config.workspace_path)
                        .await
                    {
                        Ok(info) => tracing::info!(
                            "📦 [standby] restored {} onto {} ({} bytes)",
                            info.snapshot_id,
                            new_id,
                            info.bytes_restored
                        ),
                        Err(e) => tracing::error!(
                            "❌ [standby] restore of {} onto {} failed: {:?}",
                            meta.snapshot_id,
                            new_id,
                            e
                        ),
                    }
                }
                Ok(None) => tracing::info!("[standby] no snapshot of {} to restore", failed_primary),
                Err(e) => tracing::warn!("⚠️  [standby] listing snapshots failed: {:?}", e),
            }
        }

        {
            let mut t = self.table.lock().await;
            if let Some(m) = t.machines.get_mut(&new_id) {
                m.role = MachineRole::GpuPrimary;
                m.status = MachineStatus::Ready;
                m.last_health_check = Some(Utc::now());
            }
            t.pair(&new_id, &standby);
            t.active_machine_id = Some(new_id.clone());
            t.reprovision_in_flight = false;
        }
        tracing::info!("🔙 [standby] failback {} -> {}", standby, new_id);
        self.bus.publish(FailoverEvent::new(
            &standby,
            &new_id,
            FailoverReason::GpuRecovered,
        ));

        if let Err(e) = self.destroy_machine(&failed_primary).await {
            tracing::warn!(
                "⚠️  [standby] destroy of old primary {} failed: {:?}",
                failed_primary,
                e
            );
        }
    }

    /// job-standby-health
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        tracing::info!(
            "🏥 job-standby-health started (interval={:?}, max_failures={})",
            self.config.health_check_interval,
            self.config.max_health_failures
        );
        loop {
            interval.tick().await;
            self.health_tick().await;
        }
    }
}

fn fill_from_status(m: &mut ManagedMachine, st: &InstanceStatus) {
    m.ssh_host = st.ssh_host.clone().or_else(|| st.public_ip.clone());
    m.ssh_port = st.ssh_port;
    if st.gpu_name.is_some() {
        m.gpu_name = st.gpu_name.clone();
    }
    if let Some(p) = st.price_per_hour {
        m.price_per_hour = p;
    }
}

/// STARTING -> RUNNING -> READY for a booting standby.
fn apply_startup_probe(m: &mut ManagedMachine, probe: &MachineProbe) {
    m.last_health_check = Some(Utc::now());
    if let MachineProbe::Running {
        ssh_host,
        ssh_port,
        healthy,
    } = probe
    {
        if ssh_host.is_some() {
            m.ssh_host = ssh_host.clone();
            m.ssh_port = *ssh_port;
        }
        if m.status == MachineStatus::Starting {
            m.status = MachineStatus::Running;
        }
        if *healthy {
            m.status = MachineStatus::Ready;
            m.health_failures = 0;
        }
    }
}

fn apply_health_probe(
    m: &mut ManagedMachine,
    probe: MachineProbe,
    is_active: bool,
    max_failures: u32,
) -> Option<FollowUp> {
    let provisioning = matches!(
        (m.role, m.status),
        (MachineRole::CpuStandby, MachineStatus::Starting | MachineStatus::Running)
            | (MachineRole::GpuPending, _)
            | (_, MachineStatus::Syncing)
    );

    match probe {
        MachineProbe::Unknown => None,
        MachineProbe::Gone => {
            tracing::warn!("⚠️  [standby] {} vanished from the marketplace", m.instance_id);
            m.status = MachineStatus::Offline;
            match m.role {
                MachineRole::GpuPrimary if is_active => Some(FollowUp::Failover(m.instance_id.clone())),
                MachineRole::CpuStandby => Some(FollowUp::ReplaceStandby(m.instance_id.clone())),
                _ => None,
            }
        }
        MachineProbe::Running { healthy: true, .. } if m.status == MachineStatus::Syncing => {
            m.last_health_check = Some(Utc::now());
            None
        }
        probe @ MachineProbe::Running { healthy: true, .. } => {
            let was_failing = m.status == MachineStatus::Failing;
            apply_startup_probe(m, &probe);
            m.health_failures = 0;
            if m.role == MachineRole::GpuPrimary {
                m.status = if was_failing && !is_active {
                    MachineStatus::Running
                } else {
                    MachineStatus::Ready
                };
            }
            None
        }
        probe => {
            m.last_health_check = Some(Utc::now());
            if provisioning {
                apply_startup_probe(m, &probe);
                return None;
            }
            if m.status == MachineStatus::Failing && !is_active {
                return None;
            }
            m.health_failures += 1;
            tracing::warn!(
                "⚠️  [standby] {} health check failed ({}/{})",
                m.instance_id,
                m.health_failures,
                max_failures
            );
            if m.health_failures < max_failures {
                return None;
            }
            match m.role {
                MachineRole::GpuPrimary => {
                    m.status = MachineStatus::Failing;
                    is_active.then(|| FollowUp::Failover(m.instance_id.clone()))
                }
                MachineRole::CpuStandby => {
                    m.status = MachineStatus::Offline;
                    Some(FollowUp::ReplaceStandby(m.instance_id.clone()))
                }
                MachineRole::GpuPending => None,
            }
        }
    }
}
