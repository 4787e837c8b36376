use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use spotguard_common::{FailoverReason, TargetType};

use crate::failover_proxy::FailoverProxy;
use crate::probe::ReachabilityProbe;

/// What a single monitor cycle decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Steady,
    FailedOver,
    FailedBack,
    /// Threshold reached but the other target is down too.
    NoHealthyTarget,
}

/// job-failover-monitor: probes both targets every `interval`, flips to the
/// standby after `threshold` consecutive misses and returns to the GPU as
/// soon as it answers again.
pub struct HealthMonitor {
    proxy: Arc<FailoverProxy>,
    probe: Arc<dyn ReachabilityProbe>,
    interval: Duration,
    threshold: u32,
}

impl HealthMonitor {
    pub fn new(
        proxy: Arc<FailoverProxy>,
        probe: Arc<dyn ReachabilityProbe>,
        interval: Duration,
        threshold: u32,
    ) -> Self {
        Self {
            proxy,
            probe,
            interval,
            threshold: threshold.max(1),
        }
    }

    pub async fn tick(&self) -> anyhow::Result<TickOutcome> {
        let reg = self.proxy.registry().await;
        let active = reg.active;
        let standby = active.other();
        let active_t = reg.target(active).clone();
        let standby_t = reg.target(standby).clone();

        // Probes run without any lock held.
        let active_ok = self.probe.tcp_reachable(&active_t.host, active_t.port).await;
        let standby_ok = self
            .probe
            .tcp_reachable(&standby_t.host, standby_t.port)
            .await;

        let failed = self
            .proxy
            .record_probe(active, active_ok)
            .await
            .unwrap_or(0);
        self.proxy.record_probe(standby, standby_ok).await;

        if !active_ok {
            tracing::warn!(
                "⚠️  [failover-monitor] {} {} unreachable ({}/{})",
                active.as_str(),
                active_t.endpoint().addr(),
                failed,
                self.threshold
            );
        }

        // GPU back: return to it regardless of CPU health.
        if active == TargetType::Cpu && standby_ok {
            self.proxy
                .switch_to(TargetType::Gpu, FailoverReason::GpuRecovered)
                .await?;
            return Ok(TickOutcome::FailedBack);
        }

        if !active_ok && failed >= self.threshold {
            if active == TargetType::Gpu {
                self.proxy
                    .switch_to(TargetType::Cpu, FailoverReason::GpuFailure)
                    .await?;
                return Ok(TickOutcome::FailedOver);
            }
            tracing::error!(
                "🚨 [failover-monitor] both targets unreachable, staying on {}",
                active.as_str()
            );
            return Ok(TickOutcome::NoHealthyTarget);
        }

        Ok(TickOutcome::Steady)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            "🏥 job-failover-monitor started (interval={:?}, threshold={})",
            self.interval,
            self.threshold
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!("❌ [failover-monitor] tick failed: {:?}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("🛑 job-failover-monitor stopping");
                        return;
                    }
                }
            }
        }
    }
}
