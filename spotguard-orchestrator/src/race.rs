// ============================================================================
// RACE PROVISIONER
// ============================================================================
//
// Rent several offers at once and keep the first machine that becomes
// reachable. Every other machine of the race is destroyed exactly once,
// whatever way the race ends (win, batch timeout, overall timeout, error,
// caller cancellation).

use futures_util::stream::{FuturesUnordered, StreamExt};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use spotguard_common::{Candidate, CandidateStatus, ProvisionResult};
use spotguard_providers::inventory::{LaunchSpec, Offer, OfferFilters};
use spotguard_providers::MarketplaceProvider;

use crate::probe::ReachabilityProbe;

#[derive(Clone, Debug)]
pub struct RaceConfig {
    pub filters: OfferFilters,
    pub launch: LaunchSpec,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub check_interval: Duration,
    pub max_batches: u32,
    /// Delay between successive create calls inside one batch.
    pub create_stagger: Duration,
    /// Hard cap on the whole race. Defaults to `max_batches * batch_timeout + 30s`.
    pub overall_timeout: Option<Duration>,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            filters: OfferFilters::default(),
            launch: LaunchSpec::default(),
            batch_size: 5,
            batch_timeout: Duration::from_secs(90),
            check_interval: Duration::from_secs(2),
            max_batches: 3,
            create_stagger: Duration::from_millis(200),
            overall_timeout: None,
        }
    }
}

impl RaceConfig {
    pub fn effective_overall_timeout(&self) -> Duration {
        self.overall_timeout.unwrap_or_else(|| {
            self.batch_timeout * self.max_batches.max(1) + Duration::from_secs(30)
        })
    }
}

/// Rank offers: most reliable first, then best downlink, then cheapest.
pub fn rank_offers(mut offers: Vec<Offer>) -> Vec<Offer> {
    offers.sort_by(|a, b| {
        b.reliability
            .partial_cmp(&a.reliability)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.internet_down_mbps
                    .partial_cmp(&a.internet_down_mbps)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| {
                a.price_per_hour
                    .partial_cmp(&b.price_per_hour)
                    .unwrap_or(Ordering::Equal)
            })
    });
    offers
}

struct Slot {
    round: u32,
    candidate: Candidate,
    /// Instance handed to the cleanup routine; never destroyed twice.
    released: bool,
}

#[derive(Default)]
struct RaceTable {
    slots: Vec<Slot>,
    closed_rounds: HashSet<u32>,
    all_closed: bool,
    rounds_attempted: u32,
    machines_tried: u32,
    machines_created: u32,
}

impl RaceTable {
    fn is_closed(&self, round: u32) -> bool {
        self.all_closed || self.closed_rounds.contains(&round)
    }
}

type SharedTable = Arc<Mutex<RaceTable>>;

struct Winner {
    slot: usize,
    instance_id: String,
    offer_id: String,
    host: String,
    port: u16,
    gpu_name: String,
    price_per_hour: f64,
    time_to_ready: f64,
}

/// Close `round` (or the whole race) and destroy every instance it still owns,
/// except `keep`. Instances created after the close destroy themselves.
async fn release_instances(
    table: &SharedTable,
    provider: &Arc<dyn MarketplaceProvider>,
    round: Option<u32>,
    keep: Option<&str>,
) -> usize {
    let doomed: Vec<String> = {
        let mut t = table.lock().await;
        match round {
            Some(r) => {
                t.closed_rounds.insert(r);
            }
            None => t.all_closed = true,
        }
        let mut out = Vec::new();
        for slot in t.slots.iter_mut() {
            if slot.released || round.map_or(false, |r| slot.round != r) {
                continue;
            }
            let Some(id) = slot.candidate.instance_id.clone() else {
                continue;
            };
            if keep == Some(id.as_str()) {
                continue;
            }
            slot.released = true;
            if slot.candidate.status != CandidateStatus::Failed {
                slot.candidate.status = CandidateStatus::Cancelled;
            }
            out.push(id);
        }
        out
    };

    let n = doomed.len();
    let destroys = doomed.into_iter().map(|id| {
        let provider = provider.clone();
        async move {
            match provider.destroy_instance(&id).await {
                Ok(_) => tracing::info!("🗑️ [race] destroyed non-winner {}", id),
                Err(e) => tracing::warn!("⚠️  [race] destroy of {} failed: {:?}", id, e),
            }
        }
    });
    futures_util::future::join_all(destroys).await;
    n
}

/// Destroys everything the race still owns if `provision` is dropped mid-flight.
struct CleanupGuard {
    table: SharedTable,
    provider: Arc<dyn MarketplaceProvider>,
    armed: bool,
}

impl CleanupGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!("❌ [race] cancelled outside a runtime, instances may leak");
            return;
        };
        let table = self.table.clone();
        let provider = self.provider.clone();
        handle.spawn(async move {
            let n = release_instances(&table, &provider, None, None).await;
            tracing::warn!("🛑 [race] cancelled by caller, released {} instance(s)", n);
        });
    }
}

pub struct RaceProvisioner {
    provider: Arc<dyn MarketplaceProvider>,
    probe: Arc<dyn ReachabilityProbe>,
}

impl RaceProvisioner {
    pub fn new(provider: Arc<dyn MarketplaceProvider>, probe: Arc<dyn ReachabilityProbe>) -> Self {
        Self { provider, probe }
    }

    /// Run the race. Never returns an error: failures are reported in the result.
    pub async fn provision(&self, config: &RaceConfig) -> ProvisionResult {
        let started = Instant::now();
        let table: SharedTable = Arc::new(Mutex::new(RaceTable::default()));
        let mut guard = CleanupGuard {
            table: table.clone(),
            provider: self.provider.clone(),
            armed: true,
        };

        tracing::info!(
            "🏁 [race] starting (provider={}, batch_size={}, max_batches={}, batch_timeout={:?})",
            self.provider.provider_code(),
            config.batch_size,
            config.max_batches,
            config.batch_timeout
        );

        let outcome = tokio::time::timeout(
            config.effective_overall_timeout(),
            self.run_rounds(config, &table),
        )
        .await;

        let (winner, error) = match outcome {
            Ok(Ok(Some(w))) => (Some(w), None),
            Ok(Ok(None)) => (
                None,
                Some("no machine became ready before the batches ran out".to_string()),
            ),
            Ok(Err(e)) => (None, Some(format!("{:#}", e))),
            Err(_) => (None, Some("overall race timeout exceeded".to_string())),
        };

        let keep = winner.as_ref().map(|w| w.instance_id.clone());
        release_instances(&table, &self.provider, None, keep.as_deref()).await;
        guard.disarm();

        let t = table.lock().await;
        let mut result = ProvisionResult {
            rounds_attempted: t.rounds_attempted,
            machines_tried: t.machines_tried,
            machines_created: t.machines_created,
            total_time: started.elapsed().as_secs_f64(),
            error,
            ..Default::default()
        };
        match winner {
            Some(w) => {
                debug_assert_eq!(t.slots[w.slot].candidate.status, CandidateStatus::Ready);
                tracing::info!(
                    "🏆 [race] winner {} (offer {}, {}) ready in {:.1}s",
                    w.instance_id,
                    w.offer_id,
                    w.gpu_name,
                    w.time_to_ready
                );
                result.success = true;
                result.instance_id = Some(w.instance_id);
                result.offer_id = Some(w.offer_id);
                result.ssh_host = Some(w.host);
                result.ssh_port = Some(w.port);
                result.gpu_name = Some(w.gpu_name);
                result.price_per_hour = Some(w.price_per_hour);
                result.time_to_ready = Some(w.time_to_ready);
            }
            None => {
                tracing::warn!(
                    "❌ [race] failed after {} round(s): {}",
                    result.rounds_attempted,
                    result.error.as_deref().unwrap_or("unknown")
                );
            }
        }
        result
    }

    async fn run_rounds(
        &self,
        config: &RaceConfig,
        table: &SharedTable,
    ) -> anyhow::Result<Option<Winner>> {
        let offers = self.provider.search_offers(&config.filters).await?;
        let offers: Vec<Offer> = offers
            .into_iter()
            .filter(|o| config.filters.matches(o))
            .collect();
        let offers = rank_offers(offers);
        if offers.is_empty() {
            anyhow::bail!("no offers match the requested filters");
        }
        tracing::info!("🔎 [race] {} matching offer(s)", offers.len());

        let batch_size = config.batch_size.max(1);
        for (round, batch) in offers
            .chunks(batch_size)
            .take(config.max_batches as usize)
            .enumerate()
        {
            let round = round as u32;
            {
                let mut t = table.lock().await;
                t.rounds_attempted += 1;
            }
            tracing::info!(
                "🚀 [race] round {} launching {} candidate(s)",
                round + 1,
                batch.len()
            );
            if let Some(w) = self.run_batch(config, table, round, batch).await {
                return Ok(Some(w));
            }
            let n = release_instances(table, &self.provider, Some(round), None).await;
            tracing::info!(
                "⏱️ [race] round {} ended without a winner, released {} instance(s)",
                round + 1,
                n
            );
        }
        Ok(None)
    }

    async fn run_batch(
        &self,
        config: &RaceConfig,
        table: &SharedTable,
        round: u32,
        batch: &[Offer],
    ) -> Option<Winner> {
        let deadline = Instant::now() + config.batch_timeout;
        let mut racers = FuturesUnordered::new();
        for (i, offer) in batch.iter().enumerate() {
            // Creation runs detached so an in-flight create is never lost on a win.
            let create = tokio::spawn(create_candidate(
                self.provider.clone(),
                table.clone(),
                round,
                offer.clone(),
                config.launch.clone(),
                config.create_stagger * i as u32,
            ));
            racers.push(self.race_candidate(create, table.clone(), config.check_interval));
        }

        loop {
            match tokio::time::timeout_at(deadline, racers.next()).await {
                Ok(Some(Some(w))) => {
                    let mut t = table.lock().await;
                    let slot = &mut t.slots[w.slot].candidate;
                    slot.status = CandidateStatus::Ready;
                    slot.connected = true;
                    slot.ready_time = Some(chrono::Utc::now());
                    return Some(w);
                }
                Ok(Some(None)) => continue,
                // Every candidate of the batch failed.
                Ok(None) => return None,
                Err(_) => return None,
            }
        }
    }

    async fn race_candidate(
        &self,
        create: tokio::task::JoinHandle<Option<(usize, String, Instant)>>,
        table: SharedTable,
        check_interval: Duration,
    ) -> Option<Winner> {
        let (slot, instance_id, created_at) = create.await.ok().flatten()?;
        loop {
            match self.provider.get_instance_status(&instance_id).await {
                Ok(Some(st)) if st.is_running() => {
                    let host = st.ssh_host.clone().or_else(|| st.public_ip.clone());
                    let port = st.ssh_port.unwrap_or(22);
                    if let Some(host) = host {
                        {
                            let mut t = table.lock().await;
                            let c = &mut t.slots[slot].candidate;
                            if c.status == CandidateStatus::Connecting {
                                c.status = CandidateStatus::Connected;
                            }
                            c.ssh_host = Some(host.clone());
                            c.ssh_port = Some(port);
                        }
                        if self.probe.tcp_reachable(&host, port).await {
                            let t = table.lock().await;
                            if t.slots[slot].released {
                                return None;
                            }
                            let c = &t.slots[slot].candidate;
                            return Some(Winner {
                                slot,
                                instance_id,
                                offer_id: c.offer_id.clone(),
                                host,
                                port,
                                gpu_name: st.gpu_name.clone().unwrap_or_else(|| c.gpu_name.clone()),
                                price_per_hour: c.price_per_hour,
                                time_to_ready: created_at.elapsed().as_secs_f64(),
                            });
                        }
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::warn!("⚠️  [race] instance {} disappeared", instance_id);
                    let mut t = table.lock().await;
                    t.slots[slot].candidate.status = CandidateStatus::Failed;
                    return None;
                }
                Err(e) => {
                    tracing::debug!("[race] status of {} unavailable: {:?}", instance_id, e);
                }
            }
            tokio::time::sleep(check_interval).await;
        }
    }
}

/// Create one candidate after its stagger delay. Returns `(slot, instance_id, created_at)`.
async fn create_candidate(
    provider: Arc<dyn MarketplaceProvider>,
    table: SharedTable,
    round: u32,
    offer: Offer,
    launch: LaunchSpec,
    stagger: Duration,
) -> Option<(usize, String, Instant)> {
    tokio::time::sleep(stagger).await;
    let slot = {
        let mut t = table.lock().await;
        if t.is_closed(round) {
            return None;
        }
        t.machines_tried += 1;
        let mut c = Candidate::new(&offer.id, &offer.gpu_name, offer.price_per_hour);
        c.status = CandidateStatus::Creating;
        t.slots.push(Slot {
            round,
            candidate: c,
            released: false,
        });
        t.slots.len() - 1
    };

    let created_at = Instant::now();
    let res = provider.create_instance(&offer.id, &launch).await;

    let mut t = table.lock().await;
    match res {
        Ok(Some(id)) => {
            t.machines_created += 1;
            if t.is_closed(round) {
                t.slots[slot].candidate.instance_id = Some(id.clone());
                t.slots[slot].candidate.status = CandidateStatus::Cancelled;
                t.slots[slot].released = true;
                drop(t);
                tracing::info!("🗑️ [race] {} created after its round closed, destroying", id);
                if let Err(e) = provider.destroy_instance(&id).await {
                    tracing::warn!("⚠️  [race] destroy of {} failed: {:?}", id, e);
                }
                return None;
            }
            let c = &mut t.slots[slot].candidate;
            c.instance_id = Some(id.clone());
            c.status = CandidateStatus::Connecting;
            tracing::info!("🖥️ [race] offer {} -> instance {}", offer.id, id);
            Some((slot, id, created_at))
        }
        Ok(None) => {
            t.slots[slot].candidate.status = CandidateStatus::Failed;
            tracing::info!("[race] offer {} no longer available", offer.id);
            None
        }
        Err(e) => {
            t.slots[slot].candidate.status = CandidateStatus::Failed;
            tracing::warn!("⚠️  [race] create on offer {} failed: {:?}", offer.id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(id: &str, rel: f64, down: f64, price: f64) -> Offer {
        Offer {
            id: id.into(),
            gpu_name: "RTX 4090".into(),
            price_per_hour: price,
            reliability: rel,
            internet_down_mbps: down,
            region: "EU".into(),
            disk_gb: 100.0,
            num_gpus: 1,
        }
    }

    #[test]
    fn offers_rank_by_reliability_then_bandwidth() {
        let ranked = rank_offers(vec![
            offer("a", 0.90, 900.0, 0.3),
            offer("b", 0.99, 100.0, 0.3),
            offer("c", 0.99, 500.0, 0.3),
        ]);
        let ids: Vec<_> = ranked.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn overall_timeout_defaults_from_batches() {
        let cfg = RaceConfig {
            batch_timeout: Duration::from_secs(60),
            max_batches: 2,
            ..Default::default()
        };
        assert_eq!(cfg.effective_overall_timeout(), Duration::from_secs(150));
    }
}
