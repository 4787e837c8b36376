use crate::{inventory, MarketplaceProvider};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// How an instance created from a given offer behaves.
#[derive(Clone, Debug)]
pub struct MockBehavior {
    /// Time after creation at which the control plane reports "running". `None` = never.
    pub ready_after: Option<Duration>,
    /// `create_instance` returns `Ok(None)` (offer lost to another renter).
    pub create_unavailable: bool,
    /// `create_instance` returns an error.
    pub create_error: bool,
    pub ssh_host: String,
    pub ssh_port: u16,
    /// Container port -> host port mapping exposed once running.
    pub ports: HashMap<u16, u16>,
}

impl MockBehavior {
    pub fn ready_after(secs: u64, host: &str) -> Self {
        Self {
            ready_after: Some(Duration::from_secs(secs)),
            create_unavailable: false,
            create_error: false,
            ssh_host: host.to_string(),
            ssh_port: 22,
            ports: HashMap::new(),
        }
    }

    pub fn never_ready(host: &str) -> Self {
        Self {
            ready_after: None,
            ..Self::ready_after(0, host)
        }
    }

    pub fn unavailable() -> Self {
        Self {
            create_unavailable: true,
            ..Self::never_ready("0.0.0.0")
        }
    }

    pub fn with_port(mut self, container: u16, host_port: u16) -> Self {
        self.ports.insert(container, host_port);
        self
    }
}

struct MockInstance {
    offer_id: String,
    created_at: Instant,
    behavior: MockBehavior,
    destroyed: bool,
    forced_status: Option<String>,
}

#[derive(Default)]
struct MockState {
    offers: Vec<(inventory::Offer, MockBehavior)>,
    instances: HashMap<String, MockInstance>,
    created: Vec<String>,
    destroy_calls: Vec<String>,
    create_specs: Vec<(String, inventory::LaunchSpec)>,
    next_id: u64,
}

/// In-memory marketplace used by tests and local runs.
#[derive(Default)]
pub struct MockMarketplace {
    state: Mutex<MockState>,
}

impl MockMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_offer(&self, offer: inventory::Offer, behavior: MockBehavior) {
        if let Ok(mut st) = self.state.lock() {
            st.offers.push((offer, behavior));
        }
    }

    /// Ids of every instance ever created, in creation order.
    pub fn created_ids(&self) -> Vec<String> {
        self.state.lock().map(|s| s.created.clone()).unwrap_or_default()
    }

    /// Every `destroy_instance` call, in call order (duplicates preserved).
    pub fn destroy_calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.destroy_calls.clone())
            .unwrap_or_default()
    }

    pub fn live_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| {
                s.created
                    .iter()
                    .filter(|id| s.instances.get(*id).map_or(false, |i| !i.destroyed))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn offer_of(&self, instance_id: &str) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.instances.get(instance_id).map(|i| i.offer_id.clone()))
    }

    pub fn create_count(&self) -> usize {
        self.state.lock().map(|s| s.created.len()).unwrap_or(0)
    }

    pub fn launch_specs(&self) -> Vec<(String, inventory::LaunchSpec)> {
        self.state
            .lock()
            .map(|s| s.create_specs.clone())
            .unwrap_or_default()
    }

    /// Override the reported state of an instance (e.g. "exited" to simulate a preemption).
    pub fn force_status(&self, instance_id: &str, status: &str) {
        if let Ok(mut st) = self.state.lock() {
            if let Some(inst) = st.instances.get_mut(instance_id) {
                inst.forced_status = Some(status.to_string());
            }
        }
    }
}

#[async_trait]
impl MarketplaceProvider for MockMarketplace {
    async fn search_offers(
        &self,
        filters: &inventory::OfferFilters,
    ) -> Result<Vec<inventory::Offer>> {
        let st = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("mock marketplace poisoned"))?;
        let mut out: Vec<inventory::Offer> = st
            .offers
            .iter()
            .map(|(o, _)| o.clone())
            .filter(|o| filters.matches(o))
            .collect();
        if let Some(limit) = filters.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn create_instance(
        &self,
        offer_id: &str,
        spec: &inventory::LaunchSpec,
    ) -> Result<Option<String>> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("mock marketplace poisoned"))?;
        let Some(behavior) = st
            .offers
            .iter()
            .find(|(o, _)| o.id == offer_id)
            .map(|(_, b)| b.clone())
        else {
            return Ok(None);
        };
        if behavior.create_error {
            anyhow::bail!("mock create_instance failed for offer {}", offer_id);
        }
        if behavior.create_unavailable {
            return Ok(None);
        }
        st.next_id += 1;
        let id = format!("mock-{}", st.next_id);
        st.instances.insert(
            id.clone(),
            MockInstance {
                offer_id: offer_id.to_string(),
                created_at: Instant::now(),
                behavior,
                destroyed: false,
                forced_status: None,
            },
        );
        st.created.push(id.clone());
        st.create_specs.push((offer_id.to_string(), spec.clone()));
        Ok(Some(id))
    }

    async fn get_instance_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<inventory::InstanceStatus>> {
        let st = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("mock marketplace poisoned"))?;
        let Some(inst) = st.instances.get(instance_id) else {
            return Ok(None);
        };
        if inst.destroyed {
            return Ok(None);
        }
        let running = inst
            .behavior
            .ready_after
            .map_or(false, |d| inst.created_at.elapsed() >= d);
        let status = match &inst.forced_status {
            Some(s) => s.clone(),
            None if running => "running".to_string(),
            None => "loading".to_string(),
        };
        let gpu_name = st
            .offers
            .iter()
            .find(|(o, _)| o.id == inst.offer_id)
            .map(|(o, _)| o.gpu_name.clone());
        Ok(Some(inventory::InstanceStatus {
            instance_id: instance_id.to_string(),
            status,
            ssh_host: Some(inst.behavior.ssh_host.clone()),
            ssh_port: Some(inst.behavior.ssh_port),
            public_ip: Some(inst.behavior.ssh_host.clone()),
            ports: inst.behavior.ports.clone(),
            gpu_name,
            price_per_hour: None,
        }))
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<bool> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("mock marketplace poisoned"))?;
        st.destroy_calls.push(instance_id.to_string());
        match st.instances.get_mut(instance_id) {
            Some(inst) => {
                inst.destroyed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn provider_code(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(id: &str) -> inventory::Offer {
        inventory::Offer {
            id: id.into(),
            gpu_name: "RTX 4090".into(),
            price_per_hour: 0.4,
            reliability: 0.99,
            internet_down_mbps: 800.0,
            region: "EU".into(),
            disk_gb: 100.0,
            num_gpus: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn instance_becomes_running_after_delay() {
        let m = MockMarketplace::new();
        m.add_offer(offer("o1"), MockBehavior::ready_after(10, "10.0.0.1"));
        let id = m
            .create_instance("o1", &inventory::LaunchSpec::default())
            .await
            .unwrap()
            .unwrap();
        let st = m.get_instance_status(&id).await.unwrap().unwrap();
        assert_eq!(st.status, "loading");

        tokio::time::sleep(Duration::from_secs(10)).await;
        let st = m.get_instance_status(&id).await.unwrap().unwrap();
        assert!(st.is_running());

        assert!(m.destroy_instance(&id).await.unwrap());
        assert!(m.get_instance_status(&id).await.unwrap().is_none());
        assert_eq!(m.destroy_calls(), vec![id]);
    }

    #[tokio::test]
    async fn unavailable_offer_yields_none() {
        let m = MockMarketplace::new();
        m.add_offer(offer("o1"), MockBehavior::unavailable());
        let id = m
            .create_instance("o1", &inventory::LaunchSpec::default())
            .await
            .unwrap();
        assert!(id.is_none());
        assert_eq!(m.create_count(), 0);
    }
}
