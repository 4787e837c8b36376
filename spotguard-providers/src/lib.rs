use anyhow::Result;
use async_trait::async_trait;

pub mod retry;

/// Capability interface over a spot GPU marketplace.
///
/// The orchestrator never talks to a marketplace SDK directly: the race
/// provisioner, the standby manager and the snapshot pipeline only see this
/// trait, so a new marketplace is one more feature-gated module.
#[async_trait]
pub trait MarketplaceProvider: Send + Sync {
    /// Offers currently rentable that match `filters`.
    /// Implementations may ignore filters they cannot express; callers re-filter.
    async fn search_offers(&self, filters: &inventory::OfferFilters)
        -> Result<Vec<inventory::Offer>>;

    /// Rent `offer_id`. `Ok(None)` means the offer is no longer available
    /// (taken by another renter, quota, ...), which callers treat as non-fatal.
    async fn create_instance(
        &self,
        offer_id: &str,
        spec: &inventory::LaunchSpec,
    ) -> Result<Option<String>>;

    /// Control-plane view of an instance. `Ok(None)` when the instance is unknown.
    async fn get_instance_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<inventory::InstanceStatus>>;

    /// Destroy an instance. Destroying an already-gone instance is not an error.
    async fn destroy_instance(&self, instance_id: &str) -> Result<bool>;

    // Optional: human readable provider code for logs.
    fn provider_code(&self) -> &'static str {
        "unknown"
    }
}

pub mod inventory {
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    pub struct Offer {
        pub id: String,
        pub gpu_name: String,
        pub price_per_hour: f64,
        pub reliability: f64,
        pub internet_down_mbps: f64,
        pub region: String,
        #[serde(default)]
        pub disk_gb: f64,
        #[serde(default)]
        pub num_gpus: u32,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct OfferFilters {
        /// Substring match, case-insensitive. `None` means CPU-only / any.
        pub gpu_name: Option<String>,
        pub max_price: Option<f64>,
        pub min_disk_gb: Option<f64>,
        pub min_reliability: Option<f64>,
        pub region: Option<String>,
        pub min_internet_down_mbps: Option<f64>,
        pub verified_only: bool,
        pub cpu_only: bool,
        pub limit: Option<usize>,
    }

    impl OfferFilters {
        /// Local re-check of an offer against the filters.
        pub fn matches(&self, offer: &Offer) -> bool {
            if let Some(gpu) = self.gpu_name.as_deref().filter(|s| !s.trim().is_empty()) {
                if !offer
                    .gpu_name
                    .to_ascii_lowercase()
                    .contains(&gpu.trim().to_ascii_lowercase())
                {
                    return false;
                }
            }
            if self.cpu_only && offer.num_gpus > 0 {
                return false;
            }
            if let Some(max) = self.max_price {
                if offer.price_per_hour > max {
                    return false;
                }
            }
            if let Some(min) = self.min_reliability {
                if offer.reliability < min {
                    return false;
                }
            }
            if let Some(min) = self.min_disk_gb {
                if offer.disk_gb > 0.0 && offer.disk_gb < min {
                    return false;
                }
            }
            if let Some(min) = self.min_internet_down_mbps {
                if offer.internet_down_mbps < min {
                    return false;
                }
            }
            if let Some(region) = self.region.as_deref().filter(|s| !s.trim().is_empty()) {
                if !offer
                    .region
                    .to_ascii_lowercase()
                    .contains(&region.trim().to_ascii_lowercase())
                {
                    return false;
                }
            }
            true
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct LaunchSpec {
        pub image: String,
        pub disk_gb: u32,
        pub ports: Vec<u16>,
        pub onstart: Option<String>,
        pub label: Option<String>,
    }

    impl Default for LaunchSpec {
        fn default() -> Self {
            Self {
                image: "pytorch/pytorch:latest".to_string(),
                disk_gb: 50,
                ports: vec![22, 8080],
                onstart: None,
                label: None,
            }
        }
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct InstanceStatus {
        pub instance_id: String,
        /// Raw marketplace state: running, loading, created, exited, ...
        pub status: String,
        pub ssh_host: Option<String>,
        pub ssh_port: Option<u16>,
        pub public_ip: Option<String>,
        /// Container port -> public host port.
        pub ports: HashMap<u16, u16>,
        pub gpu_name: Option<String>,
        pub price_per_hour: Option<f64>,
    }

    impl InstanceStatus {
        pub fn is_running(&self) -> bool {
            self.status.eq_ignore_ascii_case("running")
        }

        /// Public endpoint for a container port (falls back to the SSH host).
        pub fn endpoint_for(&self, container_port: u16) -> Option<(String, u16)> {
            let host = self.public_ip.clone().or_else(|| self.ssh_host.clone())?;
            let port = self.ports.get(&container_port).copied()?;
            Some((host, port))
        }
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "vastai")]
pub mod vastai;

#[cfg(test)]
mod tests {
    use super::inventory::*;

    fn offer(gpu: &str, price: f64, rel: f64) -> Offer {
        Offer {
            id: "1".into(),
            gpu_name: gpu.into(),
            price_per_hour: price,
            reliability: rel,
            internet_down_mbps: 500.0,
            region: "US-CA".into(),
            disk_gb: 100.0,
            num_gpus: 1,
        }
    }

    #[test]
    fn filters_apply_locally() {
        let f = OfferFilters {
            gpu_name: Some("4090".into()),
            max_price: Some(0.5),
            min_reliability: Some(0.9),
            region: Some("us".into()),
            ..Default::default()
        };
        assert!(f.matches(&offer("RTX 4090", 0.4, 0.95)));
        assert!(!f.matches(&offer("RTX 3090", 0.4, 0.95)));
        assert!(!f.matches(&offer("RTX 4090", 0.6, 0.95)));
        assert!(!f.matches(&offer("RTX 4090", 0.4, 0.5)));
    }

    #[test]
    fn endpoint_prefers_public_ip() {
        let mut st = InstanceStatus {
            status: "running".into(),
            ssh_host: Some("ssh.example".into()),
            public_ip: Some("1.2.3.4".into()),
            ..Default::default()
        };
        st.ports.insert(8080, 41000);
        assert!(st.is_running());
        assert_eq!(st.endpoint_for(8080), Some(("1.2.3.4".to_string(), 41000)));
        assert_eq!(st.endpoint_for(22), None);
    }
}
