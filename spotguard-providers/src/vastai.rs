use crate::retry::{with_retry, RetryPolicy};
use crate::{inventory, MarketplaceProvider};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use spotguard_common::error::MarketplaceError;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://console.vast.ai/api/v0";

pub struct VastAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl VastAiProvider {
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        // Default reqwest client has no overall timeout. If the marketplace stalls, a race can hang.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, MarketplaceError> {
        let url = format!("{}{}", self.base_url, path);
        let op = format!("{} {}", method, path);
        with_retry(&self.retry, &op, || async {
            let mut req = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.api_key);
            if let Some(b) = body {
                req = req.json(b);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| MarketplaceError::Transport(e.to_string()))?;
            let status = resp.status().as_u16();
            if !resp.status().is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(MarketplaceError::from_status(status, text));
            }
            resp.json::<Value>()
                .await
                .map_err(|e| MarketplaceError::Decode(e.to_string()))
        })
        .await
    }
}

fn search_query(filters: &inventory::OfferFilters) -> Value {
    let mut q = json!({
        "rentable": {"eq": true},
        "rented": {"eq": false},
        "order": [["reliability2", "desc"], ["inet_down", "desc"]],
        "type": "on-demand",
        "limit": filters.limit.unwrap_or(64),
    });
    if let Some(gpu) = filters.gpu_name.as_deref().filter(|s| !s.trim().is_empty()) {
        // Marketplace stores names with underscores ("RTX_4090").
        q["gpu_name"] = json!({"eq": gpu.trim().replace(' ', "_")});
    }
    if filters.cpu_only {
        q["num_gpus"] = json!({"eq": 0});
    }
    if let Some(p) = filters.max_price {
        q["dph_total"] = json!({"lte": p});
    }
    if let Some(r) = filters.min_reliability {
        q["reliability2"] = json!({"gte": r});
    }
    if let Some(d) = filters.min_disk_gb {
        q["disk_space"] = json!({"gte": d});
    }
    if let Some(m) = filters.min_internet_down_mbps {
        q["inet_down"] = json!({"gte": m});
    }
    if filters.verified_only {
        q["verified"] = json!({"eq": true});
    }
    q
}

fn parse_offer(v: &Value) -> Option<inventory::Offer> {
    let id = match &v["id"] {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    Some(inventory::Offer {
        id,
        gpu_name: v["gpu_name"].as_str().unwrap_or("").replace('_', " "),
        price_per_hour: v["dph_total"].as_f64().unwrap_or(0.0),
        reliability: v["reliability2"]
            .as_f64()
            .or_else(|| v["reliability"].as_f64())
            .unwrap_or(0.0),
        internet_down_mbps: v["inet_down"].as_f64().unwrap_or(0.0),
        region: v["geolocation"].as_str().unwrap_or("").to_string(),
        disk_gb: v["disk_space"].as_f64().unwrap_or(0.0),
        num_gpus: v["num_gpus"].as_u64().unwrap_or(0) as u32,
    })
}

fn parse_ports(v: &Value) -> HashMap<u16, u16> {
    // {"8080/tcp": [{"HostIp": "0.0.0.0", "HostPort": "41234"}]}
    let mut out = HashMap::new();
    let Some(obj) = v.as_object() else {
        return out;
    };
    for (k, bindings) in obj {
        let Some(container) = k.split('/').next().and_then(|p| p.parse::<u16>().ok()) else {
            continue;
        };
        let host_port = bindings
            .as_array()
            .and_then(|a| a.first())
            .and_then(|b| b["HostPort"].as_str())
            .and_then(|p| p.parse::<u16>().ok());
        if let Some(hp) = host_port {
            out.insert(container, hp);
        }
    }
    out
}

fn parse_instance(instance_id: &str, v: &Value) -> inventory::InstanceStatus {
    inventory::InstanceStatus {
        instance_id: instance_id.to_string(),
        status: v["actual_status"]
            .as_str()
            .or_else(|| v["cur_state"].as_str())
            .unwrap_or("unknown")
            .to_string(),
        ssh_host: v["ssh_host"].as_str().map(|s| s.to_string()),
        ssh_port: v["ssh_port"].as_u64().map(|p| p as u16),
        public_ip: v["public_ipaddr"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        ports: parse_ports(&v["ports"]),
        gpu_name: v["gpu_name"].as_str().map(|s| s.replace('_', " ")),
        price_per_hour: v["dph_total"].as_f64(),
    }
}

#[async_trait]
impl MarketplaceProvider for VastAiProvider {
    async fn search_offers(
        &self,
        filters: &inventory::OfferFilters,
    ) -> Result<Vec<inventory::Offer>> {
        let body = search_query(filters);
        let resp = self.call(Method::POST, "/bundles/", Some(&body)).await?;
        let offers = resp["offers"]
            .as_array()
            .map(|a| a.iter().filter_map(parse_offer).collect::<Vec<_>>())
            .unwrap_or_default();
        tracing::debug!("🔵 [vastai] search_offers returned {} offer(s)", offers.len());
        Ok(offers)
    }

    async fn create_instance(
        &self,
        offer_id: &str,
        spec: &inventory::LaunchSpec,
    ) -> Result<Option<String>> {
        let mut env = serde_json::Map::new();
        for p in &spec.ports {
            env.insert(format!("-p {}:{}", p, p), json!("1"));
        }
        let body = json!({
            "client_id": "me",
            "image": spec.image,
            "disk": spec.disk_gb,
            "env": env,
            "onstart": spec.onstart,
            "label": spec.label,
            "runtype": "ssh_direct",
        });
        let path = format!("/asks/{}/", offer_id);
        match self.call(Method::PUT, &path, Some(&body)).await {
            Ok(resp) => {
                if resp["success"].as_bool() == Some(false) {
                    tracing::warn!(
                        "⚠️  [vastai] offer {} not rentable: {}",
                        offer_id,
                        resp["error"].as_str().unwrap_or("unknown")
                    );
                    return Ok(None);
                }
                let id = match &resp["new_contract"] {
                    Value::Number(n) => Some(n.to_string()),
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                };
                Ok(id)
            }
            // Offer taken by another renter or otherwise rejected: not fatal for the caller.
            Err(e @ (MarketplaceError::NotFound(_) | MarketplaceError::Client { .. })) => {
                tracing::warn!("⚠️  [vastai] create on offer {} rejected: {}", offer_id, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_instance_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<inventory::InstanceStatus>> {
        let path = format!("/instances/{}/", instance_id);
        match self.call(Method::GET, &path, None).await {
            Ok(resp) => {
                let inst = &resp["instances"];
                if inst.is_null() || (inst.is_object() && inst.as_object().map_or(true, |o| o.is_empty())) {
                    return Ok(None);
                }
                Ok(Some(parse_instance(instance_id, inst)))
            }
            Err(MarketplaceError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<bool> {
        let path = format!("/instances/{}/", instance_id);
        match self.call(Method::DELETE, &path, None).await {
            Ok(resp) => Ok(resp["success"].as_bool().unwrap_or(true)),
            Err(MarketplaceError::NotFound(_)) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn provider_code(&self) -> &'static str {
        "vastai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counters {
        create_calls: AtomicU32,
        status_calls: AtomicU32,
    }

    async fn create(
        State(c): State<Arc<Counters>>,
        Path(id): Path<String>,
    ) -> axum::response::Response {
        let n = c.create_calls.fetch_add(1, Ordering::SeqCst);
        if id == "gone" {
            return (StatusCode::BAD_REQUEST, "no_such_ask").into_response();
        }
        if n < 2 {
            return (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response();
        }
        Json(json!({"success": true, "new_contract": 4242})).into_response()
    }

    async fn status(
        State(c): State<Arc<Counters>>,
        Path(id): Path<String>,
    ) -> axum::response::Response {
        c.status_calls.fetch_add(1, Ordering::SeqCst);
        if id == "missing" {
            return (StatusCode::NOT_FOUND, "nope").into_response();
        }
        Json(json!({"instances": {
            "actual_status": "running",
            "ssh_host": "ssh4.example",
            "ssh_port": 12345,
            "public_ipaddr": "5.6.7.8 ",
            "ports": {"8080/tcp": [{"HostIp": "0.0.0.0", "HostPort": "40100"}]},
            "gpu_name": "RTX_4090",
            "dph_total": 0.41
        }}))
        .into_response()
    }

    async fn spawn_fake() -> (String, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let app = Router::new()
            .route("/asks/:id/", put(create))
            .route("/instances/:id/", get(status))
            .with_state(counters.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), counters)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn create_retries_through_rate_limit() {
        let (base, counters) = spawn_fake().await;
        let p = VastAiProvider::new(&base, "key".into())
            .unwrap()
            .with_retry_policy(fast_retry());
        let id = p
            .create_instance("123", &inventory::LaunchSpec::default())
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("4242"));
        assert_eq!(counters.create_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_offer_is_none_without_retry() {
        let (base, counters) = spawn_fake().await;
        let p = VastAiProvider::new(&base, "key".into())
            .unwrap()
            .with_retry_policy(fast_retry());
        let id = p
            .create_instance("gone", &inventory::LaunchSpec::default())
            .await
            .unwrap();
        assert!(id.is_none());
        assert_eq!(counters.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn status_is_parsed_and_404_is_none() {
        let (base, counters) = spawn_fake().await;
        let p = VastAiProvider::new(&base, "key".into())
            .unwrap()
            .with_retry_policy(fast_retry());
        let st = p.get_instance_status("77").await.unwrap().unwrap();
        assert!(st.is_running());
        assert_eq!(st.ssh_port, Some(12345));
        assert_eq!(st.gpu_name.as_deref(), Some("RTX 4090"));
        assert_eq!(st.endpoint_for(8080), Some(("5.6.7.8".to_string(), 40100)));

        assert!(p.get_instance_status("missing").await.unwrap().is_none());
        assert_eq!(counters.status_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn query_carries_filters() {
        let q = search_query(&inventory::OfferFilters {
            gpu_name: Some("RTX 4090".into()),
            max_price: Some(0.5),
            ..Default::default()
        });
        assert_eq!(q["gpu_name"]["eq"], "RTX_4090");
        assert_eq!(q["dph_total"]["lte"], 0.5);
        assert_eq!(q["order"][0][0], "reliability2");
    }
}
