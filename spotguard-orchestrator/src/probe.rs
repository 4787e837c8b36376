// ============================================================================
// REACHABILITY PROBES
// ============================================================================

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;

/// Liveness checks used by the race, the standby manager and the failover monitor.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// TCP connect succeeds within the probe timeout.
    async fn tcp_reachable(&self, host: &str, port: u16) -> bool;

    /// Application endpoint answers with an "alive" status (200, 302 or 401).
    async fn http_healthy(&self, host: &str, port: u16) -> bool;
}

/// Strip CIDR suffix if present (e.g. "1.2.3.4/32" -> "1.2.3.4").
pub fn clean_host(host: &str) -> &str {
    host.split('/').next().unwrap_or(host).trim()
}

/// Status codes that prove the application is up, even behind auth or a login redirect.
pub fn is_alive_status(status: u16) -> bool {
    matches!(status, 200 | 302 | 401)
}

pub struct NetworkProbe {
    client: reqwest::Client,
    connect_timeout: Duration,
    health_path: String,
}

impl NetworkProbe {
    pub fn new(connect_timeout: Duration, health_path: &str) -> anyhow::Result<Self> {
        // Redirects must surface as 302 instead of being followed.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout * 2)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let health_path = if health_path.starts_with('/') {
            health_path.to_string()
        } else {
            format!("/{}", health_path)
        };
        Ok(Self {
            client,
            connect_timeout,
            health_path,
        })
    }
}

#[async_trait]
impl ReachabilityProbe for NetworkProbe {
    async fn tcp_reachable(&self, host: &str, port: u16) -> bool {
        let addr = format!("{}:{}", clean_host(host), port);
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }

    async fn http_healthy(&self, host: &str, port: u16) -> bool {
        let url = format!("http://{}:{}{}", clean_host(host), port, self.health_path);
        match self.client.get(&url).send().await {
            Ok(resp) => is_alive_status(resp.status().as_u16()),
            Err(e) => {
                tracing::debug!("health probe {} failed: {}", url, e);
                false
            }
        }
    }
}

/// Probe with manually set answers, keyed by `host:port` (tests, dry runs).
/// Unknown endpoints are unreachable.
#[derive(Default)]
pub struct ScriptedProbe {
    tcp: Mutex<HashMap<String, bool>>,
    http: Mutex<HashMap<String, bool>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tcp(&self, host: &str, port: u16, up: bool) {
        if let Ok(mut m) = self.tcp.lock() {
            m.insert(format!("{}:{}", host, port), up);
        }
    }

    pub fn set_http(&self, host: &str, port: u16, up: bool) {
        if let Ok(mut m) = self.http.lock() {
            m.insert(format!("{}:{}", host, port), up);
        }
    }

    /// Every probed endpoint, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn lookup(&self, map: &Mutex<HashMap<String, bool>>, host: &str, port: u16) -> bool {
        let key = format!("{}:{}", host, port);
        if let Ok(mut c) = self.calls.lock() {
            c.push(key.clone());
        }
        map.lock()
            .ok()
            .and_then(|m| m.get(&key).copied())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ReachabilityProbe for ScriptedProbe {
    async fn tcp_reachable(&self, host: &str, port: u16) -> bool {
        self.lookup(&self.tcp, host, port)
    }

    async fn http_healthy(&self, host: &str, port: u16) -> bool {
        self.lookup(&self.http, host, port)
    }
}
