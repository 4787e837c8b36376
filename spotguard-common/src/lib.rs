use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod bus;
pub mod error;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Idle,
    Creating,   // create_instance in flight
    Connecting, // instance exists, waiting for control plane
    Connected,  // control plane says running, TCP not yet open
    Ready,      // passed the liveness check
    Failed,
    Cancelled, // destroyed as a loser or on timeout
}

impl CandidateStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CandidateStatus::Ready | CandidateStatus::Failed | CandidateStatus::Cancelled
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetType {
    Gpu,
    Cpu,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Gpu => "GPU",
            TargetType::Cpu => "CPU",
        }
    }

    pub fn other(&self) -> TargetType {
        match self {
            TargetType::Gpu => TargetType::Cpu,
            TargetType::Cpu => TargetType::Gpu,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineRole {
    GpuPrimary,
    CpuStandby,
    GpuPending, // replacement primary being provisioned
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MachineStatus {
    Starting,
    Running,
    Syncing,
    Ready,
    Failing,
    Offline,
}

impl MachineStatus {
    /// Terminal machines are skipped by the health loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MachineStatus::Offline)
    }

    /// Counts as "live or provisioning" for standby de-duplication.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            MachineStatus::Ready | MachineStatus::Running | MachineStatus::Starting
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Skipped,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Pending => "pending",
            SnapshotStatus::InProgress => "in_progress",
            SnapshotStatus::Success => "success",
            SnapshotStatus::Failed => "failed",
            SnapshotStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(SnapshotStatus::Pending),
            "in_progress" => Some(SnapshotStatus::InProgress),
            "success" => Some(SnapshotStatus::Success),
            "failed" => Some(SnapshotStatus::Failed),
            "skipped" => Some(SnapshotStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    GpuFailure,
    GpuRecovered,
    Manual,
}

impl FailoverReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverReason::GpuFailure => "gpu_failure",
            FailoverReason::GpuRecovered => "gpu_recovered",
            FailoverReason::Manual => "manual",
        }
    }
}

// --- Race provisioning ---

/// One in-flight provisioning attempt, owned by a single race round.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Candidate {
    pub instance_id: Option<String>,
    pub offer_id: String,
    pub gpu_name: String,
    pub price_per_hour: f64,
    pub provision_start_time: DateTime<Utc>,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub connected: bool,
    pub status: CandidateStatus,
    pub ready_time: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn new(offer_id: &str, gpu_name: &str, price_per_hour: f64) -> Self {
        Self {
            instance_id: None,
            offer_id: offer_id.to_string(),
            gpu_name: gpu_name.to_string(),
            price_per_hour,
            provision_start_time: Utc::now(),
            ssh_host: None,
            ssh_port: None,
            connected: false,
            status: CandidateStatus::Idle,
            ready_time: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ProvisionResult {
    pub success: bool,
    pub instance_id: Option<String>,
    pub offer_id: Option<String>,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub gpu_name: Option<String>,
    pub price_per_hour: Option<f64>,
    pub rounds_attempted: u32,
    pub machines_tried: u32,
    pub machines_created: u32,
    /// Seconds from `provision()` entry to return.
    pub total_time: f64,
    /// Seconds from the winner's create call to its first passing liveness check.
    pub time_to_ready: Option<f64>,
    pub error: Option<String>,
}

// --- Failover ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TargetEndpoint {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub host: String,
    pub port: u16,
}

impl TargetEndpoint {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Target {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub host: String,
    pub port: u16,
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
}

impl Target {
    pub fn new(target_type: TargetType, host: &str, port: u16) -> Self {
        Self {
            target_type,
            host: host.to_string(),
            port,
            healthy: false,
            last_check: None,
        }
    }

    pub fn endpoint(&self) -> TargetEndpoint {
        TargetEndpoint {
            target_type: self.target_type,
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Durable record written on every failover/failback.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FailoverState {
    pub active_target: TargetEndpoint,
    pub previous_target: Option<TargetEndpoint>,
    pub timestamp: DateTime<Utc>,
    pub failover_count: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FailoverEvent {
    pub from: String,
    pub to: String,
    pub reason: FailoverReason,
    pub at: DateTime<Utc>,
}

impl FailoverEvent {
    pub fn new(from: &str, to: &str, reason: FailoverReason) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            reason,
            at: Utc::now(),
        }
    }
}

// --- Standby management ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ManagedMachine {
    pub instance_id: String,
    pub role: MachineRole,
    pub status: MachineStatus,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub health_failures: u32,
    pub gpu_name: Option<String>,
    pub price_per_hour: f64,
    pub interruptible: bool,
    pub owner_id: Option<String>,
    pub paired_with: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl ManagedMachine {
    pub fn new(instance_id: &str, role: MachineRole, status: MachineStatus) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            role,
            status,
            ssh_host: None,
            ssh_port: None,
            health_failures: 0,
            gpu_name: None,
            price_per_hour: 0.0,
            interruptible: false,
            owner_id: None,
            paired_with: None,
            created_at: Utc::now(),
            last_health_check: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ActiveEndpoint {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub role: MachineRole,
}

// --- Snapshots ---

pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;
pub const SNAPSHOT_HISTORY_LIMIT: usize = 100;
pub const SNAPSHOT_INTERVALS: [u32; 4] = [5, 15, 30, 60];
pub const DEFAULT_SNAPSHOT_PARTS: usize = 32;

pub fn is_valid_snapshot_interval(minutes: u32) -> bool {
    SNAPSHOT_INTERVALS.contains(&minutes)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SnapshotJobInfo {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub workspace_path: String,
    pub interval_minutes: u32,
    pub enabled: bool,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub next_snapshot_at: Option<DateTime<Utc>>,
    pub last_status: SnapshotStatus,
    pub consecutive_failures: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SnapshotResult {
    pub instance_id: String,
    pub status: SnapshotStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub snapshot_id: Option<String>,
    pub size_bytes: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SnapshotPart {
    pub index: usize,
    pub key: String,
    pub size_original: u64,
    pub size_compressed: u64,
    pub sha256: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    pub instance_id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub workspace_path: String,
    pub size_original: u64,
    pub size_compressed: u64,
    pub compression_ratio: f64,
    pub num_parts: usize,
    pub codec: String,
    pub sha256: String,
    pub r2_path: String,
    pub parts: Vec<SnapshotPart>,
}

/// `size_original / size_compressed`, 0 when nothing was written.
pub fn compression_ratio(size_original: u64, size_compressed: u64) -> f64 {
    if size_compressed == 0 {
        return 0.0;
    }
    size_original as f64 / size_compressed as f64
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RestoreInfo {
    pub snapshot_id: String,
    pub host: String,
    pub port: u16,
    pub workspace_path: String,
    pub bytes_restored: u64,
    pub num_parts: usize,
    pub duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_status_parse_roundtrip() {
        for s in [
            SnapshotStatus::Pending,
            SnapshotStatus::InProgress,
            SnapshotStatus::Success,
            SnapshotStatus::Failed,
            SnapshotStatus::Skipped,
        ] {
            assert_eq!(SnapshotStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SnapshotStatus::parse("bogus"), None);
    }

    #[test]
    fn interval_rules() {
        assert!(is_valid_snapshot_interval(5));
        assert!(is_valid_snapshot_interval(60));
        assert!(!is_valid_snapshot_interval(10));
        assert!(!is_valid_snapshot_interval(0));
    }

    #[test]
    fn ratio_is_original_over_compressed() {
        assert_eq!(compression_ratio(1000, 250), 4.0);
        assert_eq!(compression_ratio(10, 0), 0.0);
    }

    #[test]
    fn target_endpoint_serializes_type_field() {
        let ep = Target::new(TargetType::Gpu, "10.0.0.1", 22).endpoint();
        let v = serde_json::to_value(&ep).unwrap();
        assert_eq!(v["type"], "GPU");
        assert_eq!(v["port"], 22);
        assert_eq!(ep.addr(), "10.0.0.1:22");
    }

    #[test]
    fn machine_status_liveness() {
        assert!(MachineStatus::Ready.is_live());
        assert!(MachineStatus::Starting.is_live());
        assert!(!MachineStatus::Failing.is_live());
        assert!(MachineStatus::Offline.is_terminal());
    }
}
