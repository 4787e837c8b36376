use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use spotguard_providers::inventory::{LaunchSpec, OfferFilters};

use crate::node_transport::SshTransport;
use crate::object_store::S3Settings;
use crate::race::RaceConfig;
use crate::snapshot_engine::SnapshotConfig;
use crate::snapshot_scheduler::SchedulerConfig;
use crate::standby_manager::StandbyConfig;

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse::<u64>(key).filter(|v| *v > 0).unwrap_or(default))
}

/// Prefer `{key}_FILE` (Docker/K8s secrets), fall back to the plain variable.
pub fn env_secret(key: &str) -> Option<String> {
    env::var(format!("{}_FILE", key))
        .ok()
        .and_then(|p| fs::read_to_string(p.trim()).ok())
        .or_else(|| env::var(key).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_ports(key: &str) -> Option<Vec<u16>> {
    let raw = env_string(key)?;
    let ports: Vec<u16> = raw
        .split(',')
        .filter_map(|p| p.trim().parse::<u16>().ok())
        .collect();
    (!ports.is_empty()).then_some(ports)
}

impl RaceConfig {
    /// `RACE_*` variables; `GPU_*` for the offer filter.
    pub fn from_env() -> Self {
        let d = RaceConfig::default();
        let launch = LaunchSpec::default();
        Self {
            filters: OfferFilters {
                gpu_name: env_string("GPU_NAME"),
                max_price: env_parse("GPU_MAX_PRICE"),
                min_disk_gb: env_parse("GPU_MIN_DISK_GB"),
                min_reliability: env_parse("GPU_MIN_RELIABILITY"),
                region: env_string("GPU_REGION"),
                min_internet_down_mbps: env_parse("GPU_MIN_INET_DOWN_MBPS"),
                verified_only: env_bool("GPU_VERIFIED_ONLY", false),
                cpu_only: false,
                limit: env_parse("RACE_OFFER_LIMIT"),
            },
            launch: LaunchSpec {
                image: env_string("GPU_IMAGE").unwrap_or(launch.image),
                disk_gb: env_parse("GPU_DISK_GB").unwrap_or(launch.disk_gb),
                ports: env_ports("GPU_PORTS").unwrap_or(launch.ports),
                onstart: env_string("GPU_ONSTART"),
                label: Some("spotguard-primary".to_string()),
            },
            batch_size: env_parse::<usize>("RACE_BATCH_SIZE")
                .filter(|v| *v > 0)
                .unwrap_or(d.batch_size),
            batch_timeout: env_secs("RACE_BATCH_TIMEOUT_S", d.batch_timeout.as_secs()),
            check_interval: env_secs("RACE_CHECK_INTERVAL_S", d.check_interval.as_secs()),
            max_batches: env_parse::<u32>("RACE_MAX_BATCHES")
                .filter(|v| *v > 0)
                .unwrap_or(d.max_batches),
            create_stagger: Duration::from_millis(
                env_parse("RACE_CREATE_STAGGER_MS").unwrap_or(d.create_stagger.as_millis() as u64),
            ),
            overall_timeout: env_parse::<u64>("RACE_OVERALL_TIMEOUT_S")
                .filter(|v| *v > 0)
                .map(Duration::from_secs),
        }
    }
}

impl StandbyConfig {
    pub fn from_env(primary_race: RaceConfig) -> Self {
        let d = StandbyConfig::default();
        Self {
            health_check_interval: env_secs(
                "STANDBY_HEALTH_CHECK_INTERVAL_S",
                d.health_check_interval.as_secs(),
            ),
            max_health_failures: env_parse::<u32>("STANDBY_MAX_HEALTH_FAILURES")
                .filter(|v| *v > 0)
                .unwrap_or(d.max_health_failures),
            standby_max_price: env_parse("STANDBY_MAX_PRICE").unwrap_or(d.standby_max_price),
            standby_launch: LaunchSpec {
                image: env_string("STANDBY_IMAGE").unwrap_or(d.standby_launch.image),
                disk_gb: env_parse("STANDBY_DISK_GB").unwrap_or(d.standby_launch.disk_gb),
                ports: env_ports("STANDBY_PORTS").unwrap_or(d.standby_launch.ports),
                onstart: env_string("STANDBY_ONSTART"),
                label: d.standby_launch.label,
            },
            app_port: env_parse("STANDBY_APP_PORT").unwrap_or(d.app_port),
            ready_poll_interval: env_secs(
                "STANDBY_READY_POLL_INTERVAL_S",
                d.ready_poll_interval.as_secs(),
            ),
            ready_timeout: env_secs("STANDBY_READY_TIMEOUT_S", d.ready_timeout.as_secs()),
            create_attempts: env_parse::<usize>("STANDBY_CREATE_ATTEMPTS")
                .filter(|v| *v > 0)
                .unwrap_or(d.create_attempts),
            primary_race,
            auto_reprovision: env_bool("STANDBY_AUTO_REPROVISION", d.auto_reprovision),
            workspace_path: env_string("WORKSPACE_PATH").unwrap_or(d.workspace_path),
        }
    }
}

impl SnapshotConfig {
    pub fn from_env() -> Self {
        let d = SnapshotConfig::default();
        Self {
            num_parts: env_parse::<usize>("SNAPSHOT_NUM_PARTS")
                .filter(|v| *v > 0)
                .unwrap_or(d.num_parts),
            prefix: env_string("SNAPSHOT_PREFIX").unwrap_or(d.prefix),
            compression_level: env_parse::<u32>("SNAPSHOT_COMPRESSION_LEVEL")
                .map(|l| l.min(9))
                .unwrap_or(d.compression_level),
            max_parallel_transfers: env_parse::<usize>("SNAPSHOT_MAX_PARALLEL_TRANSFERS")
                .filter(|v| *v > 0)
                .unwrap_or(d.max_parallel_transfers),
            scratch_dir: env_string("SNAPSHOT_SCRATCH_DIR").map(PathBuf::from),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let d = SchedulerConfig::default();
        Self {
            max_concurrent: env_parse::<usize>("SNAPSHOT_MAX_CONCURRENT")
                .filter(|v| *v > 0)
                .unwrap_or(d.max_concurrent),
            tick_interval: env_secs("SNAPSHOT_TICK_INTERVAL_S", d.tick_interval.as_secs()),
            history_limit: d.history_limit,
        }
    }
}

/// Where snapshot objects go.
#[derive(Clone, Debug)]
pub enum StorageConfig {
    S3(S3Settings),
    Local(PathBuf),
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub listen_port: u16,
    pub provider: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub probe_timeout: Duration,
    pub app_health_path: String,
    pub race: RaceConfig,
    pub standby: StandbyConfig,
    pub snapshot: SnapshotConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub ssh: SshTransport,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let race = RaceConfig::from_env();
        let standby = StandbyConfig::from_env(race.clone());

        let storage = match env_string("SNAPSHOT_BUCKET") {
            Some(bucket) => StorageConfig::S3(S3Settings {
                bucket,
                endpoint_url: env_string("S3_ENDPOINT_URL"),
                region: env_string("S3_REGION").unwrap_or_else(|| "auto".to_string()),
                access_key_id: env_secret("S3_ACCESS_KEY_ID"),
                secret_access_key: env_secret("S3_SECRET_ACCESS_KEY"),
            }),
            None => StorageConfig::Local(
                env_string("SNAPSHOT_LOCAL_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/snapshots")),
            ),
        };

        let ssh_default = SshTransport::default();
        let ssh = SshTransport {
            user: env_string("SSH_USER").unwrap_or(ssh_default.user),
            key_path: env_string("SSH_KEY_PATH").map(PathBuf::from),
            connect_timeout: env_secs("SSH_CONNECT_TIMEOUT_S", ssh_default.connect_timeout.as_secs()),
            transfer_timeout: env_secs(
                "SSH_TRANSFER_TIMEOUT_S",
                ssh_default.transfer_timeout.as_secs(),
            ),
        };

        Self {
            listen_port: env_parse("ORCHESTRATOR_PORT").unwrap_or(8001),
            provider: env_string("PROVIDER").unwrap_or_else(|| "vastai".to_string()),
            database_url: env_string("DATABASE_URL"),
            redis_url: env_string("REDIS_URL"),
            probe_timeout: env_secs("PROBE_TIMEOUT_S", 3),
            app_health_path: env_string("STANDBY_HEALTH_PATH").unwrap_or_else(|| "/".to_string()),
            race,
            standby,
            snapshot: SnapshotConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            storage,
            ssh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_prefer_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, "from-file\n").unwrap();
        env::set_var("SPOTGUARD_TEST_SECRET_FILE", &path);
        env::set_var("SPOTGUARD_TEST_SECRET", "from-env");
        assert_eq!(env_secret("SPOTGUARD_TEST_SECRET").as_deref(), Some("from-file"));

        env::remove_var("SPOTGUARD_TEST_SECRET_FILE");
        assert_eq!(env_secret("SPOTGUARD_TEST_SECRET").as_deref(), Some("from-env"));
        env::remove_var("SPOTGUARD_TEST_SECRET");
    }

    #[test]
    fn port_lists_parse() {
        env::set_var("SPOTGUARD_TEST_PORTS", "22, 8080,bogus");
        assert_eq!(env_ports("SPOTGUARD_TEST_PORTS"), Some(vec![22, 8080]));
        env::remove_var("SPOTGUARD_TEST_PORTS");
        assert_eq!(env_ports("SPOTGUARD_TEST_PORTS"), None);
    }

    #[test]
    fn defaults_without_env() {
        let cfg = SchedulerConfig::from_env();
        assert_eq!(cfg.tick_interval, Duration::from_secs(30));
        let snap = SnapshotConfig::from_env();
        assert_eq!(snap.num_parts, 32);
    }
}
