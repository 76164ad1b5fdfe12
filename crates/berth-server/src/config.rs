use std::path::{Path, PathBuf};
use std::time::Duration;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.parse::<u16>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env_string(name).map(PathBuf::from)
}

const DEFAULT_HTTP_PORT: u16 = 8000;
const DEFAULT_PORT_START: u16 = 8500;
const DEFAULT_PORT_END: u16 = 8999;
const DEFAULT_EDITOR_BIN: &str = "code-server";
const DEFAULT_PROXY_PREFIX: &str = "/editor";
const DEFAULT_STOP_GRACE_SECS: u64 = 10;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
const DEFAULT_METRICS_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_UPLOAD_MB: u64 = 100;

/// Immutable runtime configuration, loaded once from the environment and
/// handed to the supervisor, store, and proxy. No hidden singletons.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub data_root: PathBuf,
    pub workspace_root: PathBuf,
    pub logs_root: PathBuf,
    pub port_start: u16,
    pub port_end: u16,
    pub editor_bin: String,
    pub proxy_prefix: String,
    pub stop_grace: Duration,
    pub health_interval: Duration,
    pub metrics_interval: Duration,
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let port_start = env_u16("BERTH_PORT_START").unwrap_or(DEFAULT_PORT_START);
        let port_end = env_u16("BERTH_PORT_END")
            .unwrap_or(DEFAULT_PORT_END)
            .max(port_start);

        Self {
            http_port: env_u16("BERTH_HTTP_PORT").unwrap_or(DEFAULT_HTTP_PORT),
            data_root: env_path("BERTH_DATA_ROOT").unwrap_or_else(|| PathBuf::from("data")),
            workspace_root: env_path("BERTH_WORKSPACE_ROOT")
                .unwrap_or_else(|| PathBuf::from("workspace")),
            logs_root: env_path("BERTH_LOGS_ROOT").unwrap_or_else(|| PathBuf::from("logs")),
            port_start,
            port_end,
            editor_bin: env_string("BERTH_EDITOR_BIN")
                .unwrap_or_else(|| DEFAULT_EDITOR_BIN.to_string()),
            proxy_prefix: env_string("BERTH_PROXY_PREFIX")
                .unwrap_or_else(|| DEFAULT_PROXY_PREFIX.to_string()),
            stop_grace: Duration::from_secs(
                env_u64("BERTH_STOP_GRACE_SEC")
                    .map(|v| v.clamp(1, 60))
                    .unwrap_or(DEFAULT_STOP_GRACE_SECS),
            ),
            health_interval: Duration::from_secs(
                env_u64("BERTH_HEALTH_INTERVAL_SEC")
                    .map(|v| v.clamp(5, 300))
                    .unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
            ),
            metrics_interval: Duration::from_millis(
                env_u64("BERTH_METRICS_INTERVAL_MS")
                    .map(|v| v.clamp(250, 60_000))
                    .unwrap_or(DEFAULT_METRICS_INTERVAL_MS),
            ),
            max_upload_bytes: env_u64("BERTH_MAX_UPLOAD_MB")
                .map(|v| v.clamp(1, 4096))
                .unwrap_or(DEFAULT_MAX_UPLOAD_MB) as usize
                * 1024
                * 1024,
        }
    }

    /// The durable registry file, a single JSON object mapping id -> instance.
    pub fn servers_file(&self) -> PathBuf {
        self.data_root.join("servers.json")
    }

    pub fn instance_data_dir(&self, id: &str) -> PathBuf {
        self.data_root.join(id)
    }

    pub fn instance_workspace_dir(&self, id: &str) -> PathBuf {
        self.workspace_root.join(id)
    }

    /// Editor config directory under the instance data root, passed as the
    /// user-data dir on the child command line.
    pub fn editor_config_dir(&self, data_path: &Path) -> PathBuf {
        data_path.join(&self.editor_bin)
    }
}
