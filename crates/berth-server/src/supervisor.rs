//! Lifecycle state machine per instance. The supervisor owns every mutation:
//! it sequences store updates against spawns, signals, and filesystem side
//! effects so that on return the store reflects reality, and it runs the
//! per-child reaper plus the global health and metrics loops.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use berth_instance::{Instance, InstanceStatus, LogLevel, LogSource};
use chrono::Utc;
use serde::Serialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extensions;
use crate::logbus::LogBus;
use crate::logfile::InstanceLogs;
use crate::probe;
use crate::runner::{self, CaptureTarget, ExitDisposition, RunningChild, SpawnSpec};
use crate::store::{InstanceStore, MetricsUpdate};
use crate::workspace::{self, WorkspaceSeed};

/// Log a periodic "still healthy" record every Nth health tick and a summary
/// every Mth, instead of wall-clock modular arithmetic that misses most
/// windows.
const HEALTHY_LOG_EVERY: u64 = 10;
const SUMMARY_LOG_EVERY: u64 = 4;

const RESTART_PAUSE: Duration = Duration::from_secs(1);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: InstanceStatus,
    pub http_healthy: bool,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub uptime_seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct RefreshReport {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub old_status: InstanceStatus,
    pub new_status: InstanceStatus,
    pub pid_status: String,
    pub healthz_status: String,
    pub updated: bool,
}

#[derive(Debug, Serialize)]
pub struct RefreshAllReport {
    pub total_servers: usize,
    pub updated: usize,
    pub servers: Vec<RefreshReport>,
}

#[derive(Clone)]
pub struct Supervisor {
    cfg: Arc<Config>,
    store: Arc<InstanceStore>,
    bus: Arc<LogBus>,
    files: Arc<InstanceLogs>,
    health_client: reqwest::Client,
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// The child contract: bind-address flag, user-data-dir flag, positional
/// workspace path, plus the documented stability knobs.
fn build_spawn_spec(cfg: &Config, inst: &Instance) -> SpawnSpec {
    let config_dir = absolute(&cfg.editor_config_dir(&inst.data_path));
    let data_home = absolute(&inst.data_path);

    SpawnSpec {
        program: cfg.editor_bin.clone(),
        args: vec![
            "--bind-addr".to_string(),
            format!("0.0.0.0:{}", inst.port),
            "--user-data-dir".to_string(),
            config_dir.display().to_string(),
            "--auth".to_string(),
            "none".to_string(),
            "--disable-telemetry".to_string(),
            "--disable-update-check".to_string(),
            "--log".to_string(),
            "info".to_string(),
            inst.workspace_path.display().to_string(),
        ],
        env: vec![
            ("XDG_DATA_HOME".to_string(), data_home.display().to_string()),
            (
                "NODE_OPTIONS".to_string(),
                "--max-old-space-size=2048".to_string(),
            ),
            ("DISABLE_TELEMETRY".to_string(), "true".to_string()),
        ],
        cwd: inst.workspace_path.clone(),
    }
}

impl Supervisor {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<InstanceStore>,
        bus: Arc<LogBus>,
        files: Arc<InstanceLogs>,
    ) -> anyhow::Result<Self> {
        let health_client = reqwest::Client::builder()
            .timeout(HEALTH_PROBE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            cfg,
            store,
            bus,
            files,
            health_client,
        })
    }

    fn log_lifecycle(&self, inst: &Instance, level: LogLevel, message: &str) {
        self.bus
            .lifecycle(&inst.id, &inst.name, level, message);
        self.files
            .append(&inst.id, level, LogSource::Lifecycle, message);
    }

    fn capture_target(&self, inst: &Instance) -> CaptureTarget {
        CaptureTarget {
            instance_id: inst.id.clone(),
            instance_name: inst.name.clone(),
            bus: self.bus.clone(),
            files: self.files.clone(),
        }
    }

    /// Create an instance: allocate a port, lay out its directories, seed the
    /// workspace if asked (fatal, rolled back), insert as `stopped`, then
    /// materialize extensions (non-fatal).
    pub async fn create(
        &self,
        name: &str,
        extensions: &[String],
        seed: Option<WorkspaceSeed>,
    ) -> Result<Instance> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("name is required".to_string()));
        }

        let mut inst = Instance::new(name.trim(), 0, PathBuf::new(), PathBuf::new());
        inst.port = self.store.allocate_port(&inst.id)?;
        inst.workspace_path = absolute(&self.cfg.instance_workspace_dir(&inst.id));
        inst.data_path = absolute(&self.cfg.instance_data_dir(&inst.id));

        let rollback = |created_dirs: bool| {
            if created_dirs {
                let _ = std::fs::remove_dir_all(&inst.workspace_path);
                let _ = std::fs::remove_dir_all(&inst.data_path);
            }
            self.store.release_port(inst.port, &inst.id);
        };

        if let Err(e) = std::fs::create_dir_all(&inst.workspace_path)
            .and_then(|_| std::fs::create_dir_all(&inst.data_path))
        {
            rollback(false);
            return Err(Error::Internal(anyhow::anyhow!(
                "failed to create instance directories: {e}"
            )));
        }

        if let Some(seed) = &seed {
            if let Err(e) = workspace::seed(seed, &inst.workspace_path).await {
                rollback(true);
                return Err(Error::SeedFailed(e.to_string()));
            }
        }

        let inst = self.store.insert(inst)?;
        self.bus.system(
            LogLevel::Info,
            format!("Server {} created on port {}", inst.name, inst.port),
        );
        self.log_lifecycle(
            &inst,
            LogLevel::Info,
            &format!(
                "Server created on port {} with workspace {}",
                inst.port,
                inst.workspace_path.display()
            ),
        );

        if extensions.is_empty() {
            return Ok(inst);
        }

        let outcome =
            extensions::install_all(&self.cfg.editor_bin, &self.bus, &self.files, &inst, extensions)
                .await;
        if outcome.succeeded == 0 {
            return Ok(inst);
        }
        self.store
            .update(&inst.id, |i| i.extensions = extensions.to_vec())
    }

    /// Materialize extensions for an existing instance. Unlike create, the
    /// standalone endpoint reports partial failure to the caller.
    pub async fn install_extensions(&self, id: &str, extensions: &[String]) -> Result<Instance> {
        let inst = self.store.get(id)?;
        if extensions.is_empty() {
            return Ok(inst);
        }

        let outcome =
            extensions::install_all(&self.cfg.editor_bin, &self.bus, &self.files, &inst, extensions)
                .await;
        let inst = if outcome.succeeded > 0 {
            self.store
                .update(id, |i| i.extensions = extensions.to_vec())?
        } else {
            inst
        };

        if !outcome.all_succeeded() {
            return Err(Error::Internal(anyhow::anyhow!(
                "some extensions failed to install: {}/{} succeeded",
                outcome.succeeded,
                outcome.total
            )));
        }
        Ok(inst)
    }

    /// Seed the workspace of an already-created instance.
    pub async fn seed_workspace(&self, id: &str, seed: WorkspaceSeed) -> Result<Instance> {
        let inst = self.store.get(id)?;
        workspace::seed(&seed, &inst.workspace_path)
            .await
            .map_err(|e| Error::SeedFailed(e.to_string()))?;
        self.log_lifecycle(&inst, LogLevel::Info, "Workspace initialized");
        Ok(inst)
    }

    pub async fn start(&self, id: &str) -> Result<Instance> {
        let inst = self.store.get(id)?;
        if inst.is_running() {
            return Err(Error::Conflict("server is already running".to_string()));
        }

        let config_dir = self.cfg.editor_config_dir(&inst.data_path);
        std::fs::create_dir_all(&config_dir).map_err(|e| {
            Error::Internal(anyhow::anyhow!(
                "failed to create config directory {}: {e}",
                config_dir.display()
            ))
        })?;

        // Best-effort: anything already bound to the target port is killed
        // before the child tries to bind it. Enumeration failure only logs.
        for stranger in probe::pids_listening_on(inst.port).await {
            self.log_lifecycle(
                &inst,
                LogLevel::Warn,
                &format!(
                    "port {} is held by pid {stranger}; terminating it before start",
                    inst.port
                ),
            );
            runner::kill_pid(stranger);
        }

        let spec = build_spawn_spec(&self.cfg, &inst);
        self.log_lifecycle(
            &inst,
            LogLevel::Info,
            &format!("Starting {} on port {}", spec.program, inst.port),
        );

        let child = match runner::spawn(&spec, self.capture_target(&inst)) {
            Ok(child) => child,
            Err(e) => {
                self.log_lifecycle(&inst, LogLevel::Error, &format!("Failed to start: {e}"));
                return Err(e);
            }
        };

        let pid = child.pid;
        let now = Utc::now();
        let argv = spec.command_line();
        let updated = self.store.update(id, |i| {
            i.status = InstanceStatus::Running;
            i.pid = Some(pid);
            i.start_time = Some(now);
            i.command = Some(argv.clone());
        })?;

        self.log_lifecycle(
            &updated,
            LogLevel::Info,
            &format!(
                "{} started with PID {pid} on port {}",
                spec.program, updated.port
            ),
        );

        let reaper = self.clone();
        let reap_id = id.to_string();
        tokio::spawn(async move { reaper.reap(reap_id, pid, child).await });

        Ok(updated)
    }

    /// Observe one child's exit and reconcile. If Stop already cleared the
    /// pid, this is a no-op besides a lifecycle log.
    async fn reap(self, id: String, pid: u32, child: RunningChild) {
        let disposition = child.wait().await;

        let mut matched = false;
        let res = self.store.update(&id, |inst| {
            if inst.pid == Some(pid) && inst.start_time.is_some() {
                matched = true;
                inst.status = match disposition {
                    ExitDisposition::Normal => InstanceStatus::Stopped,
                    ExitDisposition::NonZero(_) | ExitDisposition::Signaled => {
                        InstanceStatus::Failed
                    }
                };
                inst.clear_runtime();
            }
        });

        match res {
            Ok(inst) if matched => {
                let (level, message) = match disposition {
                    ExitDisposition::Normal => (
                        LogLevel::Info,
                        "Server process exited normally".to_string(),
                    ),
                    ExitDisposition::NonZero(code) => (
                        LogLevel::Error,
                        format!("Server process exited with code {code}"),
                    ),
                    ExitDisposition::Signaled => (
                        LogLevel::Error,
                        "Server process was terminated by a signal".to_string(),
                    ),
                };
                self.log_lifecycle(&inst, level, &message);
            }
            Ok(inst) => {
                self.log_lifecycle(
                    &inst,
                    LogLevel::Debug,
                    &format!("reaper: pid {pid} no longer tracked; nothing to reconcile"),
                );
            }
            Err(_) => {
                tracing::debug!(id = %id, pid, "instance removed before its child was reaped");
            }
        }
    }

    pub async fn stop(&self, id: &str) -> Result<Instance> {
        let inst = self.store.get(id)?;
        let Some(pid) = inst.pid.filter(|_| inst.is_running()) else {
            return Err(Error::Conflict("server is not running".to_string()));
        };

        runner::terminate_group(pid);

        // Escalate after the grace period if the pid is still around. The
        // store is already converged; this only chases the real process.
        let grace = self.cfg.stop_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if probe::pid_alive(pid) {
                tracing::warn!(pid, "child outlived the stop grace period; sending SIGKILL");
                runner::kill_group(pid);
            }
        });

        let updated = self.store.update(id, |i| {
            i.status = InstanceStatus::Stopped;
            i.clear_runtime();
        })?;
        self.log_lifecycle(&updated, LogLevel::Info, "Server stopped");
        Ok(updated)
    }

    pub async fn restart(&self, id: &str) -> Result<Instance> {
        let inst = self.store.get(id)?;
        self.log_lifecycle(&inst, LogLevel::Info, "Server restart requested");

        if inst.is_running() {
            self.stop(id).await?;
            tokio::time::sleep(RESTART_PAUSE).await;
        }
        self.start(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let inst = self.store.get(id)?;
        self.log_lifecycle(&inst, LogLevel::Info, "Server deletion requested");

        if inst.is_running()
            && let Some(pid) = inst.pid
        {
            runner::kill_group(pid);
        }

        for dir in [&inst.data_path, &inst.workspace_path] {
            if let Err(e) = std::fs::remove_dir_all(dir)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to remove instance directory");
            }
        }
        self.files.remove(&inst.id);

        self.store.remove(id)?;
        self.bus.system(
            LogLevel::Info,
            format!("Server {} deleted and all directories cleaned up", inst.name),
        );
        Ok(())
    }

    pub async fn health(&self, id: &str) -> Result<HealthReport> {
        let inst = self.store.get(id)?;
        let http_healthy = if inst.is_running() && inst.pid.is_some() {
            self.is_backend_healthy(inst.port).await
        } else {
            false
        };
        Ok(HealthReport {
            status: inst.status,
            http_healthy,
            cpu_percent: inst.cpu_percent.unwrap_or(0.0),
            memory_mb: inst.memory_mb.unwrap_or(0.0),
            uptime_seconds: inst.uptime_seconds.unwrap_or(0.0),
        })
    }

    pub fn logs(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        self.store.get(id)?;
        Ok(self.files.tail(id, lines))
    }

    /// On-demand status reconciliation for one instance: pid presence plus a
    /// live healthz probe decide the effective status.
    pub async fn refresh_status(&self, id: &str) -> Result<RefreshReport> {
        let inst = self.store.get(id)?;
        Ok(self.refresh_one(inst).await)
    }

    pub async fn refresh_all(&self) -> RefreshAllReport {
        let instances = self.store.list();
        let total_servers = instances.len();
        let mut servers = Vec::with_capacity(total_servers);
        let mut updated = 0;
        for inst in instances {
            let report = self.refresh_one(inst).await;
            if report.updated {
                updated += 1;
            }
            servers.push(report);
        }
        RefreshAllReport {
            total_servers,
            updated,
            servers,
        }
    }

    async fn refresh_one(&self, inst: Instance) -> RefreshReport {
        let old_status = inst.status;
        let (pid_status, healthy, healthz_status) = match inst.pid {
            Some(pid) => {
                let healthy = self.is_backend_healthy(inst.port).await;
                let healthz_status = if healthy {
                    format!("health endpoint responding on port {}", inst.port)
                } else {
                    format!("health endpoint not responding on port {}", inst.port)
                };
                (format!("PID {pid} exists"), healthy, healthz_status)
            }
            None => (
                "no PID".to_string(),
                false,
                "no process to check".to_string(),
            ),
        };

        let new_status = if inst.pid.is_some() && healthy {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        };

        let updated = new_status != old_status;
        if updated {
            let res = self.store.update(&inst.id, |i| {
                i.status = new_status;
                if new_status != InstanceStatus::Running {
                    i.clear_runtime();
                }
            });
            if res.is_ok() {
                self.log_lifecycle(
                    &inst,
                    LogLevel::Info,
                    &format!(
                        "Status refreshed from {old_status:?} to {new_status:?} ({pid_status}, {healthz_status})"
                    ),
                );
            }
        }

        RefreshReport {
            id: inst.id,
            name: inst.name,
            port: inst.port,
            old_status,
            new_status,
            pid_status,
            healthz_status,
            updated,
        }
    }

    /// The editor's own liveness endpoint is the effective health signal; a
    /// pid alone is not enough because the child may be hung. A wake-up GET
    /// to `/` is issued first and its outcome ignored.
    async fn is_backend_healthy(&self, port: u16) -> bool {
        let _ = self
            .health_client
            .get(format!("http://127.0.0.1:{port}/"))
            .send()
            .await;

        let resp = match self
            .health_client
            .get(format!("http://127.0.0.1:{port}/healthz"))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(_) => return false,
        };
        if resp.status() != reqwest::StatusCode::OK {
            return false;
        }

        #[derive(serde::Deserialize)]
        struct Healthz {
            status: String,
        }
        match resp.json::<Healthz>().await {
            Ok(h) => h.status == "alive",
            Err(_) => false,
        }
    }

    pub fn spawn_background_loops(&self) {
        let health = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health.cfg.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut tick: u64 = 0;
            loop {
                ticker.tick().await;
                tick += 1;
                health.health_pass(tick).await;
            }
        });

        let metrics = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(metrics.cfg.metrics_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut prev_ticks: HashMap<u32, (u64, tokio::time::Instant)> = HashMap::new();
            loop {
                ticker.tick().await;
                metrics.metrics_tick(&mut prev_ticks).await;
            }
        });
    }

    /// One 30-second health sweep. Failures are per-instance and never
    /// terminate the loop.
    async fn health_pass(&self, tick: u64) {
        let mut running = 0usize;
        let mut stopped = 0usize;
        let mut reaped = 0usize;

        for inst in self.store.list() {
            let (true, Some(pid)) = (inst.is_running(), inst.pid) else {
                stopped += 1;
                continue;
            };
            running += 1;

            if self.is_backend_healthy(inst.port).await {
                if tick % HEALTHY_LOG_EVERY == 0 {
                    self.log_lifecycle(
                        &inst,
                        LogLevel::Debug,
                        &format!("Server on port {} is healthy", inst.port),
                    );
                }
                continue;
            }

            let mut cleared = false;
            let res = self.store.update(&inst.id, |i| {
                if i.status == InstanceStatus::Running && i.pid == Some(pid) {
                    cleared = true;
                    i.status = InstanceStatus::Stopped;
                    i.clear_runtime();
                }
            });
            if res.is_ok() && cleared {
                self.log_lifecycle(
                    &inst,
                    LogLevel::Warn,
                    &format!(
                        "Health check failed - server marked as stopped (port {})",
                        inst.port
                    ),
                );
                running -= 1;
                stopped += 1;
                reaped += 1;
            }
        }

        if reaped > 0 {
            tracing::info!(reaped, "health check updated status for unresponsive servers");
        }
        if tick % SUMMARY_LOG_EVERY == 0 {
            tracing::info!(running, stopped, "health check summary");
        }
    }

    /// One 1-second metrics sweep: sample every running child, reap
    /// unprobeable pids, then reconcile the store against the durable
    /// snapshot.
    async fn metrics_tick(&self, prev_ticks: &mut HashMap<u32, (u64, tokio::time::Instant)>) {
        let wall = Utc::now();
        let now = tokio::time::Instant::now();
        let mut updates = Vec::new();
        let mut live = HashSet::new();

        for inst in self.store.list() {
            let (true, Some(pid), Some(start)) = (inst.is_running(), inst.pid, inst.start_time)
            else {
                continue;
            };

            if !probe::pid_alive(pid) {
                self.log_lifecycle(
                    &inst,
                    LogLevel::Warn,
                    "Process no longer exists - marking as stopped",
                );
                updates.push((inst.id.clone(), MetricsUpdate::Dead));
                continue;
            }
            live.insert(pid);

            let uptime_seconds = ((wall - start).num_milliseconds().max(0) as f64) / 1000.0;
            let cpu_percent = match probe::read_cpu_ticks(pid).await {
                Some(ticks) => {
                    let pct = prev_ticks
                        .get(&pid)
                        .map(|(prev, at)| probe::cpu_percent(*prev, *at, ticks, now))
                        .unwrap_or(0.0);
                    prev_ticks.insert(pid, (ticks, now));
                    pct
                }
                None => 0.0,
            };
            let memory_mb = probe::read_rss_bytes(pid).await.unwrap_or(0) as f64 / 1024.0 / 1024.0;

            updates.push((
                inst.id.clone(),
                MetricsUpdate::Sample {
                    uptime_seconds,
                    cpu_percent,
                    memory_mb,
                    at: wall,
                },
            ));
        }

        prev_ticks.retain(|pid, _| live.contains(pid));
        self.store.metrics_pass(updates);
    }

    /// Process-wide shutdown: signal every known child, then let the process
    /// exit. No graceful drain of proxy connections is attempted.
    pub fn shutdown(&self) {
        for (id, pid) in self.store.drain_running_pids() {
            tracing::info!(id = %id, pid, "terminating child on shutdown");
            runner::terminate_group(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_setup(editor_bin: &str) -> (tempfile::TempDir, Supervisor) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(Config {
            http_port: 0,
            data_root: dir.path().join("data"),
            workspace_root: dir.path().join("workspace"),
            logs_root: dir.path().join("logs"),
            port_start: 8500,
            port_end: 8999,
            editor_bin: editor_bin.to_string(),
            proxy_prefix: "/editor".to_string(),
            stop_grace: Duration::from_secs(10),
            health_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_millis(1000),
            max_upload_bytes: 1024 * 1024,
        });
        std::fs::create_dir_all(&cfg.data_root).unwrap();
        let store = Arc::new(InstanceStore::open(
            cfg.servers_file(),
            cfg.port_start,
            cfg.port_end,
        ));
        let bus = Arc::new(LogBus::new(256));
        let files = Arc::new(InstanceLogs::new(cfg.logs_root.clone()));
        let sup = Supervisor::new(cfg, store, bus, files).unwrap();
        (dir, sup)
    }

    #[test]
    fn spawn_spec_binds_the_port_and_ends_with_the_workspace() {
        let (_dir, sup) = test_setup("code-server");
        let inst = Instance::new("alpha", 8500, "/ws/alpha".into(), "/data/alpha".into());
        let spec = build_spawn_spec(&sup.cfg, &inst);

        assert_eq!(spec.program, "code-server");
        assert_eq!(spec.args[0], "--bind-addr");
        assert_eq!(spec.args[1], "0.0.0.0:8500");
        assert!(spec.args.contains(&"--user-data-dir".to_string()));
        assert_eq!(spec.args.last().unwrap(), "/ws/alpha");
        assert!(
            spec.env
                .iter()
                .any(|(k, v)| k == "XDG_DATA_HOME" && v == "/data/alpha")
        );
        assert_eq!(spec.cwd, PathBuf::from("/ws/alpha"));
    }

    #[tokio::test]
    async fn create_assigns_the_first_port_and_lays_out_directories() {
        let (_dir, sup) = test_setup("code-server");
        let inst = sup.create("alpha", &[], None).await.unwrap();

        assert_eq!(inst.port, 8500);
        assert_eq!(inst.status, InstanceStatus::Stopped);
        assert!(inst.workspace_path.is_dir());
        assert!(inst.data_path.is_dir());
        assert!(inst.workspace_path.ends_with(format!("workspace/{}", inst.id)));

        let second = sup.create("beta", &[], None).await.unwrap();
        assert_eq!(second.port, 8501);
    }

    #[tokio::test]
    async fn create_rejects_blank_names() {
        let (_dir, sup) = test_setup("code-server");
        let err = sup.create("  ", &[], None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn failed_seed_rolls_back_port_and_directories() {
        let (dir, sup) = test_setup("code-server");
        let err = sup
            .create(
                "alpha",
                &[],
                Some(WorkspaceSeed::Zip(dir.path().join("missing.zip"))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SeedFailed(_)));
        assert!(sup.store.list().is_empty());
        assert!(sup.store.get_by_port(8500).is_err());

        // The port slot is free again for the next create.
        let inst = sup.create("beta", &[], None).await.unwrap();
        assert!(inst.workspace_path.is_dir());
    }

    #[tokio::test]
    async fn start_of_unknown_instance_is_not_found() {
        let (_dir, sup) = test_setup("code-server");
        assert!(matches!(
            sup.start("nope").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn start_with_missing_editor_binary_leaves_instance_stopped() {
        let (_dir, sup) = test_setup("berth-test-editor-that-does-not-exist");
        let inst = sup.create("alpha", &[], None).await.unwrap();

        let err = sup.start(&inst.id).await.unwrap_err();
        assert!(matches!(err, Error::SpawnFailed(_)));

        let after = sup.store.get(&inst.id).unwrap();
        assert_eq!(after.status, InstanceStatus::Stopped);
        assert!(after.pid.is_none());
        assert!(after.start_time.is_none());
    }

    #[tokio::test]
    async fn start_while_running_is_a_conflict() {
        let (_dir, sup) = test_setup("code-server");
        let inst = sup.create("alpha", &[], None).await.unwrap();
        sup.store
            .update(&inst.id, |i| {
                i.status = InstanceStatus::Running;
                i.pid = Some(std::process::id());
                i.start_time = Some(Utc::now());
            })
            .unwrap();

        assert!(matches!(
            sup.start(&inst.id).await.unwrap_err(),
            Error::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn stop_of_a_stopped_instance_is_a_conflict_and_changes_nothing() {
        let (_dir, sup) = test_setup("code-server");
        let inst = sup.create("alpha", &[], None).await.unwrap();

        let err = sup.stop(&inst.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        let after = sup.store.get(&inst.id).unwrap();
        assert_eq!(after.status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn delete_removes_directories_port_and_registry_entry() {
        let (_dir, sup) = test_setup("code-server");
        let inst = sup.create("alpha", &[], None).await.unwrap();
        let (ws, data) = (inst.workspace_path.clone(), inst.data_path.clone());

        sup.delete(&inst.id).await.unwrap();

        assert!(!ws.exists());
        assert!(!data.exists());
        assert!(sup.store.get(&inst.id).is_err());
        assert!(sup.store.get_by_port(inst.port).is_err());

        assert!(matches!(
            sup.delete(&inst.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn health_of_a_stopped_instance_reports_zeros() {
        let (_dir, sup) = test_setup("code-server");
        let inst = sup.create("alpha", &[], None).await.unwrap();
        let report = sup.health(&inst.id).await.unwrap();

        assert_eq!(report.status, InstanceStatus::Stopped);
        assert!(!report.http_healthy);
        assert_eq!(report.cpu_percent, 0.0);
        assert_eq!(report.uptime_seconds, 0.0);
    }

    #[tokio::test]
    async fn metrics_tick_reaps_dead_pids() {
        let (_dir, sup) = test_setup("code-server");
        let inst = sup.create("alpha", &[], None).await.unwrap();
        // A pid that cannot exist on Linux (beyond pid_max).
        sup.store
            .update(&inst.id, |i| {
                i.status = InstanceStatus::Running;
                i.pid = Some(u32::MAX - 1);
                i.start_time = Some(Utc::now());
            })
            .unwrap();

        let mut prev = HashMap::new();
        sup.metrics_tick(&mut prev).await;

        let after = sup.store.get(&inst.id).unwrap();
        assert_eq!(after.status, InstanceStatus::Stopped);
        assert!(after.pid.is_none());
    }

    #[tokio::test]
    async fn refresh_status_clears_a_stale_running_entry() {
        let (_dir, sup) = test_setup("code-server");
        let inst = sup.create("alpha", &[], None).await.unwrap();
        // Pretend a previous run left this marked running with a pid whose
        // backend no longer answers.
        sup.store
            .update(&inst.id, |i| {
                i.status = InstanceStatus::Running;
                i.pid = Some(std::process::id());
                i.start_time = Some(Utc::now());
            })
            .unwrap();

        let report = sup.refresh_status(&inst.id).await.unwrap();
        assert_eq!(report.old_status, InstanceStatus::Running);
        assert_eq!(report.new_status, InstanceStatus::Stopped);
        assert!(report.updated);
        assert!(report.pid_status.contains("exists"));

        let after = sup.store.get(&inst.id).unwrap();
        assert_eq!(after.status, InstanceStatus::Stopped);
        assert!(after.pid.is_none());
    }
}
