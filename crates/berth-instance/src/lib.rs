use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a server instance.
///
/// Instances are created `Stopped`. `Running` requires a live child pid;
/// `Failed` records a child that exited non-zero or was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Running,
    Failed,
}

/// A logical editor server: directories, configuration, and an intermittent
/// child process bound to a dedicated local TCP port.
///
/// Runtime fields (`pid`, `start_time`, resource samples) are present exactly
/// while `status == Running`; they are modeled as options, never sentinel
/// zeros.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub workspace_path: PathBuf,
    pub data_path: PathBuf,
    #[serde(default)]
    pub extensions: Vec<String>,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(name: impl Into<String>, port: u16, workspace_path: PathBuf, data_path: PathBuf) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            port,
            workspace_path,
            data_path,
            extensions: Vec::new(),
            status: InstanceStatus::Stopped,
            pid: None,
            start_time: None,
            command: None,
            uptime_seconds: None,
            cpu_percent: None,
            memory_mb: None,
            last_update: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// Clear the child-process fields after the child is gone. The frozen
    /// `command` snapshot is advisory and survives a stop.
    pub fn clear_runtime(&mut self) {
        self.pid = None;
        self.start_time = None;
        self.clear_samples();
    }

    pub fn clear_samples(&mut self) {
        self.uptime_seconds = None;
        self.cpu_percent = None;
        self.memory_mb = None;
        self.last_update = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    System,
    Lifecycle,
    Stdout,
    Stderr,
}

/// One structured record on the log bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: LogSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    pub message: String,
}

impl LogRecord {
    pub fn system(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: LogSource::System,
            instance_id: None,
            instance_name: None,
            message: message.into(),
        }
    }

    pub fn lifecycle(
        instance_id: impl Into<String>,
        instance_name: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: LogSource::Lifecycle,
            instance_id: Some(instance_id.into()),
            instance_name: Some(instance_name.into()),
            message: message.into(),
        }
    }

    pub fn output(
        instance_id: impl Into<String>,
        instance_name: impl Into<String>,
        source: LogSource,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source,
            instance_id: Some(instance_id.into()),
            instance_name: Some(instance_name.into()),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_is_stopped_with_fresh_id() {
        let a = Instance::new("alpha", 8500, "/w/a".into(), "/d/a".into());
        let b = Instance::new("beta", 8501, "/w/b".into(), "/d/b".into());
        assert_eq!(a.status, InstanceStatus::Stopped);
        assert!(a.pid.is_none() && a.start_time.is_none());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn runtime_fields_are_omitted_when_absent() {
        let inst = Instance::new("alpha", 8500, "/w/a".into(), "/d/a".into());
        let v = serde_json::to_value(&inst).unwrap();
        assert_eq!(v["status"], "stopped");
        assert!(v.get("pid").is_none());
        assert!(v.get("start_time").is_none());
        assert!(v.get("cpu_percent").is_none());
    }

    #[test]
    fn clear_runtime_keeps_command_snapshot() {
        let mut inst = Instance::new("alpha", 8500, "/w/a".into(), "/d/a".into());
        inst.status = InstanceStatus::Running;
        inst.pid = Some(42);
        inst.start_time = Some(Utc::now());
        inst.command = Some(vec!["code-server".into()]);
        inst.cpu_percent = Some(1.5);

        inst.clear_runtime();
        assert!(inst.pid.is_none());
        assert!(inst.start_time.is_none());
        assert!(inst.cpu_percent.is_none());
        assert!(inst.command.is_some());
    }

    #[test]
    fn log_levels_serialize_uppercase() {
        let rec = LogRecord::system(LogLevel::Warn, "disk low");
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["level"], "WARN");
        assert_eq!(v["source"], "system");
        assert!(v.get("instance_id").is_none());
    }
}
