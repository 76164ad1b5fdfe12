use std::fs;
use std::io::Write;
use std::path::PathBuf;

use berth_instance::{LogLevel, LogSource};
use chrono::Utc;

const MAX_LOG_BYTES: u64 = 1024 * 1024;
const MAX_ROTATED_FILES: usize = 5;

/// Per-instance log files under `logs/<id>/process.log`, rotated at 1 MiB
/// with the 5 most recent rotations retained. Writes are open-append-close,
/// so sporadic lifecycle events and bursty output capture share one path
/// without any writer task.
pub struct InstanceLogs {
    root: PathBuf,
}

impl InstanceLogs {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn dir(&self, instance_id: &str) -> PathBuf {
        self.root.join(instance_id)
    }

    fn log_path(&self, instance_id: &str) -> PathBuf {
        self.dir(instance_id).join("process.log")
    }

    /// Append one formatted line. Errors are logged and swallowed; file
    /// logging is best-effort and never fails a lifecycle operation.
    pub fn append(
        &self,
        instance_id: &str,
        level: LogLevel,
        source: LogSource,
        message: &str,
    ) {
        let path = self.log_path(instance_id);
        if let Err(e) = self.append_inner(instance_id, &path, level, source, message) {
            tracing::warn!(instance_id, error = %e, "failed to write instance log file");
        }
    }

    fn append_inner(
        &self,
        instance_id: &str,
        path: &PathBuf,
        level: LogLevel,
        source: LogSource,
        message: &str,
    ) -> std::io::Result<()> {
        fs::create_dir_all(self.dir(instance_id))?;
        self.rotate_if_needed(path)?;

        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        let ts = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let level = match level {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Debug => "DEBUG",
        };
        let source = match source {
            LogSource::System => "system",
            LogSource::Lifecycle => "lifecycle",
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
        };
        writeln!(file, "{ts} - {level} - {source}: {message}")
    }

    fn rotate_if_needed(&self, path: &PathBuf) -> std::io::Result<()> {
        let size = match fs::metadata(path) {
            Ok(m) => m.len(),
            Err(_) => return Ok(()),
        };
        if size <= MAX_LOG_BYTES {
            return Ok(());
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let rotated = path.with_file_name(format!("process_{stamp}.log"));
        fs::rename(path, &rotated)?;
        tracing::info!(rotated = %rotated.display(), "rotated instance log file");

        if let Some(dir) = path.parent() {
            cleanup_rotated(dir);
        }
        Ok(())
    }

    /// Last `lines` lines of the current log file; empty when the file does
    /// not exist yet.
    pub fn tail(&self, instance_id: &str, lines: usize) -> Vec<String> {
        let Ok(text) = fs::read_to_string(self.log_path(instance_id)) else {
            return Vec::new();
        };
        let all: Vec<&str> = text.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].iter().map(|l| l.to_string()).collect()
    }

    /// Remove the instance's whole log directory.
    pub fn remove(&self, instance_id: &str) {
        let dir = self.dir(instance_id);
        if let Err(e) = fs::remove_dir_all(&dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove instance log dir");
        }
    }
}

/// Keep only the most recent rotated files (timestamped names sort
/// lexicographically).
fn cleanup_rotated(dir: &std::path::Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut rotated: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("process_") && n.ends_with(".log"))
        })
        .collect();
    if rotated.len() <= MAX_ROTATED_FILES {
        return;
    }
    rotated.sort();
    let excess = rotated.len() - MAX_ROTATED_FILES;
    for path in rotated.into_iter().take(excess) {
        let _ = fs::remove_file(path);
    }
}
