//! Extension materialization: drive the editor binary's own installer with
//! the instance's data directory as `XDG_DATA_HOME`, so extension state lands
//! under `data/<id>/`. Individual failures are recorded in lifecycle logs and
//! never abort instance creation.

use std::path::Path;
use std::sync::Arc;

use berth_instance::{Instance, LogLevel, LogSource};

use crate::logbus::LogBus;
use crate::logfile::InstanceLogs;

pub struct InstallOutcome {
    pub succeeded: usize,
    pub total: usize,
}

impl InstallOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}

pub async fn install_all(
    editor_bin: &str,
    bus: &Arc<LogBus>,
    files: &Arc<InstanceLogs>,
    instance: &Instance,
    extensions: &[String],
) -> InstallOutcome {
    let mut succeeded = 0;
    for (i, ext) in extensions.iter().enumerate() {
        tracing::info!(
            instance_id = %instance.id,
            extension = %ext,
            "installing extension {}/{}",
            i + 1,
            extensions.len()
        );
        match install_one(editor_bin, &instance.data_path, ext).await {
            Ok(()) => {
                succeeded += 1;
                let msg = format!("Installed extension {ext}");
                bus.lifecycle(&instance.id, &instance.name, LogLevel::Info, &msg);
                files.append(&instance.id, LogLevel::Info, LogSource::Lifecycle, &msg);
            }
            Err(e) => {
                let msg = format!("Failed to install extension {ext}: {e}");
                bus.lifecycle(&instance.id, &instance.name, LogLevel::Error, &msg);
                files.append(&instance.id, LogLevel::Error, LogSource::Lifecycle, &msg);
            }
        }
    }
    InstallOutcome {
        succeeded,
        total: extensions.len(),
    }
}

async fn install_one(editor_bin: &str, data_path: &Path, extension: &str) -> anyhow::Result<()> {
    let data_home = std::path::absolute(data_path).unwrap_or_else(|_| data_path.to_path_buf());
    let output = tokio::process::Command::new(editor_bin)
        .arg("--install-extension")
        .arg(extension)
        .env("XDG_DATA_HOME", &data_home)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "installer exited with {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(())
}
