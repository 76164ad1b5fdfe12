//! Child process runner: spawn the editor binary in its own session, capture
//! stdout/stderr line-by-line into the log bus and per-instance log file, and
//! expose `wait()` as an exit disposition for the reaper.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use berth_instance::{LogLevel, LogSource};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::Error;
use crate::logbus::LogBus;
use crate::logfile::InstanceLogs;

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

impl SpawnSpec {
    /// The frozen argv snapshot recorded on the instance.
    pub fn command_line(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    Normal,
    NonZero(i32),
    Signaled,
}

/// Handle to a spawned child. Output capture tasks are already running; the
/// reaper consumes the handle via [`RunningChild::wait`].
#[derive(Debug)]
pub struct RunningChild {
    pub pid: u32,
    child: Child,
}

impl RunningChild {
    pub async fn wait(mut self) -> ExitDisposition {
        match self.child.wait().await {
            Ok(status) => match status.code() {
                Some(0) => ExitDisposition::Normal,
                Some(code) => ExitDisposition::NonZero(code),
                None => ExitDisposition::Signaled,
            },
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "wait on child failed");
                ExitDisposition::Signaled
            }
        }
    }
}

/// Identity handed to the output-capture tasks.
#[derive(Clone)]
pub struct CaptureTarget {
    pub instance_id: String,
    pub instance_name: String,
    pub bus: Arc<LogBus>,
    pub files: Arc<InstanceLogs>,
}

pub fn spawn(spec: &SpawnSpec, capture: CaptureTarget) -> Result<RunningChild, Error> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    // New session so the whole process tree can be signaled, and so the
    // child survives a supervisor restart (reconciliation picks it back up).
    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::SpawnFailed(format!("{}: {e}", spec.program)))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::SpawnFailed(format!("{}: no pid after spawn", spec.program)))?;

    if let Some(stdout) = child.stdout.take() {
        spawn_capture(stdout, LogSource::Stdout, LogLevel::Info, capture.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_capture(stderr, LogSource::Stderr, LogLevel::Warn, capture);
    }

    Ok(RunningChild { pid, child })
}

/// One capture task per stream. EOF ends capture quietly; read errors are
/// published at ERROR. Capture ending is not an exit signal; the reaper
/// waits on the process handle.
fn spawn_capture<R>(stream: R, source: LogSource, level: LogLevel, target: CaptureTarget)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    target.bus.output(
                        &target.instance_id,
                        &target.instance_name,
                        source,
                        level,
                        &line,
                    );
                    target
                        .files
                        .append(&target.instance_id, level, source, &line);
                }
                Ok(None) => break,
                Err(e) => {
                    let msg = format!("error reading {source:?} stream: {e}");
                    target.bus.output(
                        &target.instance_id,
                        &target.instance_name,
                        source,
                        LogLevel::Error,
                        &msg,
                    );
                    target
                        .files
                        .append(&target.instance_id, LogLevel::Error, source, &msg);
                    break;
                }
            }
        }
    });
}

/// Send a signal to the child's whole process group (it called `setsid`),
/// falling back to the pid itself if the group signal fails.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: i32) {
    let rc = unsafe { libc::kill(-(pid as i32), signal) };
    if rc == -1 {
        unsafe {
            libc::kill(pid as i32, signal);
        }
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: i32) {}

#[cfg(unix)]
pub fn terminate_group(pid: u32) {
    signal_group(pid, libc::SIGTERM);
}

#[cfg(unix)]
pub fn kill_group(pid: u32) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(not(unix))]
pub fn terminate_group(_pid: u32) {}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) {}

/// SIGKILL a single pid (not its group). Used against stranger processes
/// found squatting on a port we are about to hand to a child.
#[cfg(unix)]
pub fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_pid(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(bus: &Arc<LogBus>, files: &Arc<InstanceLogs>) -> CaptureTarget {
        CaptureTarget {
            instance_id: "inst-1".to_string(),
            instance_name: "alpha".to_string(),
            bus: bus.clone(),
            files: files.clone(),
        }
    }

    fn spec(program: &str, args: &[&str], cwd: &std::path::Path) -> SpawnSpec {
        SpawnSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
            cwd: cwd.to_path_buf(),
        }
    }

    #[test]
    fn command_line_includes_the_program() {
        let s = spec("code-server", &["--bind-addr", "0.0.0.0:8500"], std::path::Path::new("."));
        assert_eq!(
            s.command_line(),
            vec!["code-server", "--bind-addr", "0.0.0.0:8500"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_captures_stdout_and_reports_normal_exit() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(LogBus::new(64));
        let files = Arc::new(InstanceLogs::new(dir.path().join("logs")));

        let child = spawn(
            &spec("sh", &["-c", "echo ready; echo oops >&2"], dir.path()),
            capture(&bus, &files),
        )
        .unwrap();
        assert!(child.pid > 0);
        assert_eq!(child.wait().await, ExitDisposition::Normal);

        // Capture tasks run concurrently with wait; give them a beat.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let (records, _rx) = bus.subscribe(Some("inst-1".to_string()));
        let stdout: Vec<_> = records
            .iter()
            .filter(|r| r.source == LogSource::Stdout)
            .collect();
        let stderr: Vec<_> = records
            .iter()
            .filter(|r| r.source == LogSource::Stderr)
            .collect();
        assert_eq!(stdout.len(), 1);
        assert_eq!(stdout[0].message, "ready");
        assert_eq!(stdout[0].level, LogLevel::Info);
        assert_eq!(stderr.len(), 1);
        assert_eq!(stderr[0].level, LogLevel::Warn);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exits_are_distinguished_from_normal_ones() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(LogBus::new(64));
        let files = Arc::new(InstanceLogs::new(dir.path().join("logs")));

        let child = spawn(&spec("sh", &["-c", "exit 3"], dir.path()), capture(&bus, &files)).unwrap();
        assert_eq!(child.wait().await, ExitDisposition::NonZero(3));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(LogBus::new(64));
        let files = Arc::new(InstanceLogs::new(dir.path().join("logs")));

        let err = spawn(
            &spec("berth-no-such-binary", &[], dir.path()),
            capture(&bus, &files),
        )
        .unwrap_err();
        assert!(matches!(err, Error::SpawnFailed(_)));
    }
}
