//! Per-pid liveness and resource probes, plus the "who holds this port"
//! query used for best-effort port pre-cleanup. All readers are `/proc`
//! based; non-Linux builds degrade to "unknown".

#[cfg(target_os = "linux")]
use std::sync::OnceLock;

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn page_size() -> u64 {
    4096
}

/// Whether the pid refers to a live process. `kill(pid, 0)` succeeds for any
/// process we can signal; EPERM still means the process exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Cumulative user+system CPU ticks for a pid, from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
pub async fn read_cpu_ticks(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await.ok()?;
    // Skip past the parenthesized comm field, which may contain spaces.
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

#[cfg(not(target_os = "linux"))]
pub async fn read_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

/// Resident set size in bytes, from `/proc/<pid>/statm`.
#[cfg(target_os = "linux")]
pub async fn read_rss_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/statm")).await.ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

#[cfg(not(target_os = "linux"))]
pub async fn read_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

/// CPU usage percent over the interval between two tick samples.
pub fn cpu_percent(
    prev_ticks: u64,
    prev_at: tokio::time::Instant,
    ticks: u64,
    now: tokio::time::Instant,
) -> f64 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0.0;
    }
    let delta = ticks.saturating_sub(prev_ticks) as f64;
    let pct = (delta / ticks_per_sec() as f64) / dt * 100.0;
    if pct.is_finite() { pct.max(0.0) } else { 0.0 }
}

/// Parse one `/proc/net/tcp{,6}` entry. Returns the local port and socket
/// inode for sockets in LISTEN state (st == 0A).
fn parse_proc_net_tcp_line(line: &str) -> Option<(u16, u64)> {
    let mut fields = line.split_whitespace();
    let slot = fields.next()?;
    if !slot.ends_with(':') {
        return None;
    }
    let local = fields.next()?;
    let _remote = fields.next()?;
    let state = fields.next()?;
    if state != "0A" {
        return None;
    }
    let port_hex = local.rsplit(':').next()?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    // Remaining fields: tx/rx queue, tr/tm->when, retrnsmt, uid, timeout, inode.
    let inode: u64 = fields.nth(5)?.parse().ok()?;
    Some((port, inode))
}

#[cfg(target_os = "linux")]
async fn listening_inodes(port: u16) -> Vec<u64> {
    let mut inodes = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(s) = tokio::fs::read_to_string(table).await else {
            continue;
        };
        for line in s.lines() {
            if let Some((p, inode)) = parse_proc_net_tcp_line(line)
                && p == port
            {
                inodes.push(inode);
            }
        }
    }
    inodes
}

/// Enumerate pids with a socket listening on the given local TCP port, by
/// matching socket inodes against `/proc/<pid>/fd` links. Best-effort:
/// unreadable entries are skipped.
#[cfg(target_os = "linux")]
pub async fn pids_listening_on(port: u16) -> Vec<u32> {
    let inodes = listening_inodes(port).await;
    if inodes.is_empty() {
        return Vec::new();
    }

    let targets: Vec<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();
    let mut pids = Vec::new();

    let Ok(mut proc_dir) = tokio::fs::read_dir("/proc").await else {
        return pids;
    };
    while let Ok(Some(entry)) = proc_dir.next_entry().await {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let fd_dir = entry.path().join("fd");
        let Ok(mut fds) = tokio::fs::read_dir(&fd_dir).await else {
            continue;
        };
        while let Ok(Some(fd)) = fds.next_entry().await {
            let Ok(link) = tokio::fs::read_link(fd.path()).await else {
                continue;
            };
            if link
                .to_str()
                .is_some_and(|l| targets.iter().any(|t| t == l))
            {
                pids.push(pid);
                break;
            }
        }
    }
    pids
}

#[cfg(not(target_os = "linux"))]
pub async fn pids_listening_on(_port: u16) -> Vec<u32> {
    Vec::new()
}
