//! CPU/RSS sampling of a child process via procfs.

use std::sync::OnceLock;

use tokio::time::Instant;

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

pub(crate) fn host_cores() -> usize {
    static CORES: OnceLock<usize> = OnceLock::new();
    *CORES.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

#[cfg(target_os = "linux")]
async fn read_proc_cpu_ticks(pid: u32) -> Option<u64> {
    let stat_path = format!("/proc/{pid}/stat");
    let s = tokio::fs::read_to_string(stat_path).await.ok()?;
    parse_stat_cpu_ticks(&s)
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
async fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let statm_path = format!("/proc/{pid}/statm");
    let s = tokio::fs::read_to_string(statm_path).await.ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

/// utime + stime from a `/proc/<pid>/stat` line. The command name may contain spaces, so
/// fields are counted from the closing parenthesis.
fn parse_stat_cpu_ticks(stat: &str) -> Option<u64> {
    let end = stat.rfind(')')?;
    let rest = stat.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

/// Host share in percent: 100 means every core is saturated.
fn cpu_share_percent(delta_ticks: u64, elapsed_secs: f64, cores: usize) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    let single_core = (delta_ticks as f64 / ticks_per_sec() as f64) / elapsed_secs * 100.0;
    let share = single_core / cores.max(1) as f64;
    if share.is_finite() {
        share.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Sample {
    pub(crate) cpu: f64,
    pub(crate) rss_bytes: u64,
}

#[derive(Debug)]
pub(crate) struct ResourceSampler {
    pid: u32,
    last: Option<(u64, Instant)>,
}

impl ResourceSampler {
    pub(crate) fn new(pid: u32) -> Self {
        Self { pid, last: None }
    }

    /// `None` once the process is gone (or procfs is unavailable).
    pub(crate) async fn sample(&mut self) -> Option<Sample> {
        let now = Instant::now();
        let ticks = read_proc_cpu_ticks(self.pid).await?;
        let rss_bytes = read_proc_rss_bytes(self.pid).await.unwrap_or(0);

        let cpu = self
            .last
            .map(|(prev_ticks, prev_at)| {
                cpu_share_percent(
                    ticks.saturating_sub(prev_ticks),
                    now.duration_since(prev_at).as_secs_f64(),
                    host_cores(),
                )
            })
            .unwrap_or(0.0);
        self.last = Some((ticks, now));

        Some(Sample { cpu, rss_bytes })
    }
}
