//! Process liveness and memory probes backed by `/proc` and `kill(2)`.

#[cfg(target_os = "linux")]
use once_cell::sync::Lazy;

#[cfg(target_os = "linux")]
static PAGE_SIZE: Lazy<u64> = Lazy::new(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 4096 }
});

/// Resident set size in bytes, sampled from `/proc/<pid>/statm`. Returns
/// `None` when the process is gone or the platform has no procfs.
#[cfg(target_os = "linux")]
pub fn rss_bytes(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident * *PAGE_SIZE)
}

#[cfg(not(target_os = "linux"))]
pub fn rss_bytes(_pid: u32) -> Option<u64> {
    None
}

pub fn current_rss_bytes() -> Option<u64> {
    rss_bytes(std::process::id())
}

/// Signal-zero probe. EPERM still means the process exists.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn own_rss_is_nonzero() {
        let rss = current_rss_bytes().expect("statm readable");
        assert!(rss > 0);
    }

    #[test]
    #[cfg(unix)]
    fn detects_own_process() {
        assert!(process_exists(std::process::id()));
    }

    #[test]
    #[cfg(unix)]
    fn reaped_child_no_longer_exists() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(!process_exists(pid));
    }
}
