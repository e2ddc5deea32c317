//! Cgroup v2 resource-limit manager.
//!
//! Every VM hosts exactly one container, but its processes still live under
//! a dedicated cgroup directory rather than the mount root: the root cgroup
//! is where subtree controllers get toggled, and cgroup v2's "no internal
//! processes" rule means a cgroup with subtree control enabled on it can't
//! also hold tasks directly. [`Manager`] owns `/sys/fs/cgroup/<id>` and every
//! operation the host can ask for on it.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Root of the cgroup v2 unified hierarchy.
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Controllers this manager knows how to toggle.
const CONTROLLERS: &[&str] = &["cpu", "memory", "io", "pids"];

/// Cgroup id for the single container this VM hosts.
pub const CONTAINER_ID: &str = "container";

/// The container's cgroup manager, set once by [`setup_container`] at boot.
static CONTAINER_CGROUP: OnceLock<Manager> = OnceLock::new();

/// Resource limits to write to a container's cgroup control files.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resources {
    /// Memory ceiling in bytes, written to `memory.max`.
    pub mem_max: Option<u64>,
    /// CFS quota in microseconds, written together with `cpu_period_us` as
    /// `"<quota> <period>"` to `cpu.max`.
    pub cpu_quota_us: Option<u64>,
    /// CFS period in microseconds.
    pub cpu_period_us: Option<u64>,
    /// Max number of tasks/processes, written to `pids.max`.
    pub pids_max: Option<u32>,
}

/// A single container's cgroup v2 directory and the operations on it.
#[derive(Debug, Clone)]
pub struct Manager {
    id: String,
}

impl Manager {
    /// Creates `/sys/fs/cgroup/<id>` (`mkdir -p`, mode 0o755).
    pub fn create(id: impl Into<String>) -> io::Result<Self> {
        let id = id.into();
        let dir = Path::new(CGROUP_ROOT).join(&id);
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
        Ok(Self { id })
    }

    fn path(&self) -> PathBuf {
        Path::new(CGROUP_ROOT).join(&self.id)
    }

    /// Enables or disables `list` on the root and every non-leaf ancestor
    /// down to this cgroup, leaving the leaf itself untouched so
    /// `cgroup.procs` stays writable there.
    pub fn toggle_subtree_controllers(&self, list: &[&str], enable: bool) {
        if list.is_empty() {
            return;
        }
        let sign = if enable { '+' } else { '-' };
        let mut dir = PathBuf::from(CGROUP_ROOT);
        write_subtree_control(&dir, list, sign);

        let parts: Vec<&str> = self.id.split('/').filter(|s| !s.is_empty()).collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            dir.push(part);
            write_subtree_control(&dir, list, sign);
        }
    }

    /// Reads `cgroup.controllers` and enables every recognized controller.
    pub fn toggle_all_available_controllers(&self, enable: bool) {
        let available = fs::read_to_string(Path::new(CGROUP_ROOT).join("cgroup.controllers"))
            .unwrap_or_default();
        let list: Vec<&str> = CONTROLLERS
            .iter()
            .copied()
            .filter(|c| available.split_whitespace().any(|a| a == *c))
            .collect();
        self.toggle_subtree_controllers(&list, enable);
    }

    /// Writes `pid` to `cgroup.procs`, retrying on `EINTR`.
    pub fn add_process(&self, pid: i32) -> io::Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(self.path().join("cgroup.procs"))?;
        let data = pid.to_string();
        let bytes = data.as_bytes();
        loop {
            let ret = unsafe { libc::write(file.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Writes `memory.max`, `cpu.max`, and `pids.max` from `resources`.
    pub fn apply_resources(&self, resources: &Resources) -> io::Result<()> {
        let dir = self.path();
        if let Some(mem) = resources.mem_max {
            let _ = fs::write(dir.join("memory.max"), mem.to_string());
        }
        if let Some(cpu_max) = format_cpu_max(resources) {
            let _ = fs::write(dir.join("cpu.max"), cpu_max);
        }
        if let Some(pids) = resources.pids_max {
            let _ = fs::write(dir.join("pids.max"), pids.to_string());
        }
        Ok(())
    }

    /// Writes `1` to `cgroup.kill`, SIGKILLing every task in the cgroup.
    pub fn kill(&self) -> io::Result<()> {
        fs::write(self.path().join("cgroup.kill"), "1")
    }

    /// Removes the cgroup directory, killing its tasks first if `force`.
    pub fn delete(&self, force: bool) -> io::Result<()> {
        if force {
            let _ = self.kill();
        }
        fs::remove_dir(self.path())
    }

    /// Reads current resource usage from the cgroup's stat files.
    #[allow(clippy::cast_possible_truncation)]
    pub fn stats(&self) -> Stats {
        let dir = self.path();
        let cpu_usage_usec = fs::read_to_string(dir.join("cpu.stat"))
            .ok()
            .and_then(|s| {
                s.lines()
                    .find_map(|l| l.strip_prefix("usage_usec "))
                    .and_then(|v| v.trim().parse().ok())
            })
            .unwrap_or(0);

        Stats {
            mem_current: read_u64(&dir.join("memory.current")).unwrap_or(0),
            mem_max: read_limit(&dir.join("memory.max")),
            cpu_usage_usec,
            pids_current: read_u64(&dir.join("pids.current")).unwrap_or(0),
            pids_max: read_limit(&dir.join("pids.max")),
        }
    }
}

/// Snapshot of a container's cgroup resource usage, for `bux inspect`-style
/// reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Current memory usage in bytes (`memory.current`).
    pub mem_current: u64,
    /// Configured memory ceiling (`memory.max`); `u64::MAX` if `"max"`.
    pub mem_max: u64,
    /// Total CPU time consumed in microseconds (`cpu.stat`'s `usage_usec`).
    pub cpu_usage_usec: u64,
    /// Current number of tasks in the cgroup (`pids.current`).
    pub pids_current: u64,
    /// Configured task ceiling (`pids.max`); `u64::MAX` if `"max"`.
    pub pids_max: u64,
}

/// Creates the container's cgroup, enables every available controller, and
/// applies `resources`. A no-op if cgroup v2 isn't mounted.
pub fn setup_container(resources: &Resources) -> io::Result<()> {
    if !Path::new(CGROUP_ROOT).join("cgroup.controllers").exists() {
        return Ok(());
    }
    let mgr = Manager::create(CONTAINER_ID)?;
    mgr.toggle_all_available_controllers(true);
    mgr.apply_resources(resources)?;
    let _ = CONTAINER_CGROUP.set(mgr);
    Ok(())
}

/// Adds `pid` to the container's cgroup, if [`setup_container`] ran. Called
/// once a spawned process's real PID is known, mirroring `ManagedProcess`
/// placing the child in its cgroup before acking the caller.
pub fn add_current_process(pid: i32) {
    if let Some(mgr) = CONTAINER_CGROUP.get() {
        let _ = mgr.add_process(pid);
    }
}

/// Formats `cpu.max`'s `"<quota> <period>"` body, defaulting the period to
/// the standard 100ms CFS window when only a quota was given.
fn format_cpu_max(resources: &Resources) -> Option<String> {
    if resources.cpu_quota_us.is_none() && resources.cpu_period_us.is_none() {
        return None;
    }
    let period = resources.cpu_period_us.unwrap_or(100_000);
    let quota = resources.cpu_quota_us.unwrap_or(period);
    Some(format!("{quota} {period}"))
}

/// Reads a single `u64` value from a cgroup control file.
fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Reads a cgroup limit file, mapping the literal `"max"` to `u64::MAX`.
fn read_limit(path: &Path) -> u64 {
    match fs::read_to_string(path) {
        Ok(s) if s.trim() == "max" => u64::MAX,
        Ok(s) => s.trim().parse().unwrap_or(u64::MAX),
        Err(_) => u64::MAX,
    }
}

/// Writes `{sign}{controller}` to `dir`'s `cgroup.subtree_control`, one
/// controller at a time. Individual failures are non-fatal — a container
/// without e.g. the `io` controller still runs fine.
fn write_subtree_control(dir: &Path, list: &[&str], sign: char) {
    let file = dir.join("cgroup.subtree_control");
    for ctrl in list {
        let _ = fs::write(&file, format!("{sign}{ctrl}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_limit_parses_max_as_u64_max() {
        let dir = std::env::temp_dir().join(format!("bux-cgroup-test-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("memory.max");

        fs::write(&path, "max").expect("write");
        assert_eq!(read_limit(&path), u64::MAX);

        fs::write(&path, "536870912").expect("write");
        assert_eq!(read_limit(&path), 536_870_912);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn format_cpu_max_matches_worked_example() {
        // cpus=2 at the default 100ms CFS period reads back as "200000 100000".
        let resources = Resources {
            cpu_quota_us: Some(200_000),
            cpu_period_us: Some(100_000),
            ..Default::default()
        };
        assert_eq!(format_cpu_max(&resources).as_deref(), Some("200000 100000"));
    }

    #[test]
    fn format_cpu_max_defaults_period_when_only_quota_given() {
        let resources = Resources {
            cpu_quota_us: Some(50_000),
            ..Default::default()
        };
        assert_eq!(format_cpu_max(&resources).as_deref(), Some("50000 100000"));
    }

    #[test]
    fn format_cpu_max_none_when_unset() {
        assert!(format_cpu_max(&Resources::default()).is_none());
    }
}
