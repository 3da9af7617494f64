//! Pin the guest's vCPU threads to dedicated host cores.
//!
//! Pinning is an optimization: callers log a failure and carry on.

use crate::config::AffinitySettings;
use crate::qemu::topology::HostTopology;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

/// Prefix QEMU gives vCPU thread names with `debug-threads=on` ("CPU 0/KVM").
const VCPU_THREAD_PREFIX: &str = "CPU ";

/// How the wait for vCPU threads ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// At least the requested number of vCPU threads exist.
    Ready(usize),
    /// Deadline hit with only this many vCPU threads.
    TimedOut(usize),
    /// The process exited (zombie awaiting reap) before enough vCPUs showed up.
    Exited(usize),
    /// Threads of the process can't be enumerated.
    Unavailable,
}

pub struct AffinityPinner<'a, H> {
    settings: &'a AffinitySettings,
    host: &'a H,
    proc_root: PathBuf,
    cwd: PathBuf,
}

impl<'a, H: HostTopology> AffinityPinner<'a, H> {
    pub fn new(settings: &'a AffinitySettings, host: &'a H, cwd: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            host,
            proc_root: PathBuf::from("/proc"),
            cwd: cwd.into(),
        }
    }

    #[cfg(test)]
    fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    /// Bind the vCPU threads of `pid` to `core_count` interleaved host cores.
    pub fn pin(&self, pid: u32, core_count: u32) -> Result<()> {
        match self.wait_for_vcpus(pid, core_count as usize) {
            Readiness::Ready(n) => tracing::debug!(threads = n, "vCPU threads up"),
            Readiness::TimedOut(n) => {
                tracing::warn!(threads = n, wanted = core_count, "not all vCPU threads appeared in time");
            }
            Readiness::Exited(n) => {
                bail!("guest pid {pid} exited with {n} of {core_count} vCPU threads up");
            }
            Readiness::Unavailable => {
                tracing::debug!("can't enumerate guest threads, sleeping instead");
                thread::sleep(Duration::from_millis(self.settings.fallback_delay_ms));
            }
        }

        let available = self
            .host
            .online_cpus()
            .context("Failed to query host CPUs")?
            .len();
        if core_count as usize > available {
            bail!("asked to pin {core_count} vCPUs but the host has only {available} cores");
        }

        let cores = self.allocate_cores(core_count)?;
        tracing::info!("QEMU affinity {}", join(&cores));
        self.run_helper(pid, &cores)
    }

    /// Poll the thread list of `pid` until `wanted` vCPU threads exist.
    pub fn wait_for_vcpus(&self, pid: u32, wanted: usize) -> Readiness {
        let deadline = Instant::now() + Duration::from_millis(self.settings.ready_timeout_ms);
        let interval = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        let proc_dir = self.proc_root.join(pid.to_string());
        let task_dir = proc_dir.join("task");

        loop {
            let Some(found) = count_vcpu_threads(&task_dir) else {
                return Readiness::Unavailable;
            };
            if found >= wanted {
                return Readiness::Ready(found);
            }
            // An unreaped child keeps its task dir around.
            if has_exited(&proc_dir) {
                return Readiness::Exited(found);
            }
            if Instant::now() >= deadline {
                return Readiness::TimedOut(found);
            }
            thread::sleep(interval);
        }
    }

    /// Core ids from the external allocator, or computed from host topology
    /// when it isn't installed.
    fn allocate_cores(&self, core_count: u32) -> Result<Vec<u32>> {
        match which::which(&self.settings.corealloc) {
            Ok(corealloc) => {
                let output = Command::new(&corealloc)
                    .args(["-c", &core_count.to_string(), "-t", "interleave"])
                    .output()
                    .with_context(|| format!("Failed to run {}", corealloc.display()))?;
                if !output.status.success() {
                    bail!("{} exited with {}", corealloc.display(), output.status);
                }
                parse_core_list(&String::from_utf8_lossy(&output.stdout))
            }
            Err(_) => {
                tracing::debug!("{} not found, interleaving cores in-process", self.settings.corealloc);
                interleave_cores(self.host, core_count)
            }
        }
    }

    fn run_helper(&self, pid: u32, cores: &[u32]) -> Result<()> {
        let Some((program, helper_args)) = self.settings.helper.split_first() else {
            bail!("no affinity helper configured");
        };

        let mut cmd = Command::new(program);
        cmd.current_dir(&self.cwd)
            .args(helper_args)
            .arg("-k")
            .args(cores.iter().map(u32::to_string))
            .arg("--")
            .arg(pid.to_string());

        let status = cmd
            .status()
            .with_context(|| format!("Failed to run affinity helper {program}"))?;
        if !status.success() {
            bail!("affinity helper {program} exited with {status}");
        }
        Ok(())
    }
}

fn count_vcpu_threads(task_dir: &Path) -> Option<usize> {
    let entries = fs::read_dir(task_dir).ok()?;
    let count = entries
        .filter_map(Result::ok)
        .filter_map(|entry| fs::read_to_string(entry.path().join("comm")).ok())
        .filter(|comm| comm.starts_with(VCPU_THREAD_PREFIX))
        .count();
    Some(count)
}

/// True once `/proc/<pid>/stat` reports the process as zombie or dead.
fn has_exited(proc_dir: &Path) -> bool {
    let Ok(stat) = fs::read_to_string(proc_dir.join("stat")) else {
        return false;
    };
    // "pid (comm) S ...": comm may itself contain parentheses
    let state = stat
        .rfind(')')
        .and_then(|end| stat[end + 1..].split_whitespace().next());
    matches!(state, Some("Z" | "X"))
}

/// Parse whitespace-separated core ids as printed by `corealloc`.
fn parse_core_list(list: &str) -> Result<Vec<u32>> {
    list.split_whitespace()
        .map(|id| {
            id.parse()
                .with_context(|| format!("invalid core id '{id}' from corealloc"))
        })
        .collect()
}

/// Round-robin over host NUMA nodes so consecutive vCPUs land on different
/// nodes: node0[0], node1[0], node0[1], node1[1], ...
pub fn interleave_cores(host: &impl HostTopology, core_count: u32) -> Result<Vec<u32>> {
    let node_max = host.numa_node_max()?;
    let per_node = (0..=node_max)
        .map(|node| host.node_cpus(node))
        .collect::<Result<Vec<_>>>()?;

    let wanted = core_count as usize;
    let deepest = per_node.iter().map(Vec::len).max().unwrap_or(0);
    let cores: Vec<u32> = (0..deepest)
        .flat_map(|depth| per_node.iter().filter_map(move |cpus| cpus.get(depth).copied()))
        .take(wanted)
        .collect();

    if cores.len() < wanted {
        bail!("host has only {} cores, {core_count} requested", cores.len());
    }
    Ok(cores)
}

fn join(cores: &[u32]) -> String {
    cores
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qemu::topology::tests::FakeHost;

    fn two_node_host() -> FakeHost {
        let mut host = FakeHost::with_nodes(1);
        host.node_cpus.insert(0, vec![0, 1, 2, 3]);
        host.node_cpus.insert(1, vec![4, 5, 6, 7]);
        host
    }

    fn fast_settings() -> AffinitySettings {
        AffinitySettings {
            corealloc: "definitely-not-installed-corealloc".into(),
            ready_timeout_ms: 50,
            poll_interval_ms: 5,
            fallback_delay_ms: 1,
            ..AffinitySettings::default()
        }
    }

    fn fake_proc(threads: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (tid, comm) in threads.iter().enumerate() {
            let task = dir.path().join("42/task").join((100 + tid).to_string());
            fs::create_dir_all(&task).unwrap();
            fs::write(task.join("comm"), format!("{comm}\n")).unwrap();
        }
        dir
    }

    #[test]
    fn test_interleave_two_nodes() {
        let host = two_node_host();
        assert_eq!(interleave_cores(&host, 4).unwrap(), vec![0, 4, 1, 5]);
        assert_eq!(interleave_cores(&host, 3).unwrap(), vec![0, 4, 1]);
    }

    #[test]
    fn test_interleave_uneven_nodes() {
        let mut host = FakeHost::with_nodes(1);
        host.node_cpus.insert(0, vec![0, 1, 2]);
        host.node_cpus.insert(1, vec![8]);
        assert_eq!(interleave_cores(&host, 4).unwrap(), vec![0, 8, 1, 2]);
    }

    #[test]
    fn test_interleave_too_many() {
        assert!(interleave_cores(&two_node_host(), 9).is_err());
    }

    #[test]
    fn test_parse_core_list() {
        assert_eq!(parse_core_list("0 4 1 5\n").unwrap(), vec![0, 4, 1, 5]);
        assert!(parse_core_list("0 x").is_err());
    }

    #[test]
    fn test_vcpus_ready() {
        let proc_root = fake_proc(&["qemu-system-x86", "CPU 0/KVM", "CPU 1/KVM", "worker"]);
        let settings = fast_settings();
        let host = two_node_host();
        let pinner = AffinityPinner::new(&settings, &host, ".").with_proc_root(proc_root.path());
        assert_eq!(pinner.wait_for_vcpus(42, 2), Readiness::Ready(2));
    }

    #[test]
    fn test_vcpus_time_out() {
        let proc_root = fake_proc(&["qemu-system-x86", "CPU 0/KVM"]);
        let settings = fast_settings();
        let host = two_node_host();
        let pinner = AffinityPinner::new(&settings, &host, ".").with_proc_root(proc_root.path());
        assert_eq!(pinner.wait_for_vcpus(42, 4), Readiness::TimedOut(1));
    }

    #[test]
    fn test_vcpus_zombie_stops_early() {
        let proc_root = fake_proc(&["qemu-system-x86"]);
        fs::write(
            proc_root.path().join("42/stat"),
            "42 (qemu (x86)) Z 1 42 42 0 -1\n",
        )
        .unwrap();
        let settings = AffinitySettings {
            ready_timeout_ms: 60_000,
            ..fast_settings()
        };
        let host = two_node_host();
        let pinner = AffinityPinner::new(&settings, &host, ".").with_proc_root(proc_root.path());

        let started = Instant::now();
        assert_eq!(pinner.wait_for_vcpus(42, 2), Readiness::Exited(0));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(pinner.pin(42, 2).is_err());
    }

    #[test]
    fn test_vcpus_exited_child_not_waited_out() {
        let mut child = Command::new("/bin/true").spawn().unwrap();
        let settings = AffinitySettings {
            ready_timeout_ms: 60_000,
            ..fast_settings()
        };
        let host = two_node_host();
        let pinner = AffinityPinner::new(&settings, &host, ".");

        let started = Instant::now();
        assert_eq!(pinner.wait_for_vcpus(child.id(), 1), Readiness::Exited(0));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(child.wait().unwrap().success());
    }

    #[test]
    fn test_running_process_is_not_exited() {
        let proc_root = fake_proc(&["qemu-system-x86"]);
        fs::write(proc_root.path().join("42/stat"), "42 (qemu) S 1 42\n").unwrap();
        assert!(!has_exited(&proc_root.path().join("42")));
        assert!(!has_exited(&proc_root.path().join("43")));
    }

    #[test]
    fn test_vcpus_unavailable() {
        let proc_root = tempfile::tempdir().unwrap();
        let settings = fast_settings();
        let host = two_node_host();
        let pinner = AffinityPinner::new(&settings, &host, ".").with_proc_root(proc_root.path());
        assert_eq!(pinner.wait_for_vcpus(42, 1), Readiness::Unavailable);
    }

    #[test]
    fn test_pin_invokes_helper_with_cores_and_pid() {
        let proc_root = fake_proc(&["CPU 0/KVM", "CPU 1/KVM"]);
        let out = tempfile::tempdir().unwrap();
        let record = out.path().join("args");
        let settings = AffinitySettings {
            helper: vec![
                "/bin/sh".into(),
                "-c".into(),
                format!("echo \"$@\" > {}", record.display()),
                "helper".into(),
            ],
            ..fast_settings()
        };
        let host = two_node_host();
        let pinner = AffinityPinner::new(&settings, &host, out.path()).with_proc_root(proc_root.path());

        pinner.pin(42, 2).unwrap();
        assert_eq!(fs::read_to_string(&record).unwrap().trim(), "-k 0 4 -- 42");
    }

    #[test]
    fn test_pin_rejects_more_cores_than_host() {
        let proc_root = fake_proc(&[]);
        let settings = AffinitySettings {
            helper: vec!["/bin/false".into()],
            ..fast_settings()
        };
        let host = two_node_host();
        let pinner = AffinityPinner::new(&settings, &host, ".").with_proc_root(proc_root.path());
        assert!(pinner.pin(42, 16).is_err());
    }

    #[test]
    fn test_failing_helper_is_error() {
        let proc_root = fake_proc(&["CPU 0/KVM"]);
        let settings = AffinitySettings {
            helper: vec!["/bin/false".into()],
            ..fast_settings()
        };
        let host = two_node_host();
        let pinner = AffinityPinner::new(&settings, &host, ".").with_proc_root(proc_root.path());
        assert!(pinner.pin(42, 1).is_err());
    }
}
