//! Guest NUMA topology planning.
//!
//! Turns {nodes, cores, memory} into per-node memory backends bound to host
//! NUMA nodes. The host side is read through [`HostTopology`].

use crate::config::LaunchConfig;
use crate::error::LaunchError;
use crate::util::cpulist;
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Read-only view of the host's NUMA and CPU layout.
pub trait HostTopology {
    /// Highest online NUMA node id (0 on a single-node host).
    fn numa_node_max(&self) -> Result<u32>;

    /// Ids of all online CPUs.
    fn online_cpus(&self) -> Result<Vec<u32>>;

    /// Ids of the CPUs belonging to one NUMA node.
    fn node_cpus(&self, node: u32) -> Result<Vec<u32>>;
}

/// [`HostTopology`] backed by `/sys/devices/system`.
#[derive(Clone, Debug)]
pub struct SysfsHost {
    root: PathBuf,
}

impl Default for SysfsHost {
    fn default() -> Self {
        Self::new("/sys/devices/system")
    }
}

impl SysfsHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, rel: &str) -> Result<(PathBuf, String)> {
        let path = self.root.join(rel);
        let content = fs::read_to_string(&path).map_err(|e| LaunchError::HostTopology {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        Ok((path, content))
    }

    fn read_cpulist(&self, rel: &str) -> Result<Vec<u32>> {
        let (path, content) = self.read(rel)?;
        cpulist::parse(&content).map_err(|e| {
            LaunchError::HostTopology {
                path,
                detail: e.to_string(),
            }
            .into()
        })
    }
}

impl HostTopology for SysfsHost {
    fn numa_node_max(&self) -> Result<u32> {
        let (path, online) = self.read("node/online")?;
        parse_node_online(&path, &online)
    }

    fn online_cpus(&self) -> Result<Vec<u32>> {
        self.read_cpulist("cpu/online")
    }

    fn node_cpus(&self, node: u32) -> Result<Vec<u32>> {
        self.read_cpulist(&format!("node/node{node}/cpulist"))
    }
}

/// Parse `node/online`: either a single id or a `0-N` range.
fn parse_node_online(path: &Path, online: &str) -> Result<u32> {
    let online = online.trim();
    let bad = |detail: String| LaunchError::HostTopology {
        path: path.to_path_buf(),
        detail,
    };

    match online.split_once('-') {
        Some((low, high)) => {
            let low: u32 = low
                .trim()
                .parse()
                .map_err(|_| bad(format!("invalid node range '{online}'")))?;
            if low != 0 {
                return Err(bad(format!("node range '{online}' does not start at 0")).into());
            }
            Ok(high
                .trim()
                .parse()
                .map_err(|_| bad(format!("invalid node range '{online}'")))?)
        }
        None => Ok(online
            .parse()
            .map_err(|_| bad(format!("invalid node id '{online}'")))?),
    }
}

/// Memory and host binding of one guest NUMA node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAllocation {
    pub node_id: u32,
    /// Id of the `memory-backend-ram` object, `nmem<node_id>`.
    pub memory_object_id: String,
    pub memory_mib: u64,
    pub host_node_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyPlan {
    /// Ascending by `node_id`; empty for a flat SMP guest.
    pub nodes: Vec<NodeAllocation>,
    pub smp_sockets: u32,
    pub smp_max_cpus: u32,
}

impl TopologyPlan {
    /// Plan the guest topology.
    ///
    /// The host is only consulted when a NUMA layout is requested. Memory that
    /// does not divide evenly across nodes is truncated per node; the
    /// remainder is not assigned to any node.
    pub fn plan(config: &LaunchConfig, host: &impl HostTopology) -> Result<Self> {
        if !config.wants_numa() {
            return Ok(Self {
                nodes: Vec::new(),
                smp_sockets: 1,
                smp_max_cpus: config.core_count,
            });
        }

        let host_numa_node_max = host.numa_node_max()?;
        let mem_per_node = config.total_memory_mib / u64::from(config.node_count);

        let nodes = (0..config.node_count)
            .map(|node_id| NodeAllocation {
                node_id,
                memory_object_id: format!("nmem{node_id}"),
                memory_mib: mem_per_node,
                host_node_id: host_node_for(node_id, host_numa_node_max),
            })
            .collect();

        Ok(Self {
            nodes,
            smp_sockets: config.node_count,
            smp_max_cpus: config.core_count,
        })
    }

    pub fn is_numa(&self) -> bool {
        !self.nodes.is_empty()
    }
}

/// Guest node `i` lands on host node `i mod (max + 1)`.
fn host_node_for(node_id: u32, host_numa_node_max: u32) -> u32 {
    if host_numa_node_max == 0 {
        0
    } else {
        node_id % (host_numa_node_max + 1)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// In-memory host for planner and pinner tests.
    pub(crate) struct FakeHost {
        pub numa_node_max: u32,
        pub node_cpus: BTreeMap<u32, Vec<u32>>,
    }

    impl FakeHost {
        pub(crate) fn with_nodes(numa_node_max: u32) -> Self {
            Self {
                numa_node_max,
                node_cpus: BTreeMap::new(),
            }
        }
    }

    impl HostTopology for FakeHost {
        fn numa_node_max(&self) -> Result<u32> {
            Ok(self.numa_node_max)
        }

        fn online_cpus(&self) -> Result<Vec<u32>> {
            let mut cpus: Vec<u32> = self.node_cpus.values().flatten().copied().collect();
            cpus.sort_unstable();
            Ok(cpus)
        }

        fn node_cpus(&self, node: u32) -> Result<Vec<u32>> {
            Ok(self.node_cpus.get(&node).cloned().unwrap_or_default())
        }
    }

    /// Host whose topology must not be consulted.
    struct UnreachableHost;

    impl HostTopology for UnreachableHost {
        fn numa_node_max(&self) -> Result<u32> {
            anyhow::bail!("host queried")
        }
        fn online_cpus(&self) -> Result<Vec<u32>> {
            anyhow::bail!("host queried")
        }
        fn node_cpus(&self, _node: u32) -> Result<Vec<u32>> {
            anyhow::bail!("host queried")
        }
    }

    fn config(nodes: u32, cores: u32, memory: u64) -> LaunchConfig {
        LaunchConfig {
            node_count: nodes,
            core_count: cores,
            total_memory_mib: memory,
            ..LaunchConfig::default()
        }
    }

    #[test]
    fn test_two_nodes_on_two_node_host() {
        let plan = TopologyPlan::plan(&config(2, 4, 1024), &FakeHost::with_nodes(1)).unwrap();
        assert_eq!(plan.nodes.len(), 2);
        assert_eq!(plan.nodes[0].memory_mib, 512);
        assert_eq!(plan.nodes[1].memory_mib, 512);
        assert_eq!(plan.nodes[0].host_node_id, 0);
        assert_eq!(plan.nodes[1].host_node_id, 1);
        assert_eq!(plan.nodes[1].memory_object_id, "nmem1");
        assert_eq!(plan.smp_sockets, 2);
        assert_eq!(plan.smp_max_cpus, 4);
    }

    #[test]
    fn test_single_node_host_binds_everything_to_zero() {
        let plan = TopologyPlan::plan(&config(4, 8, 4096), &FakeHost::with_nodes(0)).unwrap();
        assert!(plan.nodes.iter().all(|n| n.host_node_id == 0));
    }

    #[test]
    fn test_host_binding_wraps() {
        for max in 1..5 {
            let plan = TopologyPlan::plan(&config(7, 8, 7000), &FakeHost::with_nodes(max)).unwrap();
            for (i, node) in plan.nodes.iter().enumerate() {
                assert_eq!(node.node_id, i as u32);
                assert_eq!(node.host_node_id, i as u32 % (max + 1));
            }
        }
    }

    #[test]
    fn test_uneven_memory_truncates() {
        for nodes in 1..9u32 {
            for memory in [1u64, 7, 1000, 1023, 4099] {
                let plan =
                    TopologyPlan::plan(&config(nodes, 2, memory), &FakeHost::with_nodes(1))
                        .unwrap();
                assert_eq!(plan.nodes.len(), nodes as usize);
                let sum: u64 = plan.nodes.iter().map(|n| n.memory_mib).sum();
                assert!(sum <= memory);
                assert!(memory - sum < u64::from(nodes));
            }
        }
    }

    #[test]
    fn test_flat_smp_without_nodes() {
        let plan = TopologyPlan::plan(&config(0, 1, 1024), &UnreachableHost).unwrap();
        assert!(!plan.is_numa());
        assert_eq!(plan.smp_sockets, 1);
    }

    #[test]
    fn test_flat_smp_with_single_core() {
        let plan = TopologyPlan::plan(&config(4, 1, 1024), &UnreachableHost).unwrap();
        assert!(plan.nodes.is_empty());
        assert_eq!(plan.smp_sockets, 1);
    }

    #[test]
    fn test_host_error_propagates() {
        assert!(TopologyPlan::plan(&config(2, 2, 1024), &UnreachableHost).is_err());
    }

    #[test]
    fn test_sysfs_node_online_forms() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("node")).unwrap();
        let host = SysfsHost::new(dir.path());

        fs::write(dir.path().join("node/online"), "0\n").unwrap();
        assert_eq!(host.numa_node_max().unwrap(), 0);

        fs::write(dir.path().join("node/online"), "0-3\n").unwrap();
        assert_eq!(host.numa_node_max().unwrap(), 3);

        fs::write(dir.path().join("node/online"), "1-3\n").unwrap();
        let err = host.numa_node_max().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LaunchError>(),
            Some(LaunchError::HostTopology { .. })
        ));
    }

    #[test]
    fn test_sysfs_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let host = SysfsHost::new(dir.path());
        assert!(host.numa_node_max().is_err());
        assert!(host.online_cpus().is_err());
    }

    #[test]
    fn test_sysfs_cpulists() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("cpu")).unwrap();
        fs::create_dir_all(dir.path().join("node/node1")).unwrap();
        fs::write(dir.path().join("cpu/online"), "0-7\n").unwrap();
        fs::write(dir.path().join("node/node1/cpulist"), "4-7\n").unwrap();

        let host = SysfsHost::new(dir.path());
        assert_eq!(host.online_cpus().unwrap().len(), 8);
        assert_eq!(host.node_cpus(1).unwrap(), vec![4, 5, 6, 7]);
    }
}
