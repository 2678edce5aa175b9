//! NUMA topology discovery and CPU affinity assignment.
//!
//! There is no NUMA crate in this codebase's dependency stack, so discovery
//! reads the kernel's own stable interface directly: `/sys/devices/system/node`.
//! On non-Linux targets (or when that directory is absent) the whole machine
//! is reported as a single node.

use std::fs;
use std::path::Path;

const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

#[derive(Debug, Clone)]
pub struct NumaNode {
    pub id: u32,
    pub cpu_ids: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct NumaTopology {
    pub enabled: bool,
    pub nodes: Vec<NumaNode>,
}

impl NumaTopology {
    /// Discover the machine's NUMA topology, falling back to a single
    /// pseudo-node spanning every logical CPU when real nodes can't be found.
    pub fn discover() -> Self {
        Self::discover_from(Path::new(SYSFS_NODE_ROOT)).unwrap_or_else(Self::single_node)
    }

    fn discover_from(root: &Path) -> Option<Self> {
        let entries = fs::read_dir(root).ok()?;
        let mut nodes = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_str()?;
            let Some(id_str) = name.strip_prefix("node") else {
                continue;
            };
            let Ok(id) = id_str.parse::<u32>() else {
                continue;
            };
            let cpulist_path = entry.path().join("cpulist");
            let cpu_ids = fs::read_to_string(&cpulist_path)
                .ok()
                .map(|s| parse_cpulist(s.trim()))
                .unwrap_or_default();
            if !cpu_ids.is_empty() {
                nodes.push(NumaNode { id, cpu_ids });
            }
        }
        nodes.sort_by_key(|n| n.id);
        if nodes.len() < 2 {
            return None;
        }
        Some(NumaTopology {
            enabled: true,
            nodes,
        })
    }

    fn single_node() -> Self {
        let cpu_ids = (0..num_cpus::get() as u32).collect();
        NumaTopology {
            enabled: false,
            nodes: vec![NumaNode { id: 0, cpu_ids }],
        }
    }

    /// Round-robin assignment of `num_threads` workers across nodes, and
    /// within each node across its CPU list.
    pub fn assign(&self, num_threads: usize) -> ThreadAssignment {
        let node_count = self.nodes.len();
        let mut thread_to_node = Vec::with_capacity(num_threads);
        let mut thread_to_cpu = Vec::with_capacity(num_threads);
        let mut per_node_cursor = vec![0usize; node_count];

        for i in 0..num_threads {
            let node_idx = i % node_count;
            let node = &self.nodes[node_idx];
            let cursor = &mut per_node_cursor[node_idx];
            let cpu = node.cpu_ids[*cursor % node.cpu_ids.len()];
            *cursor += 1;
            thread_to_node.push(self.nodes[node_idx].id);
            thread_to_cpu.push(cpu);
        }

        ThreadAssignment {
            thread_to_node,
            thread_to_cpu,
        }
    }
}

/// Per-worker node and CPU placement computed by [`NumaTopology::assign`].
#[derive(Debug, Clone)]
pub struct ThreadAssignment {
    pub thread_to_node: Vec<u32>,
    pub thread_to_cpu: Vec<u32>,
}

impl ThreadAssignment {
    /// Count of threads `j < i` sharing `i`'s node, i.e. this thread's
    /// index into that node's own VM list.
    pub fn rank_within_node(&self, i: usize) -> usize {
        let node = self.thread_to_node[i];
        self.thread_to_node[..i].iter().filter(|&&n| n == node).count()
    }
}

fn parse_cpulist(s: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                cpus.extend(lo..=hi);
            }
        } else if let Ok(cpu) = part.parse::<u32>() {
            cpus.push(cpu);
        }
    }
    cpus
}

/// Pin the calling thread to a single CPU. Best-effort: failure is logged
/// by the caller and otherwise ignored.
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(cpu_id: u32) -> bool {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu_id as usize, &mut set);
        let ret = libc::sched_setaffinity(
            0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set as *const libc::cpu_set_t,
        );
        ret == 0
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(_cpu_id: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_cpulist() {
        assert_eq!(parse_cpulist("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0,2,4"), vec![0, 2, 4]);
        assert_eq!(parse_cpulist("0-1,4-5"), vec![0, 1, 4, 5]);
    }

    #[test]
    fn single_node_covers_all_cpus() {
        let topo = NumaTopology::single_node();
        assert!(!topo.enabled);
        assert_eq!(topo.nodes.len(), 1);
        assert_eq!(topo.nodes[0].cpu_ids.len(), num_cpus::get());
    }

    #[test]
    fn assignment_is_balanced_round_robin() {
        let topo = NumaTopology {
            enabled: true,
            nodes: vec![
                NumaNode { id: 0, cpu_ids: vec![0, 1] },
                NumaNode { id: 1, cpu_ids: vec![2, 3] },
            ],
        };
        let assign = topo.assign(4);
        assert_eq!(assign.thread_to_node, vec![0, 1, 0, 1]);
        assert_eq!(assign.rank_within_node(0), 0);
        assert_eq!(assign.rank_within_node(2), 1);
        assert_eq!(assign.rank_within_node(3), 1);
    }

    #[test]
    fn assignment_wraps_cpu_list_when_threads_exceed_cpus() {
        let topo = NumaTopology {
            enabled: true,
            nodes: vec![
                NumaNode { id: 0, cpu_ids: vec![0] },
                NumaNode { id: 1, cpu_ids: vec![1] },
            ],
        };
        let assign = topo.assign(4);
        assert_eq!(assign.thread_to_cpu, vec![0, 1, 0, 1]);
    }
}
