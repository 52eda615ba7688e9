//! Finding the processes a supervised process has spawned.
//!
//! Not every platform lets us walk a process tree, so this is a capability
//! picked once when a supervisor is created: [`SysinfoTree`] where `sysinfo`
//! can read the process table, and [`NullTree`] (which finds nothing)
//! everywhere else.

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Mutex, Once, PoisonError},
};
use sysinfo::{ProcessRefreshKind, System};

pub trait ProcessTree: Send + Sync {
    /// All processes transitively spawned by `pid`, parents before children.
    fn descendants(&self, pid: u32) -> io::Result<Vec<u32>>;
}

/// Picks the best process tree backend for the running platform.
pub fn platform() -> Box<dyn ProcessTree> {
    if sysinfo::IS_SUPPORTED_SYSTEM {
        Box::new(SysinfoTree::new())
    } else {
        Box::new(NullTree)
    }
}

/// Walks `(pid, parent pid)` pairs breadth-first from `root`.
pub fn descendants_of(root: u32, pairs: impl IntoIterator<Item = (u32, u32)>) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, ppid) in pairs {
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(root);
    while let Some(parent) = queue.pop_front() {
        if let Some(kids) = children.remove(&parent) {
            for kid in kids {
                found.push(kid);
                queue.push_back(kid);
            }
        }
    }

    found
}

/// Reads parent pids from the process table `sysinfo` keeps.
pub struct SysinfoTree {
    system: Mutex<System>,
}

impl SysinfoTree {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTree for SysinfoTree {
    fn descendants(&self, pid: u32) -> io::Result<Vec<u32>> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        // Parent links come with the basic refresh; nothing else is needed.
        system.refresh_processes_specifics(ProcessRefreshKind::new());

        let pairs = system.processes().iter().filter_map(|(child, process)| {
            process
                .parent()
                .map(|parent| (child.as_u32(), parent.as_u32()))
        });

        Ok(descendants_of(pid, pairs))
    }
}

/// Finds nothing, and says so once.
pub struct NullTree;

static NULL_TREE_WARNING: Once = Once::new();

impl ProcessTree for NullTree {
    fn descendants(&self, pid: u32) -> io::Result<Vec<u32>> {
        NULL_TREE_WARNING.call_once(|| {
            warn!(
                "Listing child processes is not supported on this platform; descendants of pid {} and others will not be stopped",
                pid
            );
        });
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::{descendants_of, NullTree, ProcessTree, SysinfoTree};
    use std::process::Command;

    #[test]
    fn walks_the_whole_subtree() {
        let pairs = vec![(1, 0), (10, 1), (11, 10), (12, 10), (13, 11), (20, 1), (30, 99)];
        assert_eq!(descendants_of(10, pairs.clone()), vec![11, 12, 13]);
        assert_eq!(descendants_of(13, pairs.clone()), Vec::<u32>::new());
        assert_eq!(descendants_of(1, pairs), vec![10, 20, 11, 12, 13]);
    }

    #[test]
    fn ignores_self_parented_entries() {
        assert_eq!(descendants_of(0, vec![(0, 0), (1, 0)]), vec![1]);
    }

    #[test]
    fn null_tree_finds_nothing() {
        assert!(NullTree.descendants(1).expect("never fails").is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn sysinfo_tree_sees_children_and_grandchildren() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("grandchild");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(format!("sleep 5 & echo $! > {}; wait", marker.display()))
            .spawn()
            .expect("spawn");

        let mut grandchild = None;
        for _ in 0..100 {
            grandchild = std::fs::read_to_string(&marker)
                .ok()
                .and_then(|pid| pid.trim().parse::<u32>().ok());
            if grandchild.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        let tree = SysinfoTree::new();
        let found = tree.descendants(std::process::id()).expect("listing works");
        assert!(found.contains(&child.id()));
        let grandchild = grandchild.expect("grandchild pid written");
        assert!(found.contains(&grandchild), "{:?}", found);

        // A second refresh reuses the same table.
        let again = tree.descendants(child.id()).expect("listing works");
        assert!(again.contains(&grandchild));

        Command::new("kill").arg(grandchild.to_string()).status().ok();
        child.kill().ok();
        child.wait().ok();
    }

    #[test]
    #[cfg(unix)]
    fn platform_tree_sees_real_children() {
        let mut child = Command::new("sleep").arg("5").spawn().expect("spawn");
        let found = super::platform()
            .descendants(std::process::id())
            .expect("listing works");
        assert!(found.contains(&child.id()));

        child.kill().ok();
        child.wait().ok();
    }
}
