//! Point-in-time parent/child process map

use std::collections::{HashMap, HashSet};

/// Immutable pid -> parent pid map captured for a single kill
///
/// Built fresh by every tree kill and dropped afterwards; processes created
/// after the capture are not part of it.
///
/// Orphans keep the pid of their dead parent, and that pid may since have
/// been reused. With start times attached, a process that started before its
/// recorded parent is not treated as its child. Without them, an orphan whose
/// old parent pid now belongs to the kill target is swept in.
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    parents: HashMap<u32, u32>,
    children: HashMap<u32, Vec<u32>>,
    started: HashMap<u32, u64>,
}

impl ProcessSnapshot {
    /// Build from `(pid, parent_pid)` pairs
    pub fn from_parents<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let parents: HashMap<u32, u32> = entries.into_iter().collect();
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (&pid, &parent) in &parents {
            children.entry(parent).or_default().push(pid);
        }
        for kids in children.values_mut() {
            kids.sort_unstable();
        }
        Self {
            parents,
            children,
            started: HashMap::new(),
        }
    }

    /// Attach `(pid, start time)` pairs, in any monotonic unit
    ///
    /// Pids without a start time keep every edge they are part of.
    pub fn with_start_times<I>(mut self, times: I) -> Self
    where
        I: IntoIterator<Item = (u32, u64)>,
    {
        self.started.extend(times);
        self
    }

    /// Start time of `pid`, if known
    pub fn started(&self, pid: u32) -> Option<u64> {
        self.started.get(&pid).copied()
    }

    /// Number of processes captured
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// True when nothing was captured
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Parent of `pid` at capture time
    pub fn parent(&self, pid: u32) -> Option<u32> {
        self.parents.get(&pid).copied()
    }

    /// Direct children of `pid`
    pub fn children(&self, pid: u32) -> &[u32] {
        self.children.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `root` and all its descendants, deepest first, `root` last
    ///
    /// Process tables can hold self-parented entries (pid 0 on Windows) and
    /// recycled pids, so visited pids are never descended into twice.
    pub fn kill_order(&self, root: u32) -> Vec<u32> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        self.collect(root, &mut visited, &mut order);
        order
    }

    fn collect(&self, pid: u32, visited: &mut HashSet<u32>, order: &mut Vec<u32>) {
        if !visited.insert(pid) {
            return;
        }
        for &child in self.children(pid) {
            if self.predates(child, pid) {
                continue;
            }
            self.collect(child, visited, order);
        }
        order.push(pid);
    }

    /// True when `child` provably started before `parent`
    fn predates(&self, child: u32, parent: u32) -> bool {
        match (self.started(child), self.started(parent)) {
            (Some(child), Some(parent)) => child < parent,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn position(order: &[u32], pid: u32) -> usize {
        order.iter().position(|&p| p == pid).unwrap()
    }

    #[test]
    fn test_kill_order_deepest_first() {
        // 10 -> {11, 12}, 11 -> {13}, 13 -> {14}; 20 is unrelated
        let snapshot = ProcessSnapshot::from_parents([
            (11, 10),
            (12, 10),
            (13, 11),
            (14, 13),
            (20, 1),
            (10, 1),
        ]);

        let order = snapshot.kill_order(10);
        assert_eq!(order, vec![14, 13, 11, 12, 10]);
        assert!(!order.contains(&20));
        assert!(!order.contains(&1));
    }

    #[test]
    fn test_parent_lookup() {
        let snapshot = ProcessSnapshot::from_parents([(11, 10), (12, 10)]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.parent(12), Some(10));
        assert_eq!(snapshot.parent(10), None);
        assert_eq!(snapshot.children(10), &[11, 12]);
    }

    #[test]
    fn test_unknown_root_is_killed_alone() {
        let snapshot = ProcessSnapshot::from_parents([(2, 1)]);
        assert_eq!(snapshot.kill_order(99), vec![99]);
    }

    #[test]
    fn test_self_parented_entry_terminates() {
        // the idle process reports itself as its own parent
        let snapshot = ProcessSnapshot::from_parents([(0, 0), (4, 0), (8, 4)]);
        assert_eq!(snapshot.kill_order(0), vec![8, 4, 0]);
    }

    #[test]
    fn test_orphan_of_reused_pid_is_left_alone() {
        // 12 and its child 13 were started by an earlier process that also had pid 10
        let snapshot = ProcessSnapshot::from_parents([(11, 10), (12, 10), (13, 12)])
            .with_start_times([(10, 100), (11, 150), (12, 50), (13, 60)]);

        assert_eq!(snapshot.kill_order(10), vec![11, 10]);
        assert_eq!(snapshot.started(12), Some(50));
    }

    #[test]
    fn test_unknown_start_time_keeps_edge() {
        let snapshot = ProcessSnapshot::from_parents([(11, 10), (12, 10)])
            .with_start_times([(10, 100), (12, 50)]);

        // 11 has no start time, so it stays a child of 10
        assert_eq!(snapshot.kill_order(10), vec![11, 10]);
    }

    proptest! {
        #[test]
        fn prop_descendants_precede_ancestors(parents in prop::collection::vec(0u32..40, 1..40)) {
            // pid i + 1 has parent parents[i] % (i + 1): always an earlier pid, so a forest
            let entries: Vec<(u32, u32)> = parents
                .iter()
                .enumerate()
                .map(|(i, p)| (i as u32 + 1, p % (i as u32 + 1)))
                .collect();
            let snapshot = ProcessSnapshot::from_parents(entries.clone());

            let order = snapshot.kill_order(0);
            prop_assert_eq!(order.last().copied(), Some(0));
            prop_assert_eq!(order.len(), entries.len() + 1);
            for (pid, parent) in entries {
                prop_assert!(position(&order, pid) < position(&order, parent));
            }
        }
    }
}
