//! Wait-for graph and cycle detection, adapted from the teacher's
//! `transaction::deadlock` module (`DeadlockDetector`, `VictimSelectionPolicy`,
//! DFS `has_cycle`) down to a single-threshold detector the async
//! `RecordLocker` can call synchronously before it starts waiting.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::RwLock;

use crate::common::TransactionId;

/// Victim selection when a cycle is found. Only `Youngest` is wired into
/// `RecordLocker` today (the waiter that requested last loses), kept as an
/// enum so the policy can be made configurable without changing callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimSelectionPolicy {
    Youngest,
    Oldest,
}

#[derive(Debug, Clone, Copy)]
pub struct DeadlockDetectorConfig {
    pub max_detection_depth: usize,
    pub victim_policy: VictimSelectionPolicy,
}

impl Default for DeadlockDetectorConfig {
    fn default() -> Self {
        Self {
            max_detection_depth: 1000,
            victim_policy: VictimSelectionPolicy::Youngest,
        }
    }
}

/// Tracks "txn A is waiting on txn B" edges and detects cycles via DFS.
pub struct DeadlockDetector {
    wait_for: RwLock<HashMap<TransactionId, HashSet<TransactionId>>>,
    config: DeadlockDetectorConfig,
}

impl DeadlockDetector {
    pub fn new(config: DeadlockDetectorConfig) -> Self {
        Self {
            wait_for: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn add_wait(&self, waiter: TransactionId, holder: TransactionId) {
        if waiter == holder {
            return;
        }
        self.wait_for.write().entry(waiter).or_default().insert(holder);
    }

    /// Clears every edge where `txn_id` is the waiter, called once it
    /// acquires a lock or gives up.
    pub fn remove_wait(&self, txn_id: TransactionId) {
        self.wait_for.write().remove(&txn_id);
    }

    /// Runs a bounded DFS from every known waiter looking for a cycle.
    /// Returns the first cycle found, as the ordered list of transaction ids
    /// forming it.
    pub fn detect_deadlock(&self) -> Option<Vec<TransactionId>> {
        let graph = self.wait_for.read();
        for &start in graph.keys() {
            let mut path = Vec::new();
            let mut visiting = HashSet::new();
            if let Some(cycle) = self.dfs(&graph, start, &mut path, &mut visiting, 0) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs(
        &self,
        graph: &HashMap<TransactionId, HashSet<TransactionId>>,
        node: TransactionId,
        path: &mut Vec<TransactionId>,
        visiting: &mut HashSet<TransactionId>,
        depth: usize,
    ) -> Option<Vec<TransactionId>> {
        if depth > self.config.max_detection_depth {
            return None;
        }
        if let Some(pos) = path.iter().position(|&n| n == node) {
            return Some(path[pos..].to_vec());
        }
        if !visiting.insert(node) {
            return None;
        }
        path.push(node);
        if let Some(neighbors) = graph.get(&node) {
            for &next in neighbors {
                if let Some(cycle) = self.dfs(graph, next, path, visiting, depth + 1) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        None
    }

    /// Picks the losing transaction from a detected cycle per the
    /// configured policy. `ages` maps each candidate to how long it has
    /// been waiting; `Youngest` (shortest wait) loses so the
    /// longest-waiting transaction makes forward progress.
    pub fn select_victim(&self, cycle: &[TransactionId], ages: &HashMap<TransactionId, Duration>) -> Option<TransactionId> {
        match self.config.victim_policy {
            VictimSelectionPolicy::Youngest => cycle
                .iter()
                .min_by_key(|id| ages.get(id).copied().unwrap_or(Duration::ZERO))
                .copied(),
            VictimSelectionPolicy::Oldest => cycle
                .iter()
                .max_by_key(|id| ages.get(id).copied().unwrap_or(Duration::ZERO))
                .copied(),
        }
    }
}
