//! Deadlock detection over the wait-for graph.
//!
//! A transaction whose pending write sits behind another live transaction's
//! pending write to the same key waits for it: `waiter → holder`. Prepare
//! reports that situation as [`TxState::Lock`](super::TxState::Lock) and
//! leaves retry policy to the caller; a cycle through the caller's
//! transaction means no retry can ever succeed.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub(crate) struct WaitForGraph {
    edges: HashMap<u64, HashSet<u64>>,
}

impl WaitForGraph {
    pub fn add_wait(&mut self, waiter: u64, holder: u64) {
        if waiter != holder {
            self.edges.entry(waiter).or_default().insert(holder);
        }
    }

    /// Whether following wait edges from `tx` leads back to `tx`.
    pub fn has_cycle_through(&self, tx: u64) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<u64> = self
            .edges
            .get(&tx)
            .map(|holders| holders.iter().copied().collect())
            .unwrap_or_default();

        while let Some(node) = stack.pop() {
            if node == tx {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(holders) = self.edges.get(&node) {
                stack.extend(holders.iter().copied());
            }
        }
        false
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|s| s.len()).sum()
    }
}
