use std::collections::{BTreeMap, BTreeSet};

use crate::common::types::TxnId;

/// Waits-for graph built by the deadlock detector: an edge `a -> b` means
/// transaction `a` is blocked behind a lock transaction `b` holds. Ordered
/// containers keep the search deterministic.
#[derive(Default)]
pub(crate) struct WaitsForGraph {
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl WaitsForGraph {
    pub fn add_edge(&mut self, from: TxnId, to: TxnId) {
        self.edges.entry(from).or_default().insert(to);
    }

    /// Drop the transaction and every edge pointing at it
    pub fn remove_txn(&mut self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        for targets in self.edges.values_mut() {
            targets.remove(&txn_id);
        }
    }

    /// Search for a cycle (DFS rooted at the lowest txn id first) and return
    /// the victim: the largest txn id on the cycle, i.e. the youngest
    /// transaction aborts.
    pub fn find_victim(&self) -> Option<TxnId> {
        let mut visited = BTreeSet::new();
        for &start in self.edges.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(entry) = self.dfs(start, &mut visited, &mut path) {
                let at = path
                    .iter()
                    .position(|&t| t == entry)
                    .expect("cycle entry is on the path");
                return path[at..].iter().copied().max();
            }
        }
        None
    }

    fn dfs(&self, node: TxnId, visited: &mut BTreeSet<TxnId>, path: &mut Vec<TxnId>) -> Option<TxnId> {
        if path.contains(&node) {
            return Some(node);
        }
        if visited.contains(&node) {
            return None;
        }
        visited.insert(node);
        path.push(node);
        if let Some(targets) = self.edges.get(&node) {
            for &next in targets {
                if let Some(entry) = self.dfs(next, visited, path) {
                    return Some(entry);
                }
            }
        }
        path.pop();
        None
    }
}
