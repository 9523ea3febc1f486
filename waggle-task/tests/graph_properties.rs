//! Property tests for the dependency graph invariants.

use proptest::prelude::*;
use waggle_core::TaskId;
use waggle_task::TaskGraph;

/// Arbitrary edge scripts over a small id universe. Each op is
/// (blocker index, blocked index, remove flag).
fn edge_script() -> impl Strategy<Value = Vec<(usize, usize, bool)>> {
    prop::collection::vec((0usize..8, 0usize..8, prop::bool::weighted(0.2)), 0..60)
}

proptest! {
    /// Incremental insertion rejects cycles, so the graph stays acyclic and
    /// `has_cycle` always agrees with `topological_sort`.
    #[test]
    fn incremental_graph_stays_acyclic(script in edge_script()) {
        let ids: Vec<TaskId> = (0..8).map(|_| TaskId::new()).collect();
        let mut graph = TaskGraph::new();

        for (from, to, remove) in script {
            if remove {
                graph.remove_task(ids[from]);
            } else {
                // Rejected inserts leave the graph untouched.
                let _ = graph.add_dependency(ids[from], ids[to]);
            }
            prop_assert!(!graph.has_cycle());
            prop_assert!(graph.topological_sort().is_ok());
        }
    }

    /// Topological order puts every blocker before everything it blocks.
    #[test]
    fn topological_order_respects_edges(script in edge_script()) {
        let ids: Vec<TaskId> = (0..8).map(|_| TaskId::new()).collect();
        let mut graph = TaskGraph::new();
        for (from, to, _) in script {
            let _ = graph.add_dependency(ids[from], ids[to]);
        }

        let order = graph.topological_sort().unwrap();
        let position = |id: TaskId| order.iter().position(|&x| x == id);
        for &id in &order {
            for dep in graph.dependents_of(id) {
                prop_assert!(position(id) < position(dep));
            }
        }
    }

    /// Execution levels partition the nodes, and every node's blockers sit
    /// in strictly earlier levels.
    #[test]
    fn execution_levels_partition_and_order(script in edge_script()) {
        let ids: Vec<TaskId> = (0..8).map(|_| TaskId::new()).collect();
        let mut graph = TaskGraph::new();
        for (from, to, _) in script {
            let _ = graph.add_dependency(ids[from], ids[to]);
        }

        let levels = graph.execution_levels().unwrap();
        let total: usize = levels.iter().map(Vec::len).sum();
        prop_assert_eq!(total, graph.len());

        let level_of = |id: TaskId| {
            levels
                .iter()
                .position(|level| level.contains(&id))
                .unwrap()
        };
        for level in &levels {
            for &id in level {
                for blocker in graph.dependencies_of(id) {
                    prop_assert!(level_of(blocker) < level_of(id));
                }
            }
        }
    }
}
