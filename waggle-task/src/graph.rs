//! Task dependency graph
//!
//! Nodes are task ids only; the tasks themselves live in the repository.
//! Edges run from blocker to blocked (`blocks`), with the inverse
//! (`blocked_by`) maintained alongside. The graph must stay acyclic:
//! incremental edge insertion rejects cycles, while bulk insertion through
//! [`TaskGraph::add_task`] trusts the declared sets and leaves detection to
//! [`TaskGraph::has_cycle`].

use crate::error::{TaskError, TaskResult};
use crate::task::Task;
use std::collections::{BTreeSet, HashMap, VecDeque};
use waggle_core::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitColor {
    White,
    Gray,
    Black,
}

/// Directed acyclic graph of task dependencies.
#[derive(Debug, Default, Clone)]
pub struct TaskGraph {
    /// blocker -> tasks it blocks (successors).
    blocks: HashMap<TaskId, BTreeSet<TaskId>>,
    /// blocked -> tasks blocking it (predecessors).
    blocked_by: HashMap<TaskId, BTreeSet<TaskId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task node with its declared edge sets, both directions.
    pub fn add_task(&mut self, task: &Task) {
        self.add_node(task.id);
        for &blocker in &task.blocked_by {
            self.insert_edge(blocker, task.id);
        }
        for &blocked in &task.blocks {
            self.insert_edge(task.id, blocked);
        }
    }

    /// Insert a bare node with no edges.
    pub fn add_node(&mut self, id: TaskId) {
        self.blocks.entry(id).or_default();
        self.blocked_by.entry(id).or_default();
    }

    /// Add one edge `blocker -> blocked`, rejecting an edge that would
    /// introduce a cycle.
    pub fn add_dependency(&mut self, blocker: TaskId, blocked: TaskId) -> TaskResult<()> {
        if blocker == blocked || self.reaches(blocked, blocker) {
            return Err(TaskError::CycleDetected);
        }
        self.insert_edge(blocker, blocked);
        Ok(())
    }

    /// Remove a node and every edge touching it, in both directions.
    pub fn remove_task(&mut self, id: TaskId) {
        if let Some(successors) = self.blocks.remove(&id) {
            for succ in successors {
                if let Some(preds) = self.blocked_by.get_mut(&succ) {
                    preds.remove(&id);
                }
            }
        }
        if let Some(predecessors) = self.blocked_by.remove(&id) {
            for pred in predecessors {
                if let Some(succs) = self.blocks.get_mut(&pred) {
                    succs.remove(&id);
                }
            }
        }
    }

    /// Tasks that must finish before `id` can run.
    pub fn dependencies_of(&self, id: TaskId) -> BTreeSet<TaskId> {
        self.blocked_by.get(&id).cloned().unwrap_or_default()
    }

    /// Tasks waiting on `id`.
    pub fn dependents_of(&self, id: TaskId) -> BTreeSet<TaskId> {
        self.blocks.get(&id).cloned().unwrap_or_default()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.blocks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// DFS coloring cycle check.
    pub fn has_cycle(&self) -> bool {
        let mut colors: HashMap<TaskId, VisitColor> =
            self.blocks.keys().map(|&id| (id, VisitColor::White)).collect();

        for &start in self.blocks.keys() {
            if colors[&start] == VisitColor::White && self.visit_finds_cycle(start, &mut colors) {
                return true;
            }
        }
        false
    }

    fn visit_finds_cycle(&self, node: TaskId, colors: &mut HashMap<TaskId, VisitColor>) -> bool {
        colors.insert(node, VisitColor::Gray);
        if let Some(successors) = self.blocks.get(&node) {
            for &succ in successors {
                match colors.get(&succ).copied().unwrap_or(VisitColor::White) {
                    VisitColor::Gray => return true,
                    VisitColor::White => {
                        if self.visit_finds_cycle(succ, colors) {
                            return true;
                        }
                    }
                    VisitColor::Black => {}
                }
            }
        }
        colors.insert(node, VisitColor::Black);
        false
    }

    /// Dependency-respecting order over all nodes; fails if cyclic.
    pub fn topological_sort(&self) -> TaskResult<Vec<TaskId>> {
        let levels = self.execution_levels()?;
        Ok(levels.into_iter().flatten().collect())
    }

    /// Kahn's algorithm: level `k` holds every task whose predecessors all
    /// sit in levels `< k`, so each level can run in parallel once the
    /// previous one has completed.
    pub fn execution_levels(&self) -> TaskResult<Vec<Vec<TaskId>>> {
        let mut in_degree: HashMap<TaskId, usize> = self
            .blocks
            .keys()
            .map(|&id| (id, self.blocked_by.get(&id).map_or(0, BTreeSet::len)))
            .collect();

        let mut frontier: Vec<TaskId> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&id, _)| id)
            .collect();
        frontier.sort();

        let mut levels = Vec::new();
        let mut seen = 0;

        while !frontier.is_empty() {
            seen += frontier.len();
            let mut next = Vec::new();
            for &id in &frontier {
                if let Some(successors) = self.blocks.get(&id) {
                    for &succ in successors {
                        if let Some(degree) = in_degree.get_mut(&succ) {
                            *degree -= 1;
                            if *degree == 0 {
                                next.push(succ);
                            }
                        }
                    }
                }
            }
            next.sort();
            levels.push(frontier);
            frontier = next;
        }

        if seen != self.blocks.len() {
            return Err(TaskError::CycleDetected);
        }
        Ok(levels)
    }

    fn insert_edge(&mut self, blocker: TaskId, blocked: TaskId) {
        self.add_node(blocker);
        self.add_node(blocked);
        self.blocks.entry(blocker).or_default().insert(blocked);
        self.blocked_by.entry(blocked).or_default().insert(blocker);
    }

    /// Whether `to` is reachable from `from` along `blocks` edges.
    fn reaches(&self, from: TaskId, to: TaskId) -> bool {
        if from == to {
            return true;
        }
        let mut queue = VecDeque::from([from]);
        let mut visited = BTreeSet::from([from]);
        while let Some(node) = queue.pop_front() {
            if let Some(successors) = self.blocks.get(&node) {
                for &succ in successors {
                    if succ == to {
                        return true;
                    }
                    if visited.insert(succ) {
                        queue.push_back(succ);
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRequest;

    fn task_with(blocked_by: &[TaskId], blocks: &[TaskId]) -> Task {
        let mut request = TaskRequest::new("t", "d", "code");
        request.blocked_by = blocked_by.iter().copied().collect();
        request.blocks = blocks.iter().copied().collect();
        Task::from_request(request, 3).unwrap()
    }

    #[test]
    fn test_edges_both_directions() {
        let mut graph = TaskGraph::new();
        let t1 = task_with(&[], &[]);
        let t2 = task_with(&[t1.id], &[]);
        graph.add_task(&t1);
        graph.add_task(&t2);

        assert_eq!(graph.dependencies_of(t2.id), BTreeSet::from([t1.id]));
        assert_eq!(graph.dependents_of(t1.id), BTreeSet::from([t2.id]));
    }

    #[test]
    fn test_remove_cleans_inverse_edges() {
        let mut graph = TaskGraph::new();
        let t1 = task_with(&[], &[]);
        let t2 = task_with(&[t1.id], &[]);
        graph.add_task(&t1);
        graph.add_task(&t2);

        graph.remove_task(t1.id);
        assert!(!graph.contains(t1.id));
        assert!(graph.dependencies_of(t2.id).is_empty());
    }

    #[test]
    fn test_cycle_via_contradictory_sets() {
        // T2 declares T1 as both blocker and blocked: a two-node cycle.
        let mut graph = TaskGraph::new();
        let t1 = task_with(&[], &[]);
        graph.add_task(&t1);
        let t2 = task_with(&[t1.id], &[t1.id]);
        graph.add_task(&t2);

        assert!(graph.has_cycle());
        assert!(matches!(
            graph.topological_sort(),
            Err(TaskError::CycleDetected)
        ));
    }

    #[test]
    fn test_incremental_cycle_rejected() {
        let mut graph = TaskGraph::new();
        let a = TaskId::new();
        let b = TaskId::new();
        let c = TaskId::new();
        graph.add_dependency(a, b).unwrap();
        graph.add_dependency(b, c).unwrap();

        assert!(matches!(
            graph.add_dependency(c, a),
            Err(TaskError::CycleDetected)
        ));
        assert!(matches!(
            graph.add_dependency(a, a),
            Err(TaskError::CycleDetected)
        ));
        assert!(!graph.has_cycle());
    }

    #[test]
    fn test_execution_levels() {
        let mut graph = TaskGraph::new();
        let t1 = task_with(&[], &[]);
        let t2 = task_with(&[], &[]);
        graph.add_task(&t1);
        graph.add_task(&t2);
        let t3 = task_with(&[t1.id, t2.id], &[]);
        graph.add_task(&t3);

        let levels = graph.execution_levels().unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(
            levels[0].iter().copied().collect::<BTreeSet<_>>(),
            BTreeSet::from([t1.id, t2.id])
        );
        assert_eq!(levels[1], vec![t3.id]);
    }

    #[test]
    fn test_topological_sort_respects_edges() {
        let mut graph = TaskGraph::new();
        let a = TaskId::new();
        let b = TaskId::new();
        let c = TaskId::new();
        graph.add_dependency(a, b).unwrap();
        graph.add_dependency(b, c).unwrap();

        let order = graph.topological_sort().unwrap();
        let position = |id: TaskId| order.iter().position(|&x| x == id).unwrap();
        assert!(position(a) < position(b));
        assert!(position(b) < position(c));
    }

    #[test]
    fn test_has_cycle_iff_sort_fails() {
        // Random-ish shapes: chain, diamond, and a cycle.
        let mut chain = TaskGraph::new();
        let ids: Vec<TaskId> = (0..5).map(|_| TaskId::new()).collect();
        for w in ids.windows(2) {
            chain.add_dependency(w[0], w[1]).unwrap();
        }
        assert_eq!(chain.has_cycle(), chain.topological_sort().is_err());

        let mut diamond = TaskGraph::new();
        let [a, b, c, d] = [TaskId::new(), TaskId::new(), TaskId::new(), TaskId::new()];
        diamond.add_dependency(a, b).unwrap();
        diamond.add_dependency(a, c).unwrap();
        diamond.add_dependency(b, d).unwrap();
        diamond.add_dependency(c, d).unwrap();
        assert_eq!(diamond.has_cycle(), diamond.topological_sort().is_err());

        let mut cyclic = TaskGraph::new();
        let t1 = task_with(&[], &[]);
        cyclic.add_task(&t1);
        let t2 = task_with(&[t1.id], &[t1.id]);
        cyclic.add_task(&t2);
        assert_eq!(cyclic.has_cycle(), cyclic.topological_sort().is_err());
        assert!(cyclic.has_cycle());
    }
}
