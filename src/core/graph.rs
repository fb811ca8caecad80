//! Task dependency graph.
//!
//! The graph is built once from the submitted task list and never mutated
//! afterwards. Progress is tracked beside it in an incremental index
//! (remaining-dependency counters plus a "waiting on" list per task), so
//! a merge only touches the merged task's direct dependents.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::task::{TaskId, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use crate::registry::CoordinationRegistry;

/// Directed acyclic graph over task ids.
///
/// Edges point from a dependency to the task that depends on it. Node
/// indices follow declaration order, which doubles as the scheduling
/// tie-break.
#[derive(Default)]
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    /// Dependents of each task, in declaration order.
    waiting_on: HashMap<TaskId, Vec<TaskId>>,
    /// Number of not-yet-merged dependencies per task.
    remaining: HashMap<TaskId, usize>,
    merged: HashSet<TaskId>,
}

impl DependencyGraph {
    /// Validate a task list and build its graph.
    ///
    /// Rejects malformed or duplicate ids and unknown dependencies with
    /// [`Error::Configuration`], and any cycle with [`Error::Cycle`]
    /// naming the tasks on it.
    pub fn build(tasks: &[TaskSpec]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for spec in tasks {
            spec.id.validate()?;
            if index.contains_key(&spec.id) {
                return Err(Error::Configuration(format!(
                    "duplicate task id '{}'",
                    spec.id
                )));
            }
            let node = graph.add_node(spec.id.clone());
            index.insert(spec.id.clone(), node);
        }

        for spec in tasks {
            let to = index[&spec.id];
            let mut seen = HashSet::new();
            for dep in &spec.depends_on {
                let from = *index.get(dep).ok_or_else(|| {
                    Error::Configuration(format!(
                        "task '{}' depends on unknown task '{}'",
                        spec.id, dep
                    ))
                })?;
                if seen.insert(from) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let mut dag = Self {
            graph,
            index,
            waiting_on: HashMap::new(),
            remaining: HashMap::new(),
            merged: HashSet::new(),
        };

        if let Some(cycle) = dag.find_cycle() {
            return Err(Error::Cycle { cycle });
        }

        for node in dag.graph.node_indices() {
            let id = dag.graph[node].clone();
            let dependents = dag.sorted_neighbors(node, Direction::Outgoing);
            dag.waiting_on.insert(id.clone(), dependents);
            let deps = dag.graph.neighbors_directed(node, Direction::Incoming).count();
            dag.remaining.insert(id, deps);
        }

        Ok(dag)
    }

    /// Locate one cycle, walking from each task to its dependencies.
    ///
    /// Picks the strongly connected component containing the earliest
    /// declared task so the report is stable across runs.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let scc = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || self
                        .graph
                        .find_edge(component[0], component[0])
                        .is_some()
            })
            .min_by_key(|component| component.iter().min().copied())?;

        let members: HashSet<NodeIndex> = scc.iter().copied().collect();
        let start = *scc.iter().min()?;
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(node) = queue.pop_front() {
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter(|n| members.contains(n))
                .collect();
            next.sort();
            next.dedup();
            for n in next {
                if n == start {
                    let mut path = vec![node];
                    let mut cur = node;
                    while let Some(&p) = parent.get(&cur) {
                        path.push(p);
                        cur = p;
                    }
                    path.reverse();
                    return Some(path.into_iter().map(|i| self.graph[i].clone()).collect());
                }
                if seen.insert(n) {
                    parent.insert(n, node);
                    queue.push_back(n);
                }
            }
        }
        Some(vec![self.graph[start].clone()])
    }

    fn sorted_neighbors(&self, node: NodeIndex, dir: Direction) -> Vec<TaskId> {
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(node, dir).collect();
        nodes.sort();
        nodes.dedup();
        nodes.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// Tasks whose dependencies are all merged and that hold no active
    /// registry entry, in declaration order.
    pub fn ready_tasks(&self, registry: &CoordinationRegistry) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter_map(|node| {
                let id = &self.graph[node];
                if registry.active(id).is_some() {
                    return None;
                }
                let deps_merged = self
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .all(|dep| {
                        registry
                            .active(&self.graph[dep])
                            .map(|entry| entry.status == TaskStatus::Merged)
                            .unwrap_or(false)
                    });
                deps_merged.then(|| id.clone())
            })
            .collect()
    }

    /// Record that `id` merged; returns the dependents this unblocked.
    ///
    /// Calling it again for the same task returns nothing.
    pub fn on_task_merged(&mut self, id: &TaskId) -> Vec<TaskId> {
        if !self.index.contains_key(id) || !self.merged.insert(id.clone()) {
            return Vec::new();
        }
        let mut unblocked = Vec::new();
        if let Some(dependents) = self.waiting_on.get(id) {
            for dependent in dependents {
                if let Some(count) = self.remaining.get_mut(dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        unblocked.push(dependent.clone());
                    }
                }
            }
        }
        unblocked
    }

    /// Rebuild the incremental index from registry state.
    pub fn sync_merged(&mut self, registry: &CoordinationRegistry) {
        self.merged = self
            .index
            .keys()
            .filter(|id| {
                registry
                    .active(id)
                    .map(|e| e.status == TaskStatus::Merged)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for node in self.graph.node_indices() {
            let pending = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter(|dep| !self.merged.contains(&self.graph[*dep]))
                .count();
            self.remaining.insert(self.graph[node].clone(), pending);
        }
    }

    /// Number of dependencies of `id` that have not merged yet.
    pub fn remaining_dependencies(&self, id: &TaskId) -> Option<usize> {
        self.remaining.get(id).copied()
    }

    /// All transitive dependents of `id`, in declaration order.
    pub fn downstream(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        let mut nodes: Vec<NodeIndex> = seen.into_iter().collect();
        nodes.sort();
        nodes.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// Tasks without an active entry that have a failed or cancelled
    /// dependency, paired with the first such dependency.
    pub fn blocked_by_failure(&self, registry: &CoordinationRegistry) -> Vec<(TaskId, TaskId)> {
        self.graph
            .node_indices()
            .filter_map(|node| {
                let id = &self.graph[node];
                if registry.active(id).is_some() {
                    return None;
                }
                let mut deps: Vec<NodeIndex> = self
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .collect();
                deps.sort();
                deps.into_iter()
                    .map(|dep| &self.graph[dep])
                    .find(|dep| {
                        registry
                            .active(dep)
                            .map(|e| e.status.blocks_dependents())
                            .unwrap_or(false)
                    })
                    .map(|culprit| (id.clone(), culprit.clone()))
            })
            .collect()
    }

    /// Position of `id` in the submitted list.
    pub fn declaration_index(&self, id: &TaskId) -> Option<usize> {
        self.index.get(id).map(|n| n.index())
    }

    /// Direct dependencies of `id`, in declaration order.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.index
            .get(id)
            .map(|&n| self.sorted_neighbors(n, Direction::Incoming))
            .unwrap_or_default()
    }

    /// Direct dependents of `id`, in declaration order.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.waiting_on.get(id).cloned().unwrap_or_default()
    }

    /// Every task id in declaration order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.graph.node_weights().cloned().collect()
    }

    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::Cycle {
            cycle: vec![self.graph[cycle.node_id()].clone()],
        })?;
        Ok(sorted.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.dependency_count())
            .field("merged", &self.merged.len())
            .finish()
    }
}
