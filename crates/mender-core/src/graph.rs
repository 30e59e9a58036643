//! Issue dependency graph and readiness tracking.
//!
//! Models issues as nodes in a directed acyclic graph (DAG). An edge
//! `A → B` means "B depends on A": A must be Fixed before B may start.
//!
//! The graph is built once from an [`IssueCatalog`]; cycles are rejected at
//! build time, before anything is dispatched. During a run, Fixed issues are
//! *retired*, which makes their dependents eligible in later [`ready`] calls.
//! A coarse rollback *restores* retired nodes so dependents wait again.
//!
//! [`ready`]: DependencyGraph::ready

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::domain::{Category, IssueCatalog, IssueId, Severity};
use crate::error::{EngineError, EngineResult};

/// Scheduling metadata kept per node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueNode {
    pub id: IssueId,
    pub category: Category,
    pub severity: Severity,
    /// Phase the scheduler assigned the issue to.
    pub phase: Option<String>,
}

/// Kahn-level ordering used for previews.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// `levels[n]` holds issues whose dependencies all sit in earlier levels,
    /// ordered by (severity descending, id ascending).
    pub levels: Vec<Vec<IssueId>>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Directed dependency graph over catalog issues.
///
/// Edges are stored as `dependency → dependents` adjacency sets plus the
/// reverse `dependent → dependencies` view.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<IssueId, IssueNode>,
    /// `dependency → {dependent, ...}` (downstream adjacency)
    downstream: HashMap<IssueId, BTreeSet<IssueId>>,
    /// `dependent → {dependency, ...}` (upstream adjacency)
    upstream: HashMap<IssueId, BTreeSet<IssueId>>,
    retired: HashSet<IssueId>,
}

impl DependencyGraph {
    /// Build the graph from a catalog.
    ///
    /// Fails with [`EngineError::DuplicateIssue`] on repeated ids,
    /// [`EngineError::UnknownDependency`] on dangling edges and
    /// [`EngineError::Cycle`] if the dependency relation is cyclic.
    pub fn build(catalog: &IssueCatalog) -> EngineResult<Self> {
        let mut graph = Self::default();

        for issue in catalog.iter() {
            if graph.nodes.contains_key(&issue.id) {
                return Err(EngineError::DuplicateIssue {
                    issue: issue.id.clone(),
                });
            }
            graph.nodes.insert(
                issue.id.clone(),
                IssueNode {
                    id: issue.id.clone(),
                    category: issue.category.clone(),
                    severity: issue.severity,
                    phase: None,
                },
            );
            graph.downstream.entry(issue.id.clone()).or_default();
            graph.upstream.entry(issue.id.clone()).or_default();
        }

        for issue in catalog.iter() {
            for dep in &issue.depends_on {
                if !graph.nodes.contains_key(dep) {
                    return Err(EngineError::UnknownDependency {
                        issue: issue.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                graph
                    .downstream
                    .entry(dep.clone())
                    .or_default()
                    .insert(issue.id.clone());
                graph
                    .upstream
                    .entry(issue.id.clone())
                    .or_default()
                    .insert(dep.clone());
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            return Err(EngineError::Cycle { issues: cycle });
        }

        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &IssueId) -> Option<&IssueNode> {
        self.nodes.get(id)
    }

    /// Record which phase an issue belongs to.
    pub fn assign_phase(&mut self, id: &IssueId, phase: &str) -> EngineResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownIssue { issue: id.clone() })?;
        node.phase = Some(phase.to_string());
        Ok(())
    }

    pub fn phase_of(&self, id: &IssueId) -> Option<&str> {
        self.nodes.get(id).and_then(|n| n.phase.as_deref())
    }

    /// Issues of `phase` that are not retired and whose dependencies are all
    /// retired, ordered by (severity descending, id ascending).
    pub fn ready(&self, phase: &str) -> Vec<IssueId> {
        let mut ready: Vec<&IssueNode> = self
            .nodes
            .values()
            .filter(|n| n.phase.as_deref() == Some(phase))
            .filter(|n| !self.retired.contains(&n.id))
            .filter(|n| {
                self.upstream
                    .get(&n.id)
                    .map(|deps| deps.iter().all(|d| self.retired.contains(d)))
                    .unwrap_or(true)
            })
            .collect();
        ready.sort_by(|a, b| {
            Reverse(a.severity)
                .cmp(&Reverse(b.severity))
                .then_with(|| a.id.cmp(&b.id))
        });
        ready.into_iter().map(|n| n.id.clone()).collect()
    }

    /// Retire a Fixed issue. Returns the dependents whose dependencies are now
    /// all retired.
    pub fn retire(&mut self, id: &IssueId) -> Vec<IssueId> {
        if !self.nodes.contains_key(id) || !self.retired.insert(id.clone()) {
            return Vec::new();
        }
        self.downstream
            .get(id)
            .into_iter()
            .flatten()
            .filter(|dependent| {
                self.upstream
                    .get(*dependent)
                    .map(|deps| deps.iter().all(|d| self.retired.contains(d)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Undo a retirement after the issue's fix was rolled back.
    pub fn restore(&mut self, id: &IssueId) -> bool {
        self.retired.remove(id)
    }

    pub fn is_retired(&self, id: &IssueId) -> bool {
        self.retired.contains(id)
    }

    /// Direct dependencies of `id` (issues it waits for).
    pub fn dependencies_of(&self, id: &IssueId) -> Vec<IssueId> {
        self.upstream
            .get(id)
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Direct dependents of `id` (issues waiting for it).
    pub fn dependents_of(&self, id: &IssueId) -> Vec<IssueId> {
        self.downstream
            .get(id)
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// All transitive dependents of `id` (BFS over downstream edges), sorted.
    pub fn transitive_dependents_of(&self, id: &IssueId) -> Vec<IssueId> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(id.clone());

        while let Some(current) = queue.pop_front() {
            if let Some(deps) = self.downstream.get(&current) {
                for dep in deps {
                    if visited.insert(dep.clone()) {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }

        visited.into_iter().collect()
    }

    /// Issues in topological order (dependencies before dependents).
    pub fn topological_order(&self) -> EngineResult<Vec<IssueId>> {
        Ok(self.execution_plan()?.levels.into_iter().flatten().collect())
    }

    /// Group issues into Kahn waves. Issues within a wave have no edges
    /// between them and could run side by side.
    pub fn execution_plan(&self) -> EngineResult<ExecutionPlan> {
        let mut in_degree: HashMap<&IssueId, usize> = self
            .nodes
            .keys()
            .map(|id| (id, self.upstream.get(id).map_or(0, BTreeSet::len)))
            .collect();

        let mut wave: Vec<&IssueId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut levels = Vec::new();
        let mut placed = 0usize;

        while !wave.is_empty() {
            self.sort_for_dispatch(&mut wave);
            let mut next = Vec::new();
            for id in &wave {
                for dependent in self.downstream.get(*id).into_iter().flatten() {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            placed += wave.len();
            levels.push(wave.iter().map(|id| (*id).clone()).collect());
            wave = next;
        }

        if placed != self.nodes.len() {
            let issues = self.find_cycle().unwrap_or_else(|| {
                let mut ids: Vec<IssueId> = self.nodes.keys().cloned().collect();
                ids.sort();
                ids
            });
            return Err(EngineError::Cycle { issues });
        }

        Ok(ExecutionPlan { levels })
    }

    fn sort_for_dispatch(&self, ids: &mut [&IssueId]) {
        ids.sort_by(|a, b| {
            let sa = self.nodes.get(*a).map(|n| n.severity);
            let sb = self.nodes.get(*b).map(|n| n.severity);
            Reverse(sa).cmp(&Reverse(sb)).then_with(|| a.cmp(b))
        });
    }

    /// DFS over every node; returns the first cycle path found.
    fn find_cycle(&self) -> Option<Vec<IssueId>> {
        let mut visited = HashSet::new();
        let mut starts: Vec<&IssueId> = self.nodes.keys().collect();
        starts.sort();
        for start in starts {
            let mut path = Vec::new();
            if self.dfs_cycle(start, &mut visited, &mut path) {
                return Some(path);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: &IssueId,
        visited: &mut HashSet<IssueId>,
        path: &mut Vec<IssueId>,
    ) -> bool {
        if let Some(pos) = path.iter().position(|p| p == node) {
            path.drain(..pos);
            path.push(node.clone());
            return true;
        }
        if visited.contains(node) {
            return false;
        }
        visited.insert(node.clone());
        path.push(node.clone());

        if let Some(dependents) = self.downstream.get(node) {
            for dep in dependents {
                if self.dfs_cycle(dep, visited, path) {
                    return true;
                }
            }
        }

        path.pop();
        false
    }
}
