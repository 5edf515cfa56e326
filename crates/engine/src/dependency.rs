//! Dependency graph resolution, cycle detection, and result caching.
//!
//! Discovered suites declare dependencies on one another by node id or by
//! suite-file path. The resolver canonicalizes those references into an
//! adjacency map, detects cycles, computes a deterministic execution order,
//! and tracks per-node execution state plus a cache of completed results.
//!
//! All state lives behind one lock so that `mark_executing` can atomically
//! observe-and-set a node's state; a second concurrent attempt to mark the
//! same node executing is reported as an error, never treated as a no-op.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Result, bail};
use indexmap::IndexMap;
use tracing::debug;
use trellis_types::{DependencyResult, DiscoveredTest, NodeState};
use trellis_util::normalize_lexically;

#[derive(Debug, Default)]
struct GraphState {
    /// node id → dependency node ids, in discovery order.
    adjacency: IndexMap<String, Vec<String>>,
    /// node id → execution state.
    states: HashMap<String, NodeState>,
    /// Canonicalized suite path → node id, for by-path dependency references.
    path_index: HashMap<PathBuf, String>,
    /// Completed results, kept across graph rebuilds until evicted explicitly.
    results: HashMap<String, DependencyResult>,
    cache_enabled: bool,
}

/// Builds and executes over the cross-suite dependency graph.
#[derive(Debug)]
pub struct DependencyResolver {
    state: Mutex<GraphState>,
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyResolver {
    /// Creates a resolver with an empty graph and caching enabled.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GraphState {
                cache_enabled: true,
                ..Default::default()
            }),
        }
    }

    /// Resolves each declared dependency to a canonical node id and stores
    /// the adjacency list. Does not execute anything.
    ///
    /// A dependency is first matched against node ids, then treated as a path
    /// relative to the declaring suite's file. Unknown references fail.
    pub fn build_dependency_graph(&self, tests: &[DiscoveredTest]) -> Result<()> {
        let mut adjacency: IndexMap<String, Vec<String>> = IndexMap::new();
        let mut path_index: HashMap<PathBuf, String> = HashMap::new();
        let mut ids: HashSet<&str> = HashSet::new();

        for test in tests {
            if !ids.insert(&test.node_id) {
                bail!("duplicate node identifier detected: '{}'", test.node_id);
            }
            path_index.insert(normalize_lexically(&test.file_path), test.node_id.clone());
        }

        for test in tests {
            let mut dependencies = Vec::with_capacity(test.depends_on.len());
            for declared in &test.depends_on {
                let resolved = resolve_dependency(declared, test, &ids, &path_index)?;
                if resolved == test.node_id {
                    bail!("suite '{}' cannot depend on itself", test.node_id);
                }
                if !dependencies.contains(&resolved) {
                    dependencies.push(resolved);
                }
            }
            adjacency.insert(test.node_id.clone(), dependencies);
        }

        let mut state = self.state.lock().expect("dependency graph lock poisoned");
        state.states = adjacency.keys().map(|id| (id.clone(), NodeState::Unvisited)).collect();
        state.adjacency = adjacency;
        state.path_index = path_index;
        debug!(nodes = state.adjacency.len(), "built dependency graph");
        Ok(())
    }

    /// Detects cycles with a depth-first traversal tracking a recursion stack.
    ///
    /// Returns one human-readable message per detected cycle; an empty vector
    /// means the graph is acyclic.
    pub fn detect_circular_dependencies(&self) -> Vec<String> {
        let state = self.state.lock().expect("dependency graph lock poisoned");
        let mut messages = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();

        for start in state.adjacency.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            let mut stack: Vec<&str> = Vec::new();
            let mut on_stack: HashSet<&str> = HashSet::new();
            dfs_cycles(start, &state.adjacency, &mut visited, &mut stack, &mut on_stack, &mut messages);
        }

        messages
    }

    /// Computes a topological execution order over the built graph.
    ///
    /// Uses repeated selection of zero-indegree nodes; ties are broken by the
    /// original discovery order so runs stay deterministic. Fails when a
    /// cycle leaves nodes unordered — callers are expected to treat a
    /// non-empty [`DependencyResolver::detect_circular_dependencies`] result
    /// as fatal before getting here.
    pub fn resolve_execution_order(&self, tests: &[DiscoveredTest]) -> Result<Vec<DiscoveredTest>> {
        let state = self.state.lock().expect("dependency graph lock poisoned");
        let lookup: HashMap<&str, &DiscoveredTest> = tests.iter().map(|test| (test.node_id.as_str(), test)).collect();

        let mut in_degrees: IndexMap<&str, usize> = state.adjacency.keys().map(|id| (id.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (node, dependencies) in &state.adjacency {
            for dependency in dependencies {
                *in_degrees
                    .get_mut(node.as_str())
                    .expect("in-degree entry exists for every node") += 1;
                dependents.entry(dependency.as_str()).or_default().push(node.as_str());
            }
        }

        // Seed in discovery order; the queue keeps that order as nodes free up.
        let mut queue: VecDeque<&str> = in_degrees
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut ordered = Vec::with_capacity(in_degrees.len());
        while let Some(node) = queue.pop_front() {
            ordered.push(node);
            if let Some(children) = dependents.get(node) {
                for child in children {
                    let degree = in_degrees.get_mut(child).expect("dependent node exists in degrees");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        if ordered.len() != in_degrees.len() {
            let mut remaining: Vec<&str> = in_degrees
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id)
                .collect();
            remaining.sort_unstable();
            bail!("cycle detected in dependency graph involving: {}", remaining.join(", "));
        }

        ordered
            .into_iter()
            .map(|id| {
                lookup
                    .get(id)
                    .map(|test| (*test).clone())
                    .ok_or_else(|| anyhow::anyhow!("ordered node '{}' missing from discovered tests", id))
            })
            .collect()
    }

    /// Atomically transitions a node to `Executing`.
    ///
    /// Fails when the node is unknown, already executing (live cycle or
    /// duplicate concurrent work), or already resolved. A failed node may be
    /// retried.
    pub fn mark_executing(&self, node_id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("dependency graph lock poisoned");
        let Some(current) = state.states.get_mut(node_id) else {
            bail!("unknown node '{}' in dependency graph", node_id);
        };
        match *current {
            NodeState::Unvisited | NodeState::Failed => {
                *current = NodeState::Executing;
                Ok(())
            }
            NodeState::Executing => bail!(
                "node '{}' is already executing; concurrent duplicate work or a live cycle",
                node_id
            ),
            NodeState::Resolved => bail!("node '{}' has already resolved", node_id),
        }
    }

    /// Stores a completed result and transitions the node to `Resolved`.
    pub fn mark_resolved(&self, node_id: &str, result: DependencyResult) -> Result<()> {
        let mut state = self.state.lock().expect("dependency graph lock poisoned");
        let Some(current) = state.states.get_mut(node_id) else {
            bail!("unknown node '{}' in dependency graph", node_id);
        };
        *current = NodeState::Resolved;
        state.results.insert(node_id.to_string(), result);
        Ok(())
    }

    /// Transitions the node to `Failed`.
    pub fn mark_failed(&self, node_id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("dependency graph lock poisoned");
        let Some(current) = state.states.get_mut(node_id) else {
            bail!("unknown node '{}' in dependency graph", node_id);
        };
        *current = NodeState::Failed;
        Ok(())
    }

    /// Current state of a node, if the graph knows it.
    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        self.state
            .lock()
            .expect("dependency graph lock poisoned")
            .states
            .get(node_id)
            .copied()
    }

    /// Returns the stored result for a node, marked as cache-served.
    ///
    /// Returns `None` when caching is disabled or no entry exists; disabling
    /// the cache does not evict existing entries.
    pub fn get_cached_result(&self, node_id: &str) -> Option<DependencyResult> {
        let state = self.state.lock().expect("dependency graph lock poisoned");
        if !state.cache_enabled {
            return None;
        }
        state.results.get(node_id).map(DependencyResult::as_cached)
    }

    /// Enables or disables serving cached results. Entries are retained.
    pub fn set_cache_enabled(&self, enabled: bool) {
        self.state.lock().expect("dependency graph lock poisoned").cache_enabled = enabled;
    }

    /// Evicts every cached result.
    pub fn clear_cache(&self) {
        self.state.lock().expect("dependency graph lock poisoned").results.clear();
    }

    /// Resets the graph together with its result cache.
    pub fn clear_graph(&self) {
        let mut state = self.state.lock().expect("dependency graph lock poisoned");
        state.adjacency.clear();
        state.states.clear();
        state.path_index.clear();
        state.results.clear();
    }
}

fn resolve_dependency(
    declared: &str,
    test: &DiscoveredTest,
    ids: &HashSet<&str>,
    path_index: &HashMap<PathBuf, String>,
) -> Result<String> {
    if ids.contains(declared) {
        return Ok(declared.to_string());
    }

    let base = test.file_path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let candidate = normalize_lexically(&base.join(declared));
    if let Some(node_id) = path_index.get(&candidate) {
        return Ok(node_id.clone());
    }

    bail!(
        "suite '{}' depends on unknown suite '{}' (no node id or suite file matched)",
        test.node_id,
        declared
    )
}

fn dfs_cycles<'graph>(
    node: &'graph str,
    adjacency: &'graph IndexMap<String, Vec<String>>,
    visited: &mut HashSet<&'graph str>,
    stack: &mut Vec<&'graph str>,
    on_stack: &mut HashSet<&'graph str>,
    messages: &mut Vec<String>,
) {
    visited.insert(node);
    stack.push(node);
    on_stack.insert(node);

    if let Some(dependencies) = adjacency.get(node) {
        for dependency in dependencies {
            if on_stack.contains(dependency.as_str()) {
                // Edge back into the recursion stack: render the cycle slice.
                let start = stack
                    .iter()
                    .position(|frame| frame == dependency)
                    .unwrap_or(0);
                let mut cycle: Vec<&str> = stack[start..].to_vec();
                cycle.push(dependency);
                messages.push(format!("Circular dependency detected: {}", cycle.join(" -> ")));
            } else if !visited.contains(dependency.as_str()) {
                dfs_cycles(dependency, adjacency, visited, stack, on_stack, messages);
            }
        }
    }

    stack.pop();
    on_stack.remove(node);
}
