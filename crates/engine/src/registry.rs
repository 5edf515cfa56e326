//! Process-wide export registry.
//!
//! Completed suites publish variables here under `${node_id}.${name}` so that
//! downstream suites can import them. The registry is an explicit service
//! instance shared by reference (`Arc`), never an ambient global, which keeps
//! independent engine instances isolated in tests.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use tracing::debug;

/// Metadata describing one node's footprint in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node identifier that owns the exports.
    pub node_id: String,
    /// Suite name recorded at registration time.
    pub suite_name: String,
    /// Number of variables the node currently has registered.
    pub variable_count: usize,
    /// When the node first registered an export.
    pub registered_at: DateTime<Utc>,
}

/// Aggregate registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Number of nodes with at least one export.
    pub node_count: usize,
    /// Total number of exported variables.
    pub variable_count: usize,
}

/// Outcome of a structural integrity check. Never fatal; callers decide what
/// to do with the findings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Non-fatal oddities, e.g. a node registered with zero variables.
    pub warnings: Vec<String>,
    /// Structural inconsistencies, e.g. an orphaned export reference.
    pub errors: Vec<String>,
}

impl IntegrityReport {
    /// Whether the check found no errors (warnings are tolerated).
    pub fn is_consistent(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A point-in-time copy of the registry contents, used to restore state in
/// tests and debugging sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    variables: HashMap<String, Value>,
    nodes: HashMap<String, NodeEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NodeEntry {
    suite_name: String,
    variable_names: Vec<String>,
    registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Full name (`node_id.name`) → value. Last write wins per name.
    variables: HashMap<String, Value>,
    /// Node id → ownership record.
    nodes: HashMap<String, NodeEntry>,
}

/// Store of variables exported by completed suites, keyed by owning node.
#[derive(Debug, Default)]
pub struct GlobalRegistry {
    inner: RwLock<RegistryInner>,
}

impl GlobalRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes one variable as `${node_id}.${name}`.
    ///
    /// Re-registering the same pair overwrites the previous value.
    pub fn register(&self, node_id: &str, suite_name: &str, name: &str, value: Value) {
        let full_name = format!("{node_id}.{name}");
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let entry = inner.nodes.entry(node_id.to_string()).or_insert_with(|| NodeEntry {
            suite_name: suite_name.to_string(),
            variable_names: Vec::new(),
            registered_at: Utc::now(),
        });
        if !entry.variable_names.iter().any(|existing| existing == name) {
            entry.variable_names.push(name.to_string());
        }
        inner.variables.insert(full_name.clone(), value);
        debug!(variable = %full_name, "registered exported variable");
    }

    /// Looks up an export by its full `${node_id}.${name}` key.
    pub fn get(&self, full_name: &str) -> Option<Value> {
        self.inner.read().expect("registry lock poisoned").variables.get(full_name).cloned()
    }

    /// Whether an export exists under the full name.
    pub fn has(&self, full_name: &str) -> bool {
        self.inner.read().expect("registry lock poisoned").variables.contains_key(full_name)
    }

    /// All exports, keyed by full name.
    pub fn all(&self) -> JsonMap<String, Value> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.variables.iter().map(|(key, value)| (key.clone(), value.clone())).collect()
    }

    /// One node's exports, keyed by bare variable name.
    pub fn node_variables(&self, node_id: &str) -> JsonMap<String, Value> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let Some(entry) = inner.nodes.get(node_id) else {
            return JsonMap::new();
        };
        entry
            .variable_names
            .iter()
            .filter_map(|name| {
                inner
                    .variables
                    .get(&format!("{node_id}.{name}"))
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }

    /// Ownership metadata for a node, if it has registered anything.
    pub fn node_info(&self, node_id: &str) -> Option<NodeInfo> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.nodes.get(node_id).map(|entry| NodeInfo {
            node_id: node_id.to_string(),
            suite_name: entry.suite_name.clone(),
            variable_count: entry.variable_names.len(),
            registered_at: entry.registered_at,
        })
    }

    /// Removes a node and every variable it registered.
    pub fn unregister_node(&self, node_id: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(entry) = inner.nodes.remove(node_id) {
            for name in &entry.variable_names {
                inner.variables.remove(&format!("{node_id}.{name}"));
            }
            debug!(node = %node_id, removed = entry.variable_names.len(), "unregistered node exports");
        }
    }

    /// Resets the registry to empty.
    pub fn clear_all(&self) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.variables.clear();
        inner.nodes.clear();
    }

    /// Aggregate counters.
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().expect("registry lock poisoned");
        RegistryStats {
            node_count: inner.nodes.len(),
            variable_count: inner.variables.len(),
        }
    }

    /// Captures the current contents for a later [`GlobalRegistry::restore_snapshot`].
    pub fn create_snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read().expect("registry lock poisoned");
        RegistrySnapshot {
            variables: inner.variables.clone(),
            nodes: inner.nodes.clone(),
        }
    }

    /// Replaces the registry contents with a previously captured snapshot.
    pub fn restore_snapshot(&self, snapshot: RegistrySnapshot) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.variables = snapshot.variables;
        inner.nodes = snapshot.nodes;
    }

    /// Serializes the registry contents to a JSON string for inspection.
    pub fn export_state(&self) -> String {
        let snapshot = self.create_snapshot();
        serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }

    /// Reports structural warnings and errors without mutating anything.
    ///
    /// An export referenced by a node index but absent from the variable map
    /// is an error; a variable with no owning node is an error; a node with
    /// zero variables is a warning.
    pub fn validate_integrity(&self) -> IntegrityReport {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut report = IntegrityReport::default();

        for (node_id, entry) in &inner.nodes {
            if entry.variable_names.is_empty() {
                report.warnings.push(format!("node '{node_id}' is registered with no variables"));
            }
            for name in &entry.variable_names {
                let full_name = format!("{node_id}.{name}");
                if !inner.variables.contains_key(&full_name) {
                    report
                        .errors
                        .push(format!("node '{node_id}' references missing export '{full_name}'"));
                }
            }
        }

        for full_name in inner.variables.keys() {
            let owned = full_name
                .split_once('.')
                .is_some_and(|(node_id, name)| {
                    inner
                        .nodes
                        .get(node_id)
                        .is_some_and(|entry| entry.variable_names.iter().any(|existing| existing == name))
                });
            if !owned {
                report.errors.push(format!("export '{full_name}' has no owning node entry"));
            }
        }

        report
    }
}
