//! Layered variable resolution and export registration.
//!
//! The [`VariableContextManager`] sits between suite execution and two stores:
//! a [`VariableStore`] holding the scoped variable maps for the current run,
//! and the [`GlobalRegistry`] holding exports published by completed suites.
//! Scope precedence when views are merged is runtime > suite > imported >
//! global, highest precedence last.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{Map as JsonMap, Value};
use tracing::{debug, warn};
use trellis_types::{DependencyResult, DiscoveredTest, VariableScope};
use trellis_util::{is_internal_env_key, is_sensitive_key, mask_value};

use crate::model::SuiteSpec;
use crate::registry::{GlobalRegistry, IntegrityReport, NodeInfo, RegistrySnapshot, RegistryStats};
use crate::resolve::{interpolate_string, interpolate_value};

/// Storage service for scoped variable maps.
///
/// The engine ships an in-memory implementation; embedders can substitute a
/// store backed by their own state management.
pub trait VariableStore: Send + Sync {
    /// A copy of one scope's variables.
    fn scope(&self, scope: VariableScope) -> JsonMap<String, Value>;

    /// Sets one variable in a scope.
    fn set(&self, scope: VariableScope, name: &str, value: Value);

    /// Clears one scope entirely.
    fn clear_scope(&self, scope: VariableScope);

    /// The merged view across all scopes, precedence runtime > suite >
    /// imported > global.
    fn merged(&self) -> JsonMap<String, Value> {
        let mut merged = JsonMap::new();
        for scope in [
            VariableScope::Global,
            VariableScope::Imported,
            VariableScope::Suite,
            VariableScope::Runtime,
        ] {
            for (name, value) in self.scope(scope) {
                merged.insert(name, value);
            }
        }
        merged
    }
}

/// Simple lock-guarded in-memory variable store.
#[derive(Debug, Default)]
pub struct InMemoryVariableStore {
    scopes: RwLock<HashMap<VariableScope, JsonMap<String, Value>>>,
}

impl InMemoryVariableStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl VariableStore for InMemoryVariableStore {
    fn scope(&self, scope: VariableScope) -> JsonMap<String, Value> {
        self.scopes
            .read()
            .expect("variable store lock poisoned")
            .get(&scope)
            .cloned()
            .unwrap_or_default()
    }

    fn set(&self, scope: VariableScope, name: &str, value: Value) {
        self.scopes
            .write()
            .expect("variable store lock poisoned")
            .entry(scope)
            .or_default()
            .insert(name.to_string(), value);
    }

    fn clear_scope(&self, scope: VariableScope) {
        self.scopes.write().expect("variable store lock poisoned").remove(&scope);
    }
}

/// Coordinates scoped variables with the global export registry.
pub struct VariableContextManager {
    store: Arc<dyn VariableStore>,
    registry: Arc<GlobalRegistry>,
}

impl VariableContextManager {
    /// Creates a manager over an injected store and registry.
    pub fn new(store: Arc<dyn VariableStore>, registry: Arc<GlobalRegistry>) -> Self {
        Self { store, registry }
    }

    /// The shared registry instance.
    pub fn registry(&self) -> &Arc<GlobalRegistry> {
        &self.registry
    }

    /// The shared variable store.
    pub fn store(&self) -> &Arc<dyn VariableStore> {
        &self.store
    }

    /// Interpolates suite-level variable templates and `base_url` against the
    /// currently visible variables, writing the results into suite scope.
    ///
    /// Registry exports are visible during interpolation under their full
    /// `${node_id}.${name}` keys.
    pub fn initialize_context(&self, suite: &SuiteSpec, test: &DiscoveredTest) {
        let visible = self.visible_variables();

        for (name, template) in &suite.variables {
            let resolved = interpolate_value(template, &visible);
            self.store.set(VariableScope::Suite, name, resolved);
        }
        if let Some(base_url) = &suite.base_url {
            let resolved = interpolate_string(base_url, &visible);
            self.store.set(VariableScope::Suite, "base_url", Value::String(resolved));
        }
        debug!(node = %test.node_id, suite = %suite.suite, "initialized suite context");
    }

    /// Clears runtime scope, and suite scope unless `preserve_exports` is set.
    ///
    /// A cross-suite call that must keep the caller's suite scope alive
    /// through the call passes `preserve_exports = true`.
    pub fn cleanup_context(&self, preserve_exports: bool) {
        self.store.clear_scope(VariableScope::Runtime);
        if !preserve_exports {
            self.store.clear_scope(VariableScope::Suite);
        }
    }

    /// The merged store view plus all registry exports under full names.
    pub fn visible_variables(&self) -> JsonMap<String, Value> {
        let mut visible = self.store.merged();
        for (full_name, value) in self.registry.all() {
            visible.entry(full_name).or_insert(value);
        }
        visible
    }

    /// Publishes the suite's declared exports to the registry.
    ///
    /// Each export resolves from the precedence-merged view: runtime scope
    /// first, then suite scope, then the passed-in captured values. A missing
    /// required export logs a warning naming the suite; missing optional
    /// exports are silent.
    pub fn register_exports(&self, test: &DiscoveredTest, captured: &JsonMap<String, Value>) -> JsonMap<String, Value> {
        let runtime = self.store.scope(VariableScope::Runtime);
        let suite_scope = self.store.scope(VariableScope::Suite);
        let mut published = JsonMap::new();

        for name in &test.exports {
            match resolve_export(name, &runtime, &suite_scope, captured) {
                Some(value) => {
                    self.registry.register(&test.node_id, &test.suite_name, name, value.clone());
                    published.insert(name.clone(), value);
                }
                None => {
                    warn!(
                        suite = %test.suite_name,
                        export = %name,
                        "declared export has no value in any scope"
                    );
                }
            }
        }
        for name in &test.optional_exports {
            if let Some(value) = resolve_export(name, &runtime, &suite_scope, captured) {
                self.registry.register(&test.node_id, &test.suite_name, name, value.clone());
                published.insert(name.clone(), value);
            }
        }

        published
    }

    /// Replays a cached result's exports into the registry without
    /// recomputation, keeping the registry consistent when a dependency is
    /// served from cache instead of re-executed.
    pub fn restore_exports_from_cache(&self, cached: &DependencyResult) {
        for (name, value) in &cached.exported_variables {
            self.registry.register(&cached.node_id, &cached.suite_name, name, value.clone());
        }
        debug!(
            node = %cached.node_id,
            count = cached.exported_variables.len(),
            "restored exports from cached result"
        );
    }

    /// Looks up an export by its full `${node_id}.${name}` key.
    pub fn get_exported_variable(&self, full_name: &str) -> Option<Value> {
        self.registry.get(full_name)
    }

    /// Whether an export exists under the full name.
    pub fn has_exported_variable(&self, full_name: &str) -> bool {
        self.registry.has(full_name)
    }

    /// All exports across all nodes, keyed by full name.
    pub fn get_all_exported_variables(&self) -> JsonMap<String, Value> {
        self.registry.all()
    }

    /// One node's exports, keyed by bare variable name.
    pub fn get_node_variables(&self, node_id: &str) -> JsonMap<String, Value> {
        self.registry.node_variables(node_id)
    }

    /// Ownership metadata for one node.
    pub fn get_node_info(&self, node_id: &str) -> Option<NodeInfo> {
        self.registry.node_info(node_id)
    }

    /// Aggregate registry counters.
    pub fn get_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Removes a node and its exports from the registry.
    pub fn unregister_node(&self, node_id: &str) {
        self.registry.unregister_node(node_id);
    }

    /// Resets the registry.
    pub fn clear_all(&self) {
        self.registry.clear_all();
    }

    /// Captures registry contents for later restore.
    pub fn create_snapshot(&self) -> RegistrySnapshot {
        self.registry.create_snapshot()
    }

    /// Serializes registry contents to a JSON string.
    pub fn export_state(&self) -> String {
        self.registry.export_state()
    }

    /// Structural consistency check; reports findings without failing.
    pub fn validate_integrity(&self) -> IntegrityReport {
        self.registry.validate_integrity()
    }

    /// Prepares a variable map for logging: internally-generated
    /// environment-style keys are dropped, then sensitive values are masked
    /// by key pattern.
    pub fn filter_and_mask_variables(&self, variables: &JsonMap<String, Value>, context: Option<&str>) -> JsonMap<String, Value> {
        let masked: JsonMap<String, Value> = variables
            .iter()
            .filter(|(key, _)| !is_internal_env_key(key))
            .map(|(key, value)| {
                if is_sensitive_key(key) {
                    (key.clone(), mask_value(value))
                } else {
                    (key.clone(), value.clone())
                }
            })
            .collect();
        if let Some(context) = context {
            debug!(context = %context, count = masked.len(), "masked variables for logging");
        }
        masked
    }
}

fn resolve_export(
    name: &str,
    runtime: &JsonMap<String, Value>,
    suite_scope: &JsonMap<String, Value>,
    captured: &JsonMap<String, Value>,
) -> Option<Value> {
    runtime
        .get(name)
        .or_else(|| suite_scope.get(name))
        .or_else(|| captured.get(name))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn manager() -> VariableContextManager {
        VariableContextManager::new(Arc::new(InMemoryVariableStore::new()), Arc::new(GlobalRegistry::new()))
    }

    fn test_record(exports: &[&str], optional: &[&str]) -> DiscoveredTest {
        DiscoveredTest {
            node_id: "orders".into(),
            suite_name: "Orders".into(),
            file_path: PathBuf::from("/suites/orders.yaml"),
            depends_on: vec![],
            exports: exports.iter().map(|s| s.to_string()).collect(),
            optional_exports: optional.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn initialize_context_interpolates_against_registry_exports() {
        let manager = manager();
        manager.registry().register("auth", "Auth Suite", "token", json!("tok-9"));

        let mut variables = JsonMap::new();
        variables.insert("auth_header".into(), json!("Bearer ${{ auth.token }}"));
        let suite = SuiteSpec {
            suite: "Orders".into(),
            base_url: Some("https://${{ auth.token }}.example.com".into()),
            variables,
            ..Default::default()
        };

        manager.initialize_context(&suite, &test_record(&[], &[]));

        let suite_scope = manager.store().scope(VariableScope::Suite);
        assert_eq!(suite_scope.get("auth_header"), Some(&json!("Bearer tok-9")));
        assert_eq!(suite_scope.get("base_url"), Some(&json!("https://tok-9.example.com")));
    }

    #[test]
    fn register_exports_prefers_runtime_over_suite_over_captured() {
        let manager = manager();
        manager.store().set(VariableScope::Runtime, "token", json!("runtime"));
        manager.store().set(VariableScope::Suite, "token", json!("suite"));
        let mut captured = JsonMap::new();
        captured.insert("token".into(), json!("captured"));
        captured.insert("order_id".into(), json!(42));

        let published = manager.register_exports(&test_record(&["token", "order_id"], &[]), &captured);

        assert_eq!(published.get("token"), Some(&json!("runtime")));
        assert_eq!(published.get("order_id"), Some(&json!(42)));
        assert_eq!(manager.get_exported_variable("orders.token"), Some(json!("runtime")));
    }

    #[test]
    fn missing_required_export_warns_but_does_not_fail() {
        let manager = manager();
        let published = manager.register_exports(&test_record(&["missing"], &["also_missing"]), &JsonMap::new());
        assert!(published.is_empty());
        assert!(!manager.has_exported_variable("orders.missing"));
    }

    #[test]
    fn unregister_node_clears_lookup() {
        let manager = manager();
        manager.store().set(VariableScope::Runtime, "token", json!("t"));
        manager.register_exports(&test_record(&["token"], &[]), &JsonMap::new());
        assert!(manager.has_exported_variable("orders.token"));

        manager.unregister_node("orders");
        assert_eq!(manager.get_exported_variable("orders.token"), None);
    }

    #[test]
    fn cleanup_context_preserving_exports_keeps_suite_scope() {
        let manager = manager();
        manager.store().set(VariableScope::Suite, "kept", json!(1));
        manager.store().set(VariableScope::Runtime, "dropped", json!(2));

        manager.cleanup_context(true);
        assert_eq!(manager.store().scope(VariableScope::Suite).len(), 1);
        assert!(manager.store().scope(VariableScope::Runtime).is_empty());

        manager.cleanup_context(false);
        assert!(manager.store().scope(VariableScope::Suite).is_empty());
    }

    #[test]
    fn restore_exports_from_cache_replays_into_registry() {
        let manager = manager();
        let mut exported = JsonMap::new();
        exported.insert("token".into(), json!("cached-tok"));
        let cached = DependencyResult {
            flow_path: PathBuf::from("/suites/auth.yaml"),
            node_id: "auth".into(),
            suite_name: "Auth Suite".into(),
            success: true,
            execution_time_ms: 0,
            exported_variables: exported,
            cached: true,
            error: None,
        };

        manager.restore_exports_from_cache(&cached);
        assert_eq!(manager.get_exported_variable("auth.token"), Some(json!("cached-tok")));
        assert_eq!(manager.get_node_info("auth").unwrap().suite_name, "Auth Suite");
    }

    #[test]
    fn filter_and_mask_hides_secrets_and_internal_keys() {
        let manager = manager();
        let mut variables = JsonMap::new();
        variables.insert("api_key".into(), json!("supersecretvalue"));
        variables.insert("username".into(), json!("alice"));
        variables.insert("TRELLIS_NODE_ID".into(), json!("orders"));

        let masked = manager.filter_and_mask_variables(&variables, Some("test"));

        assert_eq!(masked.get("username"), Some(&json!("alice")));
        assert_eq!(masked.get("api_key"), Some(&json!("s***e")));
        assert!(!masked.contains_key("TRELLIS_NODE_ID"));
    }
}
