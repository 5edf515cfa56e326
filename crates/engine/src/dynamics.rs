//! Derived-variable evaluation for interactive input steps.
//!
//! An input step's `dynamics` block produces three kinds of work: `capture`
//! expressions run immediately against the input value object, `computed`
//! expressions run immediately against the merged variable view, and
//! `reevaluate` entries register definitions that recompute later whenever one
//! of their trigger variables changes.
//!
//! Expression failures are logged and skipped; one bad expression never aborts
//! the rest of the batch.

use std::sync::Mutex;

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::{json, Map as JsonMap, Value};
use tracing::{debug, warn};
use trellis_types::{
    AssignmentSource, DynamicKind, DynamicVariableAssignment, DynamicVariableDefinition, DynamicsConfig, InputResult,
    VariableScope,
};

use crate::resolve::evaluate_expression;

/// Everything produced by one pass over an input step's dynamics block.
#[derive(Debug, Default)]
pub struct ProcessedDynamics {
    /// Assignments from the immediate `capture` and `computed` passes.
    pub assignments: Vec<DynamicVariableAssignment>,
    /// Definitions registered for later trigger-driven recomputation.
    pub registered_definitions: Vec<DynamicVariableDefinition>,
}

/// Evaluates dynamics blocks and tracks registered reevaluation rules.
///
/// Definitions are keyed by `(name, kind, expression)`; registering the same
/// triple again replaces the stored definition instead of duplicating it.
#[derive(Debug, Default)]
pub struct DynamicExpressionEngine {
    definitions: Mutex<IndexMap<(String, DynamicKind, String), DynamicVariableDefinition>>,
}

impl DynamicExpressionEngine {
    /// Creates an engine with no registered definitions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the immediate passes of a dynamics block and registers its
    /// reevaluation entries.
    ///
    /// `variables` is the merged view visible to the input step; `computed`
    /// expressions additionally see the capture results produced in the same
    /// pass under `captured`.
    pub fn process_input_dynamics(
        &self,
        config: &DynamicsConfig,
        input: &InputResult,
        variables: &JsonMap<String, Value>,
    ) -> ProcessedDynamics {
        let default_scope = config.scope.unwrap_or(VariableScope::Runtime);
        let mut assignments = Vec::new();

        let capture_scope = capture_scope_object(input, variables);
        for (name, expression) in &config.capture {
            match evaluate_expression(expression, &capture_scope) {
                Some(value) => assignments.push(assignment(
                    name,
                    value,
                    expression,
                    default_scope,
                    AssignmentSource::Capture,
                    persists(config, name),
                )),
                None => {
                    warn!(variable = %name, expression = %expression, "capture expression did not resolve; skipping");
                }
            }
        }

        let captured: JsonMap<String, Value> = assignments
            .iter()
            .map(|entry| (entry.name.clone(), entry.value.clone()))
            .collect();
        let computed_scope = computed_scope_object(input, variables, &captured);
        for (name, expression) in &config.computed {
            match evaluate_expression(expression, &computed_scope) {
                Some(value) => assignments.push(assignment(
                    name,
                    value,
                    expression,
                    default_scope,
                    AssignmentSource::Computed,
                    persists(config, name),
                )),
                None => {
                    warn!(variable = %name, expression = %expression, "computed expression did not resolve; skipping");
                }
            }
        }

        let mut registered = Vec::new();
        for entry in &config.reevaluate {
            let mut triggers = entry.reevaluate_on.clone();
            if triggers.is_empty() {
                // Implicit triggers: the input's own variable and the rule's name.
                if !input.variable.is_empty() {
                    triggers.push(input.variable.clone());
                }
                triggers.push(entry.name.clone());
            }
            let definition = DynamicVariableDefinition {
                name: entry.name.clone(),
                expression: entry.expression.clone(),
                kind: entry.kind.unwrap_or(DynamicKind::Computed),
                scope: entry.scope.or(config.scope).unwrap_or(VariableScope::Runtime),
                persist: entry.persist.unwrap_or_else(|| persists(config, &entry.name)),
                reevaluate_on: triggers,
            };
            registered.push(definition);
        }
        self.register_definitions(registered.clone());

        ProcessedDynamics {
            assignments,
            registered_definitions: registered,
        }
    }

    /// Registers definitions for later reevaluation, upserting by identity.
    pub fn register_definitions(&self, definitions: Vec<DynamicVariableDefinition>) {
        let mut stored = self.definitions.lock().expect("definitions lock poisoned");
        for definition in definitions {
            debug!(variable = %definition.name, triggers = ?definition.reevaluate_on, "registered dynamic definition");
            stored.insert(definition.identity(), definition);
        }
    }

    /// Recomputes every registered definition whose trigger set intersects
    /// `triggered`.
    ///
    /// A definition with no explicit triggers falls back to the input's
    /// variable (when an input is in play) and its own name. Failed
    /// evaluations are logged and skipped.
    pub fn reevaluate(
        &self,
        triggered: &[String],
        input: Option<&InputResult>,
        variables: &JsonMap<String, Value>,
    ) -> Vec<DynamicVariableAssignment> {
        let definitions: Vec<DynamicVariableDefinition> = {
            let stored = self.definitions.lock().expect("definitions lock poisoned");
            stored.values().cloned().collect()
        };

        let mut assignments = Vec::new();
        for definition in definitions {
            let mut triggers = definition.reevaluate_on.clone();
            if triggers.is_empty() {
                if let Some(input) = input
                    && !input.variable.is_empty()
                {
                    triggers.push(input.variable.clone());
                }
                triggers.push(definition.name.clone());
            }
            if !triggers.iter().any(|trigger| triggered.contains(trigger)) {
                continue;
            }

            let scope_object = match definition.kind {
                DynamicKind::Capture => match input {
                    Some(input) => capture_scope_object(input, variables),
                    None => {
                        warn!(variable = %definition.name, "capture reevaluation without an input value; skipping");
                        continue;
                    }
                },
                DynamicKind::Computed => computed_scope_object_bare(input, variables),
            };

            match evaluate_expression(&definition.expression, &scope_object) {
                Some(value) => assignments.push(DynamicVariableAssignment {
                    name: definition.name.clone(),
                    value,
                    scope: definition.scope,
                    source: AssignmentSource::Reevaluation,
                    expression: definition.expression.clone(),
                    timestamp: Utc::now(),
                    reevaluated: true,
                    persist: definition.persist,
                }),
                None => {
                    warn!(variable = %definition.name, expression = %definition.expression, "reevaluation did not resolve; skipping");
                }
            }
        }
        assignments
    }

    /// Number of currently registered definitions.
    pub fn definition_count(&self) -> usize {
        self.definitions.lock().expect("definitions lock poisoned").len()
    }

    /// Drops every registered definition.
    pub fn reset(&self) {
        self.definitions.lock().expect("definitions lock poisoned").clear();
    }
}

fn persists(config: &DynamicsConfig, name: &str) -> bool {
    config.persist_to_global || config.exports.iter().any(|export| export == name)
}

fn assignment(
    name: &str,
    value: Value,
    expression: &str,
    scope: VariableScope,
    source: AssignmentSource,
    persist: bool,
) -> DynamicVariableAssignment {
    DynamicVariableAssignment {
        name: name.to_string(),
        value,
        scope,
        source,
        expression: expression.to_string(),
        timestamp: Utc::now(),
        reevaluated: false,
        persist,
    }
}

/// Scope object for `capture` expressions: the input's own value and metadata.
fn capture_scope_object(input: &InputResult, variables: &JsonMap<String, Value>) -> Value {
    json!({
        "value": input.value,
        "input": {
            "variable": input.variable,
            "value": input.value,
            "used_default": input.used_default,
        },
        "variables": Value::Object(variables.clone()),
        "metadata": Value::Object(input.metadata.clone()),
    })
}

/// Scope object for `computed` expressions: the merged view plus same-pass
/// capture results.
fn computed_scope_object(input: &InputResult, variables: &JsonMap<String, Value>, captured: &JsonMap<String, Value>) -> Value {
    json!({
        "variables": Value::Object(variables.clone()),
        "captured": Value::Object(captured.clone()),
        "input": {
            "variable": input.variable,
            "value": input.value,
        },
    })
}

fn computed_scope_object_bare(input: Option<&InputResult>, variables: &JsonMap<String, Value>) -> Value {
    let input_object = match input {
        Some(input) => json!({"variable": input.variable, "value": input.value}),
        None => Value::Null,
    };
    json!({
        "variables": Value::Object(variables.clone()),
        "captured": {},
        "input": input_object,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(variable: &str, value: Value) -> InputResult {
        InputResult {
            variable: variable.to_string(),
            value,
            used_default: false,
            metadata: JsonMap::new(),
        }
    }

    fn config_from_yaml(yaml: &str) -> DynamicsConfig {
        serde_yaml::from_str(yaml).expect("parse dynamics config")
    }

    #[test]
    fn capture_runs_against_the_input_value() {
        let engine = DynamicExpressionEngine::new();
        let config = config_from_yaml(
            r#"
capture:
  user_id: "value.id"
  user_name: "value.profile.name"
"#,
        );
        let input = input("user", json!({"id": 7, "profile": {"name": "alice"}}));

        let processed = engine.process_input_dynamics(&config, &input, &JsonMap::new());

        assert_eq!(processed.assignments.len(), 2);
        assert_eq!(processed.assignments[0].name, "user_id");
        assert_eq!(processed.assignments[0].value, json!(7));
        assert_eq!(processed.assignments[0].source, AssignmentSource::Capture);
        assert!(!processed.assignments[0].reevaluated);
    }

    #[test]
    fn computed_sees_same_pass_captures() {
        let engine = DynamicExpressionEngine::new();
        let config = config_from_yaml(
            r#"
capture:
  user_id: "value.id"
computed:
  greeting: "'user ' + captured.user_id"
"#,
        );
        let input = input("user", json!({"id": 7}));

        let processed = engine.process_input_dynamics(&config, &input, &JsonMap::new());

        let greeting = processed
            .assignments
            .iter()
            .find(|entry| entry.name == "greeting")
            .expect("computed assignment");
        assert_eq!(greeting.value, json!("user 7"));
        assert_eq!(greeting.source, AssignmentSource::Computed);
    }

    #[test]
    fn failed_expression_is_skipped_without_aborting_the_batch() {
        let engine = DynamicExpressionEngine::new();
        let config = config_from_yaml(
            r#"
capture:
  bad: "value.missing.deeply"
  good: "value.id"
"#,
        );
        let input = input("user", json!({"id": 7}));

        let processed = engine.process_input_dynamics(&config, &input, &JsonMap::new());

        assert_eq!(processed.assignments.len(), 1);
        assert_eq!(processed.assignments[0].name, "good");
    }

    #[test]
    fn exports_and_persist_to_global_mark_persistence() {
        let engine = DynamicExpressionEngine::new();
        let config = config_from_yaml(
            r#"
capture:
  user_id: "value.id"
  session: "value.session"
exports: [user_id]
"#,
        );
        let input = input("user", json!({"id": 7, "session": "s-1"}));

        let processed = engine.process_input_dynamics(&config, &input, &JsonMap::new());
        let by_name = |name: &str| processed.assignments.iter().find(|a| a.name == name).unwrap();
        assert!(by_name("user_id").persist);
        assert!(!by_name("session").persist);
    }

    #[test]
    fn reevaluate_entries_register_without_immediate_evaluation() {
        let engine = DynamicExpressionEngine::new();
        let config = config_from_yaml(
            r#"
reevaluate:
  - name: total
    expression: "variables.a + variables.b"
    reevaluate_on: [a, b]
"#,
        );
        let input = input("a", json!(1));

        let processed = engine.process_input_dynamics(&config, &input, &JsonMap::new());

        assert!(processed.assignments.is_empty());
        assert_eq!(processed.registered_definitions.len(), 1);
        assert_eq!(engine.definition_count(), 1);
    }

    #[test]
    fn reevaluation_fires_on_trigger_intersection_only() {
        let engine = DynamicExpressionEngine::new();
        engine.register_definitions(vec![DynamicVariableDefinition {
            name: "total".into(),
            expression: "variables.a + variables.b".into(),
            kind: DynamicKind::Computed,
            scope: VariableScope::Runtime,
            persist: false,
            reevaluate_on: vec!["a".into(), "b".into()],
        }]);

        let mut variables = JsonMap::new();
        variables.insert("a".into(), json!(2));
        variables.insert("b".into(), json!(3));

        let fired = engine.reevaluate(&["a".into()], None, &variables);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].value, json!(5));
        assert_eq!(fired[0].source, AssignmentSource::Reevaluation);
        assert!(fired[0].reevaluated);

        let quiet = engine.reevaluate(&["unrelated".into()], None, &variables);
        assert!(quiet.is_empty());
    }

    #[test]
    fn implicit_triggers_default_to_input_variable_and_name() {
        let engine = DynamicExpressionEngine::new();
        let config = config_from_yaml(
            r#"
reevaluate:
  - name: doubled
    expression: "variables.count + variables.count"
"#,
        );
        let step_input = input("count", json!(2));
        let processed = engine.process_input_dynamics(&config, &step_input, &JsonMap::new());
        assert_eq!(processed.registered_definitions[0].reevaluate_on, vec!["count", "doubled"]);

        let mut variables = JsonMap::new();
        variables.insert("count".into(), json!(4));
        let fired = engine.reevaluate(&["count".into()], Some(&step_input), &variables);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].value, json!(8));
    }

    #[test]
    fn capture_and_reevaluate_work_end_to_end() {
        let engine = DynamicExpressionEngine::new();
        let config = config_from_yaml(
            r#"
capture:
  x: "value"
reevaluate:
  - name: y
    expression: "variables.a + variables.b"
    reevaluate_on: [a, b]
"#,
        );
        let step_input = input("answer", json!("raw"));

        let processed = engine.process_input_dynamics(&config, &step_input, &JsonMap::new());
        assert_eq!(processed.assignments.len(), 1);
        assert_eq!(processed.assignments[0].name, "x");
        assert_eq!(processed.assignments[0].value, json!("raw"));
        assert_eq!(processed.registered_definitions.len(), 1);

        let mut variables = JsonMap::new();
        variables.insert("a".into(), json!(1));
        variables.insert("b".into(), json!(2));
        let fired = engine.reevaluate(&["a".into()], Some(&step_input), &variables);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].name, "y");
        assert_eq!(fired[0].value, json!(3));
        assert!(fired[0].reevaluated);
    }

    #[test]
    fn registering_the_same_identity_upserts() {
        let engine = DynamicExpressionEngine::new();
        let definition = DynamicVariableDefinition {
            name: "total".into(),
            expression: "variables.a".into(),
            kind: DynamicKind::Computed,
            scope: VariableScope::Runtime,
            persist: false,
            reevaluate_on: vec!["a".into()],
        };
        engine.register_definitions(vec![definition.clone()]);
        engine.register_definitions(vec![DynamicVariableDefinition {
            persist: true,
            ..definition
        }]);

        assert_eq!(engine.definition_count(), 1);

        let mut variables = JsonMap::new();
        variables.insert("a".into(), json!(1));
        let fired = engine.reevaluate(&["a".into()], None, &variables);
        assert!(fired[0].persist, "the later registration wins");
    }

    #[test]
    fn reset_drops_all_definitions() {
        let engine = DynamicExpressionEngine::new();
        engine.register_definitions(vec![DynamicVariableDefinition {
            name: "x".into(),
            expression: "variables.a".into(),
            kind: DynamicKind::Computed,
            scope: VariableScope::Runtime,
            persist: false,
            reevaluate_on: vec!["a".into()],
        }]);
        engine.reset();
        assert_eq!(engine.definition_count(), 0);
    }
}
