//! Dynamic-variable definitions and assignments.
//!
//! Interactive input steps can declare derived variables: `capture` entries
//! run against the raw input value, `computed` entries run against the merged
//! variable view, and `reevaluate` entries register for later recomputation
//! when one of their trigger variables changes.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::VariableScope;

/// Kind of a dynamic variable definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DynamicKind {
    /// Evaluated against the input's own value object.
    Capture,
    /// Evaluated against the merged variable view.
    Computed,
}

/// Origin of a dynamic variable assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentSource {
    /// Produced by an immediate capture evaluation.
    Capture,
    /// Produced by an immediate computed evaluation.
    Computed,
    /// Produced by a trigger-driven recomputation.
    Reevaluation,
}

/// A named rule describing how to (re)compute a derived variable.
///
/// Identity is `(name, kind, expression)`; re-registering the same triple
/// overwrites the previous definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicVariableDefinition {
    /// Variable name the evaluation assigns to.
    pub name: String,
    /// Expression evaluated to produce the value.
    pub expression: String,
    /// Evaluation kind.
    pub kind: DynamicKind,
    /// Scope the resulting assignment targets.
    #[serde(default)]
    pub scope: VariableScope,
    /// Whether the value is also published to the global export registry.
    #[serde(default)]
    pub persist: bool,
    /// Variable names whose changes re-trigger this definition.
    #[serde(default)]
    pub reevaluate_on: Vec<String>,
}

impl DynamicVariableDefinition {
    /// The identity key used for registration upserts.
    pub fn identity(&self) -> (String, DynamicKind, String) {
        (self.name.clone(), self.kind, self.expression.clone())
    }
}

/// The output of evaluating one definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicVariableAssignment {
    /// Variable name assigned.
    pub name: String,
    /// Resolved value.
    pub value: Value,
    /// Scope the assignment targets.
    pub scope: VariableScope,
    /// Where the assignment came from.
    pub source: AssignmentSource,
    /// The expression that produced the value.
    pub expression: String,
    /// When the evaluation happened.
    pub timestamp: DateTime<Utc>,
    /// `true` when produced by `reevaluate` rather than the initial pass.
    pub reevaluated: bool,
    /// Whether the value should persist to the global registry.
    pub persist: bool,
}

/// A `reevaluate` entry as authored in a suite file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReevaluateEntry {
    /// Variable name the recomputation assigns to.
    pub name: String,
    /// Expression evaluated on each trigger.
    pub expression: String,
    /// Kind; defaults to `computed` when omitted.
    #[serde(default)]
    pub kind: Option<DynamicKind>,
    /// Scope override; falls back to the config default.
    #[serde(default)]
    pub scope: Option<VariableScope>,
    /// Trigger variable names; defaulted by the engine when empty.
    #[serde(default)]
    pub reevaluate_on: Vec<String>,
    /// Persist override; falls back to the config-level rule.
    #[serde(default)]
    pub persist: Option<bool>,
}

/// The `dynamics` block attached to an input step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicsConfig {
    /// Name → expression pairs evaluated against the input value object.
    #[serde(default)]
    pub capture: IndexMap<String, String>,
    /// Name → expression pairs evaluated against the merged variable view.
    #[serde(default)]
    pub computed: IndexMap<String, String>,
    /// Definitions registered for later trigger-driven recomputation.
    #[serde(default)]
    pub reevaluate: Vec<ReevaluateEntry>,
    /// Default scope applied when an entry does not name one.
    #[serde(default)]
    pub scope: Option<VariableScope>,
    /// Names listed here persist their values to the global registry.
    #[serde(default)]
    pub exports: Vec<String>,
    /// When set, every produced assignment persists to the global registry.
    #[serde(default)]
    pub persist_to_global: bool,
}

/// The outcome of running one interactive input step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputResult {
    /// Variable the input step assigns its answer to.
    pub variable: String,
    /// The value the user supplied (or the default that was applied).
    pub value: Value,
    /// Whether the default value was used without prompting.
    #[serde(default)]
    pub used_default: bool,
    /// Prompt metadata forwarded to capture expressions.
    #[serde(default)]
    pub metadata: JsonMap<String, Value>,
}
