//! # Suite Model Definitions
//!
//! Core data structures describing a test suite file: the suite itself, its
//! steps, and the blocks a step may carry (an HTTP request, a cross-suite
//! call, or an interactive input). Structures deserialize from both YAML and
//! JSON suite files.
//!
//! Deep schema validation is out of scope here; the loader in the crate root
//! performs only the structural checks needed to admit a file into a run.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use trellis_types::{DynamicsConfig, ErrorStrategy};

/// A collection of named suites loaded from one multi-suite document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SuiteBundle {
    /// Mapping of suite names to their specifications, in authoring order.
    pub suites: IndexMap<String, SuiteSpec>,
}

/// Complete specification for a single test suite.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SuiteSpec {
    /// Human-readable suite name. Required and non-empty.
    pub suite: String,

    /// Stable node identifier within a run. Defaults to the file stem when absent.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Base URL template for the suite's requests. Interpolated at context
    /// initialization against the currently visible variables.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Suites this one depends on, each a node id or a path to a suite file.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Suite-level variable templates, interpolated into suite scope when the
    /// context is initialized.
    #[serde(default)]
    pub variables: JsonMap<String, Value>,

    /// Variables this suite publishes after finishing. Missing values warn.
    #[serde(default)]
    pub exports: Vec<String>,

    /// Exports that publish silently when present, never warn when absent.
    #[serde(default)]
    pub optional_exports: Vec<String>,

    /// Ordered steps to execute. Required and non-empty.
    #[serde(default)]
    pub steps: Vec<SuiteStep>,
}

impl SuiteSpec {
    /// Locates a step by id first, then by name, both case-insensitive and trimmed.
    pub fn find_step(&self, key: &str) -> Option<&SuiteStep> {
        let needle = key.trim().to_lowercase();
        self.steps
            .iter()
            .find(|step| step.id.trim().to_lowercase() == needle)
            .or_else(|| {
                self.steps
                    .iter()
                    .find(|step| step.name.as_deref().is_some_and(|name| name.trim().to_lowercase() == needle))
            })
    }

    /// Renders every step's identifiers for "step not found" diagnostics.
    pub fn available_step_identifiers(&self) -> String {
        self.steps
            .iter()
            .map(|step| match &step.name {
                Some(name) => format!("'{}' (name '{}')", step.id, name),
                None => format!("'{}'", step.id),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A single executable unit within a suite.
///
/// Exactly one of `request`, `call`, or `input` is expected; the engine treats
/// a step carrying none of them as a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SuiteStep {
    /// Unique identifier for the step within the suite.
    pub id: String,

    /// Optional human-friendly step name, also usable as a call target key.
    #[serde(default)]
    pub name: Option<String>,

    /// HTTP request issued by this step, executed by the injected handler.
    #[serde(default)]
    pub request: Option<RequestSpec>,

    /// Cross-suite call issued by this step.
    #[serde(default)]
    pub call: Option<StepCallSpec>,

    /// Interactive input prompt attached to this step.
    #[serde(default)]
    pub input: Option<InputSpec>,

    /// Variables captured from this step's response, name → extraction expression.
    #[serde(default)]
    pub capture: IndexMap<String, String>,
}

/// An HTTP request description. Transport is delegated to the handler.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestSpec {
    /// HTTP method; defaults to GET.
    #[serde(default = "default_method")]
    pub method: String,

    /// Path appended to the suite's `base_url`, template-interpolated.
    pub path: String,

    /// Request headers, template-interpolated.
    #[serde(default)]
    pub headers: JsonMap<String, Value>,

    /// Optional JSON body, template-interpolated.
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A cross-suite call block as authored in a suite file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCallSpec {
    /// Target suite path, relative to this suite file by default.
    pub test: String,

    /// Target step key, matched by id first then by name.
    pub step: String,

    /// Variables passed to the called step.
    #[serde(default)]
    pub variables: JsonMap<String, Value>,

    /// Error strategy for execution failures of the called step.
    #[serde(default)]
    pub on_error: Option<ErrorStrategy>,

    /// Optional handler timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// An interactive input block attached to a step.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InputSpec {
    /// Variable the answer is assigned to.
    pub variable: String,

    /// Prompt text shown to the operator. Rendering is out of scope here.
    #[serde(default)]
    pub prompt: Option<String>,

    /// Default applied when no interactive answer is available.
    #[serde(default)]
    pub default: Option<Value>,

    /// Derived-variable rules evaluated when this input runs.
    #[serde(default)]
    pub dynamics: Option<DynamicsConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite_with_steps() -> SuiteSpec {
        SuiteSpec {
            suite: "Orders".into(),
            steps: vec![
                SuiteStep {
                    id: "create-order".into(),
                    name: Some("Create Order".into()),
                    ..Default::default()
                },
                SuiteStep {
                    id: "check-status".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn find_step_prefers_id_over_name() {
        let mut suite = suite_with_steps();
        suite.steps[1].name = Some("create-order".into());

        let found = suite.find_step("create-order").expect("step");
        assert_eq!(found.id, "create-order");
    }

    #[test]
    fn find_step_matches_name_case_insensitively() {
        let suite = suite_with_steps();
        let found = suite.find_step("  CREATE ORDER ").expect("step by name");
        assert_eq!(found.id, "create-order");
        assert!(suite.find_step("missing").is_none());
    }

    #[test]
    fn available_identifiers_lists_ids_and_names() {
        let suite = suite_with_steps();
        let listing = suite.available_step_identifiers();
        assert!(listing.contains("'create-order' (name 'Create Order')"));
        assert!(listing.contains("'check-status'"));
    }

    #[test]
    fn call_spec_parses_with_strategy() {
        let yaml = r#"
test: "../auth/login.yaml"
step: login
variables:
  user: alice
on_error: warn
"#;
        let call: StepCallSpec = serde_yaml::from_str(yaml).expect("parse call spec");
        assert_eq!(call.step, "login");
        assert_eq!(call.on_error, Some(ErrorStrategy::Warn));
    }
}
