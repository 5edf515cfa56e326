//! Shared type definitions for the Trellis suite orchestrator.
//!
//! These structures cross crate boundaries: the engine produces them, the CLI
//! and reporting layers consume them. Anything that can appear in a suite file
//! or a cached result derives `Serialize`/`Deserialize`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

pub mod call;
pub mod dynamics;

pub use call::{
    CallIdentifier, CallStack, CallStatus, ErrorStrategy, PathMode, StepCallOptions, StepCallRequest, StepCallResult,
};
pub use dynamics::{
    AssignmentSource, DynamicKind, DynamicVariableAssignment, DynamicVariableDefinition, DynamicsConfig, InputResult,
    ReevaluateEntry,
};

/// A test suite found during discovery.
///
/// Created once per run and read-only thereafter; the dependency resolver and
/// the variable registry both key their state off `node_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredTest {
    /// Stable identifier of this suite within the run, unique per run.
    pub node_id: String,
    /// Human-readable suite name from the suite file.
    pub suite_name: String,
    /// Absolute path of the suite file this test was loaded from.
    pub file_path: PathBuf,
    /// Declared dependencies, each either a node id or a path to another suite file.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Variables this suite publishes for downstream suites. Missing values warn.
    #[serde(default)]
    pub exports: Vec<String>,
    /// Exports that publish silently when present and never warn when absent.
    #[serde(default)]
    pub optional_exports: Vec<String>,
}

/// Execution state of one node in the dependency graph.
///
/// Transitions are one-way: `Unvisited → Executing → Resolved | Failed`.
/// Observing `Executing` twice for the same node signals a live cycle or
/// duplicate concurrent work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Not yet picked up by the orchestrator.
    #[default]
    Unvisited,
    /// Currently executing; doubles as a mutual-exclusion marker.
    Executing,
    /// Finished successfully; a `DependencyResult` is stored.
    Resolved,
    /// Finished with an error.
    Failed,
}

/// Outcome of executing (or cache-serving) one suite node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyResult {
    /// Path of the suite file that produced this result.
    pub flow_path: PathBuf,
    /// Node identifier within the run.
    pub node_id: String,
    /// Suite name, carried for diagnostics.
    pub suite_name: String,
    /// Whether the suite completed successfully.
    pub success: bool,
    /// Wall-clock execution time in milliseconds; `0` iff `cached`.
    pub execution_time_ms: u64,
    /// Variables the suite exported, keyed by bare variable name.
    #[serde(default)]
    pub exported_variables: JsonMap<String, Value>,
    /// `true` iff this result was served from the result cache.
    #[serde(default)]
    pub cached: bool,
    /// Error message when `success` is false.
    #[serde(default)]
    pub error: Option<String>,
}

impl DependencyResult {
    /// Returns a copy marked as cache-served, with execution time zeroed.
    pub fn as_cached(&self) -> Self {
        Self {
            cached: true,
            execution_time_ms: 0,
            ..self.clone()
        }
    }
}

/// Visibility and lifetime class of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VariableScope {
    /// Visible to every suite in the process, lives for the process lifetime.
    Global,
    /// Visible within the owning suite, cleared when the suite finishes.
    Suite,
    /// Visible within the current step chain, cleared on every cleanup.
    #[default]
    Runtime,
    /// Replayed from another suite's exports.
    Imported,
}
