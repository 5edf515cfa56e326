//! Cross-suite call primitives.
//!
//! A step in one suite may invoke a step defined in another suite file. The
//! types here identify one callable target ([`CallIdentifier`]), track one
//! logical invocation chain ([`CallStack`]), and describe the request/response
//! contract between the call resolver and its injected execution handler.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

/// Identifies one callable target: normalized suite path plus step key.
///
/// The step key is lower-cased and trimmed so that `Login`, `login` and
/// ` login ` all name the same target for recursion detection and caching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallIdentifier {
    suite_path: PathBuf,
    step_key: String,
}

impl CallIdentifier {
    /// Builds an identifier from an absolute suite path and a raw step key.
    pub fn new(suite_path: impl Into<PathBuf>, step_key: &str) -> Self {
        Self {
            suite_path: suite_path.into(),
            step_key: step_key.trim().to_lowercase(),
        }
    }

    /// The normalized suite path component.
    pub fn suite_path(&self) -> &Path {
        &self.suite_path
    }

    /// The normalized step key component.
    pub fn step_key(&self) -> &str {
        &self.step_key
    }

    /// Renders the identifier in canonical `<path>::<step>` form.
    pub fn canonical_string(&self) -> String {
        format!("{}::{}", self.suite_path.display(), self.step_key)
    }
}

/// Ordered list of call identifiers for one logical invocation chain.
///
/// Each chain owns its own stack instance; chains never share one. Pushed on
/// entry, popped on exit whether the call succeeded or failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallStack {
    frames: Vec<CallIdentifier>,
}

impl CallStack {
    /// Creates an empty call stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current chain depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether the chain already contains `identifier` (a recursive call).
    pub fn contains(&self, identifier: &CallIdentifier) -> bool {
        self.frames.contains(identifier)
    }

    /// Pushes an identifier onto the chain.
    pub fn push(&mut self, identifier: CallIdentifier) {
        self.frames.push(identifier);
    }

    /// Removes `identifier` from the chain.
    ///
    /// Removes the last frame when it matches, otherwise searches and removes
    /// by value. The fallback keeps a chain consistent if pushes and pops ever
    /// interleave non-LIFO. Returns `false` when the identifier was absent.
    pub fn remove(&mut self, identifier: &CallIdentifier) -> bool {
        if self.frames.last() == Some(identifier) {
            self.frames.pop();
            return true;
        }
        if let Some(position) = self.frames.iter().rposition(|frame| frame == identifier) {
            self.frames.remove(position);
            return true;
        }
        false
    }

    /// The frames currently on the chain, oldest first.
    pub fn frames(&self) -> &[CallIdentifier] {
        &self.frames
    }

    /// Renders the chain as `a::x -> b::y` for error messages.
    pub fn render(&self) -> String {
        self.frames
            .iter()
            .map(CallIdentifier::canonical_string)
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// How the target suite path of a call is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PathMode {
    /// Resolve against the caller file's directory; absolute inputs are rejected.
    #[default]
    Relative,
    /// Resolve against the configured sandbox root.
    Absolute,
}

/// What to do when the delegated handler reports a step execution failure.
///
/// Governs execution failures only; security and recursion errors always
/// propagate regardless of this strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    /// Propagate the failure to the caller.
    #[default]
    Fail,
    /// Log at info level and continue with a skipped result.
    Continue,
    /// Log at warn level and continue with a failure result.
    Warn,
}

/// A request to invoke a step defined in another suite file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCallRequest {
    /// Target suite path as authored in the calling suite.
    pub test: String,
    /// Target step, matched by id first, then by name.
    pub step: String,
    /// Path of the suite file issuing the call.
    pub caller_path: PathBuf,
    /// Variables passed into the called step.
    #[serde(default)]
    pub variables: JsonMap<String, Value>,
    /// Optional timeout threaded through to the execution handler, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Per-resolver configuration for cross-suite calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCallOptions {
    /// Path resolution mode.
    #[serde(default)]
    pub path_mode: PathMode,
    /// Error strategy for handler execution failures.
    #[serde(default)]
    pub on_error: ErrorStrategy,
    /// Maximum chain depth before a call is rejected.
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// Directory no resolved path may escape. Required in `Absolute` mode.
    #[serde(default)]
    pub sandbox_root: Option<PathBuf>,
}

fn default_max_call_depth() -> usize {
    10
}

impl Default for StepCallOptions {
    fn default() -> Self {
        Self {
            path_mode: PathMode::default(),
            on_error: ErrorStrategy::default(),
            max_call_depth: default_max_call_depth(),
            sandbox_root: None,
        }
    }
}

/// Terminal status of a cross-suite call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Handler executed the step successfully.
    Success,
    /// Handler reported a failure that the `Warn` strategy downgraded.
    Failure,
    /// Call was skipped under the `Continue` strategy.
    Skipped,
}

/// Result of a cross-suite call, produced by the resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCallResult {
    /// Whether the called step executed successfully.
    pub success: bool,
    /// Terminal status, including strategy-downgraded outcomes.
    pub status: CallStatus,
    /// Output the handler produced, if any.
    #[serde(default)]
    pub output: Value,
    /// Variables captured by the called step for the caller to absorb.
    #[serde(default)]
    pub captured_variables: JsonMap<String, Value>,
    /// Error detail when the call did not succeed.
    #[serde(default)]
    pub error: Option<String>,
}

impl StepCallResult {
    /// A successful result carrying the handler output.
    pub fn success(output: Value, captured_variables: JsonMap<String, Value>) -> Self {
        Self {
            success: true,
            status: CallStatus::Success,
            output,
            captured_variables,
            error: None,
        }
    }

    /// A skipped result produced by the `Continue` strategy.
    pub fn skipped(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: CallStatus::Skipped,
            output: Value::Null,
            captured_variables: JsonMap::new(),
            error: Some(error.into()),
        }
    }

    /// A failure result produced by the `Warn` strategy.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: CallStatus::Failure,
            output: Value::Null,
            captured_variables: JsonMap::new(),
            error: Some(error.into()),
        }
    }
}
