//! # Trellis Engine
//!
//! Orchestration core for cross-suite API test runs: suite discovery and
//! loading, dependency graph resolution, cross-suite step calls, variable
//! context management, and derived-variable evaluation.
//!
//! The engine performs no HTTP and renders no UI. Step execution is delegated
//! through the [`call::StepCallHandler`] trait, and every service here is an
//! explicit instance shared by `Arc` rather than ambient global state.

pub mod call;
pub mod context;
pub mod dependency;
pub mod discovery;
pub mod dynamics;
pub mod model;
pub mod registry;
pub mod resolve;

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub use call::{CallError, CallResolver, EchoStepHandler, ResolvedCall, StepCallHandler};
pub use context::{InMemoryVariableStore, VariableContextManager, VariableStore};
pub use dependency::DependencyResolver;
pub use discovery::discover_suites;
pub use dynamics::{DynamicExpressionEngine, ProcessedDynamics};
pub use model::{InputSpec, RequestSpec, StepCallSpec, SuiteBundle, SuiteSpec, SuiteStep};
pub use registry::{GlobalRegistry, IntegrityReport, NodeInfo, RegistrySnapshot, RegistryStats};

/// Parses a suite file into a [`SuiteBundle`].
///
/// YAML files may carry multiple `---`-separated suite documents; JSON files
/// carry exactly one suite. Each parsed suite must have a non-empty name and
/// at least one step.
pub fn parse_suite_file(path: &Path) -> Result<SuiteBundle> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read suite file '{}'", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));

    let mut bundle = SuiteBundle::default();
    if is_json {
        let suite: SuiteSpec =
            serde_json::from_str(&content).with_context(|| format!("invalid JSON suite '{}'", path.display()))?;
        admit_suite(&mut bundle, suite, path)?;
    } else {
        for document in serde_yaml::Deserializer::from_str(&content) {
            let suite = SuiteSpec::deserialize(document)
                .with_context(|| format!("invalid YAML suite '{}'", path.display()))?;
            admit_suite(&mut bundle, suite, path)?;
        }
    }

    if bundle.suites.is_empty() {
        bail!("suite file '{}' contains no suites", path.display());
    }
    Ok(bundle)
}

fn admit_suite(bundle: &mut SuiteBundle, suite: SuiteSpec, path: &Path) -> Result<()> {
    if suite.suite.trim().is_empty() {
        bail!("suite in '{}' is missing a name", path.display());
    }
    if suite.steps.is_empty() {
        bail!("suite '{}' in '{}' has no steps", suite.suite, path.display());
    }
    if bundle.suites.contains_key(&suite.suite) {
        bail!("suite '{}' is declared twice in '{}'", suite.suite, path.display());
    }
    bundle.suites.insert(suite.suite.clone(), suite);
    Ok(())
}
