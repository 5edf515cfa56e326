//! Cross-suite step invocation with sandboxing and recursion guards.
//!
//! A step in one suite may call a step defined in another suite file. The
//! resolver turns that request into a concrete target: it resolves the path
//! (rejecting sandbox escapes before the file is ever read), loads the target
//! suite through an mtime-keyed content cache, locates the step, and delegates
//! execution to an injected [`StepCallHandler`]. The resolver itself never
//! performs HTTP or assertions.
//!
//! Error categories matter here: security, recursion, and structural errors
//! always propagate; only execution failures raised by the handler are
//! governed by the per-call [`ErrorStrategy`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use trellis_types::{CallIdentifier, CallStack, ErrorStrategy, PathMode, StepCallOptions, StepCallRequest, StepCallResult};
use trellis_util::{normalize_lexically, path_is_contained};

use crate::model::{SuiteBundle, SuiteSpec, SuiteStep};

/// Errors raised while resolving or executing a cross-suite call.
#[derive(Debug, Error)]
pub enum CallError {
    /// Relative mode rejects absolute target paths outright.
    #[error("absolute path '{path}' is not allowed in relative resolution mode")]
    AbsolutePathRejected { path: String },

    /// Absolute mode needs a sandbox root to resolve against.
    #[error("absolute resolution mode requires a configured sandbox root")]
    SandboxRootMissing,

    /// The resolved path escapes the configured sandbox root.
    #[error("resolved path '{resolved}' escapes sandbox root '{root}'")]
    SandboxViolation { resolved: PathBuf, root: PathBuf },

    /// The target file does not exist. Governed by the error strategy.
    #[error("call target '{attempted}' not found (resolved to '{resolved}')")]
    TargetNotFound { attempted: String, resolved: PathBuf },

    /// The resolved path exists but is not a regular file. Governed by the
    /// error strategy.
    #[error("call target '{attempted}' resolved to '{resolved}', which is not a regular file")]
    NotAFile { attempted: String, resolved: PathBuf },

    /// The identifier is already on the invocation chain.
    #[error("Recursive call detected for '{identifier}'; call stack: {stack}")]
    RecursiveCall { identifier: String, stack: String },

    /// The invocation chain reached the configured depth limit.
    #[error("max call depth exceeded ({depth} >= {max}); call stack: {stack}")]
    MaxDepthExceeded { depth: usize, max: usize, stack: String },

    /// The target suite failed to load or parse.
    #[error("failed to load suite '{path}': {message}")]
    SuiteLoad { path: PathBuf, message: String },

    /// No step in the target file matches the requested key.
    #[error("step '{step}' not found in '{path}'; available steps: {available}")]
    StepNotFound { step: String, path: PathBuf, available: String },

    /// The delegated handler reported an execution failure. Governed by the
    /// error strategy.
    #[error("step call execution failed: {message}")]
    Execution { message: String },
}

impl CallError {
    /// Whether the per-call error strategy applies to this error.
    ///
    /// Only target-file and handler execution failures are governable;
    /// security, recursion, and structural errors always propagate.
    fn is_governed(&self) -> bool {
        matches!(
            self,
            CallError::TargetNotFound { .. } | CallError::NotAFile { .. } | CallError::Execution { .. }
        )
    }
}

/// A fully resolved call target handed to the execution handler.
///
/// Owned clones throughout: the handler can never mutate the resolver's
/// cached copy of the suite.
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    /// Normalized absolute path of the target suite file.
    pub suite_path: PathBuf,
    /// The suite containing the target step.
    pub suite: SuiteSpec,
    /// The target step.
    pub step: SuiteStep,
    /// Identifier under which this call sits on the invocation chain.
    pub identifier: CallIdentifier,
}

/// Executes one resolved step on behalf of the call resolver.
///
/// Implementations perform the actual work (HTTP requests, assertions); the
/// resolver awaits them to completion before unwinding the call stack. The
/// optional timeout on the request is the handler's to honor.
#[async_trait]
pub trait StepCallHandler: Send + Sync {
    /// Executes `call.step` with the variables carried by `request`.
    async fn execute(&self, call: &ResolvedCall, request: &StepCallRequest, options: &StepCallOptions) -> anyhow::Result<StepCallResult>;
}

/// Handler that echoes the resolved target without side effects, for dry runs
/// and tests.
pub struct EchoStepHandler;

#[async_trait]
impl StepCallHandler for EchoStepHandler {
    async fn execute(&self, call: &ResolvedCall, request: &StepCallRequest, _options: &StepCallOptions) -> anyhow::Result<StepCallResult> {
        let mut output = serde_json::Map::new();
        output.insert("suite".into(), Value::String(call.suite.suite.clone()));
        output.insert("step".into(), Value::String(call.step.id.clone()));
        output.insert("variables".into(), Value::Object(request.variables.clone()));
        Ok(StepCallResult::success(Value::Object(output), serde_json::Map::new()))
    }
}

struct CachedSuite {
    modified: SystemTime,
    bundle: SuiteBundle,
}

/// Resolves and invokes steps defined in other suite files.
pub struct CallResolver {
    handler: Arc<dyn StepCallHandler>,
    cache: Mutex<HashMap<PathBuf, CachedSuite>>,
}

impl CallResolver {
    /// Creates a resolver delegating execution to `handler`.
    pub fn new(handler: Arc<dyn StepCallHandler>) -> Self {
        Self {
            handler,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves and executes one cross-suite call against the caller's
    /// invocation chain.
    ///
    /// The identifier pushed for this call is removed from `stack` whether
    /// the handler succeeds or fails, so stack depth is identical before and
    /// after the call.
    pub async fn execute_step_call(
        &self,
        request: &StepCallRequest,
        options: &StepCallOptions,
        stack: &mut CallStack,
    ) -> Result<StepCallResult, CallError> {
        match self.resolve_and_execute(request, options, stack).await {
            Ok(result) => Ok(result),
            Err(error) if error.is_governed() => apply_error_strategy(error, options.on_error, request),
            Err(error) => Err(error),
        }
    }

    async fn resolve_and_execute(
        &self,
        request: &StepCallRequest,
        options: &StepCallOptions,
        stack: &mut CallStack,
    ) -> Result<StepCallResult, CallError> {
        let resolved_path = resolve_target_path(request, options)?;

        // The containment check runs before any filesystem read and is never
        // downgraded by the error strategy.
        if let Some(root) = &options.sandbox_root
            && !path_is_contained(root, &resolved_path)
        {
            return Err(CallError::SandboxViolation {
                resolved: resolved_path,
                root: root.clone(),
            });
        }

        let metadata = std::fs::metadata(&resolved_path).map_err(|_| CallError::TargetNotFound {
            attempted: request.test.clone(),
            resolved: resolved_path.clone(),
        })?;
        if !metadata.is_file() {
            return Err(CallError::NotAFile {
                attempted: request.test.clone(),
                resolved: resolved_path,
            });
        }

        let identifier = CallIdentifier::new(resolved_path.clone(), &request.step);
        if stack.contains(&identifier) {
            return Err(CallError::RecursiveCall {
                identifier: identifier.canonical_string(),
                stack: stack.render(),
            });
        }
        if stack.depth() >= options.max_call_depth {
            return Err(CallError::MaxDepthExceeded {
                depth: stack.depth(),
                max: options.max_call_depth,
                stack: stack.render(),
            });
        }

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let bundle = self.load_bundle(&resolved_path, modified)?;
        let (suite, step) = find_step(&bundle, &request.step).ok_or_else(|| CallError::StepNotFound {
            step: request.step.clone(),
            path: resolved_path.clone(),
            available: available_identifiers(&bundle),
        })?;

        let call = ResolvedCall {
            suite_path: resolved_path,
            suite,
            step,
            identifier: identifier.clone(),
        };

        debug!(target = %call.identifier.canonical_string(), depth = stack.depth(), "executing cross-suite call");
        stack.push(identifier.clone());
        let outcome = self.handler.execute(&call, request, options).await;
        stack.remove(&identifier);

        outcome.map_err(|error| CallError::Execution { message: error.to_string() })
    }

    /// Loads a suite bundle through the mtime-keyed content cache.
    ///
    /// A stale modification time forces a reload; the returned bundle is a
    /// clone, so callers never touch the cached copy.
    fn load_bundle(&self, path: &Path, modified: SystemTime) -> Result<SuiteBundle, CallError> {
        {
            let cache = self.cache.lock().expect("suite cache lock poisoned");
            if let Some(entry) = cache.get(path)
                && entry.modified == modified
            {
                return Ok(entry.bundle.clone());
            }
        }

        let bundle = crate::parse_suite_file(path).map_err(|error| CallError::SuiteLoad {
            path: path.to_path_buf(),
            message: error.to_string(),
        })?;

        let mut cache = self.cache.lock().expect("suite cache lock poisoned");
        cache.insert(
            path.to_path_buf(),
            CachedSuite {
                modified,
                bundle: bundle.clone(),
            },
        );
        Ok(bundle)
    }
}

fn resolve_target_path(request: &StepCallRequest, options: &StepCallOptions) -> Result<PathBuf, CallError> {
    let target = Path::new(&request.test);
    match options.path_mode {
        PathMode::Relative => {
            if target.is_absolute() {
                return Err(CallError::AbsolutePathRejected {
                    path: request.test.clone(),
                });
            }
            let base = request.caller_path.parent().unwrap_or_else(|| Path::new("."));
            Ok(normalize_lexically(&base.join(target)))
        }
        PathMode::Absolute => {
            let root = options.sandbox_root.as_ref().ok_or(CallError::SandboxRootMissing)?;
            let relative = target.strip_prefix("/").unwrap_or(target);
            Ok(normalize_lexically(&root.join(relative)))
        }
    }
}

fn apply_error_strategy(error: CallError, strategy: ErrorStrategy, request: &StepCallRequest) -> Result<StepCallResult, CallError> {
    match strategy {
        ErrorStrategy::Fail => Err(error),
        ErrorStrategy::Continue => {
            info!(target = %request.test, step = %request.step, error = %error, "step call skipped by continue strategy");
            Ok(StepCallResult::skipped(error.to_string()))
        }
        ErrorStrategy::Warn => {
            warn!(target = %request.test, step = %request.step, error = %error, "step call failed; continuing by warn strategy");
            Ok(StepCallResult::failure(error.to_string()))
        }
    }
}

fn find_step(bundle: &SuiteBundle, key: &str) -> Option<(SuiteSpec, SuiteStep)> {
    for suite in bundle.suites.values() {
        if let Some(step) = suite.find_step(key) {
            return Some((suite.clone(), step.clone()));
        }
    }
    None
}

fn available_identifiers(bundle: &SuiteBundle) -> String {
    bundle
        .suites
        .values()
        .map(SuiteSpec::available_step_identifiers)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use trellis_types::CallStatus;

    const TARGET_SUITE: &str = r#"
suite: "Target Suite"
steps:
  - id: login
    name: "Login"
  - id: logout
"#;

    fn write_suite(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("create suite file");
        file.write_all(content.as_bytes()).expect("write suite file");
        path
    }

    fn request(test: &str, step: &str, caller: PathBuf) -> StepCallRequest {
        StepCallRequest {
            test: test.into(),
            step: step.into(),
            caller_path: caller,
            variables: serde_json::Map::new(),
            timeout_ms: None,
        }
    }

    fn resolver() -> CallResolver {
        CallResolver::new(Arc::new(EchoStepHandler))
    }

    #[tokio::test]
    async fn resolves_relative_target_and_balances_stack() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_suite(dir.path(), "target.yaml", TARGET_SUITE);
        let caller = dir.path().join("caller.yaml");

        let resolver = resolver();
        let options = StepCallOptions::default();
        let mut stack = CallStack::new();

        let result = resolver
            .execute_step_call(&request("target.yaml", "Login", caller), &options, &mut stack)
            .await
            .expect("call succeeds");

        assert!(result.success);
        assert_eq!(result.output["step"], "login");
        assert_eq!(stack.depth(), 0);
    }

    #[tokio::test]
    async fn rejects_absolute_path_in_relative_mode() {
        let resolver = resolver();
        let options = StepCallOptions::default();
        let mut stack = CallStack::new();

        let error = resolver
            .execute_step_call(&request("/etc/target.yaml", "login", PathBuf::from("/suites/caller.yaml")), &options, &mut stack)
            .await
            .expect_err("must reject");
        assert!(matches!(error, CallError::AbsolutePathRejected { .. }));
    }

    #[tokio::test]
    async fn sandbox_escape_always_throws_even_with_continue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = dir.path().join("sandbox");
        std::fs::create_dir(&sandbox).expect("mkdir");
        write_suite(dir.path(), "outside.yaml", TARGET_SUITE);
        let caller = sandbox.join("caller.yaml");

        let resolver = resolver();
        let options = StepCallOptions {
            sandbox_root: Some(sandbox),
            on_error: ErrorStrategy::Continue,
            ..Default::default()
        };
        let mut stack = CallStack::new();

        let error = resolver
            .execute_step_call(&request("../outside.yaml", "login", caller), &options, &mut stack)
            .await
            .expect_err("sandbox violation must propagate");
        assert!(matches!(error, CallError::SandboxViolation { .. }));
    }

    #[tokio::test]
    async fn missing_file_with_continue_returns_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let caller = dir.path().join("caller.yaml");

        let resolver = resolver();
        let options = StepCallOptions {
            on_error: ErrorStrategy::Continue,
            ..Default::default()
        };
        let mut stack = CallStack::new();

        let result = resolver
            .execute_step_call(&request("missing.yaml", "login", caller), &options, &mut stack)
            .await
            .expect("continue strategy downgrades");
        assert!(!result.success);
        assert_eq!(result.status, CallStatus::Skipped);
    }

    #[tokio::test]
    async fn missing_file_with_fail_throws() {
        let dir = tempfile::tempdir().expect("tempdir");
        let caller = dir.path().join("caller.yaml");

        let resolver = resolver();
        let mut stack = CallStack::new();
        let error = resolver
            .execute_step_call(&request("missing.yaml", "login", caller), &StepCallOptions::default(), &mut stack)
            .await
            .expect_err("fail strategy propagates");
        assert!(matches!(error, CallError::TargetNotFound { .. }));
    }

    #[tokio::test]
    async fn recursive_call_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = write_suite(dir.path(), "target.yaml", TARGET_SUITE);
        let caller = dir.path().join("caller.yaml");

        let resolver = resolver();
        let mut stack = CallStack::new();
        stack.push(CallIdentifier::new(normalize_lexically(&target), "login"));

        let error = resolver
            .execute_step_call(&request("target.yaml", "LOGIN", caller), &StepCallOptions::default(), &mut stack)
            .await
            .expect_err("recursion must throw");
        assert!(error.to_string().contains("Recursive"));
        // The pre-existing frame is untouched.
        assert_eq!(stack.depth(), 1);
    }

    #[tokio::test]
    async fn depth_limit_is_enforced() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_suite(dir.path(), "target.yaml", TARGET_SUITE);
        let caller = dir.path().join("caller.yaml");

        let resolver = resolver();
        let options = StepCallOptions {
            max_call_depth: 2,
            ..Default::default()
        };
        let mut stack = CallStack::new();
        stack.push(CallIdentifier::new("/a.yaml", "one"));
        stack.push(CallIdentifier::new("/b.yaml", "two"));

        let error = resolver
            .execute_step_call(&request("target.yaml", "login", caller), &options, &mut stack)
            .await
            .expect_err("depth limit must throw");
        assert!(matches!(error, CallError::MaxDepthExceeded { .. }));
    }

    #[tokio::test]
    async fn missing_step_lists_available_identifiers() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_suite(dir.path(), "target.yaml", TARGET_SUITE);
        let caller = dir.path().join("caller.yaml");

        let resolver = resolver();
        let mut stack = CallStack::new();
        let error = resolver
            .execute_step_call(&request("target.yaml", "ghost", caller), &StepCallOptions::default(), &mut stack)
            .await
            .expect_err("missing step is structural");
        let message = error.to_string();
        assert!(message.contains("'login' (name 'Login')"), "message: {message}");
        assert!(message.contains("'logout'"), "message: {message}");
    }

    #[tokio::test]
    async fn stack_balances_when_handler_fails() {
        struct FailingHandler;
        #[async_trait]
        impl StepCallHandler for FailingHandler {
            async fn execute(&self, _: &ResolvedCall, _: &StepCallRequest, _: &StepCallOptions) -> anyhow::Result<StepCallResult> {
                anyhow::bail!("boom")
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        write_suite(dir.path(), "target.yaml", TARGET_SUITE);
        let caller = dir.path().join("caller.yaml");

        let resolver = CallResolver::new(Arc::new(FailingHandler));
        let mut stack = CallStack::new();
        let error = resolver
            .execute_step_call(&request("target.yaml", "login", caller.clone()), &StepCallOptions::default(), &mut stack)
            .await
            .expect_err("fail strategy propagates handler errors");
        assert!(matches!(error, CallError::Execution { .. }));
        assert_eq!(stack.depth(), 0);

        // Warn strategy downgrades the same failure to a failure result.
        let options = StepCallOptions {
            on_error: ErrorStrategy::Warn,
            ..Default::default()
        };
        let result = resolver
            .execute_step_call(&request("target.yaml", "login", caller.clone()), &options, &mut stack)
            .await
            .expect("warn strategy downgrades");
        assert_eq!(result.status, CallStatus::Failure);
        assert_eq!(stack.depth(), 0);
    }

    #[tokio::test]
    async fn stale_mtime_forces_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = write_suite(dir.path(), "target.yaml", TARGET_SUITE);
        let caller = dir.path().join("caller.yaml");

        let resolver = resolver();
        let options = StepCallOptions::default();
        let mut stack = CallStack::new();
        resolver
            .execute_step_call(&request("target.yaml", "login", caller.clone()), &options, &mut stack)
            .await
            .expect("first call");

        // Rewrite the target with a renamed step and a bumped mtime.
        let renamed = TARGET_SUITE.replace("id: login", "id: signin");
        std::fs::write(&target, renamed).expect("rewrite");
        let bumped = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::open(&target).expect("open");
        file.set_modified(bumped).expect("set mtime");

        let result = resolver
            .execute_step_call(&request("target.yaml", "signin", caller), &options, &mut stack)
            .await
            .expect("reloaded suite exposes the new step");
        assert_eq!(result.output["step"], "signin");
    }

    #[tokio::test]
    async fn independent_stacks_do_not_interfere() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_suite(dir.path(), "target.yaml", TARGET_SUITE);
        let caller = dir.path().join("caller.yaml");

        let resolver = Arc::new(resolver());
        let options = StepCallOptions::default();

        let mut first_stack = CallStack::new();
        let mut second_stack = CallStack::new();

        let first = resolver
            .execute_step_call(&request("target.yaml", "login", caller.clone()), &options, &mut first_stack)
            .await
            .expect("first chain");
        let second = resolver
            .execute_step_call(&request("target.yaml", "login", caller), &options, &mut second_stack)
            .await
            .expect("second chain");

        assert!(first.success && second.success);
        assert_eq!(first_stack.depth(), 0);
        assert_eq!(second_stack.depth(), 0);
    }
}
