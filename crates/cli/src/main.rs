use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Map as JsonMap, Value};
use tracing::{error, info, warn, Level};
use trellis_engine::{
    discover_suites, parse_suite_file, resolve::interpolate_string, resolve::interpolate_value, resolve::lookup_path,
    CallResolver, DependencyResolver, DynamicExpressionEngine, EchoStepHandler, GlobalRegistry, InMemoryVariableStore,
    ResolvedCall, StepCallHandler, SuiteSpec, SuiteStep, VariableContextManager, VariableStore,
};
use trellis_types::{
    CallStack, DependencyResult, DiscoveredTest, InputResult, StepCallOptions, StepCallRequest, StepCallResult,
    VariableScope,
};
use trellis_util::normalize_lexically;

#[derive(Parser)]
#[command(name = "trellis", about = "Cross-suite API test orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Discover suites under a directory and execute them in dependency order.
    Run {
        /// Directory containing suite files.
        dir: PathBuf,

        /// Resolve calls and print targets without performing HTTP.
        #[arg(long)]
        dry_run: bool,

        /// Always re-execute dependencies instead of serving cached results.
        #[arg(long)]
        no_cache: bool,

        /// Directory no cross-suite call may escape. Defaults to the suite directory.
        #[arg(long)]
        sandbox: Option<PathBuf>,

        /// Maximum cross-suite call chain depth.
        #[arg(long, default_value_t = 10)]
        max_call_depth: usize,
    },

    /// Discover suites, build the dependency graph, and report problems
    /// without executing anything.
    Validate {
        /// Directory containing suite files.
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            dir,
            dry_run,
            no_cache,
            sandbox,
            max_call_depth,
        } => run(dir, dry_run, no_cache, sandbox, max_call_depth).await,
        Command::Validate { dir } => validate(dir),
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .try_init();
}

fn validate(dir: PathBuf) -> Result<()> {
    let discovered = discover_suites(&dir)?;
    if discovered.is_empty() {
        bail!("no suite files found under '{}'", dir.display());
    }

    let resolver = DependencyResolver::new();
    resolver.build_dependency_graph(&discovered)?;

    let cycles = resolver.detect_circular_dependencies();
    if !cycles.is_empty() {
        for message in &cycles {
            error!("{message}");
        }
        bail!("{} circular dependency problem(s) found", cycles.len());
    }

    let order = resolver.resolve_execution_order(&discovered)?;
    println!("{} suites, execution order:", order.len());
    for (position, test) in order.iter().enumerate() {
        println!("  {}. {} ({})", position + 1, test.node_id, test.file_path.display());
    }
    Ok(())
}

async fn run(dir: PathBuf, dry_run: bool, no_cache: bool, sandbox: Option<PathBuf>, max_call_depth: usize) -> Result<()> {
    let discovered = discover_suites(&dir)?;
    if discovered.is_empty() {
        bail!("no suite files found under '{}'", dir.display());
    }
    info!(count = discovered.len(), dir = %dir.display(), "discovered suites");

    let resolver = DependencyResolver::new();
    resolver.set_cache_enabled(!no_cache);
    resolver.build_dependency_graph(&discovered)?;

    let cycles = resolver.detect_circular_dependencies();
    if !cycles.is_empty() {
        for message in &cycles {
            error!("{message}");
        }
        bail!("cannot run: dependency graph contains cycles");
    }
    let order = resolver.resolve_execution_order(&discovered)?;

    let registry = Arc::new(GlobalRegistry::new());
    let context = VariableContextManager::new(Arc::new(InMemoryVariableStore::new()), registry);
    let dynamics = DynamicExpressionEngine::new();
    let handler: Arc<dyn StepCallHandler> = if dry_run {
        Arc::new(EchoStepHandler)
    } else {
        Arc::new(HttpStepHandler::new()?)
    };
    let calls = CallResolver::new(handler.clone());
    let call_options = StepCallOptions {
        sandbox_root: Some(normalize_lexically(&sandbox.unwrap_or_else(|| dir.clone()))),
        max_call_depth,
        ..Default::default()
    };

    let runner = NodeRunner {
        resolver: &resolver,
        context: &context,
        calls: &calls,
        dynamics: &dynamics,
        handler,
        call_options,
    };

    let mut results = Vec::with_capacity(order.len());
    for node in &order {
        let result = runner.run_node(node).await;
        let ok = result.success;
        results.push(result);
        if !ok {
            warn!(node = %node.node_id, "suite failed; downstream suites still attempt to run");
        }
    }

    print_summary(&results);
    if results.iter().any(|result| !result.success) {
        std::process::exit(1);
    }
    Ok(())
}

struct NodeRunner<'run> {
    resolver: &'run DependencyResolver,
    context: &'run VariableContextManager,
    calls: &'run CallResolver,
    dynamics: &'run DynamicExpressionEngine,
    handler: Arc<dyn StepCallHandler>,
    call_options: StepCallOptions,
}

impl NodeRunner<'_> {
    async fn run_node(&self, node: &DiscoveredTest) -> DependencyResult {
        if let Some(cached) = self.resolver.get_cached_result(&node.node_id) {
            info!(node = %node.node_id, "serving cached result");
            self.context.restore_exports_from_cache(&cached);
            return cached;
        }

        match self.execute_node(node).await {
            Ok(result) => {
                if let Err(error) = self.resolver.mark_resolved(&node.node_id, result.clone()) {
                    warn!(node = %node.node_id, error = %error, "failed to record resolved node");
                }
                result
            }
            Err(error) => {
                error!(node = %node.node_id, error = %error, "suite execution failed");
                let _ = self.resolver.mark_failed(&node.node_id);
                self.context.cleanup_context(false);
                DependencyResult {
                    flow_path: node.file_path.clone(),
                    node_id: node.node_id.clone(),
                    suite_name: node.suite_name.clone(),
                    success: false,
                    execution_time_ms: 0,
                    exported_variables: JsonMap::new(),
                    cached: false,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    async fn execute_node(&self, node: &DiscoveredTest) -> Result<DependencyResult> {
        self.resolver.mark_executing(&node.node_id)?;
        let started = Instant::now();

        let bundle = parse_suite_file(&node.file_path)?;
        let suite = bundle
            .suites
            .values()
            .find(|suite| suite.node_id.as_deref() == Some(node.node_id.as_str()))
            .or_else(|| bundle.suites.values().next())
            .context("suite file produced no suites")?
            .clone();
        self.context.initialize_context(&suite, node);
        info!(node = %node.node_id, suite = %suite.suite, steps = suite.steps.len(), "running suite");

        let mut captured = JsonMap::new();
        let mut stack = CallStack::new();
        for step in &suite.steps {
            self.execute_step(node, &suite, step, &mut captured, &mut stack)
                .await
                .with_context(|| format!("step '{}' of suite '{}' failed", step.id, suite.suite))?;
        }

        let published = self.context.register_exports(node, &captured);
        let result = DependencyResult {
            flow_path: node.file_path.clone(),
            node_id: node.node_id.clone(),
            suite_name: node.suite_name.clone(),
            success: true,
            execution_time_ms: started.elapsed().as_millis() as u64,
            exported_variables: published,
            cached: false,
            error: None,
        };
        self.context.cleanup_context(false);
        Ok(result)
    }

    async fn execute_step(
        &self,
        node: &DiscoveredTest,
        suite: &SuiteSpec,
        step: &SuiteStep,
        captured: &mut JsonMap<String, Value>,
        stack: &mut CallStack,
    ) -> Result<()> {
        let visible = self.context.visible_variables();

        if let Some(call) = &step.call {
            let request = StepCallRequest {
                test: interpolate_string(&call.test, &visible),
                step: call.step.clone(),
                caller_path: node.file_path.clone(),
                variables: match interpolate_value(&Value::Object(call.variables.clone()), &visible) {
                    Value::Object(map) => map,
                    _ => JsonMap::new(),
                },
                timeout_ms: call.timeout_ms,
            };
            let mut options = self.call_options.clone();
            if let Some(strategy) = call.on_error {
                options.on_error = strategy;
            }
            let result = self.calls.execute_step_call(&request, &options, stack).await?;
            absorb_result(&result, step, captured, self.context);
            return Ok(());
        }

        if let Some(input) = &step.input {
            // Non-interactive runs take the declared default.
            let value = input.default.clone().map(|raw| interpolate_value(&raw, &visible));
            let Some(value) = value else {
                warn!(step = %step.id, variable = %input.variable, "input step has no default in a non-interactive run; skipping");
                return Ok(());
            };
            self.context
                .store()
                .set(VariableScope::Runtime, &input.variable, value.clone());

            if let Some(config) = &input.dynamics {
                let input_result = InputResult {
                    variable: input.variable.clone(),
                    value,
                    used_default: true,
                    metadata: JsonMap::new(),
                };
                let merged = self.context.visible_variables();
                let processed = self.dynamics.process_input_dynamics(config, &input_result, &merged);
                for assignment in &processed.assignments {
                    self.context
                        .store()
                        .set(assignment.scope, &assignment.name, assignment.value.clone());
                    if assignment.persist {
                        self.context
                            .registry()
                            .register(&node.node_id, &suite.suite, &assignment.name, assignment.value.clone());
                    }
                }

                let triggered = vec![input.variable.clone()];
                let merged = self.context.visible_variables();
                for assignment in self.dynamics.reevaluate(&triggered, Some(&input_result), &merged) {
                    self.context
                        .store()
                        .set(assignment.scope, &assignment.name, assignment.value.clone());
                }
            }
            return Ok(());
        }

        if let Some(request) = &step.request {
            let call = ResolvedCall {
                suite_path: node.file_path.clone(),
                suite: suite.clone(),
                step: step.clone(),
                identifier: trellis_types::CallIdentifier::new(node.file_path.clone(), &step.id),
            };
            let call_request = StepCallRequest {
                test: node.file_path.display().to_string(),
                step: step.id.clone(),
                caller_path: node.file_path.clone(),
                variables: visible,
                timeout_ms: None,
            };
            let result = self.handler.execute(&call, &call_request, &self.call_options).await?;
            if !result.success {
                bail!(result.error.unwrap_or_else(|| "request failed".into()));
            }
            absorb_result(&result, step, captured, self.context);
            return Ok(());
        }

        // A step with no request, call, or input block is a no-op.
        Ok(())
    }
}

/// Writes a call result's captures into runtime scope and the per-suite
/// captured map used for export resolution.
fn absorb_result(result: &StepCallResult, step: &SuiteStep, captured: &mut JsonMap<String, Value>, context: &VariableContextManager) {
    for (name, value) in &result.captured_variables {
        context.store().set(VariableScope::Runtime, name, value.clone());
        captured.insert(name.clone(), value.clone());
    }
    // Step-level capture expressions extract from the call output.
    for (name, expression) in &step.capture {
        if let Some(value) = lookup_path(&result.output, expression) {
            context.store().set(VariableScope::Runtime, name, value.clone());
            captured.insert(name.clone(), value);
        } else {
            warn!(step = %step.id, capture = %name, expression = %expression, "capture expression matched nothing");
        }
    }
}

/// Executes request-bearing steps over HTTP.
struct HttpStepHandler {
    client: reqwest::Client,
}

impl HttpStepHandler {
    fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("trellis/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StepCallHandler for HttpStepHandler {
    async fn execute(&self, call: &ResolvedCall, request: &StepCallRequest, options: &StepCallOptions) -> Result<StepCallResult> {
        let Some(spec) = &call.step.request else {
            // Called step carries no request: nothing to execute, report the
            // resolution itself as the output.
            return EchoStepHandler.execute(call, request, options).await;
        };

        let variables = &request.variables;
        let base_url = call
            .suite
            .base_url
            .as_deref()
            .map(|template| interpolate_string(template, variables))
            .or_else(|| variables.get("base_url").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        let path = interpolate_string(&spec.path, variables);
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);

        let method: reqwest::Method = spec.method.parse().map_err(|_| anyhow::anyhow!("unsupported HTTP method '{}'", spec.method))?;
        let mut builder = self.client.request(method, &url);
        for (name, value) in &spec.headers {
            let rendered = interpolate_string(value.as_str().unwrap_or_default(), variables);
            builder = builder.header(name.as_str(), rendered);
        }
        if let Some(body) = &spec.body {
            builder = builder.json(&interpolate_value(body, variables));
        }
        if let Some(timeout_ms) = request.timeout_ms {
            builder = builder.timeout(std::time::Duration::from_millis(timeout_ms));
        }

        let response = builder.send().await.with_context(|| format!("request to '{url}' failed"))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            return Ok(StepCallResult::failure(format!("'{url}' returned {status}")));
        }

        // Captures declared on the called step extract from the response body.
        let mut captured = JsonMap::new();
        for (name, expression) in &call.step.capture {
            if let Some(value) = lookup_path(&body, expression) {
                captured.insert(name.clone(), value);
            }
        }
        Ok(StepCallResult::success(body, captured))
    }
}

fn print_summary(results: &[DependencyResult]) {
    let passed = results.iter().filter(|result| result.success).count();
    println!();
    println!("=== run summary ===");
    for result in results {
        let status = if result.success { "ok" } else { "FAILED" };
        let cached = if result.cached { " (cached)" } else { "" };
        println!(
            "  {:<8} {} [{} ms]{}{}",
            status,
            result.node_id,
            result.execution_time_ms,
            cached,
            result
                .error
                .as_deref()
                .map(|error| format!(" - {error}"))
                .unwrap_or_default()
        );
    }
    println!("{passed}/{} suites passed", results.len());
}
