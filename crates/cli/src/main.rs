//! Stepwise command line: run, validate and inspect automations locally.
//!
//! Runs use in-memory collaborators, so the CLI is a way to try definitions out rather
//! than a production host.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use serde_json::Value;
use stepwise_engine::{
    AutomationRunner, EngineConfig, InMemoryQuotaGate, RhaiScriptRunner, StepRegistry, StepServices, TracingEventPublisher,
    load_config, load_config_from_path, parse_automation_file, validate_definition,
};
use stepwise_types::{AutomationDefinition, TenantId};
use tracing::{Level, info};

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(author, version, about = "Run multi-tenant automations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute an automation and print the run result as JSON
    Run(RunArgs),
    /// Validate automation definitions and print diagnostics
    Validate(ValidateArgs),
    /// Print the step catalogue with descriptors and schemas
    Steps,
}

#[derive(Args)]
struct RunArgs {
    /// Path to an automation YAML/JSON file
    #[arg(long, short = 'd')]
    definition: PathBuf,

    /// Automation id within the file; defaults to the first definition
    #[arg(long)]
    automation: Option<String>,

    /// Path to a JSON file holding the trigger payload
    #[arg(long, short = 't')]
    trigger: Option<PathBuf>,

    /// Tenant executing the run; defaults to the definition owner
    #[arg(long)]
    tenant: Option<String>,

    /// Engine configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Tenant environment variable exposed as `env.KEY` (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    environment: Vec<String>,

    /// Maximum number of runs the tenant may start
    #[arg(long)]
    quota: Option<u64>,
}

#[derive(Args)]
struct ValidateArgs {
    /// Path to an automation YAML/JSON file
    #[arg(long, short = 'd')]
    definition: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_automation(args).await,
        Commands::Validate(args) => validate_automations(&args.definition),
        Commands::Steps => print_catalog(),
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_automation(args: RunArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => load_config_from_path(path)?,
        None => load_config()?,
    };
    let definition = select_definition(&args.definition, args.automation.as_deref())?;
    let tenant_id = args
        .tenant
        .map(TenantId::new)
        .unwrap_or_else(|| definition.tenant_id.clone());
    let trigger_payload = match &args.trigger {
        Some(path) => read_trigger(path)?,
        None => Value::Null,
    };
    let environment_variables = parse_environment(&args.environment)?;

    let quota_gate = match args.quota {
        Some(limit) => InMemoryQuotaGate::with_default_limit(limit),
        None => InMemoryQuotaGate::unlimited(),
    };
    let runner = build_runner(config, quota_gate).with_tenant_environment(tenant_id.clone(), environment_variables);

    info!(automation_id = %definition.id, tenant_id = %tenant_id, "executing automation");
    match runner.execute(&definition, trigger_payload, &tenant_id).await {
        Ok(run) => {
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(())
        }
        Err(run_fault) => {
            println!("{}", serde_json::to_string_pretty(&run_fault.run)?);
            Err(anyhow::Error::new(run_fault.fault).context(format!("run {} aborted", run_fault.run.run_id)))
        }
    }
}

fn build_runner(config: EngineConfig, quota_gate: InMemoryQuotaGate) -> AutomationRunner {
    let scripts = Arc::new(RhaiScriptRunner::with_limits(config.script_limits));
    let services = StepServices::in_memory().with_scripts(scripts);
    AutomationRunner::new(
        services,
        Arc::new(quota_gate),
        Arc::new(TracingEventPublisher),
        config,
    )
}

fn select_definition(path: &Path, automation_id: Option<&str>) -> Result<AutomationDefinition> {
    let definitions = parse_automation_file(path)?;
    match automation_id {
        Some(automation_id) => definitions
            .into_iter()
            .find(|definition| definition.id == automation_id)
            .with_context(|| format!("automation '{automation_id}' not found in {}", path.display())),
        None => definitions
            .into_iter()
            .next()
            .with_context(|| format!("{} contains no automations", path.display())),
    }
}

fn read_trigger(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read trigger file: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("trigger file {} is not valid JSON", path.display()))
}

fn parse_environment(pairs: &[String]) -> Result<IndexMap<String, String>> {
    let mut environment_variables = IndexMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("environment variable '{pair}' must be written as KEY=VALUE");
        };
        environment_variables.insert(key.trim().to_string(), value.to_string());
    }
    Ok(environment_variables)
}

fn validate_automations(path: &Path) -> Result<()> {
    let registry = StepRegistry::builtin();
    let mut fault_count = 0usize;
    for definition in parse_automation_file(path)? {
        match validate_definition(&definition, &registry) {
            Ok(warnings) if warnings.is_empty() => println!("{}: ok", definition.id),
            Ok(warnings) => {
                println!("{}: ok with {} warning(s)", definition.id, warnings.len());
                for warning in warnings {
                    println!("  warning [{} {}]: {}", warning.step, warning.source_path, warning.message);
                }
            }
            Err(fault) => {
                fault_count += 1;
                println!("{}: error: {fault}", definition.id);
            }
        }
    }
    if fault_count > 0 {
        bail!("{fault_count} automation(s) failed validation");
    }
    Ok(())
}

fn print_catalog() -> Result<()> {
    let catalog = StepRegistry::builtin().catalog();
    println!("{}", serde_json::to_string_pretty(&catalog)?);
    Ok(())
}
