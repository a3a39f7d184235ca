use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nodeflow::prelude::*;
use serde_json::Value;
use tracing_subscriber::EnvFilter;
#[cfg(feature = "otel")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "otel")]
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "nodeflow")]
#[command(about = "Run node-graph workflows", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow graph file
    Run {
        /// Path to the workflow YAML or JSON file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Execution settings YAML file
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Stop once this node has executed
        #[arg(short, long)]
        target: Option<String>,

        /// Execute only this node
        #[arg(long, conflicts_with = "target")]
        single: Option<String>,

        /// Keep going after a node fails outside any try scope
        #[arg(long)]
        continue_on_error: bool,

        /// Per-node timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<f64>,

        /// Run every start node concurrently
        #[arg(long)]
        run_all: bool,

        /// Initial variable (value parsed as JSON, else taken as a string)
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },

    /// Validate a workflow graph without running it
    Validate {
        /// Path to the workflow file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// List the registered node types
    Nodes,
}

fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(feature = "otel")]
fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::runtime::Tokio;
    use opentelemetry_sdk::trace::TracerProvider;

    let filter = if verbose { "nodeflow=debug" } else { "nodeflow=info" };

    let otlp_endpoint =
        std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| "http://localhost:4317".to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .build();

    let tracer = provider.tracer("nodeflow");
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    opentelemetry::global::set_tracer_provider(provider);
    Ok(())
}

#[cfg(not(feature = "otel"))]
fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let filter = if verbose { "nodeflow=debug" } else { "nodeflow=info" };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.verbose) {
        eprintln!("Failed to initialise tracing: {}", e);
        return ExitCode::from(2);
    }

    let result = run(cli).await;

    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %e, "nodeflow failed");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    match cli.command {
        Commands::Run {
            file,
            settings,
            target,
            single,
            continue_on_error,
            timeout,
            run_all,
            vars,
        } => {
            let mut settings = match settings {
                Some(path) => ExecutionSettings::load(path)?,
                None => ExecutionSettings::default(),
            };
            if let Some(target) = target {
                settings = settings.target(target);
            }
            if let Some(node) = single {
                settings = settings.single_node(node);
            }
            if continue_on_error {
                settings = settings.continue_on_error(true);
            }
            if let Some(secs) = timeout {
                if !secs.is_finite() || secs <= 0.0 {
                    anyhow::bail!("--timeout must be a positive number of seconds");
                }
                settings = settings.node_timeout(Duration::from_secs_f64(secs));
            }
            settings.validate()?;
            run_workflow(file, settings, run_all, vars).await
        }
        Commands::Validate { file } => validate(file),
        Commands::Nodes => {
            list_node_types();
            Ok(true)
        }
    }
}

#[tracing::instrument(skip(settings, vars), fields(file = %file.display()))]
async fn run_workflow(
    file: PathBuf,
    settings: ExecutionSettings,
    run_all: bool,
    vars: Vec<(String, Value)>,
) -> anyhow::Result<bool> {
    if !file.exists() {
        anyhow::bail!("Workflow file not found: {}", file.display());
    }

    println!("Running workflow: {}\n", file.display());
    let definition = WorkflowLoader::load_file(&file)?;
    let registry = TaskRegistry::with_builtins();

    let bus = Arc::new(EventBus::new());
    let events = bus.channel();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let mut executor = WorkflowExecutor::from_definition(&definition, &registry, bus.clone())?
        .with_settings(settings);
    for (name, value) in vars {
        executor = executor.with_variable(&name, value);
    }

    let stop = executor.stop_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping workflow");
            stop.stop();
        }
    });

    let result = executor.run(run_all).await;
    ctrl_c.abort();

    // Close the event channel so the printer drains and exits
    drop(executor);
    drop(bus);
    let _ = printer.await;

    let summary = result?;
    print_summary(&summary);
    Ok(summary.success)
}

fn validate(file: PathBuf) -> anyhow::Result<bool> {
    if !file.exists() {
        anyhow::bail!("Workflow file not found: {}", file.display());
    }

    let definition = WorkflowLoader::load_file(&file)?;
    let registry = TaskRegistry::with_builtins();

    match WorkflowGraph::build(&definition, &registry) {
        Ok(graph) => {
            let starts = graph.find_start_nodes();
            println!("✓ {}", graph.name());
            println!("  Nodes: {}", graph.len());
            println!("  Connections: {}", graph.connections().len());
            if starts.is_empty() {
                println!("  ✗ No start node");
                return Ok(false);
            }
            println!("  Start nodes: {}", starts.join(", "));
            Ok(true)
        }
        Err(e) => {
            println!("✗ {}: {}", definition.name, e);
            Ok(false)
        }
    }
}

fn list_node_types() {
    let registry = TaskRegistry::with_builtins();
    println!("Registered node types:\n");
    for node_type in registry.task_types() {
        println!("  {}", node_type);
    }
}

fn print_event(event: &WorkflowEvent) {
    let node = event.node_id.as_deref().unwrap_or("");
    match event.event_type {
        EventType::NodeStarted => println!("  → {}", node),
        EventType::NodeCompleted => println!("  ✓ {}", node),
        EventType::NodeSkipped => println!("  - {} (skipped)", node),
        EventType::NodeError => println!(
            "  ✗ {}: {}",
            node,
            event.error.as_deref().unwrap_or("failed")
        ),
        EventType::WorkflowProgress => {
            if let Some(progress) = event.progress {
                tracing::debug!(progress, "Progress");
            }
        }
        _ => {}
    }
}

fn print_summary(summary: &RunSummary) {
    let status = match summary.state {
        RunState::Completed => "✓ COMPLETED",
        RunState::Stopped => "■ STOPPED",
        _ => "✗ FAILED",
    };
    println!("\n=== Results ===\n");
    println!("{} ({:?})", status, summary.duration);
    println!(
        "  Executed: {}/{} nodes",
        summary.executed_nodes.len(),
        summary.total_nodes
    );
    if let Some(error) = &summary.error {
        println!("  Error: {}", error);
    }
}
