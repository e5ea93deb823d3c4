use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use codevisor::events::{EventSink, LogSink};
use codevisor::execution::{ExecutionStatus, OutputKind};
use codevisor::tracing::{init_tracing, shutdown_tracing};
use codevisor::{build_controller, build_engine, metrics, AgentMode, ChatClient, Config};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// LLM agents driving a persistent Python kernel
#[derive(Parser, Debug)]
#[command(name = "codevisor", version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a task with the agent
    Run {
        task: String,
        /// Use the planner + executor ReAct cycle
        #[arg(long)]
        dual: bool,
        /// Workspace directory the tools operate in
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        /// Conversation id (a new one is generated if omitted)
        #[arg(long)]
        conversation: Option<String>,
        /// Print Prometheus metrics after the run
        #[arg(long)]
        print_metrics: bool,
    },
    /// Execute code directly in a kernel
    Exec {
        code: String,
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
    /// Check the model endpoint
    Check,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let mut config = Config::from_sources(cli.config.as_deref())?;
    init_tracing("codevisor", config.otlp_endpoint.as_deref())?;

    let sink: Arc<dyn EventSink> = Arc::new(LogSink);

    let result = match cli.command {
        Commands::Run {
            task,
            dual,
            workspace,
            conversation,
            print_metrics,
        } => {
            if workspace.is_some() {
                config.workspace = workspace;
            }
            run_task(&config, sink, &task, dual, conversation, print_metrics).await
        }
        Commands::Exec { code, workspace } => {
            if workspace.is_some() {
                config.workspace = workspace;
            }
            exec_code(&config, sink, &code).await
        }
        Commands::Check => check(&config).await,
    };

    shutdown_tracing();
    result
}

async fn run_task(
    config: &Config,
    sink: Arc<dyn EventSink>,
    task: &str,
    dual: bool,
    conversation: Option<String>,
    print_metrics: bool,
) -> Result<(), BoxError> {
    let controller = build_controller(config, sink)?;
    let conversation = conversation.unwrap_or_else(|| Uuid::now_v7().to_string());
    let mode = if dual { AgentMode::Dual } else { AgentMode::Single };

    println!("[AGENT] Conversation: {}", conversation);
    let outcome = controller.run(&conversation, task, mode).await;
    controller.engine().shutdown().await;
    let result = outcome?;

    println!("[AGENT] Trace ID: {}", result.trace_id);
    println!(
        "[AGENT] {} iteration(s), {} tool call(s){}",
        result.iterations,
        result.tool_calls_made,
        if result.completed { "" } else { ", round limit reached" }
    );
    println!("\n{}", result.final_response);

    if print_metrics {
        println!("\n{}", metrics::gather_text());
    }
    Ok(())
}

async fn exec_code(
    config: &Config,
    sink: Arc<dyn EventSink>,
    code: &str,
) -> Result<(), BoxError> {
    let engine = build_engine(config, sink);
    let execution_id = engine
        .execute("cli", code, config.workspace.as_deref())
        .await;
    let record = engine.wait(&execution_id).await;
    engine.shutdown().await;

    let Some(record) = record else {
        return Err(format!("execution {execution_id} disappeared").into());
    };
    for item in record.sorted_output() {
        match item.kind {
            OutputKind::Stderr | OutputKind::Error => eprint!("{}", item.content),
            _ => print!("{}", item.content),
        }
    }
    if !record.images.is_empty() {
        println!("\n[{} image(s) captured]", record.images.len());
        for (index, image) in record.images.iter().enumerate() {
            if let Some(description) = &image.description {
                println!("[image {index}] {description}");
            }
        }
    }
    if record.status != ExecutionStatus::Completed {
        return Err(format!("execution finished with status {}", record.status).into());
    }
    Ok(())
}

async fn check(config: &Config) -> Result<(), BoxError> {
    let client = ChatClient::new(&config.model);
    client.test_connection().await?;
    println!("✅ {} reachable ({})", config.model.endpoint, config.model.model);
    Ok(())
}
