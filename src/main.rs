use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use flowgate_core::config::AppConfig;
use flowgate_core::event::{EventBus, FlowEvent};
use flowgate_core::state::StatePatch;
use flowgate_core::traits::{ApprovalRepository, CheckpointSaver, SystemClock};
use flowgate_core::types::ThreadId;

use flowgate_engine::pipeline::{conversation_graph, Collaborators};
use flowgate_engine::{
    ApprovalManager, ExecutionEngine, KeywordRiskScorer, MemoryApprovalRepository,
    MemoryCheckpointStore, WorkflowService,
};
use flowgate_gateway::GatewayServer;
use flowgate_store::{SqliteApprovalRepository, SqliteCheckpointStore};

#[derive(Parser)]
#[command(name = "flowgate", version, about = "Workflow graph engine with a human approval gate")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowgate.toml", env = "FLOWGATE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve,
    /// Run one message through the pipeline and print the outcome
    Run {
        /// Continue an existing thread
        #[arg(short, long)]
        thread: Option<String>,
        /// The user message
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },
    /// Show the status of a thread
    Status { thread: String },
    /// Resume a paused thread (a thread at an approval gate needs --approve or --reject)
    Resume {
        thread: String,
        /// Approve the pending draft
        #[arg(long, conflicts_with = "reject")]
        approve: bool,
        /// Reject the pending draft
        #[arg(long)]
        reject: bool,
        /// Reviewer recorded with the decision
        #[arg(long, default_value = "cli")]
        reviewer: String,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Show the checkpoint history of a thread
    History { thread: String },
    /// List pending approval requests
    Approvals,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
        AppConfig::default()
    };

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let event_bus = Arc::new(EventBus::default());
    let service = build_service(&config, event_bus.clone())?;

    match cli.command {
        Commands::Serve => {
            let restored = service.approvals().restore().await?;
            info!(pending = restored, "Approval deadlines re-armed");
            spawn_event_logger(&event_bus);

            let server = GatewayServer::new(config.gateway.clone(), service.clone());
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
            service.approvals().shutdown();
        }
        Commands::Run { thread, message } => {
            let message = message.join(" ");
            let thread = thread.as_deref().map(ThreadId::from_string);
            let outcome = service.execute(&message, thread, None).await?;
            print_json(&outcome)?;
        }
        Commands::Status { thread } => {
            let status = service.status(&ThreadId::from_string(&thread)).await?;
            print_json(&status)?;
        }
        Commands::Resume {
            thread,
            approve,
            reject,
            reviewer,
            comment,
        } => {
            let patch = if approve || reject {
                StatePatch {
                    comment,
                    ..StatePatch::decision(approve, reviewer)
                }
            } else {
                StatePatch {
                    comment,
                    ..StatePatch::default()
                }
            };
            let outcome = service
                .resume(&ThreadId::from_string(&thread), patch)
                .await?;
            print_json(&outcome)?;
        }
        Commands::History { thread } => {
            let history = service.history(&ThreadId::from_string(&thread)).await?;
            print_json(&history)?;
        }
        Commands::Approvals => {
            let expired = service.approvals().sweep_expired().await?;
            if expired > 0 {
                info!(expired, "Timed out overdue approvals");
            }
            print_json(&service.pending_approvals().await?)?;
        }
        Commands::Config => {}
    }

    Ok(())
}

/// Wire stores, approval manager, pipeline graph, and engine from config.
fn build_service(config: &AppConfig, event_bus: Arc<EventBus>) -> anyhow::Result<WorkflowService> {
    let (checkpoints, repo): (Arc<dyn CheckpointSaver>, Arc<dyn ApprovalRepository>) =
        match config.storage.resolved_path() {
            Some(path) => {
                debug!(path = %path.display(), "Using SQLite storage");
                (
                    Arc::new(SqliteCheckpointStore::open(&path)?),
                    Arc::new(SqliteApprovalRepository::open(&path)?),
                )
            }
            None => {
                warn!("No storage path configured; threads and approvals will not outlive this process");
                (
                    Arc::new(MemoryCheckpointStore::new()),
                    Arc::new(MemoryApprovalRepository::new()),
                )
            }
        };

    let scorer = KeywordRiskScorer::from_config(&config.pipeline.risk_patterns)?;
    let approvals = ApprovalManager::new(
        repo,
        Arc::new(scorer),
        Arc::new(SystemClock),
        event_bus.clone(),
        config.approval.clone(),
    );
    let graph = conversation_graph(
        Collaborators::from_config(&config.pipeline),
        approvals.clone(),
    )?;
    let engine = ExecutionEngine::new(graph, checkpoints, event_bus, config.engine.clone());
    Ok(WorkflowService::new(Arc::new(engine), approvals))
}

/// Log workflow and approval events as they happen.
fn spawn_event_logger(event_bus: &EventBus) {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(FlowEvent::Interrupted { thread_id, node }) => {
                    info!(thread_id = %thread_id, node = %node, "Thread waiting on input");
                }
                Ok(FlowEvent::RunFinished { thread_id, status }) => {
                    info!(thread_id = %thread_id, status = %status, "Run finished");
                }
                Ok(FlowEvent::ApprovalRequested {
                    approval_id,
                    thread_id,
                    escalated,
                }) => {
                    info!(approval_id = %approval_id, thread_id = %thread_id, escalated, "Approval requested");
                }
                Ok(FlowEvent::ApprovalResolved {
                    approval_id,
                    status,
                }) => {
                    info!(approval_id = %approval_id, status = %status, "Approval resolved");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
