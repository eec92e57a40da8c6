mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent::{AgentClient, AgentService, CommandInstaller};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use events::{Event, EventBus, EventEnvelope, ProgressReporter};
use install_core::Plan;
use orchestrator::{AgentRemote, DefaultFactory, Engine};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "installer")]
#[command(about = "Coordinates installation phases across cluster nodes", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./installer.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Node agent
    #[command(subcommand)]
    Agent(AgentCommand),
    /// Installation plans
    #[command(subcommand)]
    Plan(PlanCommand),
}

#[derive(Subcommand)]
enum AgentCommand {
    /// Serve the agent control protocol on this node
    Serve {
        #[arg(long)]
        hostname: Option<String>,

        #[arg(long)]
        advertise_ip: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Abort the operation running on an agent
    Abort {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Ask an agent to stop once its operation has ended
    Shutdown {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Run a plan and write its updated state back to the file
    Run {
        plan: PathBuf,

        #[arg(long)]
        max_parallel: Option<usize>,

        #[arg(long)]
        no_rollback: bool,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Check a plan for duplicate phases, unknown prerequisites and cycles
    Validate { plan: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).await?;

    init_tracing(&config.log_level);

    match cli.command {
        Commands::Agent(AgentCommand::Serve {
            hostname,
            advertise_ip,
            port,
        }) => {
            if let Some(port) = port {
                config.agent.port = port;
            }
            serve_agent(&config, hostname, advertise_ip).await
        }
        Commands::Agent(AgentCommand::Abort { host, port }) => {
            let client = AgentClient::for_host(&host, port.unwrap_or(config.agent.port));
            abort_agent(&client).await
        }
        Commands::Agent(AgentCommand::Shutdown { host, port }) => {
            let client = AgentClient::for_host(&host, port.unwrap_or(config.agent.port));
            client
                .shutdown()
                .await
                .with_context(|| format!("Failed to shut down agent at {}", client.base_url()))?;
            println!("Agent at {} is shutting down", client.base_url());
            Ok(())
        }
        Commands::Plan(PlanCommand::Run {
            plan,
            max_parallel,
            no_rollback,
            json,
        }) => {
            if let Some(max_parallel) = max_parallel {
                config.engine.max_parallel = max_parallel;
            }
            if no_rollback {
                config.engine.rollback_on_failure = false;
            }
            run_plan(&config, &plan, json).await
        }
        Commands::Plan(PlanCommand::Validate { plan }) => validate_plan(&plan).await,
    }
}

async fn serve_agent(
    config: &Config,
    hostname: Option<String>,
    advertise_ip: Option<String>,
) -> Result<()> {
    let agent_config = config.agent_config(hostname, advertise_ip).await?;
    let command = &config.agent.command;
    let mut installer = CommandInstaller::new(&command.program).args(command.args.iter());
    if !command.abort_args.is_empty() {
        installer = installer.abort_args(command.abort_args.iter());
    }

    let listener = TcpListener::bind(&agent_config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", agent_config.listen_addr))?;
    info!(
        addr = %agent_config.listen_addr,
        hostname = %agent_config.hostname,
        advertise_ip = %agent_config.advertise_ip,
        "Agent listening"
    );

    let service = AgentService::new(Arc::new(installer), agent_config);

    let on_interrupt = Arc::clone(&service);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if on_interrupt.is_busy().await {
                warn!("Interrupt received, aborting active session");
                on_interrupt.abort().await;
            }
            on_interrupt.shutdown().await;
        }
    });

    agent::serve(listener, service).await?;
    info!("Agent stopped");
    Ok(())
}

async fn abort_agent(client: &AgentClient) -> Result<()> {
    let error = client
        .abort()
        .await
        .with_context(|| format!("Failed to abort agent at {}", client.base_url()))?;
    match error {
        None => {
            println!("Operation on {} aborted", client.base_url());
            Ok(())
        }
        Some(error) => bail!("Agent failed to clean up: {}", error.message),
    }
}

async fn read_plan(path: &Path) -> Result<Plan> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    Plan::from_json(&content).with_context(|| format!("Failed to parse plan {}", path.display()))
}

async fn validate_plan(path: &Path) -> Result<()> {
    let plan = read_plan(path).await?;
    plan.validate()
        .with_context(|| format!("Plan {} is invalid", path.display()))?;

    println!(
        "Plan {} for {} is valid ({} phases)",
        plan.operation_id,
        plan.cluster_name,
        plan.phases.len()
    );
    for phase in &plan.phases {
        println!("  [{}] {}", phase.state, phase.id);
    }
    Ok(())
}

async fn run_plan(config: &Config, path: &Path, json: bool) -> Result<()> {
    let plan = read_plan(path).await?;

    let bus = EventBus::new();
    let printer = tokio::spawn(print_events(bus.subscribe(), json));
    let reporter = Arc::new(ProgressReporter::new(bus, plan.operation_id.clone()));

    let remote = Arc::new(AgentRemote::new(
        config.engine.agent_port,
        config.engine.check_timeout(),
    ));
    let local = Arc::new(config.local_node().await?);
    let factory = DefaultFactory::new(remote, local, config.installer.clone())
        .with_agent_port(config.engine.agent_port)
        .with_agent_timeout(config.engine.agent_timeout());
    let engine = Engine::new(Arc::new(factory), reporter)
        .with_config(config.engine.engine_config());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping plan");
            trigger.cancel();
        }
    });

    info!(plan = %path.display(), operation_id = %plan.operation_id, "Running plan");
    let result = engine.run(plan, cancel).await;

    // Closes the bus so the printer drains and exits.
    drop(engine);
    if let Err(e) = printer.await {
        warn!("Event printer stopped: {}", e);
    }

    let outcome = result.context("Plan could not be run")?;
    let updated = outcome.plan.to_json()?;
    tokio::fs::write(path, updated)
        .await
        .with_context(|| format!("Failed to write plan {}", path.display()))?;

    if !outcome.is_success() {
        bail!(
            "Operation {} did not complete: {}",
            outcome.plan.operation_id,
            outcome.errors().join("; ")
        );
    }
    Ok(())
}

async fn print_events(mut rx: tokio::sync::broadcast::Receiver<EventEnvelope>, json: bool) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if json {
                    match serde_json::to_string(&envelope) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!("Failed to encode event: {}", e),
                    }
                } else {
                    print_event(&envelope.event);
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!("Skipped {} progress events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &Event) {
    match event {
        Event::Step { message, .. } => println!("  {}", message),
        Event::Progress { report, .. } => {
            println!("{}", report.message);
            for error in &report.errors {
                println!("  error: {}", error);
            }
        }
        Event::PhaseStateChanged {
            phase_id, from, to, ..
        } => println!("[{}] {} -> {}", phase_id, from, to),
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .init();
}
