//! Command-line runner for experiment graphs
//!
//! Loads a saved graph and a hardware description, runs the graph until it
//! finishes, fails, times out or is interrupted, and logs engine events
//! while it goes.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use flow_engine::{
    DriverRegistry, EngineConfig, EngineEvent, EngineState, EventCategory, FlowEngine,
    GraphDescription, HardwareConfig, HardwareManager, Result,
};

/// Run an experiment graph against configured hardware
#[derive(Debug, Parser)]
#[command(name = "flow-runner", version, about, long_about = None)]
struct Args {
    /// Saved graph description (JSON)
    graph: PathBuf,

    /// Engine settings (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Boards and devices (JSON)
    #[arg(short = 'H', long)]
    hardware: Option<PathBuf>,

    /// Stop the run after this many seconds
    #[arg(short, long)]
    timeout_secs: Option<f64>,

    /// Validate the graph and exit without running it
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    match run(&args).await {
        Ok(EngineState::Error) => ExitCode::FAILURE,
        Ok(state) => {
            log::info!("Finished in state {}", state);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn build_engine(args: &Args) -> Result<FlowEngine> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path).await?,
        None => EngineConfig::default(),
    };
    let hardware_config = match &args.hardware {
        Some(path) => HardwareConfig::load(path).await?,
        None => HardwareConfig::default(),
    };
    let hardware = HardwareManager::from_config(&hardware_config, &DriverRegistry::with_defaults())?;
    log::info!(
        "Hardware ready: {} board(s), {} device(s)",
        hardware_config.boards.len(),
        hardware_config.devices.len()
    );

    let description = GraphDescription::load(&args.graph).await?;
    let engine = FlowEngine::new(
        Arc::new(flow_nodes::builtin_registry()),
        Arc::new(hardware),
        config,
    );
    engine.load(&description)?;
    log::info!(
        "Loaded graph '{}' ({} nodes, {} connections)",
        description.name,
        description.nodes.len(),
        description.connections.len()
    );
    Ok(engine)
}

async fn run(args: &Args) -> Result<EngineState> {
    let engine = build_engine(args).await?;

    if args.check {
        let problems = engine.validate();
        for problem in &problems {
            if problem.is_fatal() {
                log::error!("{}", problem);
            } else {
                log::warn!("{}", problem);
            }
        }
        let fatal = problems.iter().any(|p| p.is_fatal());
        return Ok(if fatal {
            EngineState::Error
        } else {
            EngineState::Stopped
        });
    }

    let mut events = engine.subscribe(&EventCategory::ALL);
    let logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    engine.start().await?;
    let deadline = args
        .timeout_secs
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64);

    let state = tokio::select! {
        state = engine.wait_until_idle() => state,
        _ = sleep_until_deadline(deadline) => {
            log::warn!("Run exceeded {:?}, stopping", deadline.unwrap_or_default());
            engine.stop().await?;
            engine.state()
        }
        _ = tokio::signal::ctrl_c() => {
            log::warn!("Interrupted, stopping run");
            engine.stop().await?;
            engine.state()
        }
    };

    if let Some(failure) = engine.last_error() {
        log::error!("Run failed: {}", failure);
    }
    logger.abort();
    Ok(state)
}

async fn sleep_until_deadline(deadline: Option<Duration>) {
    match deadline {
        Some(deadline) => tokio::time::sleep(deadline).await,
        None => std::future::pending().await,
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::StateChanged { from, to, elapsed_ms } => {
            log::info!("[{:>7}ms] {} -> {}", elapsed_ms, from, to)
        }
        EngineEvent::NodeError {
            node_id,
            message,
            elapsed_ms,
        } => log::warn!("[{:>7}ms] node '{}': {}", elapsed_ms, node_id, message),
        EngineEvent::RunCompleted { run_id, elapsed_ms } => {
            log::info!("[{:>7}ms] run {} completed", elapsed_ms, run_id)
        }
        other => match serde_json::to_string(other) {
            Ok(json) => log::debug!("{}", json),
            Err(e) => log::debug!("Unserializable event {:?}: {}", other, e),
        },
    }
}
