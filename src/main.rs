use clap::Parser;
use mcp_agent::config::AppConfig;
use mcp_agent::model::OllamaProvider;
use mcp_agent::orchestrator::Orchestrator;
use mcp_agent::registry::{CapabilityRegistry, DiscoveryError};
use mcp_agent::session::{CapabilityInvoker, Session, SessionTransport};
use mcp_agent::supervisor::{self, BackendProcess};
use serde_json::json;
use std::error::Error;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "mcp-agent",
    version,
    about = "Tool-using agent over MCP backends, powered by Ollama"
)]
struct Cli {
    #[arg(long)]
    ollama_url: Option<String>,
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    system: Option<String>,
    #[arg(long)]
    max_tool_rounds: Option<usize>,
    #[arg(long)]
    prompt_file: Option<String>,
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    info!("Starting mcp-agent");
    let cli = Cli::parse();
    debug!(config = ?cli.config, ollama_url = ?cli.ollama_url, "CLI arguments parsed");

    let config_path = cli.config.as_deref().map(Path::new);
    let config = AppConfig::load(config_path)?;
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loaded configuration from file");
    } else {
        info!("Loaded configuration using default path or defaults");
    }

    let prompt = load_prompt(&cli)?;

    info!(backends = config.backends.len(), "Launching backend processes");
    let mut processes = launch_backends(&config).await?;

    let result = run_conversation(&cli, &config, &mut processes, prompt).await;

    info!("Terminating backend processes");
    supervisor::terminate_all(&mut processes).await;

    let outcome = result?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    info!("Agent execution finished");
    Ok(())
}

/// Launches every configured backend concurrently so their readiness waits
/// overlap instead of stacking. A launch failure is a hard error: everything
/// that did launch is torn down before it propagates.
async fn launch_backends(config: &AppConfig) -> Result<Vec<BackendProcess>, Box<dyn Error>> {
    let results =
        futures::future::join_all(config.backends.iter().map(supervisor::launch)).await;

    let mut processes = Vec::with_capacity(results.len());
    let mut failure = None;
    for (backend, result) in config.backends.iter().zip(results) {
        match result {
            Ok(process) => processes.push(process),
            Err(err) => {
                warn!(backend = %backend.key, %err, "backend launch failed; rolling back");
                failure.get_or_insert(err);
            }
        }
    }
    if let Some(err) = failure {
        supervisor::terminate_all(&mut processes).await;
        return Err(err.into());
    }
    Ok(processes)
}

async fn run_conversation(
    cli: &Cli,
    config: &AppConfig,
    processes: &mut [BackendProcess],
    prompt: String,
) -> Result<serde_json::Value, Box<dyn Error>> {
    let registry = Arc::new(CapabilityRegistry::default());

    let mut sessions: Vec<Arc<Session>> = Vec::new();
    let mut targets: Vec<(String, Arc<dyn CapabilityInvoker>)> = Vec::new();
    for (process, backend) in processes.iter_mut().zip(&config.backends) {
        let transport = match process.take_stdio() {
            Some((stdin, stdout)) => SessionTransport::Stdio { stdin, stdout },
            None => SessionTransport::Tcp {
                host: backend.host.clone(),
                port: backend.port,
            },
        };
        match Session::connect(&backend.key, transport, backend.invoke_timeout).await {
            Ok(session) => {
                let session = Arc::new(session);
                sessions.push(Arc::clone(&session));
                targets.push((backend.key.clone(), session));
            }
            Err(err) => {
                warn!(
                    backend = %backend.key,
                    retryable = err.is_retryable(),
                    %err,
                    "session connect failed; backend skipped"
                );
            }
        }
    }

    // Collisions abort the run; unreachable backends merely shrink the
    // registry.
    for (key, result) in registry.discover_all(targets).await {
        match result {
            Ok(count) => info!(backend = %key, count, "backend capabilities registered"),
            Err(DiscoveryError::Registry(err)) => {
                for session in &sessions {
                    session.close().await;
                }
                return Err(err.into());
            }
            Err(DiscoveryError::Session(err)) => {
                warn!(backend = %key, %err, "capability discovery failed; backend skipped");
            }
        }
    }

    let endpoint = cli
        .ollama_url
        .clone()
        .unwrap_or_else(|| config.model_endpoint.clone());
    let mut provider = OllamaProvider::new(endpoint, config.model.clone());
    if let Some(prompt) = cli.system.clone().or_else(|| config.system_prompt.clone()) {
        provider = provider.with_system_prompt(prompt);
    }
    let orchestrator = Orchestrator::new(provider, Arc::clone(&registry))
        .with_max_tool_rounds(cli.max_tool_rounds.unwrap_or(config.max_tool_rounds))
        .with_model_timeout(config.model_timeout);

    let result = orchestrator.process_message(prompt).await;

    for session in &sessions {
        session.close().await;
    }

    let outcome = result?;
    Ok(json!({
        "conversation_id": outcome.conversation_id,
        "content": outcome.response,
        "tool_steps": outcome.steps,
    }))
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}

fn load_prompt(cli: &Cli) -> Result<String, Box<dyn Error>> {
    if let Some(path) = &cli.prompt_file {
        info!(path = %path, "Loading prompt from file");
        let content = fs::read_to_string(path)?;
        return Ok(normalize_prompt(content));
    }

    if !cli.prompt.is_empty() {
        info!("Using prompt provided through CLI arguments");
        let joined = cli.prompt.join(" ");
        return Ok(normalize_prompt(joined));
    }

    if atty::isnt(atty::Stream::Stdin) {
        info!("Reading prompt from standard input");
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        return Ok(normalize_prompt(buffer));
    }

    warn!("Prompt not provided via arguments, file, or stdin");
    Err("prompt required via arguments, file, or stdin".into())
}

fn normalize_prompt(prompt: String) -> String {
    prompt.trim().to_string()
}
