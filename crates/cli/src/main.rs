use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use integrations_core::{HookAction, HookStatus, IntegrationState};
use orchestrator::{
    AggregatedOutcome, IntegrationManager, IntegrationStatus, IntegrationsConfig, IntegrationsGuard,
    StartupDiagnostic, DEFAULT_CONFIG_FILE, MAX_TIMEOUT_SECS,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "integrations")]
#[command(about = "Run lifecycle hooks against configured integrations", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Integrations config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override settings.hook_timeout_secs
    #[arg(long, global = true, value_parser = timeout_secs)]
    hook_timeout: Option<u64>,

    /// Override settings.handshake_timeout_secs
    #[arg(long, global = true, value_parser = timeout_secs)]
    handshake_timeout: Option<u64>,

    /// Override settings.shutdown_grace_secs
    #[arg(long, global = true, value_parser = timeout_secs)]
    shutdown_grace: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every integration, print its handshake, then stop
    Check,
    /// Dispatch one event and print each integration's verdict
    Dispatch {
        event: String,

        /// Event payload as a JSON object
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Per-call timeout in seconds
        #[arg(short, long, value_parser = timeout_secs)]
        timeout: Option<u64>,
    },
    /// Dispatch events from a JSON-lines file, stopping at the first halt
    Replay { file: PathBuf },
}

/// One line of a replay file.
#[derive(Debug, Deserialize)]
struct ReplayStep {
    event: String,
    #[serde(default = "empty_payload")]
    payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

/// Timeout flags accept 1 to `MAX_TIMEOUT_SECS` seconds.
fn timeout_secs(value: &str) -> std::result::Result<u64, String> {
    let secs: u64 = value
        .parse()
        .map_err(|_| format!("{:?} is not a number of seconds", value))?;
    if secs == 0 || secs > MAX_TIMEOUT_SECS {
        return Err(format!("must be between 1 and {} seconds", MAX_TIMEOUT_SECS));
    }
    Ok(secs)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(&cli).await?;
    let manager = IntegrationManager::from_config(config);

    let mut guard = IntegrationsGuard::start(manager.clone()).await;
    print_diagnostics(guard.diagnostics());

    let result = match cli.command {
        Commands::Check => check(&manager, guard.diagnostics()).await,
        Commands::Dispatch {
            event,
            payload,
            timeout,
        } => dispatch(&manager, &event, &payload, timeout).await,
        Commands::Replay { file } => replay(&manager, &file).await,
    };

    let summary = guard.stop().await;
    tracing::debug!(
        stopped = summary.stopped,
        forced = summary.forced,
        killed = summary.killed,
        "Shutdown complete"
    );

    result
}

async fn load_config(cli: &Cli) -> Result<IntegrationsConfig> {
    let mut config = IntegrationsConfig::load(&cli.config)
        .await
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    if let Some(secs) = cli.hook_timeout {
        config.settings.hook_timeout_secs = secs;
    }
    if let Some(secs) = cli.handshake_timeout {
        config.settings.handshake_timeout_secs = secs;
    }
    if let Some(secs) = cli.shutdown_grace {
        config.settings.shutdown_grace_secs = secs;
    }
    config.validate().context("Invalid command-line override")?;

    tracing::info!(
        path = %cli.config.display(),
        integrations = config.integrations.len(),
        "Loaded integrations config"
    );
    Ok(config)
}

async fn check(manager: &IntegrationManager, diagnostics: &[StartupDiagnostic]) -> Result<ExitCode> {
    let status = manager.status().await;

    println!();
    if status.is_empty() {
        println!("No integrations running.");
    } else {
        println!("Integrations ({}):", status.len());
        for integration in &status {
            print_status(integration);
        }
    }
    println!();

    if diagnostics.iter().any(StartupDiagnostic::is_error) {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn dispatch(
    manager: &IntegrationManager,
    event: &str,
    payload: &str,
    timeout: Option<u64>,
) -> Result<ExitCode> {
    let payload: Value = serde_json::from_str(payload).context("Invalid --payload JSON")?;

    let outcome = match timeout {
        Some(secs) => {
            manager
                .dispatch_with_timeout(event, payload, Duration::from_secs(secs))
                .await
        }
        None => manager.dispatch(event, payload).await,
    };

    print_outcome(&outcome);
    Ok(exit_code(outcome.action))
}

async fn replay(manager: &IntegrationManager, file: &Path) -> Result<ExitCode> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let steps = parse_replay(&content)
        .with_context(|| format!("Invalid replay file {}", file.display()))?;

    for (index, step) in steps.into_iter().enumerate() {
        let outcome = manager.dispatch(&step.event, step.payload).await;
        print_outcome(&outcome);

        if outcome.action.is_halt() {
            println!("Halted at step {} ({}).", index + 1, step.event);
            return Ok(ExitCode::FAILURE);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn parse_replay(content: &str) -> Result<Vec<ReplayStep>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(|(number, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}", number + 1))
        })
        .collect()
}

fn exit_code(action: HookAction) -> ExitCode {
    match action {
        HookAction::Continue => ExitCode::SUCCESS,
        HookAction::Halt => ExitCode::FAILURE,
    }
}

fn print_diagnostics(diagnostics: &[StartupDiagnostic]) {
    for diagnostic in diagnostics {
        let label = if diagnostic.is_error() {
            "error".red().bold()
        } else {
            "warning".yellow().bold()
        };
        eprintln!(
            "{}: {}: {}",
            label,
            diagnostic.integration,
            diagnostic.summary
        );
        eprintln!("  {}", diagnostic.detail);
    }
}

fn print_status(integration: &IntegrationStatus) {
    let icon = match integration.state {
        IntegrationState::Ready => "●".green(),
        IntegrationState::Failed => "✗".red(),
        _ => "○".normal(),
    };
    let version = integration
        .version
        .as_deref()
        .map(|v| format!("v{}", v))
        .unwrap_or_else(|| "-".to_string());

    println!(
        "  {} {} [{}] {} ({})",
        icon,
        integration.name.bold(),
        integration.state,
        version,
        integration.failure_policy.as_str()
    );
    if !integration.subscribed_events.is_empty() {
        println!("      events: {}", integration.subscribed_events.join(", "));
    }
}

fn print_outcome(outcome: &AggregatedOutcome) {
    let action = match outcome.action {
        HookAction::Continue => "continue".green(),
        HookAction::Halt => "halt".red().bold(),
    };
    let elapsed = (outcome.finished_at - outcome.started_at).num_milliseconds();

    println!();
    println!(
        "{}: {} ({} results, {}ms)",
        outcome.event.bold(),
        action,
        outcome.results.len(),
        elapsed
    );

    for result in &outcome.results {
        let status = match result.verdict.status {
            HookStatus::Success => "success".green(),
            HookStatus::Warn => "warn".yellow(),
            HookStatus::Fail => "fail".red(),
        };
        println!(
            "  {:<20} {:<8} {}",
            result.integration_name, status, result.verdict.message
        );
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "integrations=info,orchestrator=warn".into()),
        )
        .init();
}
