//! Sample integration binary.
//!
//! Spawned by the integrations host with stdin/stdout carrying protocol
//! frames. Logs go to stderr, which the host forwards to its own log.
//!
//! Environment variables:
//! - INTEGRATION_NAME: name the host registered this process under
//! - RUST_LOG: log filter (default: info)

use anyhow::Result;
use orchestrator::INTEGRATION_NAME_ENV;
use sample_integration::{serve, SampleIntegration, NAME, VERSION};
use tokio::io::BufReader;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries frames, so log to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let name = std::env::var(INTEGRATION_NAME_ENV).unwrap_or_else(|_| NAME.to_string());
    info!(integration = %name, version = VERSION, "Starting sample integration");

    let mut integration = SampleIntegration::new(name);
    serve(
        &mut integration,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await?;

    info!(integration = %integration.name(), "Sample integration exiting");
    Ok(())
}
