mod args;
mod gocompat;


use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use doc_stress::harness::Harness;
use doc_stress::report::TerminalReport;
use doc_stress::run::RunController;

use crate::args::ParseResult;

#[tokio::main]
async fn main() -> Result<()> {
    // Variables from .env must be visible to both the log filter and the flags
    let dotenv = dotenvy::dotenv();

    // Logs go to stderr so that they don't break the report on stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match dotenv {
        Ok(path) => info!(path = %path.display(), "loaded environment file"),
        Err(err) if err.not_found() => {}
        Err(err) => warn!(error = %err, "failed to load the .env file"),
    }

    let args = match args::parse_doc_stress_args(std::env::args(), true) {
        Some(ParseResult::Config(args)) => args,
        Some(ParseResult::VersionDisplayed) => return Ok(()),
        None => anyhow::bail!("Invalid command line arguments"),
    };

    args.print_configuration();

    let harness = Harness::connect(&args.uris)
        .await
        .context("Failed to connect to the stores")?;
    info!(instance_id = %harness.instance_id(), "connected");

    let report = Box::new(TerminalReport::new(std::io::stdout()));
    harness
        .execute(&args.config, report, |ctrl| {
            // Don't care about the leaking task, it won't prevent the runtime
            // from being stopped.
            tokio::task::spawn(stop_on_signal(ctrl));
        })
        .await
        .context("The benchmark failed")?;

    Ok(())
}

async fn stop_on_signal(ctrl: Arc<RunController>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for the interrupt signal");
        return;
    }
    info!("interrupted, stopping the workers");
    ctrl.ask_to_stop();

    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted again, aborting the workers");
        ctrl.abort();
    }
}
