//! db-bounce
//!
//! Finds pods whose name marks them as database pods and triggers a rolling
//! restart of the Deployments and StatefulSets that own them.

mod config;
mod output;

use anyhow::{Context, Result};
use bounce_lib::{BatchLogger, ConsoleReporter, KubeCluster, Scope};
use clap::Parser;
use std::io;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogFormat, Settings};

/// Rolling restart of database workloads
#[derive(Parser)]
#[command(name = "db-bounce")]
#[command(author, version, about = "Rolling restart of the controllers behind database pods", long_about = None)]
pub struct Cli {
    /// Path to kubeconfig file (ambient cluster access if empty)
    #[arg(long, default_value = "")]
    pub kubeconfig: String,

    /// Namespace to search (all namespaces if empty)
    #[arg(long, short, default_value = "")]
    pub namespace: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load()?;
    init_tracing(settings.log_format);
    tracing::debug!(?settings, "Settings loaded");

    let kubeconfig = config::kubeconfig_path(&cli.kubeconfig);
    let cluster = KubeCluster::connect(kubeconfig.as_deref())
        .await
        .context("Error building Kubernetes client")?;

    let scope = Scope::from_flag(&cli.namespace);
    let logger = BatchLogger::new(chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string());
    let mut reporter = ConsoleReporter::stdio(output::stdout_color(), output::stderr_color());

    bounce_lib::run(
        &cluster,
        &scope,
        &settings.run_options(),
        &mut reporter,
        &logger,
    )
    .await
    .with_context(|| format!("Error listing pods in {}", scope))?;

    Ok(())
}

/// Logs go to stderr; stdout carries only restart outcomes
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(io::stderr).with_target(false))
            .init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(io::stderr)).init(),
    }
}
