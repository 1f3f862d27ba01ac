use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use cirrus_core::engine::Engine;
use cirrus_core::server;
use cirrus_provider_cloud::CloudProvider;

#[derive(Parser)]
#[command(name = "cirrus-plugin")]
#[command(about = "Cirrus cloud provider plugin", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (logs go to stderr)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the plugin protocol on stdin/stdout (default)
    Serve,
    /// Print the provider and resource schemas as JSON
    Schema,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve().await,
        Commands::Schema => run_schema(),
    };

    if let Err(e) = result {
        tracing::error!(error = format!("{:#}", e), "plugin exited");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn engine() -> Engine {
    Engine::new(Arc::new(CloudProvider::new()))
}

async fn run_serve() -> anyhow::Result<()> {
    let engine = Arc::new(engine());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        resources = engine.resource_types().count(),
        "serving plugin protocol"
    );
    server::serve(engine, BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .context("plugin protocol session failed")
}

fn run_schema() -> anyhow::Result<()> {
    let schema = serde_json::to_string_pretty(&engine().schema()).context("encoding schema")?;
    println!("{}", schema);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::parse_from(["cirrus-plugin"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn log_level_is_accepted_after_the_subcommand() {
        let cli = Cli::parse_from(["cirrus-plugin", "schema", "--log-level", "debug"]);
        assert!(matches!(cli.command, Some(Commands::Schema)));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn schema_lists_resources() {
        let schema = engine().schema();
        assert!(schema.to_string().contains("dcs_instance"));
    }
}
