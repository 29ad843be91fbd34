use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use candidate_ingestion::cli::{self, Cli};
use candidate_ingestion::config::Config;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let pretty = std::env::var("LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("pretty")).unwrap_or(false);
    // Logs go to stderr; stdout carries the JSON results
    if pretty {
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let args = Cli::parse();
    let cfg = Config::from_env();
    tracing::info!(
        database = %cfg.database_name,
        collection = %cfg.candidates_collection,
        ai_provider = %cfg.ai.provider,
        "Loaded configuration"
    );

    cli::run(args, cfg).await
}
