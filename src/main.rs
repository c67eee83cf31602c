//! fuzz-collector server binary
//!
//! Configuration via CLI arguments or TOML file, see `config`.

use fuzz_collector::config::Config;
use fuzz_collector::log_sink::LogSink;
use fuzz_collector::server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Diagnostics go to stderr; the result log owns stdout
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        host = %config.bind_host,
        port = config.bind_port,
        workers = config.max_workers,
        log_file = ?config.log_file,
        quiet = config.quiet,
        header_policy = ?config.header_policy,
        "Starting fuzz-collector"
    );

    let log = LogSink::from_config(&config)?;
    let server = Server::new(config, log);

    if let Err(e) = server.run().await {
        error!(error = %e, "Server failed to start");
        return Err(e.into());
    }

    Ok(())
}
