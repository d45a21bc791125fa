use clap::Parser;
use iso_switch_sim::config::{CliArgs, Command, Config};
use iso_switch_sim::server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    // Load configuration
    let config = Config::load(&cli)?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Command::Iso(_) => run_iso(config),
    }
}

/// Run the ISO 8583 simulator until Ctrl-C
fn run_iso(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        dispatch = ?config.dispatch,
        max_sessions = config.max_sessions,
        mailbox_capacity = config.mailbox_capacity,
        idle_timeout = ?config.idle_timeout,
        write_timeout = ?config.write_timeout,
        unrecognized = ?config.unrecognized,
        "Starting ISO server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let server = Server::new(config);
        server.run(shutdown_signal()).await
    })?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
