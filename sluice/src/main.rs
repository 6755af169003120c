mod admin;
mod config;
mod server;

use {
    clap::Parser,
    config::ServerConfig,
    server::Server,
    tracing_subscriber::EnvFilter,
};

#[derive(Parser)]
#[command(name = "sluice", about = "Sub-second live media origin")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, default_value = "sluice.toml")]
    config: String,

    /// Log filter, e.g. `info` or `sluice_engine=debug,info`.
    #[arg(long, env = "SLUICE_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log)?)
        .init();

    // Configuration errors are the one fatal startup condition.
    let config = match ServerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(path = %cli.config, error = %err, "configuration invalid");
            return Err(err);
        }
    };

    let server = Server::new(config);
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            tracing::info!("interrupt received");
            shutdown.cancel();
        }
    });

    server.run().await
}
