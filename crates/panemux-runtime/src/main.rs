//! panemux: session orchestration daemon and CLI.
//! `serve` owns the engine; every other subcommand is a thin UDS client.

use clap::Parser;

mod backend;
mod cli;
mod client;
mod config;
mod engine;
mod server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    let socket_path = args.socket_path.unwrap_or_else(cli::default_socket_path);

    match args.command {
        cli::Command::Serve(opts) => {
            let filter = std::env::var("PANEMUX_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .init();

            let mut config = config::Config::load(args.config.as_deref())?;
            if let Some(backend_socket) = opts.backend_socket {
                config.backend.socket_path = Some(backend_socket);
            }
            tracing::info!("panemux starting");
            server::serve(config, &socket_path).await?;
        }
        cli::Command::Status => client::cmd_status(&socket_path).await?,
        cli::Command::Sessions => client::cmd_sessions(&socket_path).await?,
        cli::Command::MarkRateLimited { agent, cooldown_ms } => {
            client::cmd_mark_rate_limited(&socket_path, agent, cooldown_ms).await?;
        }
        cli::Command::MarkAvailable { agent } => {
            client::cmd_mark_available(&socket_path, agent).await?;
        }
    }

    Ok(())
}
