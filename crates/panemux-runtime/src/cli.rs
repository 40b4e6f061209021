//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use panemux_core::AgentType;

#[derive(Parser)]
#[command(name = "panemux", about = "Session orchestration for side-by-side agent terminals")]
pub struct Cli {
    /// UDS socket path (default: $XDG_RUNTIME_DIR/panemux/panemux.sock)
    #[arg(long, short = 's', global = true, env = "PANEMUX_SOCKET")]
    pub socket_path: Option<String>,

    /// Config file (default: $XDG_CONFIG_HOME/panemux/config.toml)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the engine and serve UI clients
    Serve(ServeOpts),
    /// Show busy and agent fallback summary
    Status,
    /// List sessions
    Sessions,
    /// Record that an agent backend is throttled
    MarkRateLimited {
        agent: AgentType,
        /// Estimated cooldown; the configured default applies when omitted
        #[arg(long)]
        cooldown_ms: Option<u64>,
    },
    /// Clear a throttle and make the agent eligible again
    MarkAvailable { agent: AgentType },
}

#[derive(clap::Args)]
pub struct ServeOpts {
    /// Native backend socket, overriding `[backend] socket_path`
    #[arg(long)]
    pub backend_socket: Option<String>,
}

/// Default socket path using $USER for per-user isolation.
pub fn default_socket_path() -> String {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return format!("{dir}/panemux/panemux.sock");
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("/tmp/panemux-{user}/panemux.sock")
}
