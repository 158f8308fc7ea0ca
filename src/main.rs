use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "aira")]
#[command(version, about = "Agent session orchestrator")]
pub struct Cli {
    /// Path to aira.toml (defaults to ./aira.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP control surface and the session orchestrator
    Serve {
        /// Address to bind (overrides [server] host)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database path, or ":memory:" (overrides [server] db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// List the registered agent types and their images
    Agents,
    /// Print the effective configuration as TOML
    Config,
    /// Show how resource limit strings are interpreted
    ParseLimits {
        /// Fractional cores, e.g. "0.5"
        #[arg(long, default_value = "")]
        cpu: String,

        /// Bytes with optional k/m/g suffix, e.g. "512m"
        #[arg(long, default_value = "")]
        memory: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = aira::config::AiraConfig::resolve(cli.config.as_deref())?;
    if cli.log_json {
        config.logging.json = true;
    }

    match cli.command {
        Commands::Serve {
            host,
            port,
            db_path,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(db_path) = db_path {
                config.server.db_path = db_path;
            }
            let _guard = aira::logging::init(&config.logging)?;
            cmd::cmd_serve(config).await?;
        }
        Commands::Agents => cmd::cmd_agents(&config),
        Commands::Config => cmd::cmd_config(&config)?,
        Commands::ParseLimits { cpu, memory } => cmd::cmd_parse_limits(&cpu, &memory)?,
    }

    Ok(())
}
