mod cmd;
mod output;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sessions_core::config::DaemonConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "sessionsd",
    about = "Session lifecycle daemon: raw data refresh, offload and OTF processing",
    version,
    propagate_version = true
)]
struct Cli {
    /// Daemon configuration file (YAML)
    #[arg(long, global = true, env = "SESSIONS_CONFIG")]
    config: Option<PathBuf>,

    /// Sessions data folder holding EPU, Offload, OTF and Groups
    #[arg(long, global = true, env = "SESSIONS_DATA_FOLDER")]
    data_root: Option<PathBuf>,

    /// Registry base url, e.g. http://emhub:5000
    #[arg(long, global = true, env = "SESSIONS_REGISTRY_URL")]
    registry_url: Option<String>,

    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the poll loop and the periodic refresh sweep until interrupted
    Serve,

    /// Validate and print the data folder layout
    Check,

    /// Run one refresh sweep over the active sessions and exit
    Sweep,
}

impl Cli {
    fn daemon_config(&self) -> anyhow::Result<DaemonConfig> {
        let mut config = DaemonConfig::load(self.config.as_deref())
            .with_context(|| match &self.config {
                Some(p) => format!("failed to load config {}", p.display()),
                None => "failed to load config".to_string(),
            })?;
        if let Some(root) = &self.data_root {
            config.data_root = Some(root.clone());
        }
        if let Some(url) = &self.registry_url {
            config.registry.url = url.clone();
        }
        Ok(config)
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve | Commands::Sweep => tracing::Level::INFO,
        Commands::Check => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = cli.daemon_config().and_then(|config| match cli.command {
        Commands::Serve => cmd::serve::run(&config),
        Commands::Check => cmd::check::run(&config, cli.json),
        Commands::Sweep => cmd::sweep::run(&config, cli.json),
    });

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
