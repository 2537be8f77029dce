use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use aicodewith_shim::codex_instructions::InstructionsProvider;
use aicodewith_shim::config::Config;
use aicodewith_shim::proxy;

#[derive(Debug, Parser)]
#[command(
    name = "aicodewith-shim",
    version,
    about = "Local proxy adapting OpenCode requests to stateless Codex and Claude upstreams"
)]
struct Args {
    /// Config file (default: <config dir>/aicodewith-shim/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the listen port from the config file
    #[arg(long)]
    port: Option<u16>,

    /// Override the Codex instructions file or directory
    #[arg(long, value_name = "PATH")]
    instructions: Option<PathBuf>,

    /// Print the resolved config path and exit
    #[arg(long)]
    print_config_path: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("aicodewith_shim=info")),
        )
        .init();

    let args = Args::parse();

    if args.print_config_path {
        let path = args
            .config
            .or_else(Config::config_file_path)
            .context("Could not determine config directory")?;
        println!("{}", path.display());
        return Ok(());
    }

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.listen_port = port;
    }

    let instructions_path = args
        .instructions
        .or_else(|| config.codex.instructions_file.clone());
    let instructions = InstructionsProvider::load(instructions_path.as_deref())
        .context("Failed to load Codex instructions")?;

    proxy::start_server(config, instructions).await
}
