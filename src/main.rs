#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use portico_gateway::server::bootstrap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "portico-gateway", about = "Dynamically configurable HTTP API gateway")]
struct Cli {
    /// Path to the route configuration file
    /// (defaults to $GATEWAY_CONFIG_PATH, then ./gateway.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(bootstrap::run(bootstrap::BootstrapArgs {
        config_path: cli.config,
    }))
}
