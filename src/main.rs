#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use hermes_mesh::bootstrap;
use hermes_mesh::runtime;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hermes-mesh-demo", about = "Service registration/discovery/pool host")]
struct Cli {
    /// Path to mesh config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = runtime::get_container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(bootstrap::run(bootstrap::BootstrapArgs {
        config_path: cli.config,
    }))
}
