// Entrypoint of a node that hosts remote tablespace workers.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use blockio::tokio::TOKIO;
use blockio::{BootstrapController, NodeConfig};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(about = "Runs a blockio bootstrap controller until interrupted")]
struct Args {
    /// Control port to listen on, in the form `<ip>:<port>`.  If `<port>` is
    /// `0`, the kernel picks a free port.
    #[arg(long, default_value = "0.0.0.0:7000")]
    listen: SocketAddr,

    /// Directory to keep worker files in.  By default, each worker keeps its
    /// file next to the database path the coordinator sent.
    #[arg(long)]
    remote_dir: Option<PathBuf>,

    /// Capacity of each worker's node block buffer, in blocks.
    #[arg(long, default_value_t = 1024)]
    buffer_capacity: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let controller = BootstrapController::new(NodeConfig {
        control_address: args.listen,
        remote_directory: args.remote_dir,
        buffer_capacity: args.buffer_capacity,
    });
    let handle = controller
        .listen()
        .with_context(|| format!("listening on {}", args.listen))?;
    info!("serving on {}", handle.local_address());

    TOKIO
        .block_on(tokio::signal::ctrl_c())
        .context("waiting for ctrl-c")?;
    info!("interrupted, stopping {} workers", handle.controller().running());
    handle.shutdown();
    Ok(())
}
