use std::{io, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_room::{
    cli::{Cli, TraceTarget},
    server::Server,
    trace::{LogTracer, NoopTracer, Tracer, WriterTracer},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let tracer: Arc<dyn Tracer> = match cli.trace {
        Some(TraceTarget::Stdout) => Arc::new(WriterTracer::new(io::stdout())),
        Some(TraceTarget::Log) => Arc::new(LogTracer),
        None => Arc::new(NoopTracer),
    };

    let listener = TcpListener::bind(cli.addr)
        .await
        .with_context(|| format!("failed to bind {}", cli.addr))?;
    let server = Server::new(listener, cli.room_config(), tracer);
    let addr = server.local_addr()?;
    info!("chat room listening on {}", addr);

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("chat room exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
