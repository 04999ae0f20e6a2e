//! Child process running deploy code for an agent.
//!
//! Speaks the framed executor protocol on stdin/stdout. Logs go to stderr,
//! since stdout carries frames.

use converge_agent::builtin_registry;
use converge_pool::protocol::ENV_DIR_VAR;
use converge_pool::serve_executor;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    if let Ok(dir) = std::env::var(ENV_DIR_VAR) {
        info!(env_dir = %dir, "using package environment");
    }
    serve_executor(builtin_registry(), tokio::io::stdin(), tokio::io::stdout()).await;
    Ok(())
}
