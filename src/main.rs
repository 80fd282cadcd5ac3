use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use codebox::config::Config;
use codebox::container::ContainerBackend;
use codebox::grading::{Grader, JobQueue, MemoryStore, WorkerPool};
use codebox::sandbox::{BackendKind, SharedBackend};
use codebox::session::SessionOrchestrator;
use codebox::vm::VmBackend;
use codebox::workspace::WorkspaceStager;
use codebox::Server;

#[derive(Debug, Parser)]
#[command(name = "codebox", version, about = "Sandboxed code execution server")]
struct Cli {
    /// TOML configuration file; environment variables are used when omitted
    #[arg(short, long, env = "CODEBOX_CONFIG")]
    config: Option<PathBuf>,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("codebox={},tower_http=info", config.logging.level)));

    if config.logging.format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn build_backend(config: &Config) -> SharedBackend {
    match config.worker.backend {
        BackendKind::Container => {
            let backend = ContainerBackend::new(&config.sandbox);
            if let Err(e) = backend.ensure_image().await {
                warn!("Runner image not ready: {}", e);
            }
            Arc::new(backend)
        }
        BackendKind::Vm => Arc::new(VmBackend::new(&config.vm, config.sandbox.execution_root.clone())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::from_env().await?,
    };
    config.validate()?;

    init_tracing(&config);

    info!("🦀 Starting Codebox server...");
    info!(
        backend = %config.worker.backend,
        workers = config.worker.workers,
        "Configuration loaded successfully"
    );

    let backend = build_backend(&config).await;

    let store = Arc::new(MemoryStore::new());
    let grader = Arc::new(Grader::new(
        store,
        backend.clone(),
        WorkspaceStager::from_config(&config.sandbox),
    ));
    // No HTTP route feeds this queue; grading is driven through the library
    // (`JobQueue::enqueue`), the binary only hosts the workers.
    let (queue, receiver) = JobQueue::bounded(config.worker.queue_capacity);
    let pool = WorkerPool::start(config.worker.workers, receiver, grader);

    let sessions = Arc::new(SessionOrchestrator::from_config(&config, backend)?);
    let server = Server::new(config, sessions.clone());

    let shutdown_sessions = sessions.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Shutting down Codebox server...");
        shutdown_sessions.shutdown();
    };

    server.run(shutdown).await?;

    // Closing the queue lets workers finish the jobs already accepted.
    drop(queue);
    pool.join().await;

    Ok(())
}
