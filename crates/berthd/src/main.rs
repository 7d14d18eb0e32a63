//! berthd — the berth control-plane daemon.
//!
//! Single binary assembling all subsystems:
//! - Audit repository (git-mirrored work directory)
//! - Resource store (UUIDs, states, ports, image metadata)
//! - Compile worker pool
//! - Container worker pool (Docker)
//! - Dispatch gateway
//! - Control API (axum)
//!
//! # Usage
//!
//! ```text
//! berthd --config /etc/berth/berth.toml --port 8090 --data-dir /var/lib/berth
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use berth_compile::{CommandCompiler, CompileWorker};
use berth_container::{ContainerWorker, DockerEngine};
use berth_core::BerthConfig;
use berth_dispatch::DispatchGateway;
use berth_store::{ResourceStore, WorkspaceLayout};
use berth_vcs::{AuditRepo, GitCredentials, GitIdentity};

#[derive(Parser)]
#[command(name = "berthd", about = "berth data-app lifecycle control plane")]
struct Cli {
    /// Path to the berth.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the API port from the configuration.
    #[arg(long)]
    port: Option<u16>,

    /// Override the work directory from the configuration.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,berthd=debug,berth=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => BerthConfig::from_file(path)?,
        None => BerthConfig::default(),
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.paths.work_dir = data_dir;
    }

    run(config).await
}

async fn run(config: BerthConfig) -> anyhow::Result<()> {
    info!("berth control plane starting");

    let layout = WorkspaceLayout::new(&config.paths.work_dir);

    // The audit repository must exist before the store lays out its
    // directories, so that everything it creates lands inside the clone.
    // Failure here is fatal: without the audit mirror there is no durable
    // trail to run against.
    let audit = Arc::new(AuditRepo::init(
        layout.work_dir(),
        &config.audit_git.repository_url,
        GitIdentity {
            name: config.audit_git.identity_name.clone(),
            email: config.audit_git.identity_email.clone(),
        },
        GitCredentials {
            username: config.audit_git.username.clone(),
            password: config.audit_git.password.clone(),
        },
    )?);
    info!("audit repository initialized");

    let store = Arc::new(ResourceStore::open(layout, config.paths.min_port)?);
    info!(tracked = store.tracked_count(), "resource store opened");

    store.log_system(&format!(
        "Started the control plane. {} Data Apps are already registered.",
        store.tracked_count()
    ))?;
    audit.commit_push_all("Created directory structure.")?;

    let engine = Arc::new(DockerEngine::connect(config.docker.stop_grace_secs).await?);
    info!("docker engine connected");

    let compiler = Arc::new(CommandCompiler::new(config.compile.command.clone()));
    let compile = CompileWorker::new(compiler, store.clone(), config.compile.pool_size);
    info!(pool_size = config.compile.pool_size, "compile worker initialized");

    let container = ContainerWorker::new(engine, store.clone(), &config.docker);
    info!(pool_size = config.docker.pool_size, "container worker initialized");

    let dispatch = DispatchGateway::new(&config.dispatch)?;

    let gatekeeper = Arc::new(berth_api::Gatekeeper::new(
        store, audit, compile, container, dispatch,
    ));
    let router = berth_api::build_router(gatekeeper);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "control API starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
        })
        .await?;

    info!("berth daemon stopped");
    Ok(())
}
